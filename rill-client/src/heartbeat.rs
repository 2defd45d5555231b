//! Heartbeat liveness tracking.
//!
//! Any inbound byte counts as liveness evidence, not just heartbeat
//! frames. On each tick of the negotiated interval the monitor either
//! sends a heartbeat (peer was heard from since the last tick) or declares
//! the peer dead. The flag starts set - the connect itself is evidence -
//! so a fully silent peer is declared dead after two intervals.

use std::sync::atomic::{AtomicBool, Ordering};

/// What the interval task should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickAction {
    SendHeartbeat,
    Timeout,
}

/// Shared received-since-last-tick flag.
pub(crate) struct Liveness {
    received: AtomicBool,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            received: AtomicBool::new(true),
        }
    }

    /// Called by the read loop on every inbound chunk of bytes.
    pub(crate) fn mark(&self) {
        self.received.store(true, Ordering::SeqCst);
    }

    /// Consumes the flag and decides this tick's action.
    pub(crate) fn tick(&self) -> TickAction {
        if self.received.swap(false, Ordering::SeqCst) {
            TickAction::SendHeartbeat
        } else {
            TickAction::Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_sends_then_silence_times_out() {
        let liveness = Liveness::new();
        // Connect counts as evidence: tick one heartbeats.
        assert_eq!(liveness.tick(), TickAction::SendHeartbeat);
        // Nothing received since: tick two declares the peer dead.
        assert_eq!(liveness.tick(), TickAction::Timeout);
    }

    #[test]
    fn any_byte_arrival_suppresses_the_timeout() {
        let liveness = Liveness::new();
        assert_eq!(liveness.tick(), TickAction::SendHeartbeat);
        liveness.mark();
        assert_eq!(liveness.tick(), TickAction::SendHeartbeat);
        assert_eq!(liveness.tick(), TickAction::Timeout);
    }
}
