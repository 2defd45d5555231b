//! Session correlator: correlation-id allocation and pending-request
//! resolution.
//!
//! Every registered request gets exactly one resolution: a matched
//! response, a key/version mismatch, a timeout from the sweep, or a
//! connection-close rejection. Correlation ids wrap at the protocol
//! maximum back to 1 and are never handed out while still outstanding.

use crate::error::ClientError;
use bytes::Bytes;
use parking_lot::Mutex;
use rill_protocol::{Frame, ProtocolError, ResponseCode, MAX_CORRELATION_ID};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Smallest assignable correlation id.
const FIRST_CORRELATION_ID: u32 = 1;

/// A matched response, stripped of its correlation id and status code.
#[derive(Debug)]
pub(crate) struct Response {
    pub key: u16,
    pub version: u16,
    pub code: ResponseCode,
    /// Payload after the correlation id and status code.
    pub body: Bytes,
}

struct Pending {
    key: u16,
    version: u16,
    submitted_at: Instant,
    tx: oneshot::Sender<Result<Response, ClientError>>,
}

struct Table {
    next_id: u32,
    pending: HashMap<u32, Pending>,
}

pub(crate) struct Session {
    table: Mutex<Table>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: FIRST_CORRELATION_ID,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocates the next correlation id and registers the pending entry.
    pub(crate) fn register(
        &self,
        key: u16,
        version: u16,
    ) -> (u32, oneshot::Receiver<Result<Response, ClientError>>) {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();

        let mut id = table.next_id;
        while table.pending.contains_key(&id) {
            id = next_id(id);
        }
        table.next_id = next_id(id);

        table.pending.insert(
            id,
            Pending {
                key,
                version,
                submitted_at: Instant::now(),
                tx,
            },
        );
        (id, rx)
    }

    /// Drops a registration whose frame never made it onto the wire.
    pub(crate) fn abort(&self, corr_id: u32) {
        self.table.lock().pending.remove(&corr_id);
    }

    /// Routes a response frame to its caller.
    ///
    /// Returns a session-level protocol error when there is no addressable
    /// requester; key/version mismatches are delivered to the caller and
    /// clear the entry.
    pub(crate) fn resolve(&self, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.payload.len() < 6 {
            return Err(ProtocolError::Truncated {
                needed: 6 - frame.payload.len(),
            });
        }
        let corr_id = u32::from_be_bytes(frame.payload[0..4].try_into().unwrap());
        let code = ResponseCode(u16::from_be_bytes(frame.payload[4..6].try_into().unwrap()));
        let body = frame.payload.slice(6..);
        self.complete(corr_id, frame.command_key(), frame.version, code, body)
    }

    /// Routes a response that carries a correlation id but no status code
    /// (the metadata special case). The body starts right after the id.
    pub(crate) fn resolve_unstatused(&self, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.payload.len() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4 - frame.payload.len(),
            });
        }
        let corr_id = u32::from_be_bytes(frame.payload[0..4].try_into().unwrap());
        let body = frame.payload.slice(4..);
        self.complete(
            corr_id,
            frame.command_key(),
            frame.version,
            ResponseCode::OK,
            body,
        )
    }

    fn complete(
        &self,
        corr_id: u32,
        key: u16,
        version: u16,
        code: ResponseCode,
        body: Bytes,
    ) -> Result<(), ProtocolError> {
        let entry = match self.table.lock().pending.remove(&corr_id) {
            Some(entry) => entry,
            None => return Err(ProtocolError::UnexpectedResponse(corr_id)),
        };

        let result = if entry.key != key || entry.version != version {
            Err(ClientError::Protocol(ProtocolError::ResponseMismatch {
                expected_key: entry.key,
                expected_version: entry.version,
                actual_key: key,
                actual_version: version,
            }))
        } else if code.is_ok() {
            Ok(Response {
                key,
                version,
                code,
                body,
            })
        } else {
            Err(ClientError::server(code))
        };

        // The caller may have given up already; that is not our problem.
        let _ = entry.tx.send(result);
        Ok(())
    }

    /// Fails every request older than `timeout`. Called from the sweep
    /// task at a fraction of the timeout itself.
    pub(crate) fn sweep(&self, timeout: Duration) {
        let mut table = self.table.lock();
        let expired: Vec<u32> = table
            .pending
            .iter()
            .filter(|(_, p)| p.submitted_at.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = table.pending.remove(&id) {
                tracing::debug!("request {} timed out", id);
                let _ = entry.tx.send(Err(ClientError::RequestTimeout));
            }
        }
    }

    /// Rejects every outstanding request on connection loss.
    pub(crate) fn fail_all(&self) {
        let mut table = self.table.lock();
        for (_, entry) in table.pending.drain() {
            let _ = entry.tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.table.lock().pending.len()
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u32) {
        self.table.lock().next_id = id;
    }
}

fn next_id(id: u32) -> u32 {
    if id == MAX_CORRELATION_ID {
        FIRST_CORRELATION_ID
    } else {
        id + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_protocol::{Command, RESPONSE_FLAG};

    fn response_frame_for(corr_id: u32, cmd: Command, version: u16, code: u16) -> Frame {
        let mut payload = Vec::new();
        payload.extend_from_slice(&corr_id.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        Frame {
            key: cmd.key() | RESPONSE_FLAG,
            version,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let session = Session::new();
        let (a, _rx_a) = session.register(Command::Create.key(), 1);
        let (b, _rx_b) = session.register(Command::Create.key(), 1);
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn wraparound_returns_to_the_minimum_id() {
        let session = Session::new();
        session.set_next_id(MAX_CORRELATION_ID);
        let (a, _rx_a) = session.register(Command::Create.key(), 1);
        let (b, _rx_b) = session.register(Command::Create.key(), 1);
        assert_eq!(a, MAX_CORRELATION_ID);
        assert_eq!(b, FIRST_CORRELATION_ID);
    }

    #[test]
    fn outstanding_ids_are_never_reused() {
        let session = Session::new();
        let (a, _rx_a) = session.register(Command::Create.key(), 1);
        session.set_next_id(a); // force a collision attempt
        let (b, _rx_b) = session.register(Command::Delete.key(), 1);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn matched_response_resolves_the_caller() {
        let session = Session::new();
        let (id, rx) = session.register(Command::Create.key(), 1);
        session
            .resolve(&response_frame_for(id, Command::Create, 1, 0x01))
            .unwrap();
        let response = rx.await.unwrap().unwrap();
        assert!(response.code.is_ok());
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn non_ok_status_rejects_the_caller() {
        let session = Session::new();
        let (id, rx) = session.register(Command::Delete.key(), 1);
        session
            .resolve(&response_frame_for(id, Command::Delete, 1, 0x02))
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Stream does not exist"));
    }

    #[tokio::test]
    async fn unexpected_response_disturbs_nothing() {
        let session = Session::new();
        let (_id, mut rx) = session.register(Command::Create.key(), 1);

        let err = session
            .resolve(&response_frame_for(999, Command::Create, 1, 0x01))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedResponse(999)));

        // The real pending request is untouched.
        assert_eq!(session.outstanding(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn key_mismatch_rejects_exactly_that_caller() {
        let session = Session::new();
        let (id, rx) = session.register(Command::Create.key(), 1);
        session
            .resolve(&response_frame_for(id, Command::Delete, 1, 0x01))
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::ResponseMismatch { .. })
        ));
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn version_mismatch_rejects_the_caller() {
        let session = Session::new();
        let (id, rx) = session.register(Command::Create.key(), 1);
        session
            .resolve(&response_frame_for(id, Command::Create, 2, 0x01))
            .unwrap();
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn sweep_times_out_only_aged_requests() {
        let session = Session::new();
        let (_old, old_rx) = session.register(Command::Create.key(), 1);
        // Backdate the first entry past the timeout.
        {
            let mut table = session.table.lock();
            let entry = table.pending.get_mut(&1).unwrap();
            entry.submitted_at = Instant::now() - Duration::from_secs(60);
        }
        let (_fresh, mut fresh_rx) = session.register(Command::Create.key(), 1);

        session.sweep(Duration::from_secs(30));

        assert!(matches!(
            old_rx.await.unwrap(),
            Err(ClientError::RequestTimeout)
        ));
        assert!(fresh_rx.try_recv().is_err());
        assert_eq!(session.outstanding(), 1);
    }

    #[tokio::test]
    async fn fail_all_rejects_everything() {
        let session = Session::new();
        let (_a, rx_a) = session.register(Command::Create.key(), 1);
        let (_b, rx_b) = session.register(Command::Delete.key(), 1);
        session.fail_all();
        assert!(matches!(
            rx_a.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            rx_b.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn unstatused_resolution_carries_an_implicit_ok() {
        let session = Session::new();
        let (id, rx) = session.register(Command::Metadata.key(), 1);

        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(b"rest-of-body");
        let frame = Frame {
            key: Command::Metadata.response_key(),
            version: 1,
            payload: Bytes::from(payload),
        };
        session.resolve_unstatused(&frame).unwrap();

        let response = rx.await.unwrap().unwrap();
        assert!(response.code.is_ok());
        assert_eq!(response.body.as_ref(), b"rest-of-body");
    }
}
