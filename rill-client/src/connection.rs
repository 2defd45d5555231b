//! Connection lifecycle: read loop, handshake state machine, timers.
//!
//! One logical session per connection: a single transport, a single frame
//! decoder, a single pending-request table. All of them are mutated only
//! from the event-processing path (inbound bytes, timer ticks, application
//! calls); sub-batch decompression is the one concurrent activity and it
//! reports back through completion slots (see [`crate::delivery`]).

use crate::config::ClientConfig;
use crate::delivery::SubscriptionQueues;
use crate::dispatch::dispatch;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::heartbeat::{Liveness, TickAction};
use crate::session::{Response, Session};
use crate::transport::{ClientStream, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use rill_protocol::messages::{
    heartbeat_frame, ClientCloseRequest, CreditFrame, OpenRequest, OpenResponse,
    PeerPropertiesRequest, PeerPropertiesResponse, SaslAuthenticateRequest, SaslHandshakeRequest,
    SaslHandshakeResponse, TuneFrame,
};
use rill_protocol::{Command, FrameDecoder, WireReader, RESPONSE_CODE_OK};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant};

/// Handshake and lifecycle states. Transitions are strictly sequential up
/// to `Open`; any state may fall to `Closing`/`Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    ExchangingPeerProperties,
    NegotiatingAuth,
    AwaitingTune,
    Opening,
    Open,
    Closing,
    Closed,
}

pub(crate) struct ConnectionInner {
    pub(crate) config: ClientConfig,
    pub(crate) session: Session,
    pub(crate) queues: SubscriptionQueues,
    transport: Transport,
    events: mpsc::UnboundedSender<ClientEvent>,
    liveness: Liveness,
    state: Mutex<ConnectionState>,
    server_properties: Mutex<HashMap<String, String>>,
    tune_slot: Mutex<Option<oneshot::Sender<TuneFrame>>>,
    negotiated_heartbeat: AtomicU32,
    closed: watch::Sender<bool>,
}

impl ConnectionInner {
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!("connection state -> {:?}", state);
        *self.state.lock() = state;
    }

    pub(crate) fn take_tune_slot(&self) -> Option<oneshot::Sender<TuneFrame>> {
        self.tune_slot.lock().take()
    }

    /// Writes one already-encoded frame.
    pub(crate) async fn send(&self, frame: &[u8]) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        self.transport.send(frame).await
    }

    pub(crate) async fn send_credit(&self, subscription_id: u8, credit: u16) -> Result<(), ClientError> {
        self.send(
            &CreditFrame {
                subscription_id,
                credit,
            }
            .encode(),
        )
        .await
    }

    /// Issues a correlated request and suspends until it resolves: a
    /// matching response, a mismatch, a sweep timeout, or connection loss.
    /// Individual requests cannot be cancelled.
    pub(crate) async fn request(
        &self,
        cmd: Command,
        version: u16,
        build: impl FnOnce(u32) -> Bytes,
    ) -> Result<Response, ClientError> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        let (corr_id, rx) = self.session.register(cmd.key(), version);
        let frame = build(corr_id);
        if let Err(err) = self.transport.send(&frame).await {
            self.session.abort(corr_id);
            return Err(err);
        }
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Tears the connection down exactly once: every outstanding request
    /// is rejected, delivery queues are dropped, background tasks observe
    /// the close signal, and the close event carries `reason`.
    pub(crate) async fn shutdown(&self, reason: &str, error: Option<ClientError>) {
        if self.closed.send_replace(true) {
            return;
        }
        tracing::debug!("closing connection: {}", reason);
        self.set_state(ConnectionState::Closed);
        if let Some(err) = error {
            self.emit(ClientEvent::Error(err));
        }
        self.emit(ClientEvent::Close {
            reason: reason.to_string(),
        });
        self.session.fail_all();
        self.queues.clear();
        self.transport.close().await;
    }
}

/// Zero means "unlimited", so it loses to any concrete value; otherwise
/// the smaller side wins. The same rule tunes frame size and heartbeat.
fn negotiate(client: u32, server: u32) -> u32 {
    if client == 0 || server == 0 {
        client.max(server)
    } else {
        client.min(server)
    }
}

/// A connection to a stream broker.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connects, runs the full handshake, and returns the open connection
    /// together with its event channel. Any handshake failure closes the
    /// transport and is returned here.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Connection, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let (transport, reader) = Transport::connect(&config).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(ConnectionInner {
            config,
            session: Session::new(),
            queues: SubscriptionQueues::new(),
            transport,
            events: events_tx,
            liveness: Liveness::new(),
            state: Mutex::new(ConnectionState::Connecting),
            server_properties: Mutex::new(HashMap::new()),
            tune_slot: Mutex::new(None),
            negotiated_heartbeat: AtomicU32::new(0),
            closed: closed_tx,
        });

        tokio::spawn(read_loop(inner.clone(), reader));
        spawn_sweep(&inner);

        if let Err(err) = handshake(&inner).await {
            inner
                .shutdown(&format!("handshake failed: {}", err), None)
                .await;
            return Err(err);
        }

        Ok((Connection { inner }, events_rx))
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state() == ConnectionState::Open
    }

    /// Server properties merged from the peer-properties exchange and the
    /// Open response.
    pub fn server_properties(&self) -> HashMap<String, String> {
        self.inner.server_properties.lock().clone()
    }

    /// Negotiated heartbeat interval in seconds (0 = disabled).
    pub fn heartbeat_interval(&self) -> u32 {
        self.inner.negotiated_heartbeat.load(Ordering::SeqCst)
    }

    /// Gracefully closes: a Close request to the broker (best effort),
    /// then local teardown.
    pub async fn close(&self, reason: &str) -> Result<(), ClientError> {
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Closing);
        let request = ClientCloseRequest {
            code: RESPONSE_CODE_OK,
            reason,
        };
        let _ = self
            .inner
            .request(Command::Close, 1, |corr_id| request.encode(corr_id))
            .await;
        self.inner.shutdown("closed by client", None).await;
        Ok(())
    }
}

/// Fixed connect sequence. Every step is a correlated request except the
/// tune exchange, which waits for the broker's unsolicited push under its
/// own timeout.
async fn handshake(inner: &Arc<ConnectionInner>) -> Result<(), ClientError> {
    let config = &inner.config;

    inner.set_state(ConnectionState::ExchangingPeerProperties);
    let request = PeerPropertiesRequest::new(config.connection_name.as_deref());
    let response = inner
        .request(Command::PeerProperties, 1, |corr_id| request.encode(corr_id))
        .await?;
    let peer = PeerPropertiesResponse::parse(&mut WireReader::new(response.body))?;
    inner.server_properties.lock().extend(peer.properties);

    inner.set_state(ConnectionState::NegotiatingAuth);
    let response = inner
        .request(Command::SaslHandshake, 1, SaslHandshakeRequest::encode)
        .await?;
    let mechanisms = SaslHandshakeResponse::parse(&mut WireReader::new(response.body))?.mechanisms;
    let auth = choose_mechanism(config, &mechanisms)?;

    // Install the tune slot before authenticating: the broker pushes Tune
    // as soon as the authenticate response is on the wire.
    let (tune_tx, tune_rx) = oneshot::channel();
    *inner.tune_slot.lock() = Some(tune_tx);

    inner
        .request(Command::SaslAuthenticate, 1, |corr_id| auth.encode(corr_id))
        .await?;

    inner.set_state(ConnectionState::AwaitingTune);
    let server_tune = tokio::time::timeout(config.tune_timeout, tune_rx)
        .await
        .map_err(|_| ClientError::TuneTimeout)?
        .map_err(|_| ClientError::ConnectionClosed)?;

    let frame_max = negotiate(config.frame_max, server_tune.frame_max);
    let heartbeat = negotiate(config.heartbeat, server_tune.heartbeat);
    tracing::debug!(
        "tuned: frame_max={} heartbeat={}s (server offered {}/{})",
        frame_max,
        heartbeat,
        server_tune.frame_max,
        server_tune.heartbeat
    );
    inner.transport.set_frame_max(frame_max);
    inner.negotiated_heartbeat.store(heartbeat, Ordering::SeqCst);
    spawn_heartbeat(inner, heartbeat);
    inner
        .send(
            &TuneFrame {
                frame_max,
                heartbeat,
            }
            .encode(),
        )
        .await?;

    inner.set_state(ConnectionState::Opening);
    let request = OpenRequest {
        vhost: &config.vhost,
    };
    let response = inner
        .request(Command::Open, 1, |corr_id| request.encode(corr_id))
        .await?;
    let open = OpenResponse::parse(&mut WireReader::new(response.body))?;
    let merged = {
        let mut properties = inner.server_properties.lock();
        properties.extend(open.properties);
        properties.clone()
    };

    inner.set_state(ConnectionState::Open);
    inner.emit(ClientEvent::Open {
        server_properties: merged,
    });
    Ok(())
}

/// PLAIN when a username is configured and offered, else EXTERNAL when
/// offered, else the required mechanism is simply unavailable.
fn choose_mechanism(
    config: &ClientConfig,
    mechanisms: &[String],
) -> Result<SaslAuthenticateRequest, ClientError> {
    if let Some(username) = &config.username {
        if mechanisms.iter().any(|m| m == "PLAIN") {
            return Ok(SaslAuthenticateRequest::Plain {
                username: username.clone(),
                password: config.password.clone(),
            });
        }
    } else if mechanisms.iter().any(|m| m == "EXTERNAL") {
        return Ok(SaslAuthenticateRequest::External);
    }
    Err(ClientError::AuthMechanismUnavailable {
        offered: mechanisms.to_vec(),
    })
}

/// Pulls bytes off the socket, feeds the framer, dispatches complete
/// frames. Owns the receive buffer exclusively.
async fn read_loop(inner: Arc<ConnectionInner>, mut reader: ReadHalf<ClientStream>) {
    let mut closed = inner.closed_signal();
    let mut buf = vec![0u8; inner.config.read_buffer_size];
    let mut decoder = FrameDecoder::new();

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = closed.changed() => break,
        };

        match read {
            Ok(0) => {
                inner.shutdown("connection closed by server", None).await;
                break;
            }
            Ok(n) => {
                inner.liveness.mark();
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => dispatch(&inner, frame).await,
                        Ok(None) => break,
                        Err(err) => {
                            inner.shutdown("malformed frame", Some(err.into())).await;
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                inner
                    .shutdown("transport error", Some(ClientError::Io(err)))
                    .await;
                break;
            }
        }
    }
}

/// Liveness timer: a heartbeat frame on every live tick, forced close
/// after one fully silent interval beyond that.
fn spawn_heartbeat(inner: &Arc<ConnectionInner>, seconds: u32) {
    if seconds == 0 {
        return;
    }
    let weak = Arc::downgrade(inner);
    let mut closed = inner.closed_signal();
    tokio::spawn(async move {
        let period = Duration::from_secs(seconds as u64);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    match inner.liveness.tick() {
                        TickAction::SendHeartbeat => {
                            let _ = inner.send(&heartbeat_frame()).await;
                        }
                        TickAction::Timeout => {
                            inner
                                .shutdown("heartbeat timeout", Some(ClientError::HeartbeatTimeout))
                                .await;
                            break;
                        }
                    }
                }
                _ = closed.changed() => break,
            }
        }
    });
}

/// Pending-request sweeper, at a tenth of the request timeout so a timed
/// out caller waits at most 1.1x the configured limit.
fn spawn_sweep(inner: &Arc<ConnectionInner>) {
    let timeout = inner.config.request_timeout;
    let period = (timeout / 10).max(Duration::from_millis(10));
    let weak = Arc::downgrade(inner);
    let mut closed = inner.closed_signal();
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.session.sweep(timeout);
                }
                _ = closed.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_prefers_the_smaller_nonzero_value() {
        assert_eq!(negotiate(0, 131072), 131072);
        assert_eq!(negotiate(131072, 0), 131072);
        assert_eq!(negotiate(0, 0), 0);
        assert_eq!(negotiate(65536, 131072), 65536);
        assert_eq!(negotiate(131072, 65536), 65536);
        // Mirrored for heartbeat seconds.
        assert_eq!(negotiate(0, 60), 60);
        assert_eq!(negotiate(30, 60), 30);
    }

    #[test]
    fn mechanism_choice() {
        let with_user = ClientConfig::new("localhost").with_credentials("guest", "guest");
        let no_user = ClientConfig::new("localhost");
        let plain = vec!["PLAIN".to_string(), "AMQPLAIN".to_string()];
        let external = vec!["EXTERNAL".to_string()];

        assert!(matches!(
            choose_mechanism(&with_user, &plain),
            Ok(SaslAuthenticateRequest::Plain { .. })
        ));
        assert!(matches!(
            choose_mechanism(&no_user, &external),
            Ok(SaslAuthenticateRequest::External)
        ));
        // Username configured but PLAIN not offered.
        assert!(matches!(
            choose_mechanism(&with_user, &external),
            Err(ClientError::AuthMechanismUnavailable { .. })
        ));
        // No username and no EXTERNAL.
        assert!(matches!(
            choose_mechanism(&no_user, &plain),
            Err(ClientError::AuthMechanismUnavailable { .. })
        ));
    }
}
