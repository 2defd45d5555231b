//! Incoming frame routing.
//!
//! Two commands are tested before generic response routing because they
//! reuse response-looking keys without behaving like responses:
//! CreditResponse is pushed without a correlation id, and the metadata
//! response carries a correlation id but no status code. This is a
//! deliberate protocol quirk, not an accident; keep the order.

use crate::connection::ConnectionInner;
use crate::delivery;
use crate::events::{ClientEvent, ConsumerUpdate};
use rill_protocol::messages::{
    CloseRequest, ConsumerUpdateRequest, CreditResponse, MetadataUpdate, PublishConfirm,
    PublishError, TuneFrame,
};
use rill_protocol::{Command, Frame, ProtocolError, WireReader};
use std::sync::Arc;

/// Routes one complete frame off the wire.
pub(crate) async fn dispatch(inner: &Arc<ConnectionInner>, frame: Frame) {
    if frame.key == Command::CreditResponse.key() {
        handle_credit_response(inner, frame);
        return;
    }
    if frame.key == Command::Metadata.response_key() {
        if let Err(err) = inner.session.resolve_unstatused(&frame) {
            inner.emit(ClientEvent::Error(err.into()));
        }
        return;
    }
    if frame.is_response() {
        if let Err(err) = inner.session.resolve(&frame) {
            inner.emit(ClientEvent::Error(err.into()));
        }
        return;
    }

    let cmd = match Command::try_from(frame.key) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::warn!("unknown command key {:#06x}", frame.key);
            inner.emit(ClientEvent::Error(err.into()));
            return;
        }
    };

    match cmd {
        // Liveness was already counted at the byte level; the frame itself
        // is invisible to the application.
        Command::Heartbeat => {
            check_version(inner, &frame, 1);
        }
        Command::Tune => {
            if check_version(inner, &frame, 1) {
                handle_tune(inner, frame);
            }
        }
        Command::Deliver => {
            if frame.version == 1 || frame.version == 2 {
                delivery::handle_deliver(inner, frame).await;
            } else {
                emit_unsupported_version(inner, &frame);
            }
        }
        Command::MetadataUpdate => {
            if check_version(inner, &frame, 1) {
                parse_push(inner, frame, MetadataUpdate::parse, ClientEvent::MetadataUpdate);
            }
        }
        Command::PublishConfirm => {
            if check_version(inner, &frame, 1) {
                parse_push(inner, frame, PublishConfirm::parse, ClientEvent::PublishConfirm);
            }
        }
        Command::PublishError => {
            if check_version(inner, &frame, 1) {
                parse_push(inner, frame, PublishError::parse, ClientEvent::PublishError);
            }
        }
        Command::ConsumerUpdate => {
            if check_version(inner, &frame, 1) {
                handle_consumer_update(inner, frame);
            }
        }
        Command::Close => {
            if check_version(inner, &frame, 1) {
                handle_server_close(inner, frame).await;
            }
        }
        other => {
            tracing::warn!("command {:?} is not valid as a push", other);
            inner.emit(ClientEvent::Error(
                ProtocolError::UnknownCommand(frame.key).into(),
            ));
        }
    }
}

/// Enforces a handler's version contract. A mismatch is reported but not
/// fatal to the session.
fn check_version(inner: &Arc<ConnectionInner>, frame: &Frame, supported: u16) -> bool {
    if frame.version == supported {
        true
    } else {
        emit_unsupported_version(inner, frame);
        false
    }
}

fn emit_unsupported_version(inner: &Arc<ConnectionInner>, frame: &Frame) {
    inner.emit(ClientEvent::Error(
        ProtocolError::UnsupportedCommandVersion {
            key: frame.command_key(),
            version: frame.version,
        }
        .into(),
    ));
}

fn parse_push<T>(
    inner: &Arc<ConnectionInner>,
    frame: Frame,
    parse: impl FnOnce(&mut WireReader) -> Result<T, ProtocolError>,
    wrap: impl FnOnce(T) -> ClientEvent,
) {
    let mut reader = WireReader::new(frame.payload);
    match parse(&mut reader) {
        Ok(msg) => inner.emit(wrap(msg)),
        Err(err) => inner.emit(ClientEvent::Error(err.into())),
    }
}

fn handle_credit_response(inner: &Arc<ConnectionInner>, frame: Frame) {
    let mut reader = WireReader::new(frame.payload);
    match CreditResponse::parse(&mut reader) {
        Ok(response) => {
            tracing::debug!(
                "credit error for subscription {}: code {:#04x}",
                response.subscription_id,
                response.code
            );
            inner.emit(ClientEvent::CreditError(response));
        }
        Err(err) => inner.emit(ClientEvent::Error(err.into())),
    }
}

fn handle_tune(inner: &Arc<ConnectionInner>, frame: Frame) {
    let mut reader = WireReader::new(frame.payload);
    match TuneFrame::parse(&mut reader) {
        Ok(tune) => {
            if let Some(slot) = inner.take_tune_slot() {
                let _ = slot.send(tune);
            } else {
                tracing::warn!("tune push outside the handshake, ignoring");
            }
        }
        Err(err) => inner.emit(ClientEvent::Error(err.into())),
    }
}

fn handle_consumer_update(inner: &Arc<ConnectionInner>, frame: Frame) {
    let mut reader = WireReader::new(frame.payload);
    match ConsumerUpdateRequest::parse(&mut reader) {
        Ok(request) => inner.emit(ClientEvent::ConsumerUpdate(ConsumerUpdate {
            request,
            conn: Arc::downgrade(inner),
        })),
        Err(err) => inner.emit(ClientEvent::Error(err.into())),
    }
}

/// Server-initiated close: acknowledge with the broker's correlation id,
/// then tear the connection down locally. Never retried.
async fn handle_server_close(inner: &Arc<ConnectionInner>, frame: Frame) {
    let mut reader = WireReader::new(frame.payload);
    match CloseRequest::parse(&mut reader) {
        Ok(request) => {
            tracing::debug!(
                "server closing the connection: {:#04x} {}",
                request.code,
                request.reason
            );
            let _ = inner.send(&request.encode_ack()).await;
            let reason = if request.reason.is_empty() {
                "closed by server".to_string()
            } else {
                request.reason.clone()
            };
            inner.shutdown(&reason, None).await;
        }
        Err(err) => inner.emit(ClientEvent::Error(err.into())),
    }
}
