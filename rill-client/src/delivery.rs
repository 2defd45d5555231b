//! Per-subscription ordered delivery.
//!
//! Each subscription gets a queue of completion slots in frame receipt
//! order. Chunk decoding (including concurrent sub-batch decompression on
//! the blocking pool) runs independently per chunk, but the drainer task
//! awaits the slots strictly FIFO, so a chunk can never overtake an
//! earlier one no matter how decode completion times interleave. A failed
//! decode surfaces an error for that slot only; the queue keeps going.

use crate::connection::ConnectionInner;
use crate::error::ClientError;
use crate::events::{ClientEvent, Delivery};
use parking_lot::Mutex;
use rill_protocol::deliver::{expand_sub_batch, parse_chunk, ParsedChunk, SubBatchJob};
use rill_protocol::Frame;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

type CompletionSlot = oneshot::Receiver<Result<Delivery, ClientError>>;

/// Lazily-created ordered queues, one per subscription id. They persist
/// for the life of the connection and are dropped on close.
pub(crate) struct SubscriptionQueues {
    queues: Mutex<HashMap<u8, mpsc::UnboundedSender<CompletionSlot>>>,
}

impl SubscriptionQueues {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Drops every queue; drainer tasks exit on their next poll.
    pub(crate) fn clear(&self) {
        self.queues.lock().clear();
    }

    fn enqueue(&self, inner: &Arc<ConnectionInner>, subscription_id: u8, slot: CompletionSlot) {
        let mut queues = self.queues.lock();
        let tx = queues
            .entry(subscription_id)
            .or_insert_with(|| spawn_drainer(inner, subscription_id));
        if tx.send(slot).is_err() {
            tracing::debug!("delivery queue for subscription {} is gone", subscription_id);
        }
    }
}

/// Handles one Deliver frame: parse, reserve the next queue position, and
/// kick off the decode. Called from the dispatch path so positions follow
/// frame receipt order.
pub(crate) async fn handle_deliver(inner: &Arc<ConnectionInner>, frame: Frame) {
    // The subscription id is the first payload byte; keep it for the
    // credit top-up even when the rest of the chunk fails to parse.
    let subscription_id = frame.payload.first().copied();

    let parsed = match parse_chunk(
        frame.payload,
        frame.version,
        &inner.config.compression,
        inner.config.check_crc,
    ) {
        Ok(parsed) => parsed,
        Err(err) => {
            inner.emit(ClientEvent::Error(err.into()));
            if let Some(sub_id) = subscription_id {
                let _ = inner.send_credit(sub_id, 1).await;
            }
            return;
        }
    };

    let sub_id = parsed.header.subscription_id;
    let (done_tx, done_rx) = oneshot::channel();
    inner.queues.enqueue(inner, sub_id, done_rx);
    tokio::spawn(decode_chunk(parsed, done_tx));
}

/// Completes one chunk: run every sub-batch job on the blocking pool,
/// write results into the pre-reserved slot ranges, finalize the record
/// table. Runs concurrently across chunks; ordering is the queue's job.
async fn decode_chunk(
    mut parsed: ParsedChunk,
    done: oneshot::Sender<Result<Delivery, ClientError>>,
) {
    let mut handles = Vec::with_capacity(parsed.jobs.len());
    for job in std::mem::take(&mut parsed.jobs) {
        let SubBatchJob {
            decode,
            compressed,
            first_slot,
            record_count,
        } = job;
        let handle = tokio::task::spawn_blocking(move || decode(&compressed));
        handles.push((first_slot, record_count, handle));
    }

    for (first_slot, record_count, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                let _ = done.send(Err(ClientError::Protocol(
                    rill_protocol::ProtocolError::Decompression(join_err.to_string()),
                )));
                return;
            }
        };
        let expanded = result.and_then(|data| {
            expand_sub_batch(&mut parsed.records, first_slot, record_count, &data)
        });
        if let Err(err) = expanded {
            let _ = done.send(Err(err.into()));
            return;
        }
    }

    let header = parsed.header;
    let outcome = parsed.into_records().map(|records| Delivery {
        subscription_id: header.subscription_id,
        committed_chunk_id: header.committed_chunk_id,
        timestamp: header.timestamp,
        offset: header.offset,
        records,
    });
    let _ = done.send(outcome.map_err(ClientError::from));
}

/// One drainer per subscription: releases completions strictly in the
/// order they were enqueued and tops up one credit per surfaced chunk.
fn spawn_drainer(
    inner: &Arc<ConnectionInner>,
    subscription_id: u8,
) -> mpsc::UnboundedSender<CompletionSlot> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CompletionSlot>();
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    let mut closed = inner.closed_signal();

    tokio::spawn(async move {
        loop {
            let slot = tokio::select! {
                slot = rx.recv() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
                _ = closed.changed() => break,
            };

            let outcome = tokio::select! {
                outcome = slot => outcome,
                _ = closed.changed() => break,
            };

            let Some(inner) = weak.upgrade() else { break };
            match outcome {
                Ok(Ok(delivery)) => inner.emit(ClientEvent::Delivery(delivery)),
                Ok(Err(err)) => inner.emit(ClientEvent::Error(err)),
                // Decode task dropped mid-shutdown: nothing to surface.
                Err(_) => continue,
            }
            let _ = inner.send_credit(subscription_id, 1).await;
        }
        tracing::debug!("drainer for subscription {} stopped", subscription_id);
    });

    tx
}
