//! Progressive result delivery.
//!
//! The [`StreamManager`] owns the single in-flight stream session, the
//! per-stream log tailer lives in [`log`], and delivered chunks flow into a
//! [`StreamConsumer`](consumer::StreamConsumer).

pub mod consumer;
pub mod log;
pub mod manager;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

pub use consumer::{ChannelConsumer, FanoutConsumer, StreamBuffer, StreamConsumer};
pub use manager::{ChunkOutcome, DropReason, StreamManager};

use crate::models::chunk::Chunk;

/// Spawn the idle-timeout watchdog.
///
/// Every `interval` the active session is checked against the manager's
/// timeout; an expired session receives a `timeout` chunk.
#[must_use]
pub fn spawn_stream_watchdog(
    manager: Arc<StreamManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("stream watchdog shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some(stream_id) = manager.expire_idle(Instant::now()) {
                            debug!(%stream_id, "watchdog expired stream");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("stream_watchdog")),
    )
}

/// Spawn a task that logs every delivered chunk.
///
/// Feeds on the receiver of a [`ChannelConsumer`]; exits when the
/// channel closes or on cancellation.
#[must_use]
pub fn spawn_event_logger(
    mut events: mpsc::UnboundedReceiver<Chunk>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(chunk) = event else { break };
                        if chunk.chunk_type.is_terminal() {
                            info!(
                                stream_id = %chunk.stream_id,
                                chunk_type = ?chunk.chunk_type,
                                index = ?chunk.index,
                                "stream finished"
                            );
                        } else {
                            debug!(
                                stream_id = %chunk.stream_id,
                                chunk_type = ?chunk.chunk_type,
                                index = ?chunk.index,
                                bytes = chunk.content.len(),
                                "stream chunk delivered"
                            );
                        }
                    }
                }
            }
        }
        .instrument(info_span!("stream_events")),
    )
}
