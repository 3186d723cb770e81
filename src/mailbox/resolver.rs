//! Routing of parsed inbound messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::models::message::{InboundMessage, InboundRecord};
use crate::stream::{ChunkOutcome, StreamManager};
use crate::Result;

/// What happened to the records of one inbound message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Chunks handed to the stream manager and delivered.
    pub delivered: usize,
    /// Chunks for known streams that were dropped (duplicates, late).
    pub dropped: usize,
    /// Records routed to the generic sink.
    pub logged: usize,
}

/// Capability invoked by the poller for each parsed inbound message.
///
/// Returning `Ok` allows the poller to archive the source file; returning
/// `Err` leaves it in the inbox for a retry.
pub trait InboundResolver: Send + Sync {
    /// Resolve every record of `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be handled right now.
    fn resolve(&self, message: &InboundMessage) -> Result<Resolution>;
}

/// Sink for collaborator output that does not belong to a known stream.
#[derive(Debug, Default)]
pub struct LogSink {
    received: AtomicU64,
}

impl LogSink {
    /// Log a record.
    pub fn accept(&self, source: &str, record: &Value) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let sender = record.get("sender").and_then(Value::as_str).unwrap_or("unknown");
        let summary = record
            .get("content")
            .or_else(|| record.get("response"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(source, sender, content = summary, "inbound message received");
    }

    /// Records accepted since construction.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Default resolver: chunks for known streams go to the stream manager,
/// everything else to the [`LogSink`].
pub struct MailboxResolver {
    streams: Arc<StreamManager>,
    sink: Arc<LogSink>,
}

impl MailboxResolver {
    /// Construct a resolver over the given manager and sink.
    #[must_use]
    pub fn new(streams: Arc<StreamManager>, sink: Arc<LogSink>) -> Self {
        Self { streams, sink }
    }
}

impl InboundResolver for MailboxResolver {
    fn resolve(&self, message: &InboundMessage) -> Result<Resolution> {
        let source = message
            .source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut resolution = Resolution::default();
        for record in &message.records {
            match record {
                InboundRecord::Chunk(chunk) => match self.streams.accept(chunk.clone()) {
                    ChunkOutcome::Delivered => resolution.delivered += 1,
                    ChunkOutcome::Dropped(reason) => {
                        debug!(stream_id = %chunk.stream_id, ?reason, "inbound chunk dropped");
                        resolution.dropped += 1;
                    }
                    ChunkOutcome::Unknown => {
                        let value = serde_json::to_value(chunk).unwrap_or(Value::Null);
                        self.sink.accept(&source, &value);
                        resolution.logged += 1;
                    }
                },
                InboundRecord::Generic(value) => {
                    self.sink.accept(&source, value);
                    resolution.logged += 1;
                }
            }
        }
        Ok(resolution)
    }
}
