//! Consumers of delivered stream chunks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::chunk::Chunk;

/// Receives chunks in stream order.
///
/// The manager never holds its session lock while calling
/// [`deliver`](Self::deliver), but calls may come from any thread,
/// including the mailbox poller's blocking worker. Implementations that
/// feed a UI must hand the chunk over to the UI thread rather than touch
/// UI state directly; [`ChannelConsumer`] does exactly that.
pub trait StreamConsumer: Send + Sync {
    /// Handle one chunk.
    fn deliver(&self, chunk: Chunk);
}

/// Forwards chunks over an unbounded channel to whichever thread owns the
/// receiver.
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiver it feeds.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Chunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamConsumer for ChannelConsumer {
    fn deliver(&self, chunk: Chunk) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(chunk);
    }
}

/// Delivers every chunk to each inner consumer in registration order.
#[derive(Default)]
pub struct FanoutConsumer {
    consumers: Vec<Arc<dyn StreamConsumer>>,
}

impl FanoutConsumer {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer.
    #[must_use]
    pub fn with(mut self, consumer: Arc<dyn StreamConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }
}

impl StreamConsumer for FanoutConsumer {
    fn deliver(&self, chunk: Chunk) {
        if let Some((last, rest)) = self.consumers.split_last() {
            for consumer in rest {
                consumer.deliver(chunk.clone());
            }
            last.deliver(chunk);
        }
    }
}

/// Chunks retained for one stream.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BufferedStream {
    /// Stream identifier.
    pub stream_id: String,
    /// Delivered chunks in order.
    pub chunks: Vec<Chunk>,
    /// Whether a terminal chunk has been delivered.
    pub finished: bool,
}

/// Retains delivered chunks so foreground clients can poll for them.
///
/// Keeps the most recent `capacity` streams.
pub struct StreamBuffer {
    capacity: usize,
    streams: Mutex<VecDeque<BufferedStream>>,
}

impl StreamBuffer {
    /// Create a buffer retaining up to `capacity` streams.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: Mutex::new(VecDeque::new()),
        }
    }

    /// Chunks of `stream_id` whose index is greater than `after`.
    ///
    /// Returns `None` if the stream is unknown to the buffer.
    #[must_use]
    pub fn read(&self, stream_id: &str, after: Option<u64>) -> Option<BufferedStream> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.iter().find(|stream| stream.stream_id == stream_id)?;
        let chunks = stream
            .chunks
            .iter()
            .filter(|chunk| match (after, chunk.index) {
                (Some(after), Some(index)) => index > after,
                _ => true,
            })
            .cloned()
            .collect();
        Some(BufferedStream {
            stream_id: stream.stream_id.clone(),
            chunks,
            finished: stream.finished,
        })
    }

    /// Register a stream before any chunk arrives.
    pub fn open(&self, stream_id: &str) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if streams.iter().any(|stream| stream.stream_id == stream_id) {
            return;
        }
        streams.push_back(BufferedStream {
            stream_id: stream_id.to_owned(),
            chunks: Vec::new(),
            finished: false,
        });
        while streams.len() > self.capacity {
            streams.pop_front();
        }
    }
}

impl StreamConsumer for StreamBuffer {
    fn deliver(&self, chunk: Chunk) {
        self.open(&chunk.stream_id);
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = streams
            .iter_mut()
            .find(|stream| stream.stream_id == chunk.stream_id)
        {
            stream.finished |= chunk.chunk_type.is_terminal();
            stream.chunks.push(chunk);
        }
    }
}
