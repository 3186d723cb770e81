//! Stream chunk and session models.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of progressive result unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Intermediate reasoning indicator.
    Thinking,
    /// Part of the response body.
    #[serde(rename = "partial_response", alias = "partial")]
    Partial,
    /// Final chunk written by the collaborator.
    #[serde(rename = "stream_end", alias = "complete")]
    Complete,
    /// Synthesized locally when the collaborator went silent.
    Timeout,
    /// Synthesized locally when the consumer cancelled.
    Cancelled,
}

impl ChunkType {
    /// Whether a chunk of this type ends its stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Timeout | Self::Cancelled)
    }
}

/// One incremental unit of a progressively delivered response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk classification.
    pub chunk_type: ChunkType,
    /// Stream this chunk belongs to.
    pub stream_id: String,
    /// Chunk body. `final_content` is accepted for `stream_end` records.
    #[serde(default, alias = "final_content")]
    pub content: String,
    /// Generation time.
    #[serde(
        default = "Utc::now",
        deserialize_with = "super::deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    /// Position within the stream; assigned on acceptance when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl Chunk {
    /// Build a chunk stamped with the current time.
    #[must_use]
    pub fn new(chunk_type: ChunkType, stream_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            chunk_type,
            stream_id: stream_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            index: None,
        }
    }

    /// Set an explicit stream position.
    #[must_use]
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }
}

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Created, no chunk seen yet.
    Pending,
    /// At least one non-terminal chunk seen.
    Active,
    /// Completed, cancelled, or timed out.
    Terminal,
}

/// Book-keeping for one progressive response.
#[derive(Debug, Clone)]
pub struct StreamSession {
    /// Stream identifier.
    pub stream_id: String,
    /// Current lifecycle state.
    pub state: StreamState,
    /// Index of the last accepted chunk.
    pub last_index: Option<u64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Creation or last chunk, whichever is later; drives the idle timeout.
    pub last_activity: Instant,
    /// Bytes of the stream log already consumed.
    pub log_offset: u64,
    /// Complete lines of the stream log already consumed.
    pub log_lines: u64,
}

impl StreamSession {
    /// Start a pending session.
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            state: StreamState::Pending,
            last_index: None,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            log_offset: 0,
            log_lines: 0,
        }
    }

    /// Index the next chunk receives when it carries none.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.last_index.map_or(0, |last| last + 1)
    }
}

/// Public view of a session for status responses.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Stream identifier.
    pub stream_id: String,
    /// Current lifecycle state.
    pub state: StreamState,
    /// Index of the last accepted chunk.
    pub last_index: Option<u64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<&StreamSession> for SessionSnapshot {
    fn from(session: &StreamSession) -> Self {
        Self {
            stream_id: session.stream_id.clone(),
            state: session.state,
            last_index: session.last_index,
            created_at: session.created_at,
        }
    }
}
