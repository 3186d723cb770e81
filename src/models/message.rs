//! Mailbox message models exchanged with the external collaborator.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chunk::Chunk;
use crate::{AppError, Result};

/// Message type used for stream-initiating requests.
pub const STREAMING_REQUEST: &str = "streaming_request";

/// Default message type for plain relays.
pub const DEFAULT_MESSAGE_TYPE: &str = "request";

/// Urgency hint passed through to the collaborator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default urgency.
    #[default]
    Medium,
    /// Should be picked up ahead of medium messages.
    High,
    /// Should be picked up immediately.
    Urgent,
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(AppError::BadRequest(format!("invalid priority: {other}"))),
        }
    }
}

/// Caller-supplied parts of an outbound message.
///
/// The writer fills in `id`, `timestamp`, and `sender`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDraft {
    /// Free-form classification understood by the collaborator.
    pub message_type: String,
    /// Urgency hint.
    pub priority: Priority,
    /// Message body.
    pub content: String,
    /// Optional specific request.
    pub request: Option<String>,
    /// Stream the collaborator should write chunks for.
    pub stream_id: Option<String>,
}

impl OutboundDraft {
    /// Draft a plain relay message.
    #[must_use]
    pub fn relay(content: impl Into<String>) -> Self {
        Self {
            message_type: DEFAULT_MESSAGE_TYPE.to_owned(),
            priority: Priority::default(),
            content: content.into(),
            request: None,
            stream_id: None,
        }
    }

    /// Draft a stream-initiating message for `stream_id`.
    #[must_use]
    pub fn streaming(content: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            message_type: STREAMING_REQUEST.to_owned(),
            priority: Priority::default(),
            content: content.into(),
            request: None,
            stream_id: Some(stream_id.into()),
        }
    }

    /// Override the message type.
    #[must_use]
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    /// Override the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a specific request.
    #[must_use]
    pub fn with_request(mut self, request: Option<String>) -> Self {
        self.request = request;
        self
    }
}

/// One record in the outbox, consumed by the external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Collision-free identifier; also the file stem.
    pub id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Writer identity.
    pub sender: String,
    /// Free-form classification.
    pub message_type: String,
    /// Urgency hint.
    pub priority: Priority,
    /// Message body.
    pub content: String,
    /// Optional specific request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    /// Stream the collaborator should write chunks for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Whether the collaborator should answer progressively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_stream: Option<bool>,
}

impl OutboundMessage {
    /// Assemble a message from a draft.
    #[must_use]
    pub fn from_draft(id: String, sender: String, draft: OutboundDraft) -> Self {
        let expect_stream = draft.stream_id.as_ref().map(|_| true);
        Self {
            id,
            timestamp: Utc::now(),
            sender,
            message_type: draft.message_type,
            priority: draft.priority,
            content: draft.content,
            request: draft.request,
            stream_id: draft.stream_id,
            expect_stream,
        }
    }

    /// File name used in the outbox.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

/// One parsed record from an inbound file.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRecord {
    /// Progressive result chunk.
    Chunk(Chunk),
    /// Any other collaborator output.
    Generic(Value),
}

impl InboundRecord {
    /// Classify a JSON value; objects carrying `chunk_type` are chunks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Mailbox` if the value is not an object or is a
    /// malformed chunk.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(AppError::Mailbox("record is not a json object".into()));
        }
        if value.get("chunk_type").is_some() {
            let chunk = serde_json::from_value::<Chunk>(value)
                .map_err(|err| AppError::Mailbox(format!("invalid chunk: {err}")))?;
            return Ok(Self::Chunk(chunk));
        }
        Ok(Self::Generic(value))
    }
}

/// A file picked up from the inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Path the records were read from.
    pub source: PathBuf,
    /// Records in file order.
    pub records: Vec<InboundRecord>,
    /// File modification time, when available.
    pub modified: Option<DateTime<Utc>>,
}

impl InboundMessage {
    /// Parse file contents. `.jsonl` files hold one record per line;
    /// anything else holds exactly one record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Mailbox` on invalid UTF-8, invalid JSON, or an
    /// empty file.
    pub fn parse(source: &Path, bytes: &[u8], modified: Option<DateTime<Utc>>) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| AppError::Mailbox(format!("file is not utf-8: {err}")))?;

        let is_lines = source
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));

        let mut records = Vec::new();
        if is_lines {
            for (number, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(line).map_err(|err| {
                    AppError::Mailbox(format!("line {}: invalid json: {err}", number + 1))
                })?;
                records.push(InboundRecord::from_value(value)?);
            }
        } else {
            let value: Value = serde_json::from_str(text)
                .map_err(|err| AppError::Mailbox(format!("invalid json: {err}")))?;
            records.push(InboundRecord::from_value(value)?);
        }

        if records.is_empty() {
            return Err(AppError::Mailbox("file contains no records".into()));
        }

        Ok(Self {
            source: source.to_owned(),
            records,
            modified,
        })
    }
}
