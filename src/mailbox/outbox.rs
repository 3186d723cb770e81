//! Outbound mailbox writer.
//!
//! Each message is serialized into a dot-prefixed temporary file inside
//! the outbox and then persisted under its final name with a no-clobber
//! rename, so a consumer listing the directory never observes a partial
//! file. There is no delivery acknowledgement; from the writer's point of
//! view delivery is at-most-once.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::models::message::{OutboundDraft, OutboundMessage};
use crate::{AppError, Result};

/// Result of a successful outbox write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenMessage {
    /// Identifier of the persisted message.
    pub id: String,
    /// Absolute path of the persisted file.
    pub path: PathBuf,
}

/// Generates identifiers that sort by creation time and never collide.
///
/// An id is `<utc timestamp>-<instance tag>-<counter>`. The counter makes
/// ids unique within a process; the instance tag, a truncated SHA-256 over
/// the pid, start time, and a random UUID, separates processes sharing one
/// outbox.
#[derive(Debug)]
pub struct MessageIdGenerator {
    instance: String,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    /// Create a generator with a fresh instance tag.
    #[must_use]
    pub fn new() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(started.to_le_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        let digest = hasher.finalize();
        let instance = digest[..4].iter().map(|byte| format!("{byte:02x}")).collect();

        Self {
            instance,
            counter: AtomicU64::new(0),
        }
    }

    /// Instance tag embedded in every id.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Produce the next identifier.
    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ");
        format!("{stamp}-{}-{seq:06}", self.instance)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes [`OutboundMessage`] files into the outbox directory.
pub struct OutboxWriter {
    dir: PathBuf,
    sender: String,
    ids: MessageIdGenerator,
    written: AtomicU64,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl OutboxWriter {
    /// Construct a writer for `dir`, stamping messages with `sender`.
    #[must_use]
    pub fn new(dir: PathBuf, sender: String, audit: Option<Arc<dyn AuditLogger>>) -> Self {
        Self {
            dir,
            sender,
            ids: MessageIdGenerator::new(),
            written: AtomicU64::new(0),
            audit,
        }
    }

    /// Outbox directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of messages persisted since construction.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Build and persist a message from `draft`.
    ///
    /// This performs blocking file I/O; async callers should use
    /// [`write_async`](Self::write_async).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the temporary file cannot be written or
    /// the final name is already taken.
    pub fn write(&self, draft: OutboundDraft) -> Result<WrittenMessage> {
        let message = OutboundMessage::from_draft(self.ids.next_id(), self.sender.clone(), draft);
        let path = self.dir.join(message.file_name());

        let body = serde_json::to_vec_pretty(&message)
            .map_err(|err| AppError::Io(format!("failed to serialize outbound message: {err}")))?;

        std::fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create outbox {}: {err}",
                self.dir.display()
            ))
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;

        tmp.write_all(&body)
            .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|err| AppError::Io(format!("failed to sync temporary file: {err}")))?;

        tmp.persist_noclobber(&path).map_err(|err| {
            AppError::Io(format!(
                "failed to persist outbound message to {}: {err}",
                path.display()
            ))
        })?;

        self.written.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %message.id, path = %path.display(), "outbound message persisted");

        let mut entry = AuditEntry::new(AuditEventType::OutboundWritten)
            .with_message_id(message.id.clone())
            .with_file(message.file_name());
        if let Some(ref stream_id) = message.stream_id {
            entry = entry.with_stream(stream_id.clone());
        }
        audit::record(self.audit.as_deref(), entry);

        info!(
            message_id = %message.id,
            message_type = %message.message_type,
            "outbound message queued"
        );

        Ok(WrittenMessage {
            id: message.id,
            path,
        })
    }

    /// Persist a message on the blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write); also `AppError::Io` if the blocking
    /// task panics.
    pub async fn write_async(self: &Arc<Self>, draft: OutboundDraft) -> Result<WrittenMessage> {
        let writer = Arc::clone(self);
        tokio::task::spawn_blocking(move || writer.write(draft))
            .await
            .map_err(|err| AppError::Io(format!("outbox write task failed: {err}")))?
    }
}
