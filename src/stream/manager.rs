//! Streaming session state machine.
//!
//! A session moves `pending → active → terminal`. At most one session is
//! non-terminal at a time. Chunks are indexed; anything at or below the
//! last accepted index is a duplicate and dropped. Accepted chunks are
//! queued under the lock and handed to the consumer after the lock is
//! released, by whichever caller first finds the queue idle, which keeps
//! delivery ordered across threads.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::consumer::StreamConsumer;
use super::log::{log_path, read_complete_lines};
use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::mailbox::inbox::{unique_destination, ARCHIVE_PREFIX};
use crate::models::chunk::{Chunk, ChunkType, SessionSnapshot, StreamSession, StreamState};
use crate::{AppError, Result};

/// Terminal stream ids remembered for dropping late chunks.
const RECENT_TERMINAL_CAPACITY: usize = 64;

/// Why an accepted-for-routing chunk was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Index not greater than the last accepted one.
    Duplicate,
    /// The stream already reached a terminal state.
    AfterTerminal,
}

/// Result of offering a chunk to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Queued for the consumer.
    Delivered,
    /// Belongs to a known stream but was discarded.
    Dropped(DropReason),
    /// No such stream, active or recent.
    Unknown,
}

#[derive(Default)]
struct Inner {
    active: Option<StreamSession>,
    recent_terminal: VecDeque<String>,
    queue: VecDeque<Chunk>,
    delivering: bool,
}

impl Inner {
    fn remember_terminal(&mut self, stream_id: String) {
        self.recent_terminal.push_back(stream_id);
        while self.recent_terminal.len() > RECENT_TERMINAL_CAPACITY {
            self.recent_terminal.pop_front();
        }
    }

    /// Accept `chunk` for the active session. Returns the outcome and, when
    /// the chunk ended the stream, its type.
    fn accept(&mut self, mut chunk: Chunk) -> (ChunkOutcome, Option<ChunkType>) {
        let matches_active = self
            .active
            .as_ref()
            .is_some_and(|session| session.stream_id == chunk.stream_id);

        if !matches_active {
            let outcome = if self.recent_terminal.contains(&chunk.stream_id) {
                ChunkOutcome::Dropped(DropReason::AfterTerminal)
            } else {
                ChunkOutcome::Unknown
            };
            return (outcome, None);
        }

        let Some(session) = self.active.as_mut() else {
            return (ChunkOutcome::Unknown, None);
        };

        let index = chunk.index.unwrap_or_else(|| session.next_index());
        if session.last_index.is_some_and(|last| index <= last) {
            return (ChunkOutcome::Dropped(DropReason::Duplicate), None);
        }

        chunk.index = Some(index);
        session.last_index = Some(index);
        session.last_activity = Instant::now();

        let chunk_type = chunk.chunk_type;
        let terminal = if chunk_type.is_terminal() {
            session.state = StreamState::Terminal;
            if let Some(done) = self.active.take() {
                self.remember_terminal(done.stream_id);
            }
            Some(chunk_type)
        } else {
            session.state = StreamState::Active;
            None
        };

        self.queue.push_back(chunk);
        (ChunkOutcome::Delivered, terminal)
    }

    /// Synthesize a terminal chunk for the active session.
    fn terminate(&mut self, chunk_type: ChunkType, content: String) -> Option<String> {
        let session = self.active.as_ref()?;
        let chunk = Chunk::new(chunk_type, session.stream_id.clone(), content)
            .with_index(session.next_index());
        let stream_id = session.stream_id.clone();
        self.accept(chunk);
        Some(stream_id)
    }
}

/// Clears the delivering flag if the consumer panics mid-drain.
struct DeliveryGuard<'a> {
    manager: &'a StreamManager,
    armed: bool,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.lock().delivering = false;
        }
    }
}

/// Tracks the single active stream session and delivers its chunks.
pub struct StreamManager {
    inner: Mutex<Inner>,
    consumer: Arc<dyn StreamConsumer>,
    timeout: Duration,
    streams_dir: PathBuf,
    archive_dir: PathBuf,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl StreamManager {
    /// Construct a manager.
    ///
    /// `streams_dir` holds the per-stream logs; terminal logs are moved to
    /// `archive_dir`.
    #[must_use]
    pub fn new(
        consumer: Arc<dyn StreamConsumer>,
        timeout: Duration,
        streams_dir: PathBuf,
        archive_dir: PathBuf,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            consumer,
            timeout,
            streams_dir,
            archive_dir,
            audit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle window before a session times out.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a pending session with a generated id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StreamBusy` if a session is already pending or
    /// active.
    pub fn start(&self) -> Result<String> {
        let stream_id = format!("stream-{}", Uuid::new_v4().simple());
        self.begin(&stream_id)?;
        Ok(stream_id)
    }

    /// Create a pending session for `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StreamBusy` if a session is already pending or
    /// active, or `AppError::BadRequest` if `stream_id` was used recently.
    pub fn begin(&self, stream_id: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            if let Some(ref active) = inner.active {
                return Err(AppError::StreamBusy(active.stream_id.clone()));
            }
            if inner.recent_terminal.iter().any(|id| id == stream_id) {
                return Err(AppError::BadRequest(format!(
                    "stream id already used: {stream_id}"
                )));
            }
            inner.active = Some(StreamSession::new(stream_id));
        }

        info!(stream_id, "stream session pending");
        audit::record(
            self.audit.as_deref(),
            AuditEntry::new(AuditEventType::StreamStarted).with_stream(stream_id),
        );
        Ok(())
    }

    /// Forget a pending session that never got its request out.
    ///
    /// Nothing is delivered; returns whether a session was removed.
    pub fn discard(&self, stream_id: &str) -> bool {
        let mut inner = self.lock();
        let matches = inner
            .active
            .as_ref()
            .is_some_and(|session| session.stream_id == stream_id);
        if matches {
            inner.active = None;
            debug!(stream_id, "pending stream discarded");
        }
        matches
    }

    /// Offer a chunk.
    ///
    /// Lines already appended to the target stream's log are accepted
    /// first, so a chunk arriving through the inbox never overtakes them.
    pub fn accept(&self, chunk: Chunk) -> ChunkOutcome {
        let stream_id = chunk.stream_id.clone();
        let targets_active = self
            .lock()
            .active
            .as_ref()
            .is_some_and(|session| session.stream_id == stream_id);
        if targets_active {
            if let Err(err) = self.poll_log() {
                warn!(%stream_id, %err, "stream log catch-up failed");
            }
        }
        let (outcome, terminal) = self.lock().accept(chunk);
        self.drain();
        if let Some(chunk_type) = terminal {
            self.finish(&stream_id, chunk_type);
        }
        outcome
    }

    /// Cancel `stream_id`, or the active session when `None`.
    ///
    /// A `cancelled` chunk is delivered and later chunks for the id are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the stream is not pending or active.
    pub fn cancel(&self, stream_id: Option<&str>) -> Result<String> {
        let cancelled = {
            let mut inner = self.lock();
            let matches = match (inner.active.as_ref(), stream_id) {
                (Some(active), Some(wanted)) => active.stream_id == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                inner.terminate(ChunkType::Cancelled, "stream cancelled by consumer".into())
            } else {
                None
            }
        };

        let Some(cancelled) = cancelled else {
            return Err(AppError::NotFound(match stream_id {
                Some(id) => format!("stream {id} is not active"),
                None => "no active stream".into(),
            }));
        };

        self.drain();
        info!(stream_id = %cancelled, "stream cancelled");
        self.finish(&cancelled, ChunkType::Cancelled);
        Ok(cancelled)
    }

    /// Time out the active session if it has been idle past the window.
    ///
    /// Returns the id of the session that was timed out.
    pub fn expire_idle(&self, now: Instant) -> Option<String> {
        let expired = {
            let mut inner = self.lock();
            let idle = inner
                .active
                .as_ref()
                .map(|session| now.saturating_duration_since(session.last_activity))?;
            if idle < self.timeout {
                return None;
            }
            let message = format!(
                "no chunk received within {} ms",
                self.timeout.as_millis()
            );
            inner.terminate(ChunkType::Timeout, message)?
        };

        self.drain();
        warn!(stream_id = %expired, "stream timed out");
        self.finish(&expired, ChunkType::Timeout);
        Some(expired)
    }

    /// Read new lines from the active session's log and accept them.
    ///
    /// An unindexed line is numbered by its line position, moved past any
    /// index already taken by chunks from the inbox.
    ///
    /// Returns the number of chunks delivered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log exists but cannot be read.
    pub fn poll_log(&self) -> Result<usize> {
        let Some((stream_id, offset)) = self
            .lock()
            .active
            .as_ref()
            .map(|session| (session.stream_id.clone(), session.log_offset))
        else {
            return Ok(0);
        };

        let path = log_path(&self.streams_dir, &stream_id);
        let Some(batch) = read_complete_lines(&path, offset)? else {
            return Ok(0);
        };
        if batch.lines.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        let mut terminal = None;
        {
            let mut inner = self.lock();
            let Some(session) = inner
                .active
                .as_mut()
                .filter(|session| session.stream_id == stream_id && session.log_offset == offset)
            else {
                return Ok(0);
            };
            session.log_offset = batch.end_offset;
            let first_line = session.log_lines;
            session.log_lines += u64::try_from(batch.lines.len()).unwrap_or(u64::MAX);

            for (line_no, line) in (first_line..).zip(&batch.lines) {
                if line.trim().is_empty() {
                    continue;
                }
                let chunk = match serde_json::from_str::<Chunk>(line) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!(%stream_id, line = line_no + 1, %err, "skipping malformed stream log line");
                        continue;
                    }
                };
                if chunk.stream_id != stream_id {
                    warn!(%stream_id, found = %chunk.stream_id, "stream log line for another stream");
                    continue;
                }
                let chunk = match (chunk.index, inner.active.as_ref()) {
                    (Some(_), _) | (None, None) => chunk,
                    (None, Some(session)) => {
                        let index = line_no.max(session.next_index());
                        chunk.with_index(index)
                    }
                };
                let (outcome, ended) = inner.accept(chunk);
                if outcome == ChunkOutcome::Delivered {
                    delivered += 1;
                }
                if ended.is_some() {
                    terminal = ended;
                    break;
                }
            }
        }

        self.drain();
        if let Some(chunk_type) = terminal {
            self.finish(&stream_id, chunk_type);
        }
        Ok(delivered)
    }

    /// Snapshot of the pending or active session.
    #[must_use]
    pub fn active(&self) -> Option<SessionSnapshot> {
        self.lock().active.as_ref().map(SessionSnapshot::from)
    }

    /// Whether `stream_id` is active or recently terminated.
    #[must_use]
    pub fn is_known(&self, stream_id: &str) -> bool {
        let inner = self.lock();
        inner
            .active
            .as_ref()
            .is_some_and(|session| session.stream_id == stream_id)
            || inner.recent_terminal.iter().any(|id| id == stream_id)
    }

    /// State of `stream_id`, if known.
    #[must_use]
    pub fn state_of(&self, stream_id: &str) -> Option<StreamState> {
        let inner = self.lock();
        match inner.active.as_ref() {
            Some(session) if session.stream_id == stream_id => Some(session.state),
            _ if inner.recent_terminal.iter().any(|id| id == stream_id) => {
                Some(StreamState::Terminal)
            }
            _ => None,
        }
    }

    /// Hand queued chunks to the consumer outside the lock.
    fn drain(&self) {
        {
            let mut inner = self.lock();
            if inner.delivering || inner.queue.is_empty() {
                return;
            }
            inner.delivering = true;
        }

        let mut guard = DeliveryGuard {
            manager: self,
            armed: true,
        };
        loop {
            let next = {
                let mut inner = self.lock();
                let next = inner.queue.pop_front();
                if next.is_none() {
                    inner.delivering = false;
                    guard.armed = false;
                }
                next
            };
            match next {
                Some(chunk) => self.consumer.deliver(chunk),
                None => return,
            }
        }
    }

    /// Post-terminal housekeeping: archive the stream log and audit.
    fn finish(&self, stream_id: &str, chunk_type: ChunkType) {
        let log = log_path(&self.streams_dir, stream_id);
        if log.exists() {
            let target = unique_destination(
                &self.archive_dir,
                &format!("{ARCHIVE_PREFIX}{stream_id}.jsonl"),
            );
            if let Err(err) = fs::rename(&log, &target) {
                warn!(stream_id, %err, "failed to archive stream log");
            }
        }

        info!(stream_id, ?chunk_type, "stream session terminal");
        audit::record(
            self.audit.as_deref(),
            AuditEntry::new(AuditEventType::StreamTerminated)
                .with_stream(stream_id)
                .with_detail(format!("{chunk_type:?}").to_lowercase()),
        );
    }
}
