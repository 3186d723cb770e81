//! Shared application context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLogger, JsonlAuditWriter};
use crate::config::GlobalConfig;
use crate::heartbeat::HeartbeatMonitor;
use crate::mailbox::inbox::InboxPoller;
use crate::mailbox::outbox::OutboxWriter;
use crate::mailbox::resolver::{LogSink, MailboxResolver};
use crate::mailbox::MailboxStats;
use crate::stream::{FanoutConsumer, StreamBuffer, StreamConsumer, StreamManager};
use crate::Result;

/// Streams retained by the `stream_read` buffer.
const BUFFERED_STREAMS: usize = 16;

/// Everything the tasks and command handlers share.
///
/// Built once at startup and passed around behind an `Arc`.
pub struct AppState {
    /// Validated configuration.
    pub config: Arc<GlobalConfig>,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Monotonic start time for uptime.
    pub started: Instant,
    /// Heartbeat monitor.
    pub heartbeat: Arc<HeartbeatMonitor>,
    /// Stream session manager.
    pub streams: Arc<StreamManager>,
    /// Delivered chunks kept for `stream_read`.
    pub buffer: Arc<StreamBuffer>,
    /// Outbound mailbox writer.
    pub outbox: Arc<OutboxWriter>,
    /// Inbound mailbox poller.
    pub poller: Arc<InboxPoller>,
    /// Inbound counters.
    pub stats: Arc<MailboxStats>,
    /// Sink for inbound records that belong to no stream.
    pub sink: Arc<LogSink>,
    /// Audit log, when enabled.
    pub audit: Option<Arc<dyn AuditLogger>>,
    /// Cancelled to stop every background task.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire up the shared state from `config`.
    ///
    /// Delivered chunks go to the `stream_read` buffer and, when given, to
    /// `consumer` as well.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a mailbox or audit directory cannot be
    /// created.
    pub fn build(
        config: GlobalConfig,
        consumer: Option<Arc<dyn StreamConsumer>>,
    ) -> Result<Self> {
        config.ensure_directories()?;

        let audit: Option<Arc<dyn AuditLogger>> = if config.audit.enabled {
            Some(Arc::new(JsonlAuditWriter::new(config.audit.dir.clone())?))
        } else {
            None
        };

        let buffer = Arc::new(StreamBuffer::new(BUFFERED_STREAMS));
        let mut fanout = FanoutConsumer::new().with(Arc::clone(&buffer) as Arc<dyn StreamConsumer>);
        if let Some(consumer) = consumer {
            fanout = fanout.with(consumer);
        }

        let streams = Arc::new(StreamManager::new(
            Arc::new(fanout),
            config.stream_timeout(),
            config.mailbox.streams_dir.clone(),
            config.mailbox.archive_dir.clone(),
            audit.clone(),
        ));

        let stats = Arc::new(MailboxStats::default());
        let sink = Arc::new(LogSink::default());
        let resolver = Arc::new(MailboxResolver::new(Arc::clone(&streams), Arc::clone(&sink)));
        let poller = Arc::new(InboxPoller::from_config(
            &config,
            resolver,
            Arc::clone(&stats),
            audit.clone(),
        )?);

        let outbox = Arc::new(OutboxWriter::new(
            config.mailbox.outbox_dir.clone(),
            config.sender.clone(),
            audit.clone(),
        ));

        Ok(Self {
            heartbeat: Arc::new(HeartbeatMonitor::new(config.heartbeat_interval())),
            config: Arc::new(config),
            started_at: Utc::now(),
            started: Instant::now(),
            streams,
            buffer,
            outbox,
            poller,
            stats,
            sink,
            audit,
            shutdown: CancellationToken::new(),
        })
    }

    /// Time since the state was built.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
