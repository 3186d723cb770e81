//! Built-in control commands.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::dispatch::{CommandHandler, CommandKind, CommandTableBuilder, HandlerFuture};
use crate::audit::{self, AuditEntry, AuditEventType};
use crate::models::message::{OutboundDraft, Priority};
use crate::models::request::Request;
use crate::state::AppState;
use crate::{AppError, Result};

/// Register every built-in command on `builder`.
#[must_use]
pub fn register_all(builder: CommandTableBuilder) -> CommandTableBuilder {
    builder
        .register(StatusCommand)
        .register(HeartbeatCommand)
        .register(RelayCommand)
        .register(StreamCommand)
        .register(StreamReadCommand)
        .register(CancelCommand)
        .register(ShutdownCommand)
}

fn priority_arg(request: &Request) -> Result<Priority> {
    request
        .str_arg("priority")
        .map_or(Ok(Priority::default()), str::parse)
}

fn record_command(state: &AppState, request: &Request) {
    audit::record(
        state.audit.as_deref(),
        AuditEntry::new(AuditEventType::Command).with_command(request.command.clone()),
    );
}

/// `status`: daemon liveness and counters.
pub struct StatusCommand;

impl CommandHandler for StatusCommand {
    fn name(&self) -> &'static str {
        "status"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Query
    }

    fn handle<'a>(&'a self, _request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            let counts = state.stats.snapshot();
            Ok(json!({
                "alive": true,
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": state.uptime().as_secs(),
                "started_at": state.started_at,
                "last_heartbeat": state.heartbeat.last(),
                "heartbeat_count": state.heartbeat.count(),
                "active_stream": state.streams.active(),
                "mailbox": {
                    "outbox_dir": state.outbox.dir().display().to_string(),
                    "outbound_written": state.outbox.written(),
                    "inbound_processed": counts.inbound_processed,
                    "inbound_failed": counts.inbound_failed,
                    "inbound_logged": state.sink.received(),
                    "dead_lettered": counts.dead_lettered,
                },
            }))
        })
    }
}

/// `heartbeat`: last pulse and staleness.
pub struct HeartbeatCommand;

impl CommandHandler for HeartbeatCommand {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Query
    }

    fn handle<'a>(&'a self, _request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            let monitor = &state.heartbeat;
            Ok(json!({
                "last_heartbeat": monitor.last(),
                "heartbeat_count": monitor.count(),
                "interval_ms": u64::try_from(monitor.interval().as_millis()).unwrap_or(u64::MAX),
                "stale": monitor.is_stale(Utc::now()),
            }))
        })
    }
}

/// `relay`: write one outbound message.
pub struct RelayCommand;

impl CommandHandler for RelayCommand {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Relay
    }

    fn handle<'a>(&'a self, request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mut draft = OutboundDraft::relay(request.required_str("content")?)
                .with_priority(priority_arg(request)?)
                .with_request(request.str_arg("request").map(str::to_owned));
            if let Some(message_type) = request.str_arg("message_type") {
                draft = draft.with_type(message_type);
            }

            record_command(state, request);
            let written = state.outbox.write_async(draft).await?;
            Ok(json!({
                "message_id": written.id,
                "file": written.path,
            }))
        })
    }
}

/// `stream`: open a session and ask the collaborator to stream into it.
pub struct StreamCommand;

impl CommandHandler for StreamCommand {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Stream
    }

    fn handle<'a>(&'a self, request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            let content = request.required_str("content")?;
            let priority = priority_arg(request)?;
            let extra = request.str_arg("request").map(str::to_owned);

            record_command(state, request);
            let stream_id = state.streams.start()?;

            let draft = OutboundDraft::streaming(content, stream_id.clone())
                .with_priority(priority)
                .with_request(extra);
            let written = match state.outbox.write_async(draft).await {
                Ok(written) => written,
                Err(err) => {
                    warn!(%stream_id, %err, "stream request not written; discarding session");
                    state.streams.discard(&stream_id);
                    return Err(err);
                }
            };

            state.buffer.open(&stream_id);
            info!(%stream_id, message_id = %written.id, "stream requested");
            Ok(json!({
                "stream_id": stream_id,
                "message_id": written.id,
            }))
        })
    }
}

/// `stream_read`: chunks buffered for a stream.
pub struct StreamReadCommand;

impl CommandHandler for StreamReadCommand {
    fn name(&self) -> &'static str {
        "stream_read"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Query
    }

    fn handle<'a>(&'a self, request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            let stream_id = request.required_str("stream_id")?;
            let after = request.u64_arg("after")?;

            let Some(buffered) = state.buffer.read(stream_id, after) else {
                return Err(AppError::NotFound(format!("unknown stream: {stream_id}")));
            };
            Ok(json!({
                "stream_id": buffered.stream_id,
                "chunks": buffered.chunks,
                "finished": buffered.finished,
            }))
        })
    }
}

/// `cancel`: terminate a stream early.
pub struct CancelCommand;

impl CommandHandler for CancelCommand {
    fn name(&self) -> &'static str {
        "cancel"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Control
    }

    fn handle<'a>(&'a self, request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            record_command(state, request);
            let stream_id = state.streams.cancel(request.str_arg("stream_id"))?;
            Ok(json!({
                "stream_id": stream_id,
                "state": "cancelled",
            }))
        })
    }
}

/// `shutdown`: stop the daemon.
pub struct ShutdownCommand;

impl CommandHandler for ShutdownCommand {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Control
    }

    fn handle<'a>(&'a self, request: &'a Request, state: &'a AppState) -> HandlerFuture<'a> {
        Box::pin(async move {
            record_command(state, request);
            info!("shutdown requested over the control socket");
            state.shutdown.cancel();
            Ok(json!({ "status": "shutting down" }))
        })
    }
}
