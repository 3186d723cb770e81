//! Control socket server.
//!
//! Listens on a Unix domain socket (named pipe on Windows) via the
//! `interprocess` crate. Each connection carries exactly one exchange:
//!
//! ```json
//! {"command": "relay", "content": "summarise the build log", "priority": "high"}
//! ```
//!
//! answered by one JSON line, after which the server closes the
//! connection:
//!
//! ```json
//! {"ok": true, "data": {"message_id": "...", "file": "..."}}
//! {"ok": false, "error": "unknown command: foo"}
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::{GenericFilePath, ListenerOptions, ToFsName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::dispatch::CommandTable;
use crate::models::request::Request;
use crate::state::AppState;
use crate::{AppError, Result};

/// Response envelope written back to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response carrying `message`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Failed response for `err`, using its client-facing message.
    #[must_use]
    pub fn from_error(err: &AppError) -> Self {
        Self::error(err.response_message())
    }

    fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned());
        line.push('\n');
        line
    }
}

/// Bind the control socket and spawn the accept loop.
///
/// A leftover socket file is removed unless a live server still answers
/// on it. The loop stops when `state.shutdown` is cancelled, waits for
/// open connections to finish, and removes the socket file.
///
/// # Errors
///
/// Returns `AppError::Ipc` if another instance owns the socket or the
/// listener cannot be created.
pub async fn spawn_ipc_server(
    state: Arc<AppState>,
    table: Arc<CommandTable>,
) -> Result<JoinHandle<()>> {
    let path = state.config.socket_path.clone();
    prepare_socket_path(&path).await?;

    let name = path
        .as_path()
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Ipc(format!("invalid socket path {}: {err}", path.display())))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| {
            AppError::Ipc(format!(
                "failed to bind control socket {}: {err}",
                path.display()
            ))
        })?;
    set_socket_mode(&path, state.config.ipc.socket_mode)?;

    info!(socket = %path.display(), "control socket listening");

    let ct = state.shutdown.clone();
    let span = info_span!("ipc_server", socket = %path.display());
    let handle = tokio::spawn(
        async move {
            let tracker = TaskTracker::new();
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("control socket shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tracker.spawn(handle_connection(
                                    stream,
                                    Arc::clone(&state),
                                    Arc::clone(&table),
                                ));
                            }
                            Err(err) => warn!(%err, "control socket accept failed"),
                        }
                    }
                }
            }

            drop(listener);
            tracker.close();
            tracker.wait().await;
            remove_socket(&path);
            info!("control socket closed");
        }
        .instrument(span),
    );

    Ok(handle)
}

async fn prepare_socket_path(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Ipc(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        return Ok(());
    }

    let name = path
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Ipc(format!("invalid socket path {}: {err}", path.display())))?;
    if Stream::connect(name).await.is_ok() {
        return Err(AppError::Ipc(format!(
            "another instance is already listening on {}",
            path.display()
        )));
    }

    fs::remove_file(path).map_err(|err| {
        AppError::Ipc(format!(
            "failed to remove stale socket {}: {err}",
            path.display()
        ))
    })?;
    warn!(socket = %path.display(), "removed stale control socket");
    Ok(())
}

#[cfg(unix)]
fn set_socket_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| {
        AppError::Ipc(format!(
            "failed to set permissions on {}: {err}",
            path.display()
        ))
    })
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn remove_socket(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(socket = %path.display(), %err, "failed to remove control socket"),
    }
}

/// Read one request: bytes up to the first newline or EOF.
///
/// # Errors
///
/// Returns `AppError::RequestTooLarge` past `limit` bytes,
/// `AppError::Timeout` if nothing complete arrives within `timeout`, and
/// `AppError::Ipc` on read failure.
pub async fn read_request<R>(reader: R, limit: usize, timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut reader = BufReader::new(reader.take(cap));
    let mut buf = Vec::new();

    tokio::time::timeout(timeout, reader.read_until(b'\n', &mut buf))
        .await
        .map_err(|_| AppError::Timeout(format!("no request within {} ms", timeout.as_millis())))?
        .map_err(|err| AppError::Ipc(format!("failed to read request: {err}")))?;

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() > limit {
        return Err(AppError::RequestTooLarge(limit));
    }
    Ok(buf)
}

async fn handle_connection(stream: Stream, state: Arc<AppState>, table: Arc<CommandTable>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let limit = state.config.ipc.max_request_bytes;

        let response = match read_request(reader, limit, state.config.request_timeout()).await {
            Ok(raw) => respond(&raw, state, table).await,
            Err(err) => {
                warn!(%err, "rejected control request");
                IpcResponse::from_error(&err)
            }
        };

        if let Err(err) = writer.write_all(response.to_line().as_bytes()).await {
            warn!(%err, "failed to write control response");
            return;
        }
        if let Err(err) = writer.shutdown().await {
            debug!(%err, "control connection already closed");
        }
    }
    .instrument(span)
    .await;
}

async fn respond(raw: &[u8], state: Arc<AppState>, table: Arc<CommandTable>) -> IpcResponse {
    let request = match Request::parse(raw) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "malformed control request");
            return IpcResponse::from_error(&err);
        }
    };

    let command = request.command.clone();
    // Handlers run in their own task so a panic surfaces as a JoinError.
    let outcome = tokio::spawn(async move { table.dispatch(&request, &state).await }).await;

    match outcome {
        Ok(Ok(data)) => IpcResponse::success(data),
        Ok(Err(err)) => {
            info!(%command, %err, "command failed");
            IpcResponse::from_error(&err)
        }
        Err(err) => {
            error!(%command, %err, "command handler aborted");
            IpcResponse::error("internal error")
        }
    }
}
