//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed control request (not JSON, not an object, no `command`).
    Protocol(String),
    /// Control request exceeded the configured byte limit.
    RequestTooLarge(usize),
    /// Command name not present in the dispatch table.
    UnknownCommand(String),
    /// Well-formed request with missing or invalid fields.
    BadRequest(String),
    /// Control socket failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Inbound mailbox record could not be parsed or resolved.
    Mailbox(String),
    /// An operation or stream did not make progress in time.
    Timeout(String),
    /// Work item was already claimed by another poll cycle.
    DuplicateProcessing(String),
    /// A stream session is already pending or active.
    StreamBusy(String),
    /// Requested entity does not exist.
    NotFound(String),
}

impl AppError {
    /// Text returned to control-socket clients for this error.
    ///
    /// Protocol failures collapse to a fixed message; the detail is only
    /// logged server-side.
    #[must_use]
    pub fn response_message(&self) -> String {
        match self {
            Self::Protocol(_) => "invalid message format".to_owned(),
            Self::RequestTooLarge(_) => "request too large".to_owned(),
            Self::UnknownCommand(name) => format!("unknown command: {name}"),
            Self::Timeout(_) => "request timed out".to_owned(),
            Self::StreamBusy(id) => format!("stream already active: {id}"),
            Self::BadRequest(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::RequestTooLarge(limit) => {
                write!(f, "protocol: request exceeds {limit} bytes")
            }
            Self::UnknownCommand(name) => write!(f, "unknown command: {name}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Mailbox(msg) => write!(f, "mailbox: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::DuplicateProcessing(msg) => write!(f, "duplicate processing: {msg}"),
            Self::StreamBusy(id) => write!(f, "stream busy: {id}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
