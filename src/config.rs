//! Global configuration parsing, validation, and path resolution.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Environment variable that overrides the default daemon root.
pub const ROOT_ENV: &str = "AGENT_CONDUIT_HOME";

/// Control socket limits and permissions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IpcConfig {
    /// Largest accepted request in bytes.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// How long a client may take to send its request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Unix permission bits applied to the socket file after bind.
    ///
    /// Anyone able to open the socket can run every command, `shutdown`
    /// included, so the default restricts it to the owning user.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: default_max_request_bytes(),
            request_timeout_ms: default_request_timeout_ms(),
            socket_mode: default_socket_mode(),
        }
    }
}

/// Mailbox directory layout and polling behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MailboxConfig {
    /// Directory the external collaborator consumes from.
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
    /// Directory the external collaborator writes results into.
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,
    /// Destination for successfully processed inbound files.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Destination for inbound files that keep failing.
    #[serde(default = "default_dead_letter_dir")]
    pub dead_letter_dir: PathBuf,
    /// Directory holding per-stream append-only chunk logs.
    #[serde(default = "default_streams_dir")]
    pub streams_dir: PathBuf,
    /// Inbox poll interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive failures before a file is dead-lettered.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            outbox_dir: default_outbox_dir(),
            inbox_dir: default_inbox_dir(),
            archive_dir: default_archive_dir(),
            dead_letter_dir: default_dead_letter_dir(),
            streams_dir: default_streams_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            max_failures: default_max_failures(),
        }
    }
}

/// Streaming session timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Idle window before a session is timed out.
    #[serde(default = "default_stream_timeout_ms")]
    pub timeout_ms: u64,
    /// How often the watchdog checks for idle sessions.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_stream_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
        }
    }
}

/// Heartbeat schedule.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Interval between heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// JSONL file receiving one record per heartbeat.
    #[serde(default = "default_heartbeat_log")]
    pub log_file: PathBuf,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            log_file: default_heartbeat_log(),
        }
    }
}

/// Message/ack audit trail.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuditConfig {
    /// Whether audit records are written.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory receiving the daily JSONL files.
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_audit_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_request_bytes() -> usize {
    64 * 1024
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_socket_mode() -> u32 {
    0o600
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}

fn default_inbox_dir() -> PathBuf {
    PathBuf::from("inbox")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archive")
}

fn default_dead_letter_dir() -> PathBuf {
    PathBuf::from("dead_letter")
}

fn default_streams_dir() -> PathBuf {
    PathBuf::from("streams")
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_failures() -> u32 {
    3
}

fn default_stream_timeout_ms() -> u64 {
    120_000
}

fn default_watchdog_interval_ms() -> u64 {
    250
}

fn default_heartbeat_interval_ms() -> u64 {
    60_000
}

fn default_heartbeat_log() -> PathBuf {
    PathBuf::from("heartbeat.jsonl")
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("conduit.sock")
}

fn default_sender() -> String {
    "conduit".into()
}

/// Global configuration parsed from `config.toml`.
///
/// Every relative path is resolved against [`root`](Self::root) during
/// validation, so consumers always see absolute locations.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Base directory for the socket, mailbox, and logs.
    pub root: PathBuf,
    /// Control socket path.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// `sender` value stamped on outbound messages.
    #[serde(default = "default_sender")]
    pub sender: String,
    /// Control socket settings.
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Mailbox settings.
    #[serde(default)]
    pub mailbox: MailboxConfig,
    /// Streaming settings.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Audit settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and resolve paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build an all-defaults configuration rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `root` is not absolute.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self {
            root: root.into(),
            socket_path: default_socket_path(),
            sender: default_sender(),
            ipc: IpcConfig::default(),
            mailbox: MailboxConfig::default(),
            stream: StreamConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            audit: AuditConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Root taken from `AGENT_CONDUIT_HOME`, falling back to
    /// `$HOME/.agent-conduit`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither variable is set.
    pub fn default_root() -> Result<PathBuf> {
        if let Ok(root) = env::var(ROOT_ENV) {
            return Ok(PathBuf::from(root));
        }
        env::var("HOME")
            .map(|home| PathBuf::from(home).join(".agent-conduit"))
            .map_err(|_| AppError::Config(format!("neither {ROOT_ENV} nor HOME is set")))
    }

    /// Inbox poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.mailbox.poll_interval_ms)
    }

    /// Stream idle timeout.
    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.timeout_ms)
    }

    /// Stream watchdog tick.
    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.stream.watchdog_interval_ms)
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Control request read timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc.request_timeout_ms)
    }

    /// Create every directory the daemon writes into.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a directory cannot be created.
    pub fn ensure_directories(&self) -> Result<()> {
        let mailbox = &self.mailbox;
        for dir in [
            &self.root,
            &mailbox.outbox_dir,
            &mailbox.inbox_dir,
            &mailbox.archive_dir,
            &mailbox.dead_letter_dir,
            &mailbox.streams_dir,
        ] {
            fs::create_dir_all(dir).map_err(|err| {
                AppError::Io(format!("failed to create {}: {err}", dir.display()))
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(AppError::Config(format!(
                "root must be an absolute path: {}",
                self.root.display()
            )));
        }

        let positive = [
            ("ipc.request_timeout_ms", self.ipc.request_timeout_ms),
            ("mailbox.poll_interval_ms", self.mailbox.poll_interval_ms),
            ("stream.timeout_ms", self.stream.timeout_ms),
            ("stream.watchdog_interval_ms", self.stream.watchdog_interval_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.ipc.max_request_bytes == 0 {
            return Err(AppError::Config(
                "ipc.max_request_bytes must be greater than zero".into(),
            ));
        }

        if self.mailbox.max_failures == 0 {
            return Err(AppError::Config(
                "mailbox.max_failures must be at least 1".into(),
            ));
        }

        if self.sender.trim().is_empty() {
            return Err(AppError::Config("sender must not be empty".into()));
        }

        let root = self.root.clone();
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        };
        resolve(&mut self.socket_path);
        resolve(&mut self.mailbox.outbox_dir);
        resolve(&mut self.mailbox.inbox_dir);
        resolve(&mut self.mailbox.archive_dir);
        resolve(&mut self.mailbox.dead_letter_dir);
        resolve(&mut self.mailbox.streams_dir);
        resolve(&mut self.heartbeat.log_file);
        resolve(&mut self.audit.dir);

        Ok(())
    }
}
