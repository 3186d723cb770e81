//! Unit tests for `GlobalConfig` parsing, validation, and path resolution.

use std::path::PathBuf;
use std::time::Duration;

use agent_conduit::config::GlobalConfig;
use agent_conduit::AppError;

fn root() -> PathBuf {
    std::env::temp_dir().join("agent-conduit-config-tests")
}

fn toml_with(body: &str) -> String {
    format!(
        "root = '{}'\n{body}",
        root().to_string_lossy().replace('\\', "\\\\")
    )
}

#[test]
fn minimal_config_applies_defaults() {
    let config = GlobalConfig::from_toml_str(&toml_with("")).expect("valid config");

    assert_eq!(config.sender, "conduit");
    assert_eq!(config.ipc.max_request_bytes, 64 * 1024);
    assert_eq!(config.ipc.socket_mode, 0o600);
    assert_eq!(config.mailbox.max_failures, 3);
    assert_eq!(config.poll_interval(), Duration::from_secs(1));
    assert_eq!(config.stream_timeout(), Duration::from_secs(120));
    assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
    assert!(config.audit.enabled);
}

#[test]
fn relative_paths_resolve_against_root() {
    let config = GlobalConfig::from_toml_str(&toml_with("")).expect("valid config");
    let root = root();

    assert_eq!(config.socket_path, root.join("conduit.sock"));
    assert_eq!(config.mailbox.outbox_dir, root.join("outbox"));
    assert_eq!(config.mailbox.inbox_dir, root.join("inbox"));
    assert_eq!(config.mailbox.archive_dir, root.join("archive"));
    assert_eq!(config.mailbox.dead_letter_dir, root.join("dead_letter"));
    assert_eq!(config.mailbox.streams_dir, root.join("streams"));
    assert_eq!(config.heartbeat.log_file, root.join("heartbeat.jsonl"));
    assert_eq!(config.audit.dir, root.join("logs"));
}

#[test]
fn absolute_paths_are_kept() {
    let elsewhere = std::env::temp_dir().join("elsewhere-outbox");
    let body = format!(
        "[mailbox]\noutbox_dir = '{}'\n",
        elsewhere.to_string_lossy().replace('\\', "\\\\")
    );
    let config = GlobalConfig::from_toml_str(&toml_with(&body)).expect("valid config");
    assert_eq!(config.mailbox.outbox_dir, elsewhere);
}

#[test]
fn sections_override_defaults() {
    let body = r#"
sender = "nova"

[ipc]
max_request_bytes = 1024
request_timeout_ms = 250
socket_mode = 0o660

[mailbox]
poll_interval_ms = 50
max_failures = 5

[stream]
timeout_ms = 2000
watchdog_interval_ms = 20

[heartbeat]
interval_ms = 100

[audit]
enabled = false
"#;
    let config = GlobalConfig::from_toml_str(&toml_with(body)).expect("valid config");

    assert_eq!(config.sender, "nova");
    assert_eq!(config.ipc.max_request_bytes, 1024);
    assert_eq!(config.request_timeout(), Duration::from_millis(250));
    assert_eq!(config.ipc.socket_mode, 0o660);
    assert_eq!(config.poll_interval(), Duration::from_millis(50));
    assert_eq!(config.mailbox.max_failures, 5);
    assert_eq!(config.stream_timeout(), Duration::from_secs(2));
    assert_eq!(config.watchdog_interval(), Duration::from_millis(20));
    assert_eq!(config.heartbeat_interval(), Duration::from_millis(100));
    assert!(!config.audit.enabled);
}

#[test]
fn relative_root_is_rejected() {
    let result = GlobalConfig::from_toml_str("root = 'relative/dir'");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("absolute")));
}

#[test]
fn missing_root_is_rejected() {
    let result = GlobalConfig::from_toml_str("sender = 'x'");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_intervals_are_rejected() {
    for body in [
        "[mailbox]\npoll_interval_ms = 0",
        "[stream]\ntimeout_ms = 0",
        "[stream]\nwatchdog_interval_ms = 0",
        "[heartbeat]\ninterval_ms = 0",
        "[ipc]\nrequest_timeout_ms = 0",
    ] {
        let result = GlobalConfig::from_toml_str(&toml_with(body));
        assert!(
            matches!(result, Err(AppError::Config(ref msg)) if msg.contains("greater than zero")),
            "expected rejection for {body:?}, got {result:?}"
        );
    }
}

#[test]
fn zero_request_limit_is_rejected() {
    let result = GlobalConfig::from_toml_str(&toml_with("[ipc]\nmax_request_bytes = 0"));
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn zero_max_failures_is_rejected() {
    let result = GlobalConfig::from_toml_str(&toml_with("[mailbox]\nmax_failures = 0"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("max_failures")));
}

#[test]
fn blank_sender_is_rejected() {
    let result = GlobalConfig::from_toml_str(&toml_with("sender = '  '"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("sender")));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let result = GlobalConfig::from_toml_str("root = [");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn with_root_matches_parsed_defaults() {
    let built = GlobalConfig::with_root(root()).expect("valid root");
    let parsed = GlobalConfig::from_toml_str(&toml_with("")).expect("valid config");
    assert_eq!(built, parsed);
}

#[test]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, toml_with("sender = 'from-file'")).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load config");
    assert_eq!(config.sender, "from-file");
}

#[test]
fn load_from_missing_path_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = GlobalConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("failed to read")));
}

#[test]
fn ensure_directories_creates_mailbox_tree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::with_root(temp.path().join("home")).expect("config");

    config.ensure_directories().expect("create directories");

    for dir in [
        &config.mailbox.outbox_dir,
        &config.mailbox.inbox_dir,
        &config.mailbox.archive_dir,
        &config.mailbox.dead_letter_dir,
        &config.mailbox.streams_dir,
    ] {
        assert!(dir.is_dir(), "{} should exist", dir.display());
    }
}
