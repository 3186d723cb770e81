//! Periodic liveness pulse.
//!
//! The scheduler updates an in-memory [`HeartbeatMonitor`] read by the
//! `status` and `heartbeat` commands, and appends each pulse to a JSONL
//! log so external watchers can see the daemon is alive.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::heartbeat::HeartbeatRecord;
use crate::{AppError, Result};

#[derive(Debug, Default)]
struct Pulse {
    last: Option<DateTime<Utc>>,
    count: u64,
}

/// Last heartbeat and pulse count.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    pulse: Mutex<Pulse>,
}

impl HeartbeatMonitor {
    /// Create a monitor expecting a pulse every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pulse: Mutex::new(Pulse::default()),
        }
    }

    /// Record a pulse at `now` and return it.
    pub fn beat(&self, now: DateTime<Utc>) -> HeartbeatRecord {
        let mut pulse = self.pulse.lock().unwrap_or_else(PoisonError::into_inner);
        pulse.count += 1;
        pulse.last = Some(now);
        HeartbeatRecord {
            timestamp: now,
            sequence: pulse.count,
        }
    }

    /// Time of the most recent pulse.
    #[must_use]
    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.pulse.lock().unwrap_or_else(PoisonError::into_inner).last
    }

    /// Pulses recorded since start.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.pulse.lock().unwrap_or_else(PoisonError::into_inner).count
    }

    /// Expected pulse interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the last pulse is older than two intervals at `now`.
    ///
    /// A monitor that has never pulsed is not stale.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last() else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(self.interval * 2) else {
            return false;
        };
        now - last > window
    }
}

/// Append `record` as one line to the heartbeat log at `path`.
///
/// # Errors
///
/// Returns `AppError::Io` if the log cannot be opened or written.
pub fn append_record(path: &Path, record: &HeartbeatRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::Io(format!("failed to create {}: {err}", parent.display())))?;
    }
    let mut line = serde_json::to_string(record)
        .map_err(|err| AppError::Io(format!("failed to serialize heartbeat: {err}")))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;
    file.write_all(line.as_bytes())
        .map_err(|err| AppError::Io(format!("failed to append heartbeat: {err}")))
}

/// Spawn the heartbeat scheduler.
///
/// The first pulse fires immediately. A failed log write is reported and
/// the schedule carries on.
#[must_use]
pub fn spawn_heartbeat_task(
    monitor: Arc<HeartbeatMonitor>,
    log_file: PathBuf,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = monitor.interval();
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("heartbeat scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let record = monitor.beat(Utc::now());
                        let path = log_file.clone();
                        let written = tokio::task::spawn_blocking(move || {
                            append_record(&path, &record).map(|()| record.sequence)
                        })
                        .await;
                        match written {
                            Ok(Ok(sequence)) => debug!(sequence, "heartbeat"),
                            Ok(Err(err)) => warn!(%err, "failed to write heartbeat"),
                            Err(err) => warn!(%err, "heartbeat write task failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("heartbeat")),
    )
}
