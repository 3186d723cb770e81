//! Day-partitioned JSONL audit trail.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

/// File name prefix of every audit file.
pub const AUDIT_FILE_PREFIX: &str = "conduit-audit-";

/// The file currently receiving entries.
struct DayFile {
    date: NaiveDate,
    file: File,
}

/// Appends one JSON object per line to
/// `<dir>/conduit-audit-YYYY-MM-DD.jsonl`.
///
/// Entries are filed under the UTC date of their own timestamp, so a
/// record created just before midnight never lands in the next day's file.
/// Each line goes out in a single write so concurrent writers cannot
/// interleave partial records.
pub struct JsonlAuditWriter {
    dir: PathBuf,
    current: Mutex<Option<DayFile>>,
}

impl JsonlAuditWriter {
    /// Create a writer over `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!("failed to create audit directory {}: {err}", dir.display()))
        })?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Path of the file holding entries dated `date`.
    #[must_use]
    pub fn file_for_date(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{AUDIT_FILE_PREFIX}{date}.jsonl"))
    }

    fn open_day(&self, date: NaiveDate) -> Result<DayFile> {
        let path = self.file_for_date(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                AppError::Io(format!("failed to open audit file {}: {err}", path.display()))
            })?;
        debug!(file = %path.display(), "audit file opened");
        Ok(DayFile { date, file })
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)
            .map_err(|err| AppError::Io(format!("failed to encode audit entry: {err}")))?;
        line.push(b'\n');

        let date = entry.timestamp.date_naive();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let day = match current.take() {
            Some(day) if day.date == date => day,
            _ => self.open_day(date)?,
        };
        let day = current.insert(day);

        day.file.write_all(&line).map_err(|err| {
            warn!(%err, %date, "audit entry not written");
            AppError::Io(format!("audit write failed: {err}"))
        })
    }
}
