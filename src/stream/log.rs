//! Per-stream append-only chunk logs.
//!
//! The collaborator appends one JSON chunk per line to
//! `<streams_dir>/<stream_id>.jsonl`. Readers resume from a byte offset and
//! only consume newline-terminated lines, so a line still being written is
//! picked up on the next read.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::models::chunk::Chunk;
use crate::{AppError, Result};

/// Complete lines read from a log since a given offset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogBatch {
    /// Lines without their terminators.
    pub lines: Vec<String>,
    /// Offset just past the last consumed newline.
    pub end_offset: u64,
}

/// Location of the log for `stream_id`.
#[must_use]
pub fn log_path(streams_dir: &Path, stream_id: &str) -> PathBuf {
    streams_dir.join(format!("{stream_id}.jsonl"))
}

/// Read the complete lines appended after `offset`.
///
/// Returns `Ok(None)` if the log does not exist yet.
///
/// # Errors
///
/// Returns `AppError::Io` if the log exists but cannot be read.
pub fn read_complete_lines(path: &Path, offset: u64) -> Result<Option<LogBatch>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to open {}: {err}",
                path.display()
            )))
        }
    };

    file.seek(SeekFrom::Start(offset))
        .map_err(|err| AppError::Io(format!("failed to seek {}: {err}", path.display())))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", path.display())))?;

    let Some(last_newline) = tail.iter().rposition(|byte| *byte == b'\n') else {
        return Ok(Some(LogBatch {
            lines: Vec::new(),
            end_offset: offset,
        }));
    };

    let lines = tail[..last_newline]
        .split(|byte| *byte == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect();

    let consumed = u64::try_from(last_newline + 1).unwrap_or(u64::MAX);
    Ok(Some(LogBatch {
        lines,
        end_offset: offset + consumed,
    }))
}

/// Append `chunk` as one line to the log at `path`.
///
/// This is the collaborator's half of the contract; the daemon itself
/// only reads logs.
///
/// # Errors
///
/// Returns `AppError::Io` if the log cannot be opened or written.
pub fn append_chunk(path: &Path, chunk: &Chunk) -> Result<()> {
    let mut line = serde_json::to_string(chunk)
        .map_err(|err| AppError::Io(format!("failed to serialize chunk: {err}")))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;
    file.write_all(line.as_bytes())
        .map_err(|err| AppError::Io(format!("failed to append to {}: {err}", path.display())))?;
    Ok(())
}
