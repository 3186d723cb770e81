//! Inbound mailbox poller.
//!
//! Files are processed in file-name order, so the collaborator must embed
//! a sortable timestamp in each name. A file is first claimed by renaming
//! it into `<inbox>/.claimed/`; only the poller whose rename succeeds may
//! process it. After the resolver succeeds the claimed file is renamed
//! into the archive with a `processed_` prefix. On failure it is returned
//! to the inbox, and after `max_failures` consecutive failures it goes to
//! the dead-letter directory instead.
//!
//! A file that was resolved but could not be archived is renamed to
//! `<name>.resolved` inside the claim directory. Later cycles retry only
//! the archive step for it, and claim recovery leaves it alone, so its
//! messages are never resolved twice.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::resolver::InboundResolver;
use super::MailboxStats;
use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::config::GlobalConfig;
use crate::models::message::InboundMessage;
use crate::{AppError, Result};

/// Name of the claim directory inside the inbox.
pub const CLAIM_DIR: &str = ".claimed";

/// Prefix given to archived files.
pub const ARCHIVE_PREFIX: &str = "processed_";

/// Suffix marking a claimed file that was resolved but not yet archived.
pub const RESOLVED_SUFFIX: &str = ".resolved";

/// Outcome of one poll cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// The cycle did not run because another one was in progress.
    pub skipped: bool,
    /// Files resolved and archived.
    pub archived: Vec<String>,
    /// Files that failed and were returned to the inbox.
    pub failed: Vec<String>,
    /// Files moved to the dead-letter directory.
    pub dead_lettered: Vec<String>,
    /// Resolved files still waiting for their archive rename.
    pub unarchived: Vec<String>,
    /// Files claimed by another poller between listing and claiming.
    pub lost_claims: usize,
}

impl PollReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether the cycle touched no file.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.archived.is_empty()
            && self.failed.is_empty()
            && self.dead_lettered.is_empty()
            && self.unarchived.is_empty()
            && self.lost_claims == 0
    }
}

/// Resets the run-in-progress flag when a cycle ends, even on panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Scans the inbox and hands parsed files to an [`InboundResolver`].
pub struct InboxPoller {
    inbox: PathBuf,
    claimed: PathBuf,
    archive: PathBuf,
    dead_letter: PathBuf,
    max_failures: u32,
    resolver: Arc<dyn InboundResolver>,
    failures: Mutex<HashMap<String, u32>>,
    running: AtomicBool,
    stats: Arc<MailboxStats>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl InboxPoller {
    /// Construct a poller over explicit directories.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a directory cannot be created.
    pub fn new(
        inbox: PathBuf,
        archive: PathBuf,
        dead_letter: PathBuf,
        max_failures: u32,
        resolver: Arc<dyn InboundResolver>,
        stats: Arc<MailboxStats>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Self> {
        let claimed = inbox.join(CLAIM_DIR);
        for dir in [&inbox, &claimed, &archive, &dead_letter] {
            fs::create_dir_all(dir).map_err(|err| {
                AppError::Io(format!("failed to create {}: {err}", dir.display()))
            })?;
        }
        Ok(Self {
            inbox,
            claimed,
            archive,
            dead_letter,
            max_failures: max_failures.max(1),
            resolver,
            failures: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            stats,
            audit,
        })
    }

    /// Construct a poller from the mailbox section of `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a directory cannot be created.
    pub fn from_config(
        config: &GlobalConfig,
        resolver: Arc<dyn InboundResolver>,
        stats: Arc<MailboxStats>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Self> {
        Self::new(
            config.mailbox.inbox_dir.clone(),
            config.mailbox.archive_dir.clone(),
            config.mailbox.dead_letter_dir.clone(),
            config.mailbox.max_failures,
            resolver,
            stats,
            audit,
        )
    }

    /// Return files stranded in the claim directory by a crash.
    ///
    /// Must only run while no other poller shares this inbox.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the claim directory cannot be listed.
    pub fn recover_claims(&self) -> Result<usize> {
        let mut recovered = 0;
        for name in list_candidates(&self.claimed)? {
            let from = self.claimed.join(&name);
            let to = self.inbox.join(&name);
            match fs::rename(&from, &to) {
                Ok(()) => recovered += 1,
                Err(err) => warn!(file = %name, %err, "failed to recover claimed file"),
            }
        }
        if recovered > 0 {
            info!(recovered, "returned stranded claims to the inbox");
        }
        Ok(recovered)
    }

    /// Run one poll cycle.
    ///
    /// Returns immediately with [`PollReport::skipped`] set if another
    /// cycle on this poller is still running.
    pub fn poll_once(&self) -> PollReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("poll cycle already running; skipping");
            return PollReport::skipped();
        }
        let _guard = RunGuard(&self.running);

        let mut report = PollReport::default();
        self.retry_unarchived(&mut report);

        let names = match list_candidates(&self.inbox) {
            Ok(names) => names,
            Err(err) => {
                warn!(%err, "failed to list inbox");
                return report;
            }
        };

        for name in names {
            let source = self.inbox.join(&name);
            let claimed = self.claimed.join(&name);

            match fs::rename(&source, &claimed) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(file = %name, "file claimed elsewhere");
                    report.lost_claims += 1;
                    continue;
                }
                Err(err) => {
                    warn!(file = %name, %err, "failed to claim inbox file");
                    continue;
                }
            }

            match self.process(&source, &claimed) {
                Ok(()) => match self.archive(&name, &claimed) {
                    Ok(archived) => self.record_archived(name, &archived, &mut report),
                    Err(err) => self.hold_resolved(name, &claimed, &err, &mut report),
                },
                Err(err) => {
                    self.stats.record_failed();
                    warn!(file = %name, %err, "inbound file failed");
                    audit::record(
                        self.audit.as_deref(),
                        AuditEntry::new(AuditEventType::InboundFailed)
                            .with_file(&name)
                            .with_detail(err.to_string()),
                    );
                    if self.bump_failures(&name) >= self.max_failures {
                        self.dead_letter(&name, &claimed, &mut report);
                    } else {
                        if let Err(err) = fs::rename(&claimed, &source) {
                            warn!(file = %name, %err, "failed to return file to the inbox");
                        }
                        report.failed.push(name);
                    }
                }
            }
        }

        report
    }

    /// Archive files held back by an earlier archive failure.
    fn retry_unarchived(&self, report: &mut PollReport) {
        let held = match fs::read_dir(&self.claimed) {
            Ok(entries) => {
                let mut held: Vec<String> = entries
                    .filter_map(std::result::Result::ok)
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .filter_map(|marker| marker.strip_suffix(RESOLVED_SUFFIX).map(str::to_owned))
                    .filter(|name| !name.is_empty())
                    .collect();
                held.sort();
                held
            }
            Err(err) => {
                warn!(%err, "failed to list claim directory");
                return;
            }
        };

        for name in held {
            let marker = self.claimed.join(format!("{name}{RESOLVED_SUFFIX}"));
            match self.archive(&name, &marker) {
                Ok(archived) => self.record_archived(name, &archived, report),
                Err(err) => {
                    debug!(file = %name, %err, "resolved file still not archived");
                    report.unarchived.push(name);
                }
            }
        }
    }

    fn record_archived(&self, name: String, archived: &str, report: &mut PollReport) {
        self.clear_failures(&name);
        self.stats.record_processed();
        audit::record(
            self.audit.as_deref(),
            AuditEntry::new(AuditEventType::InboundArchived).with_file(archived),
        );
        report.archived.push(name);
    }

    /// Park a resolved file whose archive rename failed.
    fn hold_resolved(
        &self,
        name: String,
        claimed: &Path,
        cause: &AppError,
        report: &mut PollReport,
    ) {
        let err = AppError::DuplicateProcessing(format!(
            "{name} was resolved but not archived: {cause}"
        ));
        let marker = self.claimed.join(format!("{name}{RESOLVED_SUFFIX}"));
        match fs::rename(claimed, &marker) {
            Ok(()) => warn!(file = %name, %err, "holding resolved file until it can be archived"),
            Err(rename_err) => error!(
                file = %name,
                %err,
                %rename_err,
                "resolved file left in the claim directory; it will be resolved again after a restart"
            ),
        }
        audit::record(
            self.audit.as_deref(),
            AuditEntry::new(AuditEventType::InboundFailed)
                .with_file(&name)
                .with_detail(err.to_string()),
        );
        report.unarchived.push(name);
    }

    fn process(&self, source: &Path, claimed: &Path) -> Result<()> {
        let bytes = fs::read(claimed)
            .map_err(|err| AppError::Io(format!("failed to read {}: {err}", claimed.display())))?;
        let modified = fs::metadata(claimed)
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let message = InboundMessage::parse(source, &bytes, modified)?;
        let resolution = self.resolver.resolve(&message)?;
        debug!(
            file = %source.display(),
            modified = ?message.modified,
            delivered = resolution.delivered,
            dropped = resolution.dropped,
            logged = resolution.logged,
            "inbound file resolved"
        );
        Ok(())
    }

    fn archive(&self, name: &str, claimed: &Path) -> Result<String> {
        let target = unique_destination(&self.archive, &format!("{ARCHIVE_PREFIX}{name}"));
        fs::rename(claimed, &target).map_err(|err| {
            AppError::Io(format!("failed to archive {name} to {}: {err}", target.display()))
        })?;
        Ok(target
            .file_name()
            .map(|file| file.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    fn dead_letter(&self, name: &str, claimed: &Path, report: &mut PollReport) {
        let target = unique_destination(&self.dead_letter, name);
        match fs::rename(claimed, &target) {
            Ok(()) => {
                self.clear_failures(name);
                self.stats.record_dead_letter();
                warn!(file = %name, attempts = self.max_failures, "inbound file dead-lettered");
                audit::record(
                    self.audit.as_deref(),
                    AuditEntry::new(AuditEventType::DeadLettered).with_file(name),
                );
                report.dead_lettered.push(name.to_owned());
            }
            Err(err) => {
                warn!(file = %name, %err, "failed to dead-letter file; returning it to the inbox");
                if let Err(err) = fs::rename(claimed, self.inbox.join(name)) {
                    warn!(file = %name, %err, "failed to return file to the inbox");
                }
                report.failed.push(name.to_owned());
            }
        }
    }

    fn bump_failures(&self, name: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(name.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_failures(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Consecutive failures recorded for `name`.
    #[must_use]
    pub fn failure_count(&self, name: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

/// Mailbox files in `dir`, sorted by name.
///
/// Dotfiles (in-progress temp files), `*.tmp`, directories, and anything
/// other than `*.json` / `*.jsonl` are ignored.
///
/// # Errors
///
/// Returns `AppError::Io` if `dir` cannot be read.
pub fn list_candidates(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", dir.display())))?;

    let mut names: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_mailbox_file(name))
        .collect();
    names.sort();
    Ok(names)
}

fn is_mailbox_file(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    let path = Path::new(name);
    path.extension().is_some_and(|ext| {
        ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("jsonl")
    })
}

/// First free path for `name` in `dir`; `a.json` becomes `a.1.json`,
/// `a.2.json`, … when taken.
#[must_use]
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned());
    let ext = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let mut attempt: u32 = 1;
    loop {
        let candidate = dir.join(format!("{stem}.{attempt}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        attempt += 1;
    }
}
