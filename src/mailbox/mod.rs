//! Filesystem mailbox shared with the external collaborator.
//!
//! The daemon writes requests into the outbox ([`outbox`]) and picks up
//! results from the inbox ([`inbox`]). Both sides use write-to-temp then
//! rename, and the inbox is consumed by claim-by-rename, so neither side
//! ever reads a partial file and no file is processed twice.

pub mod inbox;
pub mod outbox;
pub mod resolver;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::stream::StreamManager;
use inbox::InboxPoller;

/// Inbound counters reported by `status`.
#[derive(Debug, Default)]
pub struct MailboxStats {
    inbound_processed: AtomicU64,
    inbound_failed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`MailboxStats`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MailboxCounts {
    /// Inbound files resolved and archived.
    pub inbound_processed: u64,
    /// Inbound processing failures (each attempt counts).
    pub inbound_failed: u64,
    /// Inbound files moved to the dead-letter directory.
    pub dead_lettered: u64,
}

impl MailboxStats {
    pub(crate) fn record_processed(&self) {
        self.inbound_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.inbound_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MailboxCounts {
        MailboxCounts {
            inbound_processed: self.inbound_processed.load(Ordering::Relaxed),
            inbound_failed: self.inbound_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the mailbox polling task.
///
/// Each tick tails the active stream's log and then scans the inbox. The
/// filesystem work runs on the blocking pool; a tick that is still running
/// when the next one fires is awaited, never overlapped.
#[must_use]
pub fn spawn_mailbox_poller(
    poller: Arc<InboxPoller>,
    streams: Arc<StreamManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("mailbox poller shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let poller = Arc::clone(&poller);
                        let streams = Arc::clone(&streams);
                        let tick = tokio::task::spawn_blocking(move || {
                            let tailed = streams.poll_log();
                            let report = poller.poll_once();
                            (report, tailed)
                        });
                        match tick.await {
                            Ok((report, tailed)) => {
                                if !report.is_idle() {
                                    debug!(
                                        archived = report.archived.len(),
                                        failed = report.failed.len(),
                                        dead_lettered = report.dead_lettered.len(),
                                        unarchived = report.unarchived.len(),
                                        "inbox poll finished"
                                    );
                                }
                                if let Err(err) = tailed {
                                    warn!(%err, "stream log tail failed");
                                }
                            }
                            Err(err) => error!(%err, "mailbox poll task failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("mailbox_poller")),
    )
}
