//! Unit tests for the inbound mailbox poller.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use agent_conduit::mailbox::inbox::{
    list_candidates, unique_destination, InboxPoller, CLAIM_DIR, RESOLVED_SUFFIX,
};
use agent_conduit::mailbox::resolver::{InboundResolver, Resolution};
use agent_conduit::mailbox::MailboxStats;
use agent_conduit::models::message::InboundMessage;
use agent_conduit::{AppError, Result};

/// Records every message it sees; fails while `fail` is set.
#[derive(Default)]
struct RecordingResolver {
    seen: Mutex<Vec<String>>,
    fail: std::sync::atomic::AtomicBool,
    delay: Option<Duration>,
}

impl RecordingResolver {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("lock").clone()
    }
}

impl InboundResolver for RecordingResolver {
    fn resolve(&self, message: &InboundMessage) -> Result<Resolution> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let name = message
            .source
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .into_owned();
        self.seen.lock().expect("lock").push(name);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Mailbox("resolver refused".into()));
        }
        Ok(Resolution {
            logged: message.records.len(),
            ..Resolution::default()
        })
    }
}

struct Dirs {
    _temp: tempfile::TempDir,
    inbox: PathBuf,
    archive: PathBuf,
    dead: PathBuf,
}

fn dirs() -> Dirs {
    let temp = tempfile::tempdir().expect("tempdir");
    Dirs {
        inbox: temp.path().join("inbox"),
        archive: temp.path().join("archive"),
        dead: temp.path().join("dead_letter"),
        _temp: temp,
    }
}

fn poller(dirs: &Dirs, resolver: Arc<RecordingResolver>, max_failures: u32) -> InboxPoller {
    InboxPoller::new(
        dirs.inbox.clone(),
        dirs.archive.clone(),
        dirs.dead.clone(),
        max_failures,
        resolver,
        Arc::new(MailboxStats::default()),
        None,
    )
    .expect("poller")
}

fn drop_file(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).expect("write inbox file");
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name != CLAIM_DIR)
        .collect();
    names.sort();
    names
}

#[test]
fn resolved_files_are_archived_with_prefix() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 3);
    drop_file(&dirs.inbox, "001.json", r#"{"response":"one"}"#);
    drop_file(&dirs.inbox, "002.json", r#"{"response":"two"}"#);

    let report = poller.poll_once();

    assert_eq!(report.archived, vec!["001.json", "002.json"]);
    assert_eq!(resolver.seen(), vec!["001.json", "002.json"]);
    assert!(names(&dirs.inbox).is_empty());
    assert_eq!(
        names(&dirs.archive),
        vec!["processed_001.json", "processed_002.json"]
    );
}

#[test]
fn files_are_processed_in_name_order() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 3);
    for name in ["20240101T000003.json", "20240101T000001.json", "20240101T000002.json"] {
        drop_file(&dirs.inbox, name, "{}");
    }

    poller.poll_once();

    assert_eq!(
        resolver.seen(),
        vec![
            "20240101T000001.json",
            "20240101T000002.json",
            "20240101T000003.json"
        ]
    );
}

#[test]
fn temp_and_foreign_files_are_ignored() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 3);
    drop_file(&dirs.inbox, ".partial.json", "{");
    drop_file(&dirs.inbox, "upload.tmp", "{");
    drop_file(&dirs.inbox, "notes.txt", "hello");
    fs::create_dir_all(dirs.inbox.join("sub.json")).expect("dir");

    let report = poller.poll_once();

    assert!(report.is_idle());
    assert!(resolver.seen().is_empty());
    assert_eq!(
        list_candidates(&dirs.inbox).expect("list"),
        Vec::<String>::new()
    );
}

#[test]
fn failed_file_returns_to_inbox_then_dead_letters() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    resolver.fail.store(true, Ordering::SeqCst);
    let poller = poller(&dirs, Arc::clone(&resolver), 2);
    drop_file(&dirs.inbox, "bad.json", "{}");

    let first = poller.poll_once();
    assert_eq!(first.failed, vec!["bad.json"]);
    assert_eq!(names(&dirs.inbox), vec!["bad.json"]);
    assert_eq!(poller.failure_count("bad.json"), 1);

    let second = poller.poll_once();
    assert_eq!(second.dead_lettered, vec!["bad.json"]);
    assert!(names(&dirs.inbox).is_empty());
    assert_eq!(names(&dirs.dead), vec!["bad.json"]);
    assert!(names(&dirs.archive).is_empty());
    assert_eq!(poller.failure_count("bad.json"), 0);
}

#[test]
fn success_after_failure_clears_count() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    resolver.fail.store(true, Ordering::SeqCst);
    let poller = poller(&dirs, Arc::clone(&resolver), 3);
    drop_file(&dirs.inbox, "flaky.json", "{}");

    poller.poll_once();
    assert_eq!(poller.failure_count("flaky.json"), 1);

    resolver.fail.store(false, Ordering::SeqCst);
    let report = poller.poll_once();
    assert_eq!(report.archived, vec!["flaky.json"]);
    assert_eq!(poller.failure_count("flaky.json"), 0);
}

#[test]
fn unparseable_file_counts_as_failure() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 1);
    drop_file(&dirs.inbox, "garbage.json", "{not json");

    let report = poller.poll_once();

    assert_eq!(report.dead_lettered, vec!["garbage.json"]);
    assert!(resolver.seen().is_empty(), "resolver must not see unparseable files");
}

#[test]
fn archive_name_collisions_get_suffix() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 3);

    drop_file(&dirs.inbox, "reply.json", "{}");
    poller.poll_once();
    drop_file(&dirs.inbox, "reply.json", "{}");
    poller.poll_once();

    assert_eq!(
        names(&dirs.archive),
        vec!["processed_reply.1.json", "processed_reply.json"]
    );
}

#[test]
fn unique_destination_skips_taken_names() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(unique_destination(temp.path(), "a.json"), temp.path().join("a.json"));
    fs::write(temp.path().join("a.json"), "").expect("write");
    fs::write(temp.path().join("a.1.json"), "").expect("write");
    assert_eq!(unique_destination(temp.path(), "a.json"), temp.path().join("a.2.json"));
}

#[test]
fn stranded_claims_are_recovered() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 3);
    drop_file(&dirs.inbox.join(CLAIM_DIR), "stranded.json", "{}");

    assert_eq!(poller.recover_claims().expect("recover"), 1);
    assert_eq!(names(&dirs.inbox), vec!["stranded.json"]);

    let report = poller.poll_once();
    assert_eq!(report.archived, vec!["stranded.json"]);
}

#[test]
fn resolved_file_that_cannot_be_archived_is_never_resolved_again() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let poller = poller(&dirs, Arc::clone(&resolver), 3);
    let claim_dir = dirs.inbox.join(CLAIM_DIR);

    // A plain file where the archive directory should be makes every
    // archive rename fail, even for a privileged user.
    fs::remove_dir(&dirs.archive).expect("remove archive dir");
    fs::write(&dirs.archive, b"not a directory").expect("block archive");
    drop_file(&dirs.inbox, "reply.json", r#"{"response":"once"}"#);

    let first = poller.poll_once();
    assert!(first.archived.is_empty());
    assert_eq!(first.unarchived, vec!["reply.json"]);
    assert!(first.failed.is_empty());
    assert!(names(&dirs.inbox).is_empty());
    assert_eq!(
        names(&claim_dir),
        vec![format!("reply.json{RESOLVED_SUFFIX}")]
    );

    let second = poller.poll_once();
    assert_eq!(second.unarchived, vec!["reply.json"]);
    assert_eq!(poller.recover_claims().expect("recover"), 0);
    assert!(names(&dirs.inbox).is_empty());

    fs::remove_file(&dirs.archive).expect("unblock archive");
    fs::create_dir(&dirs.archive).expect("archive dir");
    let third = poller.poll_once();
    assert_eq!(third.archived, vec!["reply.json"]);
    assert!(third.unarchived.is_empty());
    assert!(names(&claim_dir).is_empty());
    assert_eq!(names(&dirs.archive), vec!["processed_reply.json"]);

    assert_eq!(resolver.seen(), vec!["reply.json"]);
}

#[test]
fn overlapping_cycles_on_one_poller_skip() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver {
        delay: Some(Duration::from_millis(200)),
        ..RecordingResolver::default()
    });
    let poller = Arc::new(poller(&dirs, Arc::clone(&resolver), 3));
    drop_file(&dirs.inbox, "slow.json", "{}");

    let background = {
        let poller = Arc::clone(&poller);
        std::thread::spawn(move || poller.poll_once())
    };
    std::thread::sleep(Duration::from_millis(50));
    let concurrent = poller.poll_once();
    let first = background.join().expect("poll thread");

    assert!(concurrent.skipped);
    assert_eq!(first.archived, vec!["slow.json"]);
    assert_eq!(resolver.seen().len(), 1);
}

#[test]
fn competing_pollers_resolve_each_file_at_most_once() {
    let dirs = dirs();
    let resolver = Arc::new(RecordingResolver::default());
    let pollers: Vec<Arc<InboxPoller>> = (0..4)
        .map(|_| Arc::new(poller(&dirs, Arc::clone(&resolver), 3)))
        .collect();
    for n in 0..50 {
        drop_file(&dirs.inbox, &format!("{n:03}.json"), "{}");
    }

    let barrier = Arc::new(Barrier::new(pollers.len()));
    let archived = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = pollers
        .into_iter()
        .map(|poller| {
            let barrier = Arc::clone(&barrier);
            let archived = Arc::clone(&archived);
            std::thread::spawn(move || {
                barrier.wait();
                let report = poller.poll_once();
                archived.fetch_add(report.archived.len(), Ordering::SeqCst);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("poll thread");
    }

    let mut seen = resolver.seen();
    let total = seen.len();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), total, "a file was resolved twice");
    assert_eq!(total, 50);
    assert_eq!(archived.load(Ordering::SeqCst), 50);
    assert_eq!(names(&dirs.archive).len(), 50);
}
