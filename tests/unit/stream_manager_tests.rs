//! Unit tests for the stream session manager.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_conduit::models::chunk::{Chunk, ChunkType, StreamState};
use agent_conduit::stream::log::{append_chunk, log_path};
use agent_conduit::stream::{
    ChannelConsumer, ChunkOutcome, DropReason, StreamBuffer, StreamConsumer, StreamManager,
};
use agent_conduit::AppError;

/// Collects delivered chunks in order.
#[derive(Default)]
struct Collector {
    chunks: Mutex<Vec<Chunk>>,
}

impl Collector {
    fn kinds(&self) -> Vec<ChunkType> {
        self.chunks
            .lock()
            .expect("lock")
            .iter()
            .map(|chunk| chunk.chunk_type)
            .collect()
    }

    fn contents(&self) -> Vec<String> {
        self.chunks
            .lock()
            .expect("lock")
            .iter()
            .map(|chunk| chunk.content.clone())
            .collect()
    }

    fn terminal_count(&self) -> usize {
        self.chunks
            .lock()
            .expect("lock")
            .iter()
            .filter(|chunk| chunk.chunk_type.is_terminal())
            .count()
    }
}

impl StreamConsumer for Collector {
    fn deliver(&self, chunk: Chunk) {
        self.chunks.lock().expect("lock").push(chunk);
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    streams_dir: PathBuf,
    archive_dir: PathBuf,
    collector: Arc<Collector>,
    manager: StreamManager,
}

fn fixture(timeout: Duration) -> Fixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let streams_dir = temp.path().join("streams");
    let archive_dir = temp.path().join("archive");
    fs::create_dir_all(&streams_dir).expect("streams dir");
    fs::create_dir_all(&archive_dir).expect("archive dir");
    let collector = Arc::new(Collector::default());
    let manager = StreamManager::new(
        Arc::clone(&collector) as Arc<dyn StreamConsumer>,
        timeout,
        streams_dir.clone(),
        archive_dir.clone(),
        None,
    );
    Fixture {
        _temp: temp,
        streams_dir,
        archive_dir,
        collector,
        manager,
    }
}

fn chunk(kind: ChunkType, stream_id: &str, content: &str) -> Chunk {
    Chunk::new(kind, stream_id, content)
}

#[test]
fn session_moves_pending_active_terminal() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");

    assert_eq!(fx.manager.state_of(&id), Some(StreamState::Pending));
    fx.manager.accept(chunk(ChunkType::Thinking, &id, ""));
    assert_eq!(fx.manager.state_of(&id), Some(StreamState::Active));
    fx.manager.accept(chunk(ChunkType::Complete, &id, "done"));
    assert_eq!(fx.manager.state_of(&id), Some(StreamState::Terminal));
    assert!(fx.manager.active().is_none());
    assert!(fx.manager.is_known(&id));
}

#[test]
fn second_stream_is_rejected_while_one_is_active() {
    let fx = fixture(Duration::from_secs(60));
    let first = fx.manager.start().expect("start");

    let err = fx.manager.start().expect_err("busy");
    assert!(matches!(err, AppError::StreamBusy(ref id) if *id == first));

    fx.manager.accept(chunk(ChunkType::Complete, &first, ""));
    fx.manager.start().expect("start after terminal");
}

#[test]
fn chunks_are_delivered_in_order_and_indexed() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");

    for (kind, content) in [
        (ChunkType::Thinking, ""),
        (ChunkType::Partial, "a"),
        (ChunkType::Partial, "b"),
        (ChunkType::Complete, "ab"),
    ] {
        assert_eq!(fx.manager.accept(chunk(kind, &id, content)), ChunkOutcome::Delivered);
    }

    assert_eq!(
        fx.collector.kinds(),
        vec![
            ChunkType::Thinking,
            ChunkType::Partial,
            ChunkType::Partial,
            ChunkType::Complete
        ]
    );
    let indexes: Vec<Option<u64>> = fx
        .collector
        .chunks
        .lock()
        .expect("lock")
        .iter()
        .map(|chunk| chunk.index)
        .collect();
    assert_eq!(indexes, vec![Some(0), Some(1), Some(2), Some(3)]);
}

#[test]
fn duplicate_indexes_are_dropped() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");

    fx.manager
        .accept(chunk(ChunkType::Partial, &id, "a").with_index(0));
    fx.manager
        .accept(chunk(ChunkType::Partial, &id, "b").with_index(1));
    let replay = fx
        .manager
        .accept(chunk(ChunkType::Partial, &id, "a again").with_index(0));

    assert_eq!(replay, ChunkOutcome::Dropped(DropReason::Duplicate));
    assert_eq!(fx.collector.contents(), vec!["a", "b"]);
}

#[test]
fn chunks_after_terminal_are_dropped() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    fx.manager.accept(chunk(ChunkType::Complete, &id, "done"));

    let late = fx.manager.accept(chunk(ChunkType::Partial, &id, "late"));

    assert_eq!(late, ChunkOutcome::Dropped(DropReason::AfterTerminal));
    assert_eq!(fx.collector.terminal_count(), 1);
}

#[test]
fn unknown_stream_is_reported() {
    let fx = fixture(Duration::from_secs(60));
    let outcome = fx.manager.accept(chunk(ChunkType::Partial, "nobody", "x"));
    assert_eq!(outcome, ChunkOutcome::Unknown);
    assert!(fx.collector.kinds().is_empty());
}

#[test]
fn cancel_delivers_cancelled_and_drops_later_chunks() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    fx.manager.accept(chunk(ChunkType::Partial, &id, "a"));

    let cancelled = fx.manager.cancel(Some(&id)).expect("cancel");
    assert_eq!(cancelled, id);

    let late = fx.manager.accept(chunk(ChunkType::Partial, &id, "b"));
    assert_eq!(late, ChunkOutcome::Dropped(DropReason::AfterTerminal));
    assert_eq!(
        fx.collector.kinds(),
        vec![ChunkType::Partial, ChunkType::Cancelled]
    );
}

#[test]
fn cancel_without_id_targets_active_session() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    assert_eq!(fx.manager.cancel(None).expect("cancel"), id);
}

#[test]
fn cancel_of_unknown_stream_is_not_found() {
    let fx = fixture(Duration::from_secs(60));
    assert!(matches!(fx.manager.cancel(None), Err(AppError::NotFound(_))));
    fx.manager.start().expect("start");
    assert!(matches!(
        fx.manager.cancel(Some("other")),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn idle_session_times_out_once() {
    let fx = fixture(Duration::from_millis(100));
    let id = fx.manager.start().expect("start");

    assert!(fx.manager.expire_idle(Instant::now()).is_none());
    let later = Instant::now() + Duration::from_millis(150);
    assert_eq!(fx.manager.expire_idle(later), Some(id.clone()));
    assert!(fx.manager.expire_idle(later).is_none());

    assert_eq!(fx.collector.kinds(), vec![ChunkType::Timeout]);
    assert_eq!(fx.manager.state_of(&id), Some(StreamState::Terminal));
}

#[test]
fn each_chunk_resets_idle_window() {
    let fx = fixture(Duration::from_millis(200));
    let id = fx.manager.start().expect("start");

    std::thread::sleep(Duration::from_millis(120));
    fx.manager.accept(chunk(ChunkType::Partial, &id, "a"));
    let check = Instant::now() + Duration::from_millis(120);

    assert!(fx.manager.expire_idle(check).is_none());
}

#[test]
fn discard_forgets_pending_session_silently() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");

    assert!(fx.manager.discard(&id));
    assert!(fx.manager.active().is_none());
    assert!(!fx.manager.is_known(&id));
    assert!(fx.collector.kinds().is_empty());
}

#[test]
fn log_lines_are_tailed_in_order() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    append_chunk(&log, &chunk(ChunkType::Thinking, &id, "")).expect("append");
    append_chunk(&log, &chunk(ChunkType::Partial, &id, "a")).expect("append");
    assert_eq!(fx.manager.poll_log().expect("poll"), 2);

    append_chunk(&log, &chunk(ChunkType::Partial, &id, "b")).expect("append");
    assert_eq!(fx.manager.poll_log().expect("poll"), 1);
    assert_eq!(fx.manager.poll_log().expect("poll"), 0);

    assert_eq!(fx.collector.contents(), vec!["", "a", "b"]);
}

#[test]
fn partial_log_line_waits_for_newline() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    let line = serde_json::to_string(&chunk(ChunkType::Partial, &id, "a")).expect("json");
    let (head, tail) = line.split_at(line.len() / 2);
    fs::write(&log, head).expect("write head");
    assert_eq!(fx.manager.poll_log().expect("poll"), 0);

    let mut full = fs::read_to_string(&log).expect("read");
    full.push_str(tail);
    full.push('\n');
    fs::write(&log, full).expect("write tail");
    assert_eq!(fx.manager.poll_log().expect("poll"), 1);
}

#[test]
fn terminal_log_is_archived() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    append_chunk(&log, &chunk(ChunkType::Partial, &id, "a")).expect("append");
    append_chunk(&log, &chunk(ChunkType::Complete, &id, "a")).expect("append");
    fx.manager.poll_log().expect("poll");

    assert!(!log.exists());
    assert!(fx
        .archive_dir
        .join(format!("processed_{id}.jsonl"))
        .exists());
    assert_eq!(fx.collector.terminal_count(), 1);
}

#[test]
fn malformed_log_line_is_skipped() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    fs::write(&log, "this is not json\n").expect("write");
    append_chunk(&log, &chunk(ChunkType::Partial, &id, "ok")).expect("append");

    assert_eq!(fx.manager.poll_log().expect("poll"), 1);
    assert_eq!(fx.collector.contents(), vec!["ok"]);
}

#[test]
fn jittered_log_writes_are_delivered_in_generation_order() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    let writer = {
        let id = id.clone();
        let log = log.clone();
        std::thread::spawn(move || {
            let sequence = [
                (ChunkType::Thinking, "", 7),
                (ChunkType::Partial, "a", 1),
                (ChunkType::Partial, "b", 13),
                (ChunkType::Complete, "ab", 3),
            ];
            for (kind, content, pause_ms) in sequence {
                std::thread::sleep(Duration::from_millis(pause_ms));
                append_chunk(&log, &chunk(kind, &id, content)).expect("append");
            }
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while fx.collector.terminal_count() == 0 && Instant::now() < deadline {
        fx.manager.poll_log().expect("poll");
        std::thread::sleep(Duration::from_millis(2));
    }
    writer.join().expect("writer thread");

    assert_eq!(
        fx.collector.kinds(),
        vec![
            ChunkType::Thinking,
            ChunkType::Partial,
            ChunkType::Partial,
            ChunkType::Complete
        ]
    );
    assert_eq!(fx.collector.contents(), vec!["", "a", "b", "ab"]);
}

#[test]
fn inbox_end_marker_waits_for_unread_log_lines() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    append_chunk(&log, &chunk(ChunkType::Thinking, &id, "")).expect("append");
    append_chunk(&log, &chunk(ChunkType::Partial, &id, "a")).expect("append");
    append_chunk(&log, &chunk(ChunkType::Partial, &id, "b")).expect("append");

    let outcome = fx.manager.accept(chunk(ChunkType::Complete, &id, "ab"));
    assert_eq!(outcome, ChunkOutcome::Delivered);
    assert_eq!(
        fx.collector.kinds(),
        vec![
            ChunkType::Thinking,
            ChunkType::Partial,
            ChunkType::Partial,
            ChunkType::Complete
        ]
    );
    assert_eq!(fx.collector.contents(), vec!["", "a", "b", "ab"]);
    assert_eq!(fx.collector.terminal_count(), 1);
    assert!(fx
        .archive_dir
        .join(format!("processed_{id}.jsonl"))
        .exists());
}

#[test]
fn log_line_after_inbox_chunk_is_not_a_duplicate() {
    let fx = fixture(Duration::from_secs(60));
    let id = fx.manager.start().expect("start");
    let log = log_path(&fx.streams_dir, &id);

    assert_eq!(
        fx.manager.accept(chunk(ChunkType::Thinking, &id, "")),
        ChunkOutcome::Delivered
    );
    append_chunk(&log, &chunk(ChunkType::Partial, &id, "first log line")).expect("append");
    append_chunk(&log, &chunk(ChunkType::Partial, &id, "second log line")).expect("append");

    assert_eq!(fx.manager.poll_log().expect("poll"), 2);
    assert_eq!(
        fx.collector.contents(),
        vec!["", "first log line", "second log line"]
    );

    assert_eq!(
        fx.manager.accept(chunk(ChunkType::Partial, &id, "from inbox")),
        ChunkOutcome::Delivered
    );
    append_chunk(&log, &chunk(ChunkType::Complete, &id, "done")).expect("append");
    assert_eq!(fx.manager.poll_log().expect("poll"), 1);
    assert_eq!(fx.collector.terminal_count(), 1);
}

#[tokio::test]
async fn channel_consumer_hands_chunks_to_receiver() {
    let (consumer, mut rx) = ChannelConsumer::channel();
    consumer.deliver(chunk(ChunkType::Partial, "s", "x"));
    let received = rx.recv().await.expect("chunk");
    assert_eq!(received.content, "x");
}

#[test]
fn buffer_reads_after_index_and_reports_finish() {
    let buffer = StreamBuffer::new(2);
    buffer.open("s");
    buffer.deliver(chunk(ChunkType::Partial, "s", "a").with_index(0));
    buffer.deliver(chunk(ChunkType::Partial, "s", "b").with_index(1));

    let tail = buffer.read("s", Some(0)).expect("known stream");
    assert_eq!(tail.chunks.len(), 1);
    assert_eq!(tail.chunks[0].content, "b");
    assert!(!tail.finished);

    buffer.deliver(chunk(ChunkType::Complete, "s", "ab").with_index(2));
    assert!(buffer.read("s", None).expect("known stream").finished);

    buffer.open("t");
    buffer.open("u");
    assert!(buffer.read("s", None).is_none(), "oldest stream evicted");
}
