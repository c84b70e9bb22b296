//! Buffered writer integration tests: triggers, retries, ordering and
//! shutdown against a scripted append sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use seqlog_client::{
    decode_batch, Append, AppendCallback, AppendReply, AppendSink, BufferedWriter,
    BufferedWriterOptions, Compression, ContextSet, Mode, Payload, RetryDecision,
};
use seqlog_core::{LogId, NodeId, Status};

/// Sink that records every dispatched batch and answers from a script
/// (default: OK with an increasing sequence number).
#[derive(Default)]
struct ScriptedSink {
    dispatched: Mutex<Vec<(LogId, u32, usize)>>,
    scripted_replies: Mutex<VecDeque<AppendReply>>,
    next_seq: AtomicU64,
}

impl ScriptedSink {
    fn script(&self, reply: AppendReply) {
        self.scripted_replies.lock().unwrap().push_back(reply);
    }

    fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }
}

impl AppendSink for ScriptedSink {
    fn append_batch(
        &self,
        log_id: LogId,
        blob: Bytes,
        record_count: u32,
    ) -> BoxFuture<'static, AppendReply> {
        let decoded = decode_batch(&blob).expect("valid blob").len();
        self.dispatched
            .lock()
            .unwrap()
            .push((log_id, record_count, decoded));
        let reply = self.scripted_replies.lock().unwrap().pop_front();
        let reply = reply.unwrap_or_else(|| {
            let seq = self.next_seq.fetch_add(1000, Ordering::SeqCst);
            (Status::Ok, seq, None)
        });
        Box::pin(async move { reply })
    }
}

#[derive(Default)]
struct RecordingCallback {
    successes: Mutex<Vec<(Vec<u64>, u64)>>,
    failures: Mutex<Vec<(Vec<u64>, Status)>>,
}

impl RecordingCallback {
    fn success_count(&self) -> usize {
        self.successes.lock().unwrap().len()
    }

    fn failure_count(&self) -> usize {
        self.failures.lock().unwrap().len()
    }
}

impl AppendCallback for RecordingCallback {
    fn on_success(&self, _log_id: LogId, contexts: ContextSet, first_seq: u64) {
        let ctxs = contexts.iter().map(|(c, _)| *c).collect();
        self.successes.lock().unwrap().push((ctxs, first_seq));
    }

    fn on_failure(
        &self,
        _log_id: LogId,
        contexts: ContextSet,
        status: Status,
        _redirect: Option<NodeId>,
    ) {
        let ctxs = contexts.iter().map(|(c, _)| *c).collect();
        self.failures.lock().unwrap().push((ctxs, status));
    }

    fn on_retry(&self, _log_id: LogId, _record_count: usize, _status: Status) -> RetryDecision {
        RetryDecision::Allow
    }
}

struct Setup {
    writer: BufferedWriter,
    sink: Arc<ScriptedSink>,
    callback: Arc<RecordingCallback>,
}

fn setup(options: BufferedWriterOptions) -> Setup {
    let sink = Arc::new(ScriptedSink::default());
    let callback = Arc::new(RecordingCallback::default());
    let writer = BufferedWriter::new(
        Arc::new(move |_| options.clone()),
        sink.clone(),
        callback.clone(),
        64 * 1024 * 1024,
    );
    Setup {
        writer,
        sink,
        callback,
    }
}

fn record(context: u64, len: usize) -> Append {
    Append::new(context, Payload::Single(Bytes::from(vec![b'r'; len])))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn test_size_trigger_single_batch() {
    let options = BufferedWriterOptions {
        size_trigger: Some(1024),
        time_trigger: None,
        compression: Compression::None,
        ..Default::default()
    };
    let s = setup(options);

    // Ten records of 200 bytes submitted as one atomic chunk cross the
    // 1024-byte trigger: exactly one dispatch with all ten records.
    let chunk: Vec<Append> = (0..10).map(|i| record(i, 200)).collect();
    s.writer.append_chunk(LogId(1), chunk).expect("append");

    let callback = s.callback.clone();
    wait_until(move || callback.success_count() == 1).await;

    assert_eq!(s.sink.dispatch_count(), 1);
    {
        let dispatched = s.sink.dispatched.lock().unwrap();
        assert_eq!(dispatched[0].1, 10);
        assert_eq!(dispatched[0].2, 10);
    }
    let successes = s.callback.successes.lock().unwrap();
    assert_eq!(successes[0].0, (0..10).collect::<Vec<u64>>());
    assert_eq!(s.writer.memory_used(), 0);
}

#[tokio::test]
async fn test_time_trigger_flushes_quiet_log() {
    let options = BufferedWriterOptions {
        size_trigger: Some(1 << 30),
        time_trigger: Some(Duration::from_millis(20)),
        compression: Compression::Lz4,
        ..Default::default()
    };
    let s = setup(options);

    s.writer.append(LogId(2), record(7, 64)).expect("append");
    let callback = s.callback.clone();
    wait_until(move || callback.success_count() == 1).await;

    assert_eq!(s.sink.dispatch_count(), 1);
    assert_eq!(s.writer.memory_used(), 0);
}

#[tokio::test]
async fn test_retry_then_success_delivers_once() {
    let options = BufferedWriterOptions {
        time_trigger: None,
        compression: Compression::None,
        retry_count: 3,
        retry_initial_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let s = setup(options);

    // First reply times out, the retry succeeds.
    s.sink.script((Status::Timedout, 0, None));

    s.writer.append(LogId(3), record(0, 32)).expect("append 0");
    s.writer.append(LogId(3), record(1, 32)).expect("append 1");
    s.writer.flush_log(LogId(3));

    let callback = s.callback.clone();
    wait_until(move || callback.success_count() == 1).await;

    // Two dispatches (original + retry), one success, zero failures.
    assert_eq!(s.sink.dispatch_count(), 2);
    assert_eq!(s.callback.failure_count(), 0);
    let successes = s.callback.successes.lock().unwrap();
    assert_eq!(successes[0].0, vec![0, 1]);
    assert_eq!(s.writer.memory_used(), 0);
}

#[tokio::test]
async fn test_permanent_failure_does_not_retry() {
    let options = BufferedWriterOptions {
        time_trigger: None,
        compression: Compression::None,
        retry_count: 5,
        ..Default::default()
    };
    let s = setup(options);

    s.sink.script((Status::TooBig, 0, None));
    s.writer.append(LogId(4), record(0, 32)).expect("append");
    s.writer.flush_log(LogId(4));

    let callback = s.callback.clone();
    wait_until(move || callback.failure_count() == 1).await;

    assert_eq!(s.sink.dispatch_count(), 1);
    assert_eq!(s.callback.failures.lock().unwrap()[0].1, Status::TooBig);
}

#[tokio::test]
async fn test_one_at_a_time_preserves_submission_order() {
    let options = BufferedWriterOptions {
        mode: Mode::OneAtATime,
        time_trigger: Some(Duration::from_millis(5)),
        compression: Compression::None,
        ..Default::default()
    };
    let s = setup(options);

    for ctx in 0..6u64 {
        s.writer.append(LogId(5), record(ctx, 100)).expect("append");
    }

    let callback = s.callback.clone();
    wait_until(move || {
        let successes = callback.successes.lock().unwrap();
        successes.iter().map(|(c, _)| c.len()).sum::<usize>() == 6
    })
    .await;

    // Across however many batches it took, the records arrived in
    // submission order.
    let successes = s.callback.successes.lock().unwrap();
    let observed: Vec<u64> = successes.iter().flat_map(|(c, _)| c.clone()).collect();
    assert_eq!(observed, (0..6).collect::<Vec<u64>>());
    assert_eq!(s.writer.memory_used(), 0);
}

#[tokio::test]
async fn test_shutdown_fails_buffered_appends() {
    let options = BufferedWriterOptions {
        time_trigger: Some(Duration::from_secs(3600)),
        compression: Compression::None,
        ..Default::default()
    };
    let s = setup(options);

    s.writer.append(LogId(6), record(0, 128)).expect("append");
    s.writer.append(LogId(6), record(1, 128)).expect("append");
    s.writer.shutdown();

    assert_eq!(s.callback.failure_count(), 1);
    {
        let failures = s.callback.failures.lock().unwrap();
        assert_eq!(failures[0].0, vec![0, 1]);
        assert_eq!(failures[0].1, Status::Shutdown);
    }

    // New appends are refused.
    assert_eq!(
        s.writer.append(LogId(6), record(2, 16)).unwrap_err(),
        Status::Shutdown
    );
    assert_eq!(s.writer.memory_used(), 0);
}

#[tokio::test]
async fn test_memory_budget_rejects_oversized_append() {
    let sink = Arc::new(ScriptedSink::default());
    let callback = Arc::new(RecordingCallback::default());
    let options = BufferedWriterOptions {
        time_trigger: None,
        ..Default::default()
    };
    let writer = BufferedWriter::new(
        Arc::new(move |_| options.clone()),
        sink,
        callback,
        256, // tiny budget
    );

    writer.append(LogId(7), record(0, 200)).expect("fits");
    assert_eq!(
        writer.append(LogId(7), record(1, 200)).unwrap_err(),
        Status::NoBufs
    );
}
