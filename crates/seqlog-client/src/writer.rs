//! The Buffered Writer
//!
//! Async shell around the per-log state machines. It owns:
//!
//! - the append entry points (with memory admission against the global
//!   payload budget),
//! - the time-trigger and retry timer tasks,
//! - background encoding of large blobs on the blocking pool,
//! - and the `AppendSink` calls that actually deliver batches.
//!
//! The per-log lock is a plain mutex held only for state-machine
//! transitions; every await (sink call, timer sleep) happens with the
//! lock released, and the resulting actions are applied on re-entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use seqlog_core::{LogId, NodeId, Status};
use tracing::debug;

use crate::log_writer::{Append, ContextSet, LogWriter, SendJob, WriterAction};
use crate::memory::MemoryBudget;
use crate::options::BufferedWriterOptions;

/// Whether a failed batch may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Allow,
    Deny,
}

/// Callbacks into the application. Every record submitted eventually
/// sees exactly one `on_success` or `on_failure` covering it.
pub trait AppendCallback: Send + Sync {
    fn on_success(&self, log_id: LogId, contexts: ContextSet, first_seq: u64);

    fn on_failure(
        &self,
        log_id: LogId,
        contexts: ContextSet,
        status: Status,
        redirect: Option<NodeId>,
    );

    /// Consulted before each retry; `Deny` fails the batch now.
    fn on_retry(&self, _log_id: LogId, _record_count: usize, _status: Status) -> RetryDecision {
        RetryDecision::Allow
    }
}

/// Reply to one batch append: status, the sequence number assigned to
/// the batch's first record, and an optional redirect target.
pub type AppendReply = (Status, u64, Option<NodeId>);

/// Where finished batches go: in production the sequencer append path,
/// in tests a script.
///
/// `append_batch` is two-phase: the batch must be *dispatched* (handed
/// to the transport) before the call returns, and the returned future
/// resolves with the reply. The writer relies on this to dispatch a
/// log's batches strictly in order while keeping several in flight.
pub trait AppendSink: Send + Sync {
    fn append_batch(
        &self,
        log_id: LogId,
        blob: Bytes,
        record_count: u32,
    ) -> BoxFuture<'static, AppendReply>;

    /// The encoder freed payload memory early (destroy mode).
    fn on_bytes_freed(&self, _bytes: u64) {}
}

/// Writer-wide counters.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub size_trigger_flush: AtomicU64,
    pub max_payload_flush: AtomicU64,
    pub time_trigger_flush: AtomicU64,
    pub retries: AtomicU64,
    pub batches_succeeded: AtomicU64,
    pub batches_failed: AtomicU64,
    pub appends_success: AtomicU64,
    pub appends_failed: AtomicU64,
    pub appends_failed_shutdown: AtomicU64,
    pub appends_dropped_behind_failed_batch: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_batched: AtomicU64,
}

impl WriterStats {
    pub fn bump_size_trigger_flush(&self) {
        self.size_trigger_flush.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_max_payload_flush(&self) {
        self.max_payload_flush.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_time_trigger_flush(&self) {
        self.time_trigger_flush.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_batches_succeeded(&self) {
        self.batches_succeeded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_appends_success(&self, n: u64) {
        self.appends_success.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_appends_failed(&self, n: u64) {
        self.appends_failed.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_appends_failed_shutdown(&self, n: u64) {
        self.appends_failed_shutdown.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_appends_dropped_behind_failed_batch(&self, n: u64) {
        self.appends_dropped_behind_failed_batch
            .fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_bytes_batched(&self, n: u64) {
        self.bytes_batched.fetch_add(n, Ordering::Relaxed);
    }
}

struct WriterShared {
    logs: Mutex<HashMap<LogId, Arc<Mutex<LogWriter>>>>,
    get_options: Arc<dyn Fn(LogId) -> BufferedWriterOptions + Send + Sync>,
    sink: Arc<dyn AppendSink>,
    callback: Arc<dyn AppendCallback>,
    budget: MemoryBudget,
    stats: Arc<WriterStats>,
    shutting_down: AtomicBool,
}

/// Client-side batching writer. Cheap to clone; all clones share the
/// same per-log state and budget.
#[derive(Clone)]
pub struct BufferedWriter {
    shared: Arc<WriterShared>,
}

impl BufferedWriter {
    pub fn new(
        get_options: Arc<dyn Fn(LogId) -> BufferedWriterOptions + Send + Sync>,
        sink: Arc<dyn AppendSink>,
        callback: Arc<dyn AppendCallback>,
        memory_limit_bytes: i64,
    ) -> Self {
        Self {
            shared: Arc::new(WriterShared {
                logs: Mutex::new(HashMap::new()),
                get_options,
                sink,
                callback,
                budget: MemoryBudget::new(memory_limit_bytes),
                stats: Arc::new(WriterStats::default()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.shared.stats.clone()
    }

    pub fn memory_used(&self) -> i64 {
        self.shared.budget.used()
    }

    /// Buffer one append. Must run inside a tokio runtime; timers,
    /// encodes and sends are spawned from here.
    pub fn append(&self, log_id: LogId, append: Append) -> Result<(), Status> {
        self.append_chunk(log_id, vec![append])
    }

    /// Buffer several appends atomically: they land in the same batch
    /// and succeed or fail together.
    pub fn append_chunk(&self, log_id: LogId, chunk: Vec<Append>) -> Result<(), Status> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(Status::Shutdown);
        }
        if chunk.is_empty() {
            return Err(Status::Invalid);
        }

        let bytes: usize = chunk.iter().map(|a| a.payload.memory_size()).sum();
        if !self.shared.budget.acquire(bytes) {
            return Err(Status::NoBufs);
        }

        let writer = self.log_writer(log_id);
        let actions = writer.lock().expect("log writer poisoned").append(chunk);
        self.perform_actions(log_id, actions);
        Ok(())
    }

    /// Flush one log now (building batch immediately, blocked appends
    /// as soon as they unblock).
    pub fn flush_log(&self, log_id: LogId) {
        let writer = self.log_writer(log_id);
        let actions = writer.lock().expect("log writer poisoned").flush_all();
        self.perform_actions(log_id, actions);
    }

    /// Flush every log with buffered data.
    pub fn flush_all(&self) {
        let writers: Vec<(LogId, Arc<Mutex<LogWriter>>)> = {
            let logs = self.shared.logs.lock().expect("log map poisoned");
            logs.iter().map(|(id, w)| (*id, w.clone())).collect()
        };
        for (log_id, writer) in writers {
            let actions = writer.lock().expect("log writer poisoned").flush_all();
            self.perform_actions(log_id, actions);
        }
    }

    /// Fail everything buffered with `Shutdown` and refuse new appends.
    /// Inflight sink calls may still complete; their replies are
    /// ignored by the terminated batches.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        let writers: Vec<Arc<Mutex<LogWriter>>> = {
            let logs = self.shared.logs.lock().expect("log map poisoned");
            logs.values().cloned().collect()
        };
        for writer in writers {
            writer.lock().expect("log writer poisoned").shutdown();
        }
        debug!("buffered writer shut down");
    }

    fn log_writer(&self, log_id: LogId) -> Arc<Mutex<LogWriter>> {
        let mut logs = self.shared.logs.lock().expect("log map poisoned");
        logs.entry(log_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(LogWriter::new(
                    log_id,
                    self.shared.get_options.clone(),
                    self.shared.callback.clone(),
                    self.shared.budget.clone(),
                    self.shared.stats.clone(),
                )))
            })
            .clone()
    }

    fn perform_actions(&self, log_id: LogId, actions: Vec<WriterAction>) {
        for action in actions {
            match action {
                WriterAction::Encode {
                    batch_num,
                    background,
                } => self.spawn_encode(log_id, batch_num, background),
                WriterAction::Send(job) => self.spawn_send(log_id, job),
                WriterAction::ScheduleRetry {
                    batch_num,
                    generation,
                    delay,
                } => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let writer = this.log_writer(log_id);
                        let actions = writer
                            .lock()
                            .expect("log writer poisoned")
                            .retry_timer_fired(batch_num, generation);
                        this.perform_actions(log_id, actions);
                    });
                }
                WriterAction::ArmTimeTrigger { generation, delay } => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let writer = this.log_writer(log_id);
                        let actions = writer
                            .lock()
                            .expect("log writer poisoned")
                            .time_trigger_fired(generation);
                        this.perform_actions(log_id, actions);
                    });
                }
            }
        }
    }

    /// Encode a batch blob: inline for small batches, on the blocking
    /// pool for large ones so the async workers stay responsive.
    fn spawn_encode(&self, log_id: LogId, batch_num: u64, background: bool) {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            // Shutdown fails the batches with callbacks; nothing to
            // encode.
            return;
        }
        let this = self.clone();
        if background {
            tokio::task::spawn_blocking(move || {
                this.encode_and_dispatch(log_id, batch_num);
            });
        } else {
            this.encode_and_dispatch(log_id, batch_num);
        }
    }

    fn encode_and_dispatch(&self, log_id: LogId, batch_num: u64) {
        let writer = self.log_writer(log_id);
        let (freed, actions) = {
            let mut writer = writer.lock().expect("log writer poisoned");
            let freed = writer.construct_blob(batch_num);
            (freed, writer.ready_to_send(batch_num))
        };
        if freed > 0 {
            self.shared.sink.on_bytes_freed(freed as u64);
        }
        self.perform_actions(log_id, actions);
    }

    fn spawn_send(&self, log_id: LogId, job: SendJob) {
        let SendJob {
            batch_num,
            blob,
            record_count,
        } = job;
        // Dispatch happens here, synchronously and therefore in batch
        // order; only the wait for the reply is spawned.
        let reply = self.shared.sink.append_batch(log_id, blob, record_count);
        let this = self.clone();
        tokio::spawn(async move {
            let (status, first_seq, redirect) = reply.await;
            let writer = this.log_writer(log_id);
            let actions = writer
                .lock()
                .expect("log writer poisoned")
                .on_append_reply(batch_num, status, first_seq, redirect);
            this.perform_actions(log_id, actions);
        });
    }
}
