//! Per-Log Writer State Machine
//!
//! One `LogWriter` owns everything buffered for one log: the FIFO of
//! batches, the blocked-append queue (ONE_AT_A_TIME mode), the ordering
//! counters, and the trigger bookkeeping. It is a synchronous state
//! machine: every entry point mutates state and returns the
//! `WriterAction`s the async shell must perform (encode a blob, send a
//! batch, arm a timer). That split keeps the ordering logic fully
//! deterministic and testable without a runtime.
//!
//! Ordering rules enforced here:
//!
//! - Batches are numbered in creation order and dispatched strictly in
//!   that order; a batch whose blob finished encoding early waits until
//!   every earlier batch has been dispatched.
//! - In ONE_AT_A_TIME mode at most one batch is past Building at any
//!   time; chunks that cannot join the building batch wait in
//!   `blocked_appends` and are replayed in arrival order.
//! - On terminal failure of a batch in ONE_AT_A_TIME mode the blocked
//!   appends fail with the same status, so no record of the log can
//!   overtake a failed predecessor. This is best effort: appends issued
//!   concurrently with the failure may still be accepted afterwards.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use seqlog_core::{LogId, NodeId, Status};
use tracing::{debug, trace, warn};

use crate::batch::{Batch, BatchState, RetryBackoff};
use crate::encoder::{encode_batch, Payload};
use crate::memory::MemoryBudget;
use crate::options::{BufferedWriterOptions, Mode};
use crate::writer::{AppendCallback, RetryDecision, WriterStats};

/// Caller-supplied tag identifying one append in callbacks.
pub type AppendContext = u64;

/// Per-append attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendAttributes {
    /// Client key; a batch keeps the smallest across its appends.
    pub optional_key: Option<String>,
    /// Counters merged key-wise into the batch.
    pub counters: Option<BTreeMap<u8, i64>>,
}

/// One client-submitted record.
#[derive(Debug, Clone)]
pub struct Append {
    pub context: AppendContext,
    pub payload: Payload,
    pub attrs: AppendAttributes,
}

impl Append {
    pub fn new(context: AppendContext, payload: Payload) -> Self {
        Self {
            context,
            payload,
            attrs: AppendAttributes::default(),
        }
    }
}

/// Contexts and payloads handed back through callbacks, in submission
/// order.
pub type ContextSet = Vec<(AppendContext, Payload)>;

/// One batch ready to go to the sequencer.
pub struct SendJob {
    pub batch_num: u64,
    pub blob: Bytes,
    pub record_count: u32,
}

/// Work the async shell performs on behalf of the state machine.
pub enum WriterAction {
    /// Construct the blob of `batch_num`; on the blocking pool when
    /// `background`.
    Encode { batch_num: u64, background: bool },
    Send(SendJob),
    /// Wake the batch after `delay` unless its generation moved on.
    ScheduleRetry {
        batch_num: u64,
        generation: u64,
        delay: Duration,
    },
    /// Arm the time trigger unless the generation moved on.
    ArmTimeTrigger { generation: u64, delay: Duration },
}

pub struct LogWriter {
    log_id: LogId,
    options: BufferedWriterOptions,
    get_options: Arc<dyn Fn(LogId) -> BufferedWriterOptions + Send + Sync>,
    callback: Arc<dyn AppendCallback>,
    budget: MemoryBudget,
    stats: Arc<WriterStats>,

    batches: VecDeque<Batch>,
    blocked_appends: VecDeque<Vec<Append>>,
    /// How many blocked chunks a flush() call has already promised to
    /// flush once they unblock.
    blocked_appends_flush_deferred_count: usize,

    next_batch_num: u64,
    next_batch_to_send: u64,

    is_flushable: bool,
    time_trigger_armed: bool,
    time_trigger_generation: u64,
}

impl LogWriter {
    pub fn new(
        log_id: LogId,
        get_options: Arc<dyn Fn(LogId) -> BufferedWriterOptions + Send + Sync>,
        callback: Arc<dyn AppendCallback>,
        budget: MemoryBudget,
        stats: Arc<WriterStats>,
    ) -> Self {
        let options = get_options(log_id);
        Self {
            log_id,
            options,
            get_options,
            callback,
            budget,
            stats,
            batches: VecDeque::new(),
            blocked_appends: VecDeque::new(),
            blocked_appends_flush_deferred_count: 0,
            next_batch_num: 0,
            next_batch_to_send: 0,
            is_flushable: false,
            time_trigger_armed: false,
            time_trigger_generation: 0,
        }
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn is_flushable(&self) -> bool {
        self.is_flushable
    }

    /// True when nothing is buffered, inflight or blocked.
    pub fn is_quiescent(&self) -> bool {
        self.batches.is_empty() && self.blocked_appends.is_empty()
    }

    // ---------------------------------------------------------------
    // Append path
    // ---------------------------------------------------------------

    /// Buffer one chunk of appends (the chunk is atomic: all its
    /// records land in the same batch). Memory must already be
    /// reserved by the caller.
    pub fn append(&mut self, chunk: Vec<Append>) -> Vec<WriterAction> {
        let mut actions = Vec::new();
        if let Err(chunk) = self.append_impl(chunk, false, &mut actions) {
            // A batch is inflight in ONE_AT_A_TIME mode; park the chunk
            // until that batch finishes.
            self.blocked_appends.push_back(chunk);
            self.flushable_may_have_changed(&mut actions);
            debug_assert!(self.is_flushable);
        }
        actions
    }

    fn append_impl(
        &mut self,
        chunk: Vec<Append>,
        defer_size_trigger: bool,
        actions: &mut Vec<WriterAction>,
    ) -> Result<(), Vec<Append>> {
        let payload_memory: usize = chunk.iter().map(|a| a.payload.memory_size()).sum();

        if self.have_building_batch() {
            let batch = self.batches.back_mut().expect("building batch exists");
            // Estimate the blob with these records included.
            let mut estimator = batch.estimator.clone();
            for append in &chunk {
                estimator.append(&append.payload);
            }
            if estimator.calculate_size() > self.options.max_payload_size {
                // The chunk would blow the payload limit; flush what is
                // buffered and start a new batch for the chunk.
                self.stats.bump_max_payload_flush();
                self.flush_building_batch(actions);
                debug_assert!(!self.have_building_batch());
            } else {
                batch.blob_bytes_total = estimator.calculate_size();
                batch.blob_format = estimator.format();
                batch.estimator = estimator;
            }
        }

        if !self.have_building_batch() {
            if self.options.mode == Mode::OneAtATime && !self.batches.is_empty() {
                // Wait for the inflight batch before opening a new one.
                return Err(chunk);
            }

            // Refresh log options once per batch.
            self.options = (self.get_options)(self.log_id);

            let mut batch = Batch::new(self.next_batch_num);
            self.next_batch_num += 1;
            for append in &chunk {
                batch.estimator.append(&append.payload);
            }
            batch.blob_bytes_total = batch.estimator.calculate_size();
            batch.blob_format = batch.estimator.format();
            self.batches.push_back(batch);
            trace!(log = %self.log_id, batch = self.next_batch_num - 1, "opened batch");

            self.flushable_may_have_changed(actions);
            debug_assert!(self.is_flushable);
        }

        let batch = self.batches.back_mut().expect("building batch exists");
        batch.payload_memory_bytes_total += payload_memory;
        for append in chunk {
            batch.attrs.merge(&append);
            batch.appends.push(append);
        }

        self.flush_me_maybe(defer_size_trigger, actions);
        Ok(())
    }

    fn flush_me_maybe(&mut self, defer_size_trigger: bool, actions: &mut Vec<WriterAction>) {
        debug_assert!(self.have_building_batch());
        let batch = self.batches.back().expect("building batch exists");

        // Hard limit on the encoded payload.
        if batch.blob_bytes_total >= self.options.max_payload_size {
            self.stats.bump_max_payload_flush();
            self.flush_building_batch(actions);
            return;
        }

        // Client size trigger, unless deferred to pack blocked appends.
        if !defer_size_trigger {
            if let Some(trigger) = self.options.size_trigger {
                if batch.payload_memory_bytes_total >= trigger {
                    self.stats.bump_size_trigger_flush();
                    self.flush_building_batch(actions);
                }
            }
        }
    }

    fn have_building_batch(&self) -> bool {
        self.batches
            .back()
            .is_some_and(|b| b.state == BatchState::Building)
    }

    // ---------------------------------------------------------------
    // Flushing
    // ---------------------------------------------------------------

    fn flush_building_batch(&mut self, actions: &mut Vec<WriterAction>) {
        debug_assert!(self.is_flushable);
        debug_assert!(self.have_building_batch());
        let idx = self.batches.len() - 1;
        self.send_batch(idx, actions);
    }

    /// Flush everything: the building batch now, and blocked appends as
    /// soon as they unblock.
    pub fn flush_all(&mut self) -> Vec<WriterAction> {
        let mut actions = Vec::new();
        if !self.is_flushable {
            return actions;
        }
        if self.have_building_batch() {
            self.flush_building_batch(&mut actions);
        }
        // Blocked chunks cannot flush while a batch is inflight;
        // remember how many this flush covers so they go out as soon as
        // the inflight batch comes back.
        self.blocked_appends_flush_deferred_count = self.blocked_appends.len();
        self.flushable_may_have_changed(&mut actions);
        debug_assert!(!self.is_flushable);
        actions
    }

    /// Time trigger callback from the shell.
    pub fn time_trigger_fired(&mut self, generation: u64) -> Vec<WriterAction> {
        if generation != self.time_trigger_generation {
            return Vec::new();
        }
        self.time_trigger_armed = false;
        self.stats.bump_time_trigger_flush();
        self.flush_all()
    }

    fn calculate_is_flushable(&self) -> bool {
        debug_assert!(self.blocked_appends_flush_deferred_count <= self.blocked_appends.len());
        self.have_building_batch()
            || self.blocked_appends_flush_deferred_count < self.blocked_appends.len()
    }

    fn flushable_may_have_changed(&mut self, actions: &mut Vec<WriterAction>) {
        let new_flushable = self.calculate_is_flushable();
        if new_flushable == self.is_flushable {
            return;
        }
        self.is_flushable = new_flushable;
        if new_flushable {
            // Flushable long enough means the time trigger fires; this
            // covers both a building batch and unsent blocked appends.
            self.arm_time_trigger(actions);
        } else {
            // Cancel by generation; a sleeping timer task becomes a
            // no-op.
            self.time_trigger_generation += 1;
            self.time_trigger_armed = false;
        }
    }

    fn arm_time_trigger(&mut self, actions: &mut Vec<WriterAction>) {
        let Some(delay) = self.options.time_trigger else {
            return;
        };
        if self.time_trigger_armed {
            return;
        }
        self.time_trigger_armed = true;
        actions.push(WriterAction::ArmTimeTrigger {
            generation: self.time_trigger_generation,
            delay,
        });
    }

    // ---------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------

    fn batch_index(&self, batch_num: u64) -> Option<usize> {
        let front = self.batches.front()?.num;
        if batch_num < front {
            return None;
        }
        let idx = (batch_num - front) as usize;
        (idx < self.batches.len()).then_some(idx)
    }

    fn send_batch(&mut self, idx: usize, actions: &mut Vec<WriterAction>) {
        let state = self.batches[idx].state;
        if state == BatchState::Building {
            debug_assert!(self.batches[idx].blob.is_empty());
            let batch_num = self.batches[idx].num;
            let background =
                self.batches[idx].blob_bytes_total >= self.options.bg_encode_bytes_threshold;
            self.set_batch_state(idx, BatchState::ConstructingBlob, actions);
            actions.push(WriterAction::Encode {
                batch_num,
                background,
            });
        } else {
            // A retry: the blob already exists, skip straight to the
            // wire.
            debug_assert_eq!(state, BatchState::RetryPending);
            self.append_batch(idx, actions);
        }
    }

    /// Build the blob for `batch_num`. May run on the blocking pool for
    /// large batches; the caller holds the writer lock either way.
    /// Returns the payload bytes freed early by the encoder (destroy
    /// mode) for the caller to report.
    pub fn construct_blob(&mut self, batch_num: u64) -> usize {
        let Some(idx) = self.batch_index(batch_num) else {
            return 0;
        };
        let batch = &mut self.batches[idx];
        if batch.state != BatchState::ConstructingBlob {
            // Shutdown raced us; the batch was already finished.
            return 0;
        }

        let payload_bytes = batch.payload_memory_bytes_total;
        let (blob, freed) = if self.options.destroy_payloads {
            let mut payloads: Vec<Payload> = batch
                .appends
                .iter_mut()
                .map(|a| std::mem::replace(&mut a.payload, Payload::Single(Bytes::new())))
                .collect();
            encode_batch(
                &mut payloads,
                batch.blob_format,
                self.options.compression,
                true,
            )
        } else {
            let mut payloads: Vec<Payload> =
                batch.appends.iter().map(|a| a.payload.clone()).collect();
            encode_batch(
                &mut payloads,
                batch.blob_format,
                self.options.compression,
                false,
            )
        };
        batch.total_size_freed += freed;
        batch.blob = blob;

        // Before/after counters give clients the compression ratio.
        self.stats.add_bytes_in(payload_bytes as u64);
        self.stats.add_bytes_batched(batch.blob.len() as u64);
        freed
    }

    /// Blob construction finished; dispatch every batch that is now
    /// unblocked, strictly in order.
    pub fn ready_to_send(&mut self, batch_num: u64) -> Vec<WriterAction> {
        let mut actions = Vec::new();
        let Some(idx) = self.batch_index(batch_num) else {
            return actions;
        };
        if self.batches[idx].state != BatchState::ConstructingBlob {
            return actions;
        }
        self.set_batch_state(idx, BatchState::ReadyToSend, &mut actions);

        let mut sent_at_least_one = false;
        loop {
            let front_num = match self.batches.front() {
                Some(batch) => batch.num,
                None => break,
            };
            // Batches before the front that never got dispatched were
            // terminated (shutdown); catch the counter up.
            if self.next_batch_to_send < front_num {
                self.next_batch_to_send = front_num;
            }
            let index = (self.next_batch_to_send - front_num) as usize;
            if index >= self.batches.len() {
                break;
            }
            if self.batches[index].state != BatchState::ReadyToSend {
                if !sent_at_least_one {
                    warn!(
                        log = %self.log_id,
                        behind = self.batches.len() - index,
                        next = self.next_batch_to_send,
                        state = self.batches[index].state.name(),
                        "batches waiting behind an unfinished predecessor"
                    );
                }
                break;
            }
            self.next_batch_to_send += 1;
            self.append_batch(index, &mut actions);
            sent_at_least_one = true;
        }
        actions
    }

    fn append_batch(&mut self, idx: usize, actions: &mut Vec<WriterAction>) {
        debug_assert!(matches!(
            self.batches[idx].state,
            BatchState::ReadyToSend | BatchState::RetryPending
        ));
        debug_assert!(!self.batches[idx].blob.is_empty());

        self.set_batch_state(idx, BatchState::Inflight, actions);
        let batch = &self.batches[idx];
        actions.push(WriterAction::Send(SendJob {
            batch_num: batch.num,
            blob: batch.blob.clone(),
            record_count: batch.appends.len() as u32,
        }));
    }

    // ---------------------------------------------------------------
    // Replies
    // ---------------------------------------------------------------

    /// Sequencer reply for one inflight batch.
    pub fn on_append_reply(
        &mut self,
        batch_num: u64,
        status: Status,
        first_seq: u64,
        redirect: Option<NodeId>,
    ) -> Vec<WriterAction> {
        let mut actions = Vec::new();
        let Some(idx) = self.batch_index(batch_num) else {
            return actions;
        };
        if self.batches[idx].state != BatchState::Inflight {
            return actions;
        }
        debug!(
            log = %self.log_id,
            batch = batch_num,
            status = status.name(),
            "append reply"
        );

        if status != Status::Ok && self.schedule_retry(idx, status, &mut actions) {
            return actions;
        }

        if status == Status::Ok {
            self.stats.bump_batches_succeeded();
        } else {
            self.stats.bump_batches_failed();
        }

        self.invoke_callbacks(idx, status, first_seq, redirect);
        self.finish_batch(idx, &mut actions);
        self.reap();

        if self.options.mode == Mode::OneAtATime {
            if status == Status::Ok {
                // The slot freed up; replay whatever was blocked.
                self.unblock_appends(&mut actions);
            } else {
                // Fail the blocked appends too, preserving per-log
                // order as far as we can see it.
                self.drop_blocked_appends(status, redirect, &mut actions);
            }
        }
        actions
    }

    fn schedule_retry(
        &mut self,
        idx: usize,
        status: Status,
        actions: &mut Vec<WriterAction>,
    ) -> bool {
        if self.batches[idx].retry_count >= self.options.retry_count {
            return false;
        }
        // Permanent statuses fail the batch immediately.
        if !status.is_transient() {
            return false;
        }
        let callback = self.callback.clone();
        let record_count = self.batches[idx].appends.len();
        if callback.on_retry(self.log_id, record_count, status) == RetryDecision::Deny {
            return false;
        }

        let initial = self.options.retry_initial_delay;
        let max = self.options.retry_max_delay;
        let batch = &mut self.batches[idx];
        let backoff = batch
            .retry_backoff
            .get_or_insert_with(|| RetryBackoff::new(initial, max));
        let delay = backoff.next();
        batch.retry_count += 1;
        batch.retry_generation += 1;
        let batch_num = batch.num;
        let generation = batch.retry_generation;
        self.set_batch_state(idx, BatchState::RetryPending, actions);
        self.stats.bump_retries();
        debug!(log = %self.log_id, batch = batch_num, delay_ms = delay.as_millis() as u64, "scheduling retry");
        actions.push(WriterAction::ScheduleRetry {
            batch_num,
            generation,
            delay,
        });
        true
    }

    /// Retry timer callback from the shell.
    pub fn retry_timer_fired(&mut self, batch_num: u64, generation: u64) -> Vec<WriterAction> {
        let mut actions = Vec::new();
        let Some(idx) = self.batch_index(batch_num) else {
            return actions;
        };
        let batch = &self.batches[idx];
        if batch.state != BatchState::RetryPending || batch.retry_generation != generation {
            return actions;
        }
        self.send_batch(idx, &mut actions);
        actions
    }

    fn invoke_callbacks(
        &mut self,
        idx: usize,
        status: Status,
        first_seq: u64,
        redirect: Option<NodeId>,
    ) {
        debug_assert!(self.batches[idx].state != BatchState::Finished);
        let callback = self.callback.clone();
        let batch = &mut self.batches[idx];
        let contexts: ContextSet = batch
            .appends
            .drain(..)
            .map(|a| (a.context, a.payload))
            .collect();

        if status == Status::Ok {
            self.stats.add_appends_success(contexts.len() as u64);
            callback.on_success(self.log_id, contexts, first_seq);
        } else {
            if status == Status::Shutdown {
                self.stats.add_appends_failed_shutdown(contexts.len() as u64);
            } else {
                self.stats.add_appends_failed(contexts.len() as u64);
            }
            callback.on_failure(self.log_id, contexts, status, redirect);
        }
    }

    fn finish_batch(&mut self, idx: usize, actions: &mut Vec<WriterAction>) {
        {
            let batch = &mut self.batches[idx];
            // Callbacks took the payloads already.
            debug_assert!(batch.appends.is_empty());
            batch.blob = Bytes::new();
            // A sleeping retry timer for this batch must not fire.
            batch.retry_generation += 1;
            self.budget.release(batch.payload_memory_bytes_total);
            batch.payload_memory_bytes_total = 0;
        }
        self.set_batch_state(idx, BatchState::Finished, actions);
    }

    fn reap(&mut self) {
        while self
            .batches
            .front()
            .is_some_and(|b| b.state == BatchState::Finished)
        {
            self.batches.pop_front();
        }
    }

    fn set_batch_state(&mut self, idx: usize, state: BatchState, actions: &mut Vec<WriterAction>) {
        self.batches[idx].state = state;
        self.flushable_may_have_changed(actions);
    }

    // ---------------------------------------------------------------
    // Blocked appends
    // ---------------------------------------------------------------

    fn unblock_appends(&mut self, actions: &mut Vec<WriterAction>) {
        let mut flush_at_end = false;

        while let Some(chunk) = self.blocked_appends.pop_front() {
            // With more blocked appends behind this one, defer the size
            // trigger so the next batch packs as many as possible.
            let defer_size_trigger = !self.blocked_appends.is_empty();
            match self.append_impl(chunk, defer_size_trigger, actions) {
                Ok(()) => {
                    if self.blocked_appends_flush_deferred_count > 0 {
                        // A flush() arrived while this chunk was
                        // blocked; honor it once replay is done.
                        flush_at_end = true;
                        self.blocked_appends_flush_deferred_count -= 1;
                    }
                }
                Err(chunk) => {
                    // A new batch just went inflight; stop replaying.
                    self.blocked_appends.push_front(chunk);
                    break;
                }
            }
        }

        if flush_at_end && self.have_building_batch() {
            self.flush_building_batch(actions);
        } else {
            self.flushable_may_have_changed(actions);
        }
    }

    fn drop_blocked_appends(
        &mut self,
        status: Status,
        redirect: Option<NodeId>,
        actions: &mut Vec<WriterAction>,
    ) {
        let chunks: Vec<Vec<Append>> = self.blocked_appends.drain(..).collect();
        let callback = self.callback.clone();
        let mut released = 0usize;
        for chunk in chunks {
            self.stats
                .add_appends_dropped_behind_failed_batch(chunk.len() as u64);
            released += chunk
                .iter()
                .map(|a| a.payload.memory_size())
                .sum::<usize>();
            let contexts: ContextSet =
                chunk.into_iter().map(|a| (a.context, a.payload)).collect();
            callback.on_failure(self.log_id, contexts, status, redirect);
        }
        self.budget.release(released);
        self.blocked_appends_flush_deferred_count = 0;
        self.flushable_may_have_changed(actions);
    }

    // ---------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------

    /// Fail every non-finished batch and every blocked chunk with
    /// `Shutdown`, cancel all timers, release all memory.
    pub fn shutdown(&mut self) {
        let mut actions = Vec::new();
        self.time_trigger_generation += 1;
        self.time_trigger_armed = false;

        for idx in 0..self.batches.len() {
            if self.batches[idx].state != BatchState::Finished {
                self.invoke_callbacks(idx, Status::Shutdown, 0, None);
                self.finish_batch(idx, &mut actions);
            }
        }
        self.reap();
        self.drop_blocked_appends(Status::Shutdown, None, &mut actions);
        // Timer actions are moot now; drop them.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Compression;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallback {
        successes: Mutex<Vec<(LogId, Vec<AppendContext>, u64)>>,
        failures: Mutex<Vec<(LogId, Vec<AppendContext>, Status)>>,
        retries: Mutex<Vec<Status>>,
        deny_retries: std::sync::atomic::AtomicBool,
    }

    impl AppendCallback for RecordingCallback {
        fn on_success(&self, log_id: LogId, contexts: ContextSet, first_seq: u64) {
            let ctxs = contexts.iter().map(|(c, _)| *c).collect();
            self.successes.lock().unwrap().push((log_id, ctxs, first_seq));
        }

        fn on_failure(
            &self,
            log_id: LogId,
            contexts: ContextSet,
            status: Status,
            _redirect: Option<NodeId>,
        ) {
            let ctxs = contexts.iter().map(|(c, _)| *c).collect();
            self.failures.lock().unwrap().push((log_id, ctxs, status));
        }

        fn on_retry(&self, _log_id: LogId, _record_count: usize, status: Status) -> RetryDecision {
            self.retries.lock().unwrap().push(status);
            if self.deny_retries.load(std::sync::atomic::Ordering::SeqCst) {
                RetryDecision::Deny
            } else {
                RetryDecision::Allow
            }
        }
    }

    struct Fixture {
        writer: LogWriter,
        callback: Arc<RecordingCallback>,
        budget: MemoryBudget,
    }

    fn fixture(options: BufferedWriterOptions) -> Fixture {
        let callback = Arc::new(RecordingCallback::default());
        let budget = MemoryBudget::unbounded();
        let stats = Arc::new(WriterStats::default());
        let writer = LogWriter::new(
            LogId(7),
            Arc::new(move |_| options.clone()),
            callback.clone(),
            budget.clone(),
            stats,
        );
        Fixture {
            writer,
            callback,
            budget,
        }
    }

    fn record(context: AppendContext, len: usize) -> Append {
        Append::new(context, Payload::Single(Bytes::from(vec![b'x'; len])))
    }

    fn acquire(fixture: &Fixture, appends: &[Append]) {
        let bytes: usize = appends.iter().map(|a| a.payload.memory_size()).sum();
        assert!(fixture.budget.acquire(bytes));
    }

    /// Walk the actions: encode inline and collect send jobs, like the
    /// shell would.
    fn drive(writer: &mut LogWriter, actions: Vec<WriterAction>) -> Vec<SendJob> {
        let mut jobs = Vec::new();
        let mut pending = actions;
        while let Some(action) = pending.pop() {
            match action {
                WriterAction::Encode { batch_num, .. } => {
                    writer.construct_blob(batch_num);
                    pending.extend(writer.ready_to_send(batch_num));
                }
                WriterAction::Send(job) => jobs.push(job),
                WriterAction::ScheduleRetry { .. } | WriterAction::ArmTimeTrigger { .. } => {}
            }
        }
        jobs.sort_by_key(|j| j.batch_num);
        jobs
    }

    fn options_one_at_a_time() -> BufferedWriterOptions {
        BufferedWriterOptions {
            mode: Mode::OneAtATime,
            compression: Compression::None,
            time_trigger: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_size_trigger_flushes_on_crossing_append() {
        let options = BufferedWriterOptions {
            size_trigger: Some(1024),
            compression: Compression::None,
            time_trigger: None,
            ..Default::default()
        };
        let mut f = fixture(options);

        let mut jobs = Vec::new();
        for i in 0..10u64 {
            let chunk = vec![record(i, 200)];
            acquire(&f, &chunk);
            let actions = f.writer.append(chunk);
            jobs.extend(drive(&mut f.writer, actions));
            if i < 5 {
                assert!(jobs.is_empty(), "no dispatch before the trigger");
            }
        }
        // The 6th append crossed 1024 buffered bytes and flushed the
        // batch with everything buffered so far; the remaining four
        // records are building the next batch.
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].record_count, 6);
        assert!(f.writer.is_flushable());
    }

    #[test]
    fn test_single_chunk_crossing_trigger_is_one_batch() {
        let options = BufferedWriterOptions {
            size_trigger: Some(1024),
            compression: Compression::None,
            time_trigger: None,
            ..Default::default()
        };
        let mut f = fixture(options);

        // One atomic chunk of ten records crosses the trigger at once:
        // a single batch carries all of them.
        let chunk: Vec<Append> = (0..10u64).map(|i| record(i, 200)).collect();
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let jobs = drive(&mut f.writer, actions);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].record_count, 10);
    }

    #[test]
    fn test_max_payload_flush() {
        let options = BufferedWriterOptions {
            max_payload_size: 500,
            compression: Compression::None,
            time_trigger: None,
            ..Default::default()
        };
        let mut f = fixture(options);

        let chunk = vec![record(0, 300)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        assert!(drive(&mut f.writer, actions).is_empty());

        // The next chunk would push the blob past 500; the building
        // batch flushes first and the chunk opens a new one.
        let chunk = vec![record(1, 300)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let jobs = drive(&mut f.writer, actions);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].record_count, 1);
    }

    #[test]
    fn test_one_at_a_time_blocks_second_chunk() {
        let mut f = fixture(options_one_at_a_time());

        let chunk = vec![record(0, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let flush_actions = f.writer.flush_all();
        let mut jobs = drive(&mut f.writer, actions);
        jobs.extend(drive(&mut f.writer, flush_actions));
        assert_eq!(jobs.len(), 1);

        // Batch 0 is inflight; the next chunk must wait.
        let chunk = vec![record(1, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        assert!(drive(&mut f.writer, actions).is_empty());
        assert!(f.writer.is_flushable());

        // Success unblocks and replays the chunk into a new batch.
        let actions = f.writer.on_append_reply(0, Status::Ok, 100, None);
        let jobs = drive(&mut f.writer, actions);
        assert!(jobs.is_empty(), "replayed chunk is building, not sent");
        let actions = f.writer.flush_all();
        let jobs = drive(&mut f.writer, actions);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].batch_num, 1);

        let successes = f.callback.successes.lock().unwrap();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].1, vec![0]);
        assert_eq!(successes[0].2, 100);
    }

    #[test]
    fn test_terminal_failure_drops_blocked_appends() {
        let mut f = fixture(options_one_at_a_time());

        let chunk = vec![record(0, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let flush = f.writer.flush_all();
        let mut jobs = drive(&mut f.writer, actions);
        jobs.extend(drive(&mut f.writer, flush));
        assert_eq!(jobs.len(), 1);

        for ctx in [1u64, 2] {
            let chunk = vec![record(ctx, 10)];
            acquire(&f, &chunk);
            let actions = f.writer.append(chunk);
            assert!(drive(&mut f.writer, actions).is_empty());
        }

        // Terminal failure: InvalidParam is not transient, so no retry;
        // the blocked appends fail with the same status.
        let actions = f.writer.on_append_reply(0, Status::InvalidParam, 0, None);
        assert!(drive(&mut f.writer, actions).is_empty());

        let failures = f.callback.failures.lock().unwrap();
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|(_, _, s)| *s == Status::InvalidParam));
        // Order preserved: the inflight batch first, then blocked in
        // arrival order.
        assert_eq!(failures[0].1, vec![0]);
        assert_eq!(failures[1].1, vec![1]);
        assert_eq!(failures[2].1, vec![2]);

        // All memory returned at quiescence.
        assert_eq!(f.budget.used(), 0);
        assert!(f.writer.is_quiescent());
    }

    #[test]
    fn test_transient_failure_retries_then_succeeds() {
        let options = BufferedWriterOptions {
            compression: Compression::None,
            time_trigger: None,
            retry_count: 3,
            ..Default::default()
        };
        let mut f = fixture(options);

        let chunk = vec![record(0, 10), record(1, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let flush = f.writer.flush_all();
        let mut jobs = drive(&mut f.writer, actions);
        jobs.extend(drive(&mut f.writer, flush));
        assert_eq!(jobs.len(), 1);

        // Timeout: transitions Inflight -> RetryPending.
        let actions = f.writer.on_append_reply(0, Status::Timedout, 0, None);
        let mut retry = None;
        for action in &actions {
            if let WriterAction::ScheduleRetry {
                batch_num,
                generation,
                ..
            } = action
            {
                retry = Some((*batch_num, *generation));
            }
        }
        let (batch_num, generation) = retry.expect("retry scheduled");
        assert_eq!(f.callback.retries.lock().unwrap().len(), 1);

        // Timer fires: RetryPending -> Inflight, resent.
        let actions = f.writer.retry_timer_fired(batch_num, generation);
        let jobs = drive(&mut f.writer, actions);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].batch_num, 0);

        // Success: exactly one on_success with both records.
        let actions = f.writer.on_append_reply(0, Status::Ok, 555, None);
        assert!(drive(&mut f.writer, actions).is_empty());
        let successes = f.callback.successes.lock().unwrap();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].1, vec![0, 1]);
        assert_eq!(successes[0].2, 555);
        assert!(f.callback.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_denied_by_callback_fails_batch() {
        let mut f = fixture(BufferedWriterOptions {
            compression: Compression::None,
            time_trigger: None,
            ..Default::default()
        });
        f.callback
            .deny_retries
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let chunk = vec![record(0, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let flush = f.writer.flush_all();
        drive(&mut f.writer, actions);
        drive(&mut f.writer, flush);

        let actions = f.writer.on_append_reply(0, Status::Timedout, 0, None);
        assert!(drive(&mut f.writer, actions).is_empty());
        assert_eq!(f.callback.failures.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_retries_exhausted_fails_batch() {
        let options = BufferedWriterOptions {
            compression: Compression::None,
            time_trigger: None,
            retry_count: 1,
            ..Default::default()
        };
        let mut f = fixture(options);

        let chunk = vec![record(0, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let flush = f.writer.flush_all();
        drive(&mut f.writer, actions);
        drive(&mut f.writer, flush);

        let actions = f.writer.on_append_reply(0, Status::Timedout, 0, None);
        let (batch_num, generation) = actions
            .iter()
            .find_map(|a| match a {
                WriterAction::ScheduleRetry {
                    batch_num,
                    generation,
                    ..
                } => Some((*batch_num, *generation)),
                _ => None,
            })
            .expect("first retry allowed");

        let actions = f.writer.retry_timer_fired(batch_num, generation);
        drive(&mut f.writer, actions);

        // Second failure exceeds retry_count = 1.
        let actions = f.writer.on_append_reply(0, Status::Timedout, 0, None);
        assert!(drive(&mut f.writer, actions).is_empty());
        assert_eq!(f.callback.failures.lock().unwrap().len(), 1);
        assert_eq!(
            f.callback.failures.lock().unwrap()[0].2,
            Status::Timedout
        );
    }

    #[test]
    fn test_in_order_dispatch_with_out_of_order_encodes() {
        // Independent mode: open two batches, finish encoding the
        // second first; it must not be dispatched before the first.
        let options = BufferedWriterOptions {
            compression: Compression::None,
            time_trigger: None,
            max_payload_size: 400,
            ..Default::default()
        };
        let mut f = fixture(options);

        let chunk = vec![record(0, 300)];
        acquire(&f, &chunk);
        let actions0 = f.writer.append(chunk);
        // This flushes batch 0 (max payload) and opens batch 1.
        let chunk = vec![record(1, 300)];
        acquire(&f, &chunk);
        let actions1 = f.writer.append(chunk);
        let flush = f.writer.flush_all();

        // Collect the encode actions without performing them yet.
        let mut encodes = Vec::new();
        for action in actions0.into_iter().chain(actions1).chain(flush) {
            if let WriterAction::Encode { batch_num, .. } = action {
                encodes.push(batch_num);
            }
        }
        assert_eq!(encodes, vec![0, 1]);

        // Encode batch 1 first: nothing can be dispatched yet.
        f.writer.construct_blob(1);
        let actions = f.writer.ready_to_send(1);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, WriterAction::Send(_))));

        // Encoding batch 0 releases both, in order.
        f.writer.construct_blob(0);
        let actions = f.writer.ready_to_send(0);
        let sends: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                WriterAction::Send(job) => Some(job.batch_num),
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec![0, 1]);
    }

    #[test]
    fn test_shutdown_fails_everything_and_returns_memory() {
        let mut f = fixture(options_one_at_a_time());

        let chunk = vec![record(0, 10)];
        acquire(&f, &chunk);
        let actions = f.writer.append(chunk);
        let flush = f.writer.flush_all();
        drive(&mut f.writer, actions);
        drive(&mut f.writer, flush);

        let chunk = vec![record(1, 10)];
        acquire(&f, &chunk);
        f.writer.append(chunk);

        f.writer.shutdown();

        let failures = f.callback.failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|(_, _, s)| *s == Status::Shutdown));
        assert_eq!(f.budget.used(), 0);
        assert!(f.writer.is_quiescent());
    }
}
