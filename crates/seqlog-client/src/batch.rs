//! Batch State
//!
//! One batch is one future append to the sequencer: an ordered set of
//! records, their merged attributes, and (once constructed) the encoded
//! blob. The state machine:
//!
//! ```text
//! Building -- size/time/max-payload trigger --> ConstructingBlob
//! ConstructingBlob -- encode complete --> ReadyToSend
//! ReadyToSend -- in-order dispatch --> Inflight
//! Inflight -- OK --> Finished
//! Inflight -- transient failure, retries remain --> RetryPending
//! Inflight -- terminal failure --> Finished
//! RetryPending -- timer --> Inflight
//! ```
//!
//! The only legal shortcut is Inflight -> Finished on shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::encoder::{BlobFormat, BlobSizeEstimator};
use crate::log_writer::Append;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Building,
    ConstructingBlob,
    ReadyToSend,
    Inflight,
    RetryPending,
    Finished,
}

impl BatchState {
    pub fn name(&self) -> &'static str {
        match self {
            BatchState::Building => "BUILDING",
            BatchState::ConstructingBlob => "CONSTRUCTING_BLOB",
            BatchState::ReadyToSend => "READY_TO_SEND",
            BatchState::Inflight => "INFLIGHT",
            BatchState::RetryPending => "RETRY_PENDING",
            BatchState::Finished => "FINISHED",
        }
    }
}

/// Attributes merged across a batch's appends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchAttributes {
    /// Smallest client-supplied key across the appends; lets readers
    /// seek batches by key range.
    pub optional_key: Option<String>,
    /// Counter attributes, merged by key-wise addition.
    pub counters: Option<BTreeMap<u8, i64>>,
}

impl BatchAttributes {
    /// Fold one append's attributes in.
    pub fn merge(&mut self, append: &Append) {
        if let Some(key) = &append.attrs.optional_key {
            match &self.optional_key {
                Some(current) if current <= key => {}
                _ => self.optional_key = Some(key.clone()),
            }
        }
        if let Some(new_counters) = &append.attrs.counters {
            let merged = self.counters.get_or_insert_with(BTreeMap::new);
            for (key, value) in new_counters {
                *merged.entry(*key).or_insert(0) += value;
            }
        }
    }
}

/// Exponential backoff state for one batch's retries. The first delay
/// is randomized so batches that failed together do not retry together.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    next_delay: Duration,
    max_delay: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        // 0.5x..1.5x spread on the first delay.
        let jitter = 0.5 + rand::random::<f64>();
        let first = Duration::from_millis((initial.as_millis() as f64 * jitter) as u64);
        Self {
            next_delay: first.min(max),
            max_delay: max,
        }
    }

    /// The delay to wait now; doubles for next time, capped.
    pub fn next(&mut self) -> Duration {
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        delay
    }
}

pub struct Batch {
    pub num: u64,
    pub state: BatchState,
    pub appends: Vec<Append>,
    pub attrs: BatchAttributes,
    pub blob: Bytes,
    pub estimator: BlobSizeEstimator,
    pub blob_bytes_total: usize,
    pub blob_format: BlobFormat,
    pub retry_count: u32,
    pub retry_backoff: Option<RetryBackoff>,
    /// Invalidates a sleeping retry timer when the batch terminates.
    pub retry_generation: u64,
    pub payload_memory_bytes_total: usize,
    /// Bytes the encoder already freed (destroy mode), to report once.
    pub total_size_freed: usize,
}

impl Batch {
    pub fn new(num: u64) -> Self {
        Self {
            num,
            state: BatchState::Building,
            appends: Vec::new(),
            attrs: BatchAttributes::default(),
            blob: Bytes::new(),
            estimator: BlobSizeEstimator::new(),
            blob_bytes_total: 0,
            blob_format: BlobFormat::SinglePayloads,
            retry_count: 0,
            retry_backoff: None,
            retry_generation: 0,
            payload_memory_bytes_total: 0,
            total_size_freed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Payload;
    use crate::log_writer::AppendAttributes;

    fn append_with_key(key: Option<&str>) -> Append {
        Append {
            context: 0,
            payload: Payload::Single(Bytes::from_static(b"p")),
            attrs: AppendAttributes {
                optional_key: key.map(str::to_owned),
                counters: None,
            },
        }
    }

    fn append_with_counters(counters: &[(u8, i64)]) -> Append {
        Append {
            context: 0,
            payload: Payload::Single(Bytes::from_static(b"p")),
            attrs: AppendAttributes {
                optional_key: None,
                counters: Some(counters.iter().copied().collect()),
            },
        }
    }

    #[test]
    fn test_merge_keeps_smallest_key() {
        let mut attrs = BatchAttributes::default();
        attrs.merge(&append_with_key(Some("m")));
        attrs.merge(&append_with_key(Some("a")));
        attrs.merge(&append_with_key(Some("z")));
        attrs.merge(&append_with_key(None));
        assert_eq!(attrs.optional_key.as_deref(), Some("a"));
    }

    #[test]
    fn test_merge_adds_counters_keywise() {
        let mut attrs = BatchAttributes::default();
        attrs.merge(&append_with_counters(&[(1, 10), (2, 5)]));
        attrs.merge(&append_with_counters(&[(1, -3), (9, 7)]));
        let counters = attrs.counters.unwrap();
        assert_eq!(counters.get(&1), Some(&7));
        assert_eq!(counters.get(&2), Some(&5));
        assert_eq!(counters.get(&9), Some(&7));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_millis(300));
        let first = backoff.next();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(300));
        let mut last = first;
        for _ in 0..5 {
            let next = backoff.next();
            assert!(next >= last);
            assert!(next <= Duration::from_millis(300));
            last = next;
        }
        assert_eq!(last, Duration::from_millis(300));
    }
}
