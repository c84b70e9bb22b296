//! Buffered Writer Options
//!
//! Per-log knobs, refreshed once per batch through the options
//! callback, so a config change applies to the next batch without
//! disturbing the one being built.

use std::time::Duration;

use crate::encoder::Compression;

/// How many batches may be in flight for one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Several batches in flight; later batches never overtake earlier
    /// ones at dispatch.
    Independent,
    /// One batch in flight at a time; new appends join the building
    /// batch or wait in the blocked queue.
    OneAtATime,
}

#[derive(Debug, Clone)]
pub struct BufferedWriterOptions {
    pub mode: Mode,

    /// Flush once this many payload bytes are buffered. `None` means
    /// no size trigger.
    pub size_trigger: Option<usize>,
    /// Flush a building batch this long after it becomes flushable.
    /// `None` means no time trigger.
    pub time_trigger: Option<Duration>,

    /// Hard cap on the encoded blob. A chunk that would push the
    /// building batch past it forces a flush first.
    pub max_payload_size: usize,

    pub compression: Compression,

    /// Retries per batch after the initial attempt. `0` fails a batch
    /// on its first unsuccessful reply.
    pub retry_count: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,

    /// Encode blobs at least this large on the blocking pool instead
    /// of the worker.
    pub bg_encode_bytes_threshold: usize,

    /// Let the encoder consume payloads as it copies them into the
    /// blob, returning their memory to the budget early.
    pub destroy_payloads: bool,
}

impl Default for BufferedWriterOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Independent,
            size_trigger: None,
            time_trigger: Some(Duration::from_millis(100)),
            max_payload_size: 1024 * 1024,
            compression: Compression::Lz4,
            retry_count: 3,
            retry_initial_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(10),
            bg_encode_bytes_threshold: 512 * 1024,
            destroy_payloads: false,
        }
    }
}
