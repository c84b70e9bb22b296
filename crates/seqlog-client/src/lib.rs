//! SeqLog Client - The Buffered Writer
//!
//! Client-side batching for appends. Records accumulate per log into
//! batches, the batch blob is encoded and compressed (off-thread when
//! large), appends go to the sequencer strictly in batch order, and
//! transient failures retry with jittered exponential backoff without
//! ever reordering a log's records.
//!
//! The per-log state machine lives in `log_writer`; `writer` is the
//! async shell that owns timers, background encoding and the append
//! sink. The sink (`AppendSink`) is the seam to the actual transport,
//! which is also what the tests script.

pub mod batch;
pub mod encoder;
pub mod log_writer;
pub mod memory;
pub mod options;
pub mod writer;

pub use batch::{Batch, BatchAttributes, BatchState};
pub use encoder::{decode_batch, BlobFormat, BlobSizeEstimator, Compression, Payload};
pub use log_writer::{
    Append, AppendAttributes, AppendContext, ContextSet, LogWriter, SendJob, WriterAction,
};
pub use memory::MemoryBudget;
pub use options::{BufferedWriterOptions, Mode};
pub use writer::{
    AppendCallback, AppendReply, AppendSink, BufferedWriter, RetryDecision, WriterStats,
};
