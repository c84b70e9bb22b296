//! Connection Debug Surface
//!
//! Bridges the admin dispatcher to the per-worker Senders. Connection
//! state is confined to each worker, so the handle posts a query onto
//! every worker's queue and gathers the answers; a worker that has
//! already exited simply contributes nothing.

use seqlog_net::{ConnectionDebugRow, WorkerHandle};
use serde::Serialize;

/// Debug snapshot of one worker's connections.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConnections {
    pub worker: usize,
    pub connections: Vec<ConnectionDebugRow>,
    /// JSON map of message type to queued count across the worker's
    /// connections.
    pub queued_messages: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetConnectionsDebugResponse {
    pub workers: Vec<WorkerConnections>,
}

/// Admin-side handle onto the networking workers.
#[derive(Clone)]
pub struct NetDebugHandle {
    workers: Vec<WorkerHandle>,
}

impl NetDebugHandle {
    pub fn new(workers: Vec<WorkerHandle>) -> Self {
        Self { workers }
    }

    /// For processes without a networking stack (tooling, tests of the
    /// other capabilities).
    pub fn empty() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    /// Snapshot every worker's connections and queued-message counts.
    pub async fn connections(&self) -> Vec<WorkerConnections> {
        let mut out = Vec::new();
        for (worker, handle) in self.workers.iter().enumerate() {
            let snapshot = handle
                .with_sender(|sender| {
                    (sender.fill_debug_info(), sender.dump_queued_messages(None))
                })
                .await;
            if let Some((connections, queued_messages)) = snapshot {
                out.push(WorkerConnections {
                    worker,
                    connections,
                    queued_messages,
                });
            }
        }
        out
    }
}
