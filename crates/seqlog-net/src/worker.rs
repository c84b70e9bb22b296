//! The Worker Executor
//!
//! A worker is one cooperative, single-threaded executor that owns one
//! Sender. Everything the Sender touches is confined to its worker;
//! other tasks interact by posting closures onto the worker's queue and
//! letting the worker run them against `&mut Sender`.
//!
//! Two queues exist: the high-priority one carries completion drains
//! and other latency-critical work, and always wins over the regular
//! queue. The worker also drives the Sender's periodic duties: the
//! connection health pass and the flow-group replenish tick.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::sender::Sender;

/// Work posted to a worker; runs on the worker with exclusive access
/// to its Sender.
pub type Task = Box<dyn FnOnce(&mut Sender) + Send>;

/// How often deferred traffic is re-evaluated for released bandwidth.
const SHAPING_TICK: Duration = Duration::from_millis(10);

/// Cloneable handle used to post work onto a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    hi_tx: mpsc::UnboundedSender<Task>,
    lo_tx: mpsc::UnboundedSender<Task>,
}

impl WorkerHandle {
    pub fn post(&self, task: Task) -> bool {
        self.lo_tx.send(task).is_ok()
    }

    pub fn post_high_priority(&self, task: Task) -> bool {
        self.hi_tx.send(task).is_ok()
    }

    /// Run `f` against the worker's Sender and await its result. This
    /// is how code outside the worker (the admin debug surface, tests)
    /// reads or pokes per-worker state without sharing it. `None` when
    /// the worker is gone.
    pub async fn with_sender<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Sender) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let posted = self.post(Box::new(move |sender: &mut Sender| {
            let _ = tx.send(f(sender));
        }));
        if !posted {
            return None;
        }
        rx.await.ok()
    }
}

/// Receiving ends of a worker's queues, created before the Sender so
/// the Sender can hold the handle.
pub struct WorkerQueues {
    hi_rx: mpsc::UnboundedReceiver<Task>,
    lo_rx: mpsc::UnboundedReceiver<Task>,
}

/// Create the queue pair for one worker.
pub fn worker_channel() -> (WorkerHandle, WorkerQueues) {
    let (hi_tx, hi_rx) = mpsc::unbounded_channel();
    let (lo_tx, lo_rx) = mpsc::unbounded_channel();
    (WorkerHandle { hi_tx, lo_tx }, WorkerQueues { hi_rx, lo_rx })
}

pub struct Worker {
    sender: Sender,
    queues: WorkerQueues,
}

impl Worker {
    pub fn new(sender: Sender, queues: WorkerQueues) -> Self {
        Self { sender, queues }
    }

    /// Direct access for tests and embedders that drive the worker
    /// manually.
    pub fn sender_mut(&mut self) -> &mut Sender {
        &mut self.sender
    }

    /// Run until shutdown completes. Posted tasks run with exclusive
    /// access to the Sender; periodic duties interleave between them.
    pub async fn run(mut self) {
        let mut health =
            tokio::time::interval(self.sender.settings().socket_health_check_period);
        let mut shaping = tokio::time::interval(SHAPING_TICK);
        // The first tick of a tokio interval fires immediately.
        health.tick().await;
        shaping.tick().await;

        loop {
            tokio::select! {
                biased;
                task = self.queues.hi_rx.recv() => match task {
                    Some(task) => task(&mut self.sender),
                    None => break,
                },
                task = self.queues.lo_rx.recv() => match task {
                    Some(task) => task(&mut self.sender),
                    None => break,
                },
                _ = health.tick() => {
                    self.sender.cleanup_connections();
                }
                _ = shaping.tick() => {
                    self.sender.run_flow_groups();
                }
            }

            if self.sender.is_shutting_down() && self.sender.is_shutdown_completed() {
                break;
            }
        }
        debug!("worker exiting");
        // Whatever completions are still queued get one final drain;
        // they are dropped unless the sender is still accepting work.
        self.sender.deliver_completed_messages();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_posts_survive_clone() {
        let (handle, mut queues) = worker_channel();
        let handle2 = handle.clone();
        assert!(handle.post(Box::new(|_| {})));
        assert!(handle2.post_high_priority(Box::new(|_| {})));
        assert!(queues.hi_rx.try_recv().is_ok());
        assert!(queues.lo_rx.try_recv().is_ok());
    }
}
