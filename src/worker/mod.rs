//! Ordered host-side work queues backing CPU worker-pool streams.
//!
//! A [`WorkerQueue`] is one stream's executor: a dedicated thread running
//! submitted host functions strictly in submission order. This gives
//! host-async frees the same contract GPU host callbacks have ("runs
//! after everything submitted before it"), which is what makes the
//! release-chain protocol backend-agnostic.

use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::backend::HostFn;

/// FIFO executor thread for one CPU stream.
pub struct WorkerQueue {
    sender: Option<mpsc::Sender<HostFn>>,
    worker: Option<JoinHandle<()>>,
    id: u64,
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue").field("id", &self.id).finish()
    }
}

impl WorkerQueue {
    pub fn new(id: u64) -> Self {
        let (sender, receiver) = mpsc::channel::<HostFn>();
        let worker = std::thread::Builder::new()
            .name(format!("streamalloc-worker-{id}"))
            .spawn(move || {
                tracing::debug!("worker stream {} started", id);
                while let Ok(job) = receiver.recv() {
                    job();
                }
                tracing::debug!("worker stream {} stopped", id);
            })
            .expect("failed to spawn worker stream thread");

        WorkerQueue {
            sender: Some(sender),
            worker: Some(worker),
            id,
        }
    }

    /// Submit `f` behind everything previously enqueued.
    pub fn enqueue(&self, f: HostFn) {
        if let Some(sender) = &self.sender {
            // A send error means the worker thread died; jobs must not be
            // silently dropped because frees depend on them.
            sender
                .send(f)
                .expect("worker stream thread terminated with jobs pending");
        }
    }

    /// Block until every previously enqueued job has run.
    pub fn sync(&self) {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        self.enqueue(Box::new(move || {
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the backlog and exit.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
