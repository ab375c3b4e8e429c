//! Deferred-work queue.
//!
//! Fallback and JOIN completion can be triggered from contexts that must
//! not take the meta lock (packet reception under a subflow lock). Both
//! call sites push a closure carrying the control-block handle; a single
//! drain task runs each job in a context where taking the meta lock is
//! safe.

use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Worker {
    tx: mpsc::UnboundedSender<Job>,
}

impl Worker {
    /// Spawns the drain task; must be called within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("worker queue closed, drain task exiting");
        });
        Self { tx }
    }

    /// Enqueues a job; runs asynchronously on the drain task.
    pub fn defer<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Send only fails after the drain task died, which means the
        // runtime is tearing down anyway.
        let _ = self.tx.send(Box::new(job));
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}
