//! Bounded background work queue.
//!
//! Replaces the old sleep-and-poll list: consumers block on `dequeue` and
//! wake the moment work arrives, producers feel backpressure through the
//! bounded channel, and `depth()` exposes the backlog for observability.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// The queue rejected a job because it was full.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("work queue is full")]
pub struct QueueFull<T>(pub T);

pub struct WorkQueue<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    depth: AtomicUsize,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a job, waiting for capacity when the queue is full.
    pub async fn enqueue(&self, job: T) {
        // The channel is never closed while `self` is alive: we hold both ends.
        if self.sender.send(job).await.is_ok() {
            let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(depth, "job enqueued");
        }
    }

    /// Enqueue without waiting; hands the job back when the queue is full.
    pub fn try_enqueue(&self, job: T) -> Result<(), QueueFull<T>> {
        match self.sender.try_send(job) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(depth, "job enqueued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => Err(QueueFull(job)),
            Err(mpsc::error::TrySendError::Closed(job)) => Err(QueueFull(job)),
        }
    }

    /// Wait for the next job. Wakes as soon as one is enqueued.
    pub async fn dequeue(&self) -> T {
        let mut receiver = self.receiver.lock().await;
        // See `enqueue`: the sender half cannot be dropped first.
        let job = receiver.recv().await.expect("work queue sender lives as long as the queue");
        self.depth.fetch_sub(1, Ordering::SeqCst);
        job
    }

    /// Jobs currently waiting.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
