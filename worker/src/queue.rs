//! The bounded job queue: a `Mutex<VecDeque<Job>>` gated by two semaphores,
//! `space` (free slots) and `items` (ready jobs). A resize swaps the whole
//! `JobQueue` behind the `RwLock<Arc<JobQueue>>` indirection C7 owns, since
//! `tokio::sync::Semaphore` has no in-place capacity change.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use worker_common::job::Job;

pub struct JobQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<Job>>,
    space: Semaphore,
    items: Semaphore,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            items: Semaphore::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs currently queued (not yet popped).
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Blocks until there is a free slot, or shutdown is signalled. A slot
    /// that's already free is taken immediately even if shutdown has already
    /// fired, so a push racing the very start of a drain still lands.
    /// Returns `false` only if no slot is available and shutdown fires first.
    pub async fn push(&self, job: Job, shutdown: &CancellationToken) -> bool {
        let permit = match self.space.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return false,
                    permit = self.space.acquire() => permit,
                };
                let Ok(permit) = permit else { return false };
                permit
            }
        };
        permit.forget();

        self.jobs.lock().await.push_back(job);
        self.items.add_permits(1);
        true
    }

    /// Blocks until a job is available, or shutdown is signalled. A job
    /// that's already queued is popped immediately even if shutdown has
    /// already fired, so a drain on shutdown still empties the queue before
    /// giving up. Returns `None` only once nothing remains queued and
    /// shutdown fires first.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<Job> {
        let permit = match self.items.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return None,
                    permit = self.items.acquire() => permit,
                };
                let Ok(permit) = permit else { return None };
                permit
            }
        };
        permit.forget();

        let job = self.jobs.lock().await.pop_front();
        self.space.add_permits(1);
        job
    }
}

/// The current queue, swappable as a whole on a concurrency-budget resize.
/// Readers take a read lock to grab the `Arc`, so a resize never blocks an
/// in-flight push/pop on the old queue.
pub struct QueueHandle {
    inner: tokio::sync::RwLock<Arc<JobQueue>>,
}

impl QueueHandle {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(Arc::new(JobQueue::new(capacity))),
        }
    }

    pub async fn current(&self) -> Arc<JobQueue> {
        self.inner.read().await.clone()
    }

    /// Waits for the current queue to fully drain of queued (not in-flight)
    /// jobs, then swaps in a freshly sized replacement.
    pub async fn resize(&self, new_capacity: usize, shutdown: &CancellationToken) {
        loop {
            let current = self.current().await;
            if current.capacity() == new_capacity {
                return;
            }
            if current.is_empty().await {
                break;
            }
            if shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        let mut guard = self.inner.write().await;
        if guard.capacity() != new_capacity {
            *guard = Arc::new(JobQueue::new(new_capacity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> Job {
        Job::new(id, serde_json::json!({}))
    }

    #[tokio::test]
    async fn push_then_pop_round_trips() {
        let queue = JobQueue::new(2);
        let shutdown = CancellationToken::new();
        assert!(queue.push(job("A"), &shutdown).await);
        assert_eq!(queue.len().await, 1);
        let popped = queue.pop(&shutdown).await.unwrap();
        assert_eq!(popped.id, "A");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn push_blocks_at_capacity_until_pop_frees_a_slot() {
        let queue = Arc::new(JobQueue::new(1));
        let shutdown = CancellationToken::new();
        assert!(queue.push(job("A"), &shutdown).await);

        let queue2 = queue.clone();
        let shutdown2 = shutdown.clone();
        let pusher = tokio::spawn(async move { queue2.push(job("B"), &shutdown2).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        let popped = queue.pop(&shutdown).await.unwrap();
        assert_eq!(popped.id, "A");
        assert!(pusher.await.unwrap());
    }

    #[tokio::test]
    async fn pop_returns_none_on_shutdown_with_empty_queue() {
        let queue = JobQueue::new(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(queue.pop(&shutdown).await.is_none());
    }

    #[tokio::test]
    async fn resize_swaps_capacity_once_drained() {
        let shutdown = CancellationToken::new();
        let handle = QueueHandle::new(1);
        assert_eq!(handle.current().await.capacity(), 1);
        handle.resize(4, &shutdown).await;
        assert_eq!(handle.current().await.capacity(), 4);
    }
}
