//! Progress Update channel (C8): a bounded, best-effort side channel from
//! handler code into the shared connection pool for mid-job progress
//! messages, entirely separate from the terminal result path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::job::ProgressUpdate;

/// The channel itself: owned by the orchestrator, drained by a single
/// long-lived task. A plain `std::sync::Mutex` backs the queue (rather than
/// the async `tokio::sync::Mutex` the rest of the crate favors) so that
/// `send` stays a synchronous call usable from a blocking handler without an
/// executor underneath it.
pub struct ProgressChannel {
    capacity: usize,
    queue: Mutex<VecDeque<ProgressUpdate>>,
    items: Semaphore,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            items: Semaphore::new(0),
        })
    }

    /// Enqueues `update`, never blocking. If the channel is at capacity, the
    /// oldest pending update is dropped (and a warning logged) to make room:
    /// progress updates are best-effort, and a live handler should never be
    /// slowed down by a reporting channel.
    fn send(&self, update: ProgressUpdate) {
        let mut queue = self.queue.lock().expect("progress channel mutex poisoned");
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    job_id = %dropped.job_id,
                    capacity = self.capacity,
                    "progress channel full, dropping oldest pending update"
                );
            }
        } else {
            self.items.add_permits(1);
        }
        queue.push_back(update);
    }

    /// Blocks until an update is available, or shutdown is signalled. An
    /// update that's already queued is drained immediately even if shutdown
    /// has already fired.
    pub async fn recv(&self, shutdown: &CancellationToken) -> Option<ProgressUpdate> {
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
        self.queue
            .lock()
            .expect("progress channel mutex poisoned")
            .pop_front()
    }
}

/// A cheaply-`Clone`able handle into a handler invocation context, letting
/// user code emit a progress message without blocking on a fresh connection.
#[derive(Clone)]
pub struct ProgressSender {
    channel: Arc<ProgressChannel>,
}

impl ProgressSender {
    pub fn new(channel: Arc<ProgressChannel>) -> Self {
        Self { channel }
    }

    /// Enqueue; return. Never awaits, never blocks on I/O.
    pub fn send(&self, job_id: impl Into<String>, payload: serde_json::Value) {
        self.channel.send(ProgressUpdate {
            job_id: job_id.into(),
            payload,
        });
    }
}
