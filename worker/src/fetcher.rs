//! Job Fetcher (C5): polls the acquisition endpoint and feeds the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use worker_common::registry::ProgressRegistry;
use worker_common::transport::{AcquireOutcome, Transport};

use crate::inflight::InFlightIds;
use crate::queue::QueueHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Runs until `shutdown` fires. Exits promptly once the shutdown token is
/// cancelled, leaving any jobs already pushed for C6 to drain.
pub async fn run(
    transport: Arc<Transport>,
    registry: Arc<ProgressRegistry>,
    queue: Arc<QueueHandle>,
    in_flight: Arc<InFlightIds>,
    concurrency_modifier: Arc<dyn Fn(usize) -> usize + Send + Sync>,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        // Invoked before every cycle regardless of queue saturation: a
        // runner that drains slower than this loop fills keeps the queue
        // permanently at capacity, and that is exactly the condition a
        // downsize/upsize request needs to reach the queue.
        let budget_before_modifier = queue.current().await.capacity();
        let new_budget = concurrency_modifier(budget_before_modifier);
        if new_budget != budget_before_modifier {
            queue.resize(new_budget, &shutdown).await;
        }

        let current_queue = queue.current().await;
        let queue_size = current_queue.len().await;
        let budget = current_queue.capacity();
        if queue_size >= budget {
            if wait(&shutdown).await {
                break;
            }
            continue;
        }

        let jobs_needed = budget - queue_size;
        let in_progress = match registry.count().await {
            Ok(count) => count > 0,
            Err(err) => {
                warn!(error = %err, "fetcher failed to read in-progress count");
                false
            }
        };

        match transport.acquire(in_progress, jobs_needed).await {
            Ok(AcquireOutcome::Jobs(jobs)) => {
                for job in jobs {
                    let id = job.id.clone();
                    if !in_flight.try_track(&id) {
                        debug!(job_id = %id, "dropping duplicate job delivery; already queued or in-flight");
                        continue;
                    }
                    if !current_queue.push(job, &shutdown).await {
                        in_flight.release(&id);
                        break;
                    }
                    if let Err(err) = registry.add(&id).await {
                        warn!(job_id = %id, error = %err, "failed to record job as in-progress");
                    }
                }
            }
            Ok(AcquireOutcome::Empty) => {
                debug!("acquisition returned no jobs");
            }
            Ok(AcquireOutcome::RateLimited) => {
                if wait_for(&shutdown, transport.rate_limit_backoff()).await {
                    break;
                }
                continue;
            }
            Err(err) if err.is_retryable() => {
                debug!(error = %err, "acquisition hit a transient error, retrying");
            }
            Err(err) => {
                warn!(error = %err, "acquisition failed");
            }
        }
    }
}

/// Waits `POLL_INTERVAL`, or returns `true` early if shutdown fires first.
async fn wait(shutdown: &CancellationToken) -> bool {
    wait_for(shutdown, POLL_INTERVAL).await
}

async fn wait_for(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use worker_common::transport::TransportUrls;

    fn urls(server: &MockServer) -> TransportUrls {
        TransportUrls {
            acquire: server.url("/job-take").parse().unwrap(),
            post_output: server.url("/job-done").parse().unwrap(),
            post_stream: server.url("/job-stream").parse().unwrap(),
            ping: server.url("/ping").parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn pushes_acquired_jobs_and_registers_them() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/job-take");
            then.status(200)
                .json_body(serde_json::json!({"id": "A", "input": {}}));
        });

        let transport = Arc::new(Transport::new(urls(&server), Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ProgressRegistry::load(dir.path().join("registry.json"))
                .await
                .unwrap(),
        );
        let queue = Arc::new(QueueHandle::new(2));
        let in_flight = Arc::new(InFlightIds::new());
        let shutdown = CancellationToken::new();

        let queue_clone = queue.clone();
        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(run(
            transport,
            registry.clone(),
            queue_clone,
            in_flight,
            Arc::new(|budget| budget),
            shutdown_clone,
        ));

        let current = queue.current().await;
        let job = tokio::time::timeout(Duration::from_secs(2), current.pop(&shutdown))
            .await
            .expect("timed out waiting for a fetched job")
            .expect("expected a job");
        assert_eq!(job.id, "A");
        assert_eq!(registry.count().await.unwrap(), 1);

        mock.assert_hits_at_least(1);
        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn duplicate_delivery_while_tracked_is_dropped() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/job-take");
            then.status(200)
                .json_body(serde_json::json!({"id": "A", "input": {}}));
        });

        let transport = Arc::new(Transport::new(urls(&server), Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ProgressRegistry::load(dir.path().join("registry.json"))
                .await
                .unwrap(),
        );
        let queue = Arc::new(QueueHandle::new(2));
        let in_flight = Arc::new(InFlightIds::new());
        let shutdown = CancellationToken::new();

        // Simulate "A" already being queued/in-flight from an earlier delivery.
        assert!(in_flight.try_track("A"));

        let queue_clone = queue.clone();
        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(run(
            transport,
            registry.clone(),
            queue_clone,
            in_flight,
            Arc::new(|budget| budget),
            shutdown_clone,
        ));

        // Give the fetcher a few poll cycles to (not) push the duplicate.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = queue.current().await;
        assert!(current.is_empty().await);
        assert_eq!(registry.count().await.unwrap(), 0);

        shutdown.cancel();
        let _ = task.await;
    }

    /// A saturated queue must not starve the concurrency modifier: even while
    /// `queue_size >= budget` keeps taking the early-continue branch every
    /// cycle, the modifier has to run and its resize request has to be
    /// honored as soon as the queue actually drains.
    #[tokio::test]
    async fn modifier_runs_and_eventually_resizes_while_queue_is_saturated() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/job-take");
            then.status(204);
        });

        let transport = Arc::new(Transport::new(urls(&server), Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ProgressRegistry::load(dir.path().join("registry.json"))
                .await
                .unwrap(),
        );

        let queue = Arc::new(QueueHandle::new(1));
        let shutdown = CancellationToken::new();
        queue
            .current()
            .await
            .push(
                worker_common::job::Job::new("saturating", serde_json::json!({})),
                &shutdown,
            )
            .await;

        let in_flight = Arc::new(InFlightIds::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let modifier: Arc<dyn Fn(usize) -> usize + Send + Sync> = Arc::new(move |_budget| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            3
        });

        let queue_clone = queue.clone();
        let shutdown_clone = shutdown.clone();
        let task = tokio::spawn(run(
            transport,
            registry,
            queue_clone,
            in_flight,
            modifier,
            shutdown_clone,
        ));

        // While the queue stays full, the modifier must still be invoked on
        // every cycle (the bug this test guards against: skipping it
        // entirely whenever `queue_size >= budget`).
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) > 0);
        assert_eq!(queue.current().await.capacity(), 1, "resize can't complete until the queue drains");

        // Draining the queue lets the pending resize finish.
        let popped = queue.current().await.pop(&shutdown).await.unwrap();
        assert_eq!(popped.id, "saturating");

        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if queue.current().await.capacity() == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("queue never resized after draining");

        shutdown.cancel();
        let _ = task.await;
    }
}
