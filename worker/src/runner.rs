//! Job Runner (C6): pops jobs off the queue, dispatches each as a concurrent
//! task capped by the current budget, invokes the handler, posts the result,
//! and updates the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use worker_common::handler::{invoke, HandlerConfig};
use worker_common::job::StreamFragment;
use worker_common::progress::ProgressSender;
use worker_common::registry::ProgressRegistry;
use worker_common::transport::Transport;

use crate::inflight::InFlightIds;
use crate::queue::QueueHandle;

/// Set once a handler invocation returns `refresh_worker: true` (or the
/// handler config has it configured). The runner also cancels `shutdown`
/// itself at that point, so a refresh request drains and exits promptly
/// rather than waiting for an unrelated external signal.
pub struct RunnerOutcome {
    pub refresh_requested: Arc<AtomicBool>,
}

/// Runs until shutdown is signalled *and* the queue is empty *and* no tasks
/// remain in flight.
pub async fn run(
    transport: Arc<Transport>,
    registry: Arc<ProgressRegistry>,
    queue: Arc<QueueHandle>,
    in_flight: Arc<InFlightIds>,
    handler_config: Arc<HandlerConfig>,
    worker_id: String,
    progress: ProgressSender,
    shutdown: CancellationToken,
) -> RunnerOutcome {
    let refresh_requested = Arc::new(AtomicBool::new(false));
    let mut tasks = FuturesUnordered::new();
    let mut capacity = queue.current().await.capacity();
    let mut semaphore = Arc::new(Semaphore::new(capacity));

    loop {
        let current_queue = queue.current().await;
        let current_capacity = current_queue.capacity();
        if current_capacity != capacity {
            capacity = current_capacity;
            semaphore = Arc::new(Semaphore::new(capacity));
        }

        metrics::gauge!("serverless_worker_saturation_percent")
            .set(1f64 - semaphore.available_permits() as f64 / capacity as f64);

        if shutdown.is_cancelled() && current_queue.is_empty().await && tasks.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            maybe_job = current_queue.pop(&shutdown) => {
                if let Some(job) = maybe_job {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    metrics::counter!("serverless_worker_jobs_total").increment(1);
                    let transport = transport.clone();
                    let registry = registry.clone();
                    let in_flight = in_flight.clone();
                    let handler_config = handler_config.clone();
                    let worker_id = worker_id.clone();
                    let progress = progress.clone();
                    let refresh_requested = refresh_requested.clone();
                    let shutdown = shutdown.clone();

                    tasks.push(tokio::spawn(async move {
                        let _permit = permit;
                        process_job(
                            transport,
                            registry,
                            in_flight,
                            handler_config,
                            worker_id,
                            progress,
                            refresh_requested,
                            shutdown,
                            job,
                        )
                        .await;
                    }));
                }
            }

            Some(result) = tasks.next(), if !tasks.is_empty() => {
                if let Err(err) = result {
                    warn!(error = %err, "job-processing task panicked");
                }
            }
        }
    }

    RunnerOutcome { refresh_requested }
}

/// Drains fragments off `rx` in receive order, posting each one in turn over
/// `transport`. A single consumer task guarantees fragment N's POST is sent
/// (and completed) before fragment N+1's, without the handler's own
/// invocation having to await anything.
async fn drain_fragments(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<StreamFragment>,
    transport: Arc<Transport>,
    job_id: String,
) {
    while let Some(fragment) = rx.recv().await {
        transport.post_stream(&job_id, &fragment).await;
    }
}

async fn process_job(
    transport: Arc<Transport>,
    registry: Arc<ProgressRegistry>,
    in_flight: Arc<InFlightIds>,
    handler_config: Arc<HandlerConfig>,
    worker_id: String,
    progress: ProgressSender,
    refresh_requested: Arc<AtomicBool>,
    shutdown: CancellationToken,
    job: worker_common::job::Job,
) {
    let job_id = job.id.clone();

    // Fragments are sent (synchronously, never blocking the handler) into this
    // channel and posted by a single dedicated task in strict receive order;
    // the terminal result is only posted once that task has drained and
    // exited, which only happens after every fragment's POST has completed.
    let (fragment_tx, fragment_rx) = tokio::sync::mpsc::unbounded_channel::<StreamFragment>();
    let stream_task = tokio::spawn(drain_fragments(
        fragment_rx,
        transport.clone(),
        job_id.clone(),
    ));

    let started = tokio::time::Instant::now();
    let invocation = invoke(&handler_config, job, &worker_id, &progress, move |fragment: &StreamFragment| {
        // The receiver only closes if `drain_fragments` panicked; dropping a
        // fragment in that case is the best this side can do.
        let _ = fragment_tx.send(fragment.clone());
    })
    .await;
    let elapsed = started.elapsed().as_secs_f64();

    if let Err(err) = stream_task.await {
        warn!(job_id = %job_id, error = %err, "stream-fragment posting task panicked");
    }

    let outcome_label = match &invocation.result {
        worker_common::job::JobResult::Success { .. } => "success",
        worker_common::job::JobResult::UserError { .. } => "user_error",
        worker_common::job::JobResult::RuntimeError { .. } => "runtime_error",
    };
    let labels = [("outcome", outcome_label)];
    metrics::counter!("serverless_worker_jobs_completed", &labels).increment(1);
    metrics::histogram!("serverless_worker_job_duration_seconds", &labels).record(elapsed);

    if invocation.result.refresh_worker() {
        refresh_requested.store(true, Ordering::Relaxed);
        shutdown.cancel();
    }

    transport.post_result(&job_id, &invocation.result).await;

    if let Err(err) = registry.remove(&job_id).await {
        warn!(job_id = %job_id, error = %err, "failed to remove completed job from registry");
    }

    in_flight.release(&job_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use worker_common::handler::{HandlerFn, HandlerOutcome};
    use worker_common::job::Job;
    use worker_common::progress::ProgressChannel;
    use worker_common::transport::TransportUrls;

    fn urls(server: &MockServer) -> TransportUrls {
        TransportUrls {
            acquire: server.url("/job-take").parse().unwrap(),
            post_output: server.url("/job-done").parse().unwrap(),
            post_stream: server.url("/job-stream").parse().unwrap(),
            ping: server.url("/ping").parse().unwrap(),
        }
    }

    fn progress() -> ProgressSender {
        ProgressSender::new(ProgressChannel::new(16))
    }

    #[tokio::test]
    async fn single_job_runs_and_registry_ends_empty() {
        let server = MockServer::start();
        let result_mock = server.mock(|when, then| {
            when.method(POST).path("/job-done");
            then.status(200);
        });

        let transport = Arc::new(Transport::new(urls(&server), std::time::Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ProgressRegistry::load(dir.path().join("registry.json"))
                .await
                .unwrap(),
        );
        registry.add("A").await.unwrap();

        let queue = Arc::new(QueueHandle::new(2));
        queue
            .current()
            .await
            .push(Job::new("A", serde_json::json!({"x": 21})), &CancellationToken::new())
            .await;

        let in_flight = Arc::new(InFlightIds::new());
        in_flight.try_track("A");

        let handler = HandlerFn::Blocking(Arc::new(|job: &Job, _progress: &ProgressSender| {
            HandlerOutcome::new(serde_json::json!({"output": job.input["x"].as_i64().unwrap() * 2}))
        }));
        let handler_config = Arc::new(HandlerConfig::new(handler));

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = run(
            transport,
            registry.clone(),
            queue,
            in_flight.clone(),
            handler_config,
            "w-1".to_string(),
            progress(),
            shutdown,
        )
        .await;

        result_mock.assert();
        assert!(!outcome.refresh_requested.load(Ordering::Relaxed));
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_worker_result_cancels_shutdown() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/job-done");
            then.status(200);
        });

        let transport = Arc::new(Transport::new(urls(&server), std::time::Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ProgressRegistry::load(dir.path().join("registry.json"))
                .await
                .unwrap(),
        );
        registry.add("A").await.unwrap();

        let queue = Arc::new(QueueHandle::new(2));
        queue
            .current()
            .await
            .push(Job::new("A", serde_json::json!({})), &CancellationToken::new())
            .await;

        let in_flight = Arc::new(InFlightIds::new());
        in_flight.try_track("A");

        let handler = HandlerFn::Blocking(Arc::new(|_job: &Job, _progress: &ProgressSender| {
            HandlerOutcome::new(serde_json::json!({"output": 1, "refresh_worker": true}))
        }));
        let handler_config = Arc::new(HandlerConfig::new(handler));

        // Never externally cancelled: only the handler's refresh_worker flag
        // should bring the runner loop to a halt.
        let shutdown = CancellationToken::new();

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            run(
                transport,
                registry,
                queue,
                in_flight,
                handler_config,
                "w-1".to_string(),
                progress(),
                shutdown.clone(),
            ),
        )
        .await
        .expect("runner did not exit after a refresh-requesting result");

        assert!(outcome.refresh_requested.load(Ordering::Relaxed));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn stream_fragments_all_post_before_terminal_result() {
        let server = MockServer::start();
        let stream_mock = server.mock(|when, then| {
            when.method(POST).path("/job-stream");
            then.status(200);
        });
        let result_mock = server.mock(|when, then| {
            when.method(POST).path("/job-done");
            then.status(200);
        });

        let transport = Arc::new(Transport::new(urls(&server), std::time::Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            ProgressRegistry::load(dir.path().join("registry.json"))
                .await
                .unwrap(),
        );
        registry.add("D").await.unwrap();

        let queue = Arc::new(QueueHandle::new(2));
        queue
            .current()
            .await
            .push(Job::new("D", serde_json::json!({})), &CancellationToken::new())
            .await;

        let in_flight = Arc::new(InFlightIds::new());
        in_flight.try_track("D");

        let handler = HandlerFn::BlockingStream(Arc::new(|_job: &Job, _progress: &ProgressSender| {
            let items: Vec<HandlerOutcome> = ["a", "b", "c"]
                .iter()
                .map(|s| HandlerOutcome::new(serde_json::json!(s)))
                .collect();
            Box::new(items.into_iter()) as Box<dyn Iterator<Item = HandlerOutcome> + Send>
        }));
        let handler_config = Arc::new(HandlerConfig::new(handler));

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = run(
            transport,
            registry.clone(),
            queue,
            in_flight,
            handler_config,
            "w-1".to_string(),
            progress(),
            shutdown,
        )
        .await;

        // `run()` only returns once `process_job`'s task completes, which now
        // awaits the fragment-draining task before posting the terminal
        // result — so by the time we get here, every fragment POST the
        // handler produced must already have landed.
        stream_mock.assert_hits(3);
        result_mock.assert_hits(1);
        assert!(!outcome.refresh_requested.load(Ordering::Relaxed));
        assert_eq!(registry.count().await.unwrap(), 0);
    }
}
