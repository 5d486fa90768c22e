//! JobScaler (C7): the orchestrator. Owns the shutdown token, the queue, and
//! the concurrency budget; runs startup fitness checks, loads the registry,
//! starts the heartbeat thread and the progress-update drain task, installs
//! signal handlers, then runs C5 and C6 concurrently until a graceful drain
//! completes.
//!
//! Grounded on the lifecycle manager's `Manager`/monitor-loop shutdown
//! coordination: a shared cancellation token flips once, every loop observes
//! it cooperatively, and shutdown waits for in-flight work rather than
//! aborting it.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use worker_common::handler::HandlerConfig;
use worker_common::health::HealthRegistry;
use worker_common::progress::{ProgressChannel, ProgressSender};
use worker_common::registry::ProgressRegistry;
use worker_common::transport::{Transport, TransportUrls};

use crate::fitness::FitnessCheck;
use crate::heartbeat::{liveness_deadline, Heartbeat};
use crate::inflight::InFlightIds;
use crate::queue::QueueHandle;
use crate::{fetcher, runner};

pub struct JobScaler {
    registry_path: PathBuf,
    transport_urls: TransportUrls,
    request_timeout: Duration,
    ping_interval: Duration,
    initial_concurrency: usize,
    worker_id: String,
    progress_channel_capacity: usize,
    fitness_checks: Vec<Box<dyn FitnessCheck>>,
}

impl JobScaler {
    pub fn new(
        registry_path: PathBuf,
        transport_urls: TransportUrls,
        request_timeout: Duration,
        ping_interval: Duration,
        initial_concurrency: usize,
        worker_id: String,
        progress_channel_capacity: usize,
        fitness_checks: Vec<Box<dyn FitnessCheck>>,
    ) -> Self {
        Self {
            registry_path,
            transport_urls,
            request_timeout,
            ping_interval,
            initial_concurrency,
            worker_id,
            progress_channel_capacity,
            fitness_checks,
        }
    }

    /// Runs the worker to completion: fitness checks, startup, the C5/C6
    /// loops, and a graceful drain on shutdown. Returns `Ok(true)` if the
    /// handler requested a refresh and the process should exit so an
    /// orchestrator can replace it.
    pub async fn run(self, handler_config: Arc<HandlerConfig>, liveness: HealthRegistry) -> Result<bool, crate::error::WorkerError> {
        if let Err((name, reason)) = crate::fitness::run_all(&self.fitness_checks).await {
            return Err(crate::error::WorkerError::FitnessCheckFailed { name, reason });
        }

        let registry = Arc::new(ProgressRegistry::load(&self.registry_path).await?);
        let transport = Arc::new(Transport::new(self.transport_urls.clone(), self.request_timeout));
        let queue = Arc::new(QueueHandle::new(self.initial_concurrency));
        let in_flight = Arc::new(InFlightIds::new());
        let shutdown = CancellationToken::new();

        let progress_channel = ProgressChannel::new(self.progress_channel_capacity);
        let progress_sender = ProgressSender::new(progress_channel.clone());
        let progress_task = tokio::spawn(run_progress_drain(
            progress_channel,
            transport.clone(),
            shutdown.clone(),
        ));

        let heartbeat_liveness = liveness
            .register("heartbeat".to_string(), liveness_deadline(self.ping_interval))
            .await;
        let heartbeat = Heartbeat::spawn(
            self.registry_path.clone(),
            transport.clone(),
            self.ping_interval,
            heartbeat_liveness,
            shutdown.clone(),
        );

        install_signal_handlers(shutdown.clone());

        let fetcher_liveness = liveness
            .register("fetcher".to_string(), time::Duration::seconds(30))
            .await;
        let runner_liveness = liveness
            .register("runner".to_string(), time::Duration::seconds(30))
            .await;

        let fetcher_task = tokio::spawn(run_fetcher_with_liveness(
            transport.clone(),
            registry.clone(),
            queue.clone(),
            in_flight.clone(),
            handler_config.concurrency_modifier.clone(),
            shutdown.clone(),
            fetcher_liveness,
        ));

        let runner_outcome = run_runner_with_liveness(
            transport,
            registry,
            queue,
            in_flight,
            handler_config.clone(),
            self.worker_id,
            progress_sender,
            shutdown.clone(),
            runner_liveness,
        )
        .await;

        shutdown.cancel();
        if let Err(err) = fetcher_task.await {
            error!(error = %err, "fetcher task panicked");
        }
        if let Err(err) = progress_task.await {
            error!(error = %err, "progress drain task panicked");
        }

        if tokio::task::spawn_blocking(move || heartbeat.join())
            .await
            .is_err()
        {
            error!("heartbeat join task panicked");
        }

        let refresh_requested = runner_outcome.refresh_requested.load(Ordering::Relaxed)
            || handler_config.refresh_worker;

        info!(refresh_requested, "job scaler shut down cleanly");
        Ok(refresh_requested)
    }
}

async fn run_fetcher_with_liveness(
    transport: Arc<Transport>,
    registry: Arc<ProgressRegistry>,
    queue: Arc<QueueHandle>,
    in_flight: Arc<InFlightIds>,
    concurrency_modifier: Arc<dyn Fn(usize) -> usize + Send + Sync>,
    shutdown: CancellationToken,
    liveness: worker_common::health::HealthHandle,
) {
    liveness.report_healthy().await;
    fetcher::run(transport, registry, queue, in_flight, concurrency_modifier, shutdown).await;
}

async fn run_runner_with_liveness(
    transport: Arc<Transport>,
    registry: Arc<ProgressRegistry>,
    queue: Arc<QueueHandle>,
    in_flight: Arc<InFlightIds>,
    handler_config: Arc<HandlerConfig>,
    worker_id: String,
    progress: ProgressSender,
    shutdown: CancellationToken,
    liveness: worker_common::health::HealthHandle,
) -> runner::RunnerOutcome {
    liveness.report_healthy().await;
    runner::run(
        transport,
        registry,
        queue,
        in_flight,
        handler_config,
        worker_id,
        progress,
        shutdown,
    )
    .await
}

/// Drains the Progress Update channel, posting each update over the shared
/// connection pool. Runs until shutdown fires and the channel is empty.
async fn run_progress_drain(
    channel: Arc<ProgressChannel>,
    transport: Arc<Transport>,
    shutdown: CancellationToken,
) {
    while let Some(update) = channel.recv(&shutdown).await {
        transport.post_progress(&update).await;
    }
}

/// Installs SIGINT/SIGTERM handlers that cancel the shared shutdown token.
fn install_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
        shutdown.cancel();
    });
}
