//! Heartbeat (C4): a dedicated OS thread with its own `current_thread` Tokio
//! runtime, so a stalled blocking handler on the main runtime never starves
//! liveness pings. Grounded on the lifecycle manager's monitor-thread
//! pattern: spawn a thread, build a minimal runtime on it, block on a future
//! that loops until the shared cancellation token fires.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use time::Duration as TimeDuration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use worker_common::health::HealthHandle;
use worker_common::registry::ProgressRegistry;
use worker_common::transport::Transport;

pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawns the dedicated heartbeat thread and returns immediately; the
    /// thread runs until `shutdown` is cancelled.
    pub fn spawn(
        registry_path: PathBuf,
        transport: Arc<Transport>,
        interval: Duration,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build heartbeat thread runtime");
                runtime.block_on(run(registry_path, transport, interval, liveness, shutdown));
            })
            .expect("failed to spawn heartbeat thread");

        Self { handle }
    }

    /// Blocks the calling thread until the heartbeat thread has exited.
    /// Called by C7 during shutdown, after the shared token is cancelled.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("heartbeat thread panicked");
        }
    }
}

async fn run(
    registry_path: PathBuf,
    transport: Arc<Transport>,
    interval: Duration,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    let mut retry_ping = false;

    while !shutdown.is_cancelled() {
        // Reopened fresh every tick: the heartbeat thread must never depend
        // on the main runtime's in-memory registry state.
        let registry = match ProgressRegistry::load(&registry_path).await {
            Ok(registry) => registry,
            Err(err) => {
                warn!(error = %err, "heartbeat failed to open progress registry");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => continue,
                }
            }
        };

        let ids = registry.snapshot().await.unwrap_or_default();

        match transport.ping(&ids, retry_ping, interval).await {
            Ok(()) => {
                retry_ping = false;
                liveness.report_healthy().await;
            }
            Err(err) => {
                warn!(error = %err, "heartbeat ping failed");
                retry_ping = true;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Converts a `std::time::Duration` ping interval into the `time::Duration`
/// the health registry's deadline API expects.
pub fn liveness_deadline(interval: Duration) -> TimeDuration {
    TimeDuration::seconds((interval.as_secs() as i64) * 3)
}
