//! Entry point for the serverless worker runtime: parses the core CLI flags,
//! loads configuration from the environment, wires up the metrics/health
//! router, and hands off to the `JobScaler`.

use std::process::ExitCode;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use envconfig::Envconfig;
use std::future::ready;

use worker::config::Config;
use worker::scaler::JobScaler;
use worker_common::handler::{HandlerConfig, HandlerFn, HandlerOutcome};
use worker_common::health::HealthRegistry;
use worker_common::job::Job;
use worker_common::metrics::setup_metrics_router;
use worker_common::progress::{ProgressChannel, ProgressSender};
use worker_common::transport::TransportUrls;

/// Core-relevant flags; the full CLI (GraphQL wrapper, S3 helpers,
/// the local dev server) is out of scope and not modeled here.
#[derive(Parser, Debug)]
#[command(version, about = "serverless worker runtime")]
struct Cli {
    /// Overrides RUNPOD_DEBUG_LEVEL for this process.
    #[arg(long)]
    rp_log_level: Option<String>,

    /// Enables a remote debugger attach point; recognized, not implemented.
    #[arg(long, default_value_t = false)]
    rp_debugger: bool,

    /// Runs the handler once against a synthesized job and exits, bypassing
    /// fitness checks and the acquisition loop entirely.
    #[arg(long)]
    test_input: Option<String>,

    /// Local API dev-serving mode; out of core scope in this crate.
    #[arg(long, default_value_t = false)]
    rp_serve_api: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let log_level = cli.rp_log_level.as_deref().unwrap_or(&config.debug_level);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(translate_log_level(log_level)))
        .init();

    if cli.rp_serve_api {
        eprintln!("--rp_serve_api (local dev serving mode) is not supported by this worker");
        return ExitCode::FAILURE;
    }

    // Placeholder echo handler: a real deployment supplies its own
    // `HandlerConfig` with a user-authored `HandlerFn`. Kept here only so
    // `--test_input` and the scaler have something concrete to invoke.
    let mut handler_config = HandlerConfig::new(HandlerFn::Blocking(Arc::new(
        |job: &Job, _progress: &ProgressSender| HandlerOutcome::new(job.input.clone()),
    )));
    handler_config.max_output_bytes = config.max_output_bytes;
    let handler_config = Arc::new(handler_config);

    if let Some(test_input) = cli.test_input {
        return run_test_input(&handler_config, &test_input, &config).await;
    }

    let transport_urls = match build_transport_urls(&config) {
        Ok(urls) => urls,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let liveness = HealthRegistry::new("liveness");

    let scaler = JobScaler::new(
        config.registry_path.clone().into(),
        transport_urls,
        config.request_timeout.0,
        config.ping_interval(),
        config.max_concurrency,
        config.worker_id().to_string(),
        config.progress_channel_capacity,
        Vec::new(),
    );

    let router = Router::new()
        .route("/_readiness", get(|| ready("ok")))
        .route("/_liveness", {
            let liveness = liveness.clone();
            get(move || ready(liveness.get_status()))
        });
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();

    tokio::task::spawn(async move {
        worker_common::metrics::serve(router, &bind)
            .await
            .expect("failed to start serving metrics/health endpoints");
    });

    match scaler.run(handler_config, liveness).await {
        Ok(refresh_requested) => {
            if refresh_requested {
                tracing::info!("worker exiting for a requested refresh");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "worker exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_test_input(handler_config: &HandlerConfig, test_input: &str, config: &Config) -> ExitCode {
    let input: serde_json::Value = match serde_json::from_str(test_input) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("--test_input is not valid JSON: {err}");
            return ExitCode::FAILURE;
        }
    };

    let job = Job::new("local-test", input);
    let progress = ProgressSender::new(ProgressChannel::new(config.progress_channel_capacity));
    let invocation = worker_common::handler::invoke(
        handler_config,
        job,
        config.worker_id(),
        &progress,
        |_fragment| {},
    )
    .await;

    match invocation.result {
        worker_common::job::JobResult::Success { output, .. } => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        worker_common::job::JobResult::UserError { message, .. } => {
            eprintln!("handler error: {message}");
            ExitCode::FAILURE
        }
        worker_common::job::JobResult::RuntimeError { envelope, .. } => {
            eprintln!("handler panicked: {}", envelope.error_message);
            ExitCode::FAILURE
        }
    }
}

fn build_transport_urls(config: &Config) -> Result<TransportUrls, String> {
    Ok(TransportUrls {
        acquire: config
            .webhook_get_job
            .parse()
            .map_err(|e| format!("RUNPOD_WEBHOOK_GET_JOB: {e}"))?,
        post_output: config
            .webhook_post_output
            .parse()
            .map_err(|e| format!("RUNPOD_WEBHOOK_POST_OUTPUT: {e}"))?,
        post_stream: config
            .webhook_post_stream
            .parse()
            .map_err(|e| format!("RUNPOD_WEBHOOK_POST_STREAM: {e}"))?,
        ping: config
            .webhook_ping
            .parse()
            .map_err(|e| format!("RUNPOD_WEBHOOK_PING: {e}"))?,
    })
}

/// Maps the RunPod-style debug level onto a `tracing_subscriber::EnvFilter` directive.
fn translate_log_level(level: &str) -> &str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}
