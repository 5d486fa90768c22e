//! Handler Invoker (C3): polymorphic invocation of user code and uniform
//! translation of its outcome into a `JobResult`/`StreamFragment` sequence.
//!
//! The four handler shapes are selected once at construction time into a
//! tagged `HandlerFn`, so the hot path never has to introspect what kind of
//! handler it is holding — it's a single `match`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use gethostname::gethostname;
use tracing::warn;

use crate::job::{Job, JobResult, RuntimeErrorEnvelope, StreamFragment};
use crate::progress::ProgressSender;

/// What a single handler invocation (or a single yielded item of a streaming
/// handler) produced, before C3 has classified it into a `JobResult`.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub value: serde_json::Value,
}

impl HandlerOutcome {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }
}

/// The four user-handler shapes, fixed at construction. Each is handed a
/// `ProgressSender` alongside the job, so handler code can emit mid-job
/// progress messages without blocking on a fresh connection.
#[derive(Clone)]
pub enum HandlerFn {
    /// Blocks the single-threaded runtime for its duration; the documented
    /// trade-off handler authors accept when choosing this variant.
    Blocking(Arc<dyn Fn(&Job, &ProgressSender) -> HandlerOutcome + Send + Sync>),
    /// Awaited normally; yields control at its own await points.
    Async(Arc<dyn Fn(Job, ProgressSender) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>),
    /// Each `.next()` is synchronous and blocks the runtime.
    BlockingStream(
        Arc<
            dyn Fn(&Job, &ProgressSender) -> Box<dyn Iterator<Item = HandlerOutcome> + Send>
                + Send
                + Sync,
        >,
    ),
    /// Polled cooperatively via `futures::StreamExt`.
    AsyncStream(Arc<dyn Fn(Job, ProgressSender) -> BoxStream<'static, HandlerOutcome> + Send + Sync>),
}

/// Per-handler configuration: one struct, defaulted fields, built once at
/// startup and shared by every invocation.
#[derive(Clone)]
pub struct HandlerConfig {
    pub handler: HandlerFn,
    pub concurrency_modifier: Arc<dyn Fn(usize) -> usize + Send + Sync>,
    pub refresh_worker: bool,
    pub return_aggregate_stream: bool,
    pub max_output_bytes: usize,
}

/// 2 MiB: large enough for typical job outputs, small enough to bound memory.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

impl HandlerConfig {
    pub fn new(handler: HandlerFn) -> Self {
        Self {
            handler,
            concurrency_modifier: Arc::new(|budget| budget),
            refresh_worker: false,
            return_aggregate_stream: false,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// What C6 gets back from invoking a handler on one job. Non-terminal
/// fragments are handed to `on_fragment` as they're produced, not buffered
/// here, so the caller can post each one immediately.
pub struct Invocation {
    pub result: JobResult,
}

/// Invoke `config.handler` on `job`, classify its outcome, and fold in the
/// `refresh_worker` / output-size policy.
///
/// Streaming variants call `on_fragment` for each non-terminal partial so the
/// caller (C6) can post it immediately rather than buffer the whole sequence.
pub async fn invoke<F>(
    config: &HandlerConfig,
    job: Job,
    worker_id: &str,
    progress: &ProgressSender,
    mut on_fragment: F,
) -> Invocation
where
    F: FnMut(&StreamFragment),
{
    let result = match &config.handler {
        HandlerFn::Blocking(f) => invoke_blocking(f.as_ref(), &job, worker_id, progress),
        HandlerFn::Async(f) => invoke_async(f.as_ref(), job.clone(), worker_id, progress.clone()).await,
        HandlerFn::BlockingStream(f) => {
            invoke_blocking_stream(f.as_ref(), &job, worker_id, progress, config, &mut on_fragment)
        }
        HandlerFn::AsyncStream(f) => {
            invoke_async_stream(
                f.as_ref(),
                job.clone(),
                worker_id,
                progress.clone(),
                config,
                &mut on_fragment,
            )
            .await
        }
    };

    let result = apply_refresh_worker(result, config.refresh_worker);
    let result = enforce_output_size(result, config.max_output_bytes);

    Invocation { result }
}

fn invoke_blocking(
    f: &(dyn Fn(&Job, &ProgressSender) -> HandlerOutcome + Send + Sync),
    job: &Job,
    worker_id: &str,
    progress: &ProgressSender,
) -> JobResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| f(job, progress))) {
        Ok(outcome) => classify(outcome.value),
        Err(payload) => runtime_error_from_panic(payload, worker_id),
    }
}

async fn invoke_async(
    f: &(dyn Fn(Job, ProgressSender) -> BoxFuture<'static, HandlerOutcome> + Send + Sync),
    job: Job,
    worker_id: &str,
    progress: ProgressSender,
) -> JobResult {
    let future = f(job, progress);
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => classify(outcome.value),
        Err(payload) => runtime_error_from_panic(payload, worker_id),
    }
}

fn invoke_blocking_stream(
    f: &(dyn Fn(&Job, &ProgressSender) -> Box<dyn Iterator<Item = HandlerOutcome> + Send> + Send + Sync),
    job: &Job,
    worker_id: &str,
    progress: &ProgressSender,
    config: &HandlerConfig,
    on_fragment: &mut impl FnMut(&StreamFragment),
) -> JobResult {
    let mut aggregate = Vec::new();
    let produced = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut iter = f(job, progress);
        loop {
            match std::panic::catch_unwind(AssertUnwindSafe(|| iter.next())) {
                Ok(Some(outcome)) => {
                    let fragment = StreamFragment {
                        output: outcome.value.clone(),
                    };
                    on_fragment(&fragment);
                    aggregate.push(outcome.value);
                }
                Ok(None) => return Ok(()),
                Err(payload) => return Err(payload),
            }
        }
    }));

    match produced {
        Ok(Ok(())) => terminal_for_stream(aggregate, config),
        Ok(Err(payload)) | Err(payload) => runtime_error_from_panic(payload, worker_id),
    }
}

async fn invoke_async_stream(
    f: &(dyn Fn(Job, ProgressSender) -> BoxStream<'static, HandlerOutcome> + Send + Sync),
    job: Job,
    worker_id: &str,
    progress: ProgressSender,
    config: &HandlerConfig,
    on_fragment: &mut impl FnMut(&StreamFragment),
) -> JobResult {
    let mut stream = f(job, progress);
    let mut aggregate = Vec::new();

    loop {
        let next = AssertUnwindSafe(stream.next()).catch_unwind().await;
        match next {
            Ok(Some(outcome)) => {
                let fragment = StreamFragment {
                    output: outcome.value.clone(),
                };
                on_fragment(&fragment);
                aggregate.push(outcome.value);
            }
            Ok(None) => return terminal_for_stream(aggregate, config),
            Err(payload) => return runtime_error_from_panic(payload, worker_id),
        }
    }
}

fn terminal_for_stream(aggregate: Vec<serde_json::Value>, config: &HandlerConfig) -> JobResult {
    let output = if config.return_aggregate_stream {
        serde_json::Value::Array(aggregate)
    } else {
        serde_json::Value::Null
    };
    JobResult::Success {
        output,
        refresh_worker: false,
    }
}

/// Classify a returned JSON value: `{"error": ...}` wins over a simultaneous
/// `output` key; `refresh_worker: true` is read out regardless of which
/// branch is taken.
fn classify(value: serde_json::Value) -> JobResult {
    let refresh_worker = value
        .get("refresh_worker")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    if let Some(error) = value.get("error") {
        let message = match error {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return JobResult::UserError {
            message,
            refresh_worker,
        };
    }

    let output = value.get("output").cloned().unwrap_or(value);
    JobResult::Success {
        output,
        refresh_worker,
    }
}

fn apply_refresh_worker(result: JobResult, configured: bool) -> JobResult {
    if !configured {
        return result;
    }
    match result {
        JobResult::Success { output, .. } => JobResult::Success {
            output,
            refresh_worker: true,
        },
        JobResult::UserError { message, .. } => JobResult::UserError {
            message,
            refresh_worker: true,
        },
        JobResult::RuntimeError { envelope, .. } => JobResult::RuntimeError {
            envelope,
            refresh_worker: true,
        },
    }
}

fn enforce_output_size(result: JobResult, max_output_bytes: usize) -> JobResult {
    let JobResult::Success {
        output,
        refresh_worker,
    } = &result
    else {
        return result;
    };

    let size = serde_json::to_vec(output).map(|bytes| bytes.len()).unwrap_or(0);
    if size <= max_output_bytes {
        return result;
    }

    warn!(size, max_output_bytes, "handler output exceeded size limit");
    JobResult::UserError {
        message: format!(
            "handler output of {size} bytes exceeds the {max_output_bytes}-byte limit"
        ),
        refresh_worker: *refresh_worker,
    }
}

fn runtime_error_from_panic(
    payload: Box<dyn std::any::Any + Send>,
    worker_id: &str,
) -> JobResult {
    let message = panic_message(&payload);
    let envelope = RuntimeErrorEnvelope {
        error_type: "HandlerRuntimeError".to_string(),
        error_message: message,
        error_traceback: std::backtrace::Backtrace::force_capture().to_string(),
        hostname: gethostname().to_string_lossy().into_owned(),
        worker_id: worker_id.to_string(),
        runpod_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    JobResult::RuntimeError {
        envelope,
        refresh_worker: false,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

/// A boxed future alias kept for handler authors constructing `HandlerFn::Async`
/// without pulling in `futures::future::BoxFuture` directly.
pub type PinnedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
