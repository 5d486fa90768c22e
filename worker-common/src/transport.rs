//! HTTP Transport (C2): one shared connection pool, acquisition GET, result/stream
//! POST, and heartbeat GET, all built around a single `reqwest::Client` constructed
//! once and reused for the life of the process.

use std::time::Duration;

use reqwest::header;
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::job::{AcquiredJobs, Job, JobResult, ProgressUpdate, StreamFragment};
use crate::retry::FibonacciBackoff;

const ACQUIRE_DEADLINE: Duration = Duration::from_secs(90);
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

/// The four control-plane endpoints this worker talks to.
#[derive(Debug, Clone)]
pub struct TransportUrls {
    pub acquire: Url,
    pub post_output: Url,
    pub post_stream: Url,
    pub ping: Url,
}

/// Outcome of a single acquisition GET.
#[derive(Debug)]
pub enum AcquireOutcome {
    Jobs(Vec<Job>),
    /// 204 or 400 ("fast-boot enabled, no backlog"): not an error.
    Empty,
    /// 429: caller must back off `RATE_LIMIT_BACKOFF` before retrying.
    RateLimited,
}

/// Shared HTTP transport. One `reqwest::Client` connection pool for the whole
/// worker process; no per-request clients.
pub struct Transport {
    client: reqwest::Client,
    urls: TransportUrls,
    backoff: FibonacciBackoff,
}

impl Transport {
    pub fn new(urls: TransportUrls, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("serverless-worker/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for worker transport");

        Self {
            client,
            urls,
            backoff: FibonacciBackoff::new(),
        }
    }

    /// Acquisition GET: `job_in_progress` flags whether the worker already holds
    /// in-progress jobs; `batch_size` requests a batch when > 1.
    pub async fn acquire(
        &self,
        job_in_progress: bool,
        batch_size: usize,
    ) -> Result<AcquireOutcome, TransportError> {
        let mut request = self
            .client
            .get(self.urls.acquire.clone())
            .timeout(ACQUIRE_DEADLINE)
            .query(&[("job_in_progress", if job_in_progress { "1" } else { "0" })]);

        if batch_size > 1 {
            request = request.query(&[("batch_size", batch_size.to_string())]);
        }

        let response = request.send().await.map_err(classify_send_error)?;

        match response.status() {
            status if status == reqwest::StatusCode::OK => {
                let body: AcquiredJobs = response.json().await.map_err(TransportError::Decode)?;
                Ok(AcquireOutcome::Jobs(body.into_vec()))
            }
            status if status == reqwest::StatusCode::NO_CONTENT => Ok(AcquireOutcome::Empty),
            status if status == reqwest::StatusCode::BAD_REQUEST => {
                debug!("acquisition returned 400, treating as fast-boot/no backlog");
                Ok(AcquireOutcome::Empty)
            }
            status if status == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                Ok(AcquireOutcome::RateLimited)
            }
            status if status.is_server_error() => {
                Err(TransportError::Transient(
                    response.error_for_status().unwrap_err(),
                ))
            }
            _ => Err(TransportError::Transient(
                response.error_for_status().unwrap_err(),
            )),
        }
    }

    /// How long the fetcher should sleep after an `AcquireOutcome::RateLimited`.
    pub fn rate_limit_backoff(&self) -> Duration {
        RATE_LIMIT_BACKOFF
    }

    /// Result POST: an initial send plus up to 3 retries (4 sends total),
    /// Fibonacci delays (1s, 1s, 2s) between consecutive sends. Failure after
    /// exhaustion is logged and swallowed — at-least-once delivery is
    /// preserved by the caller removing the job from the registry regardless.
    pub async fn post_result(&self, job_id: &str, result: &JobResult) {
        let body = result.to_body();
        let is_stream = "false";

        for attempt in 0..FibonacciBackoff::MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }

            match self.post_json_form(&self.urls.post_output, job_id, is_stream, &body).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        job_id,
                        attempt = attempt + 1,
                        error = %err,
                        "result POST failed"
                    );
                }
            }
        }

        warn!(
            job_id,
            "result POST exhausted all retries; dropping, control plane will re-dispatch"
        );
    }

    /// Stream POST: a single transport-level attempt; failures are
    /// logged only, never retried, and never remove the job from the registry.
    pub async fn post_stream(&self, job_id: &str, fragment: &StreamFragment) {
        let body = fragment.to_body();
        if let Err(err) = self
            .post_json_form(&self.urls.post_stream, job_id, "true", &body)
            .await
        {
            warn!(job_id, error = %err, "stream POST failed");
        }
    }

    /// Progress POST: a single transport-level attempt, multiplexed over the
    /// same stream endpoint as fragment POSTs since no dedicated progress URL
    /// is part of the wire contract. Failures are logged only; the update is
    /// already out-of-band and best-effort by the time it reaches here.
    pub async fn post_progress(&self, update: &ProgressUpdate) {
        let body = serde_json::json!({ "output": update.payload });
        if let Err(err) = self
            .post_json_form(&self.urls.post_stream, &update.job_id, "true", &body)
            .await
        {
            warn!(job_id = %update.job_id, error = %err, "progress POST failed");
        }
    }

    async fn post_json_form(
        &self,
        url: &Url,
        job_id: &str,
        is_stream: &str,
        body: &serde_json::Value,
    ) -> Result<(), TransportError> {
        // The payload is a JSON document but declared `application/x-www-form-urlencoded`,
        // matching what the control plane expects on the wire.
        let payload = serde_json::to_vec(body).expect("JobResult body is always serializable");

        let response = self
            .client
            .post(url.clone())
            .query(&[("id", job_id), ("isStream", is_stream)])
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await
            .map_err(classify_send_error)?;

        response
            .error_for_status()
            .map(|_| ())
            .map_err(TransportError::Transient)
    }

    /// Heartbeat GET: `job_id=<csv>`, `retry_ping=1` if the previous
    /// tick failed. Timeout is 2x the configured ping interval.
    pub async fn ping(
        &self,
        job_ids: &[String],
        retry_ping: bool,
        interval: Duration,
    ) -> Result<(), TransportError> {
        let csv = job_ids.join(",");
        let mut request = self
            .client
            .get(self.urls.ping.clone())
            .timeout(interval * 2)
            .query(&[("job_id", csv.as_str())]);

        if retry_ping {
            request = request.query(&[("retry_ping", "1")]);
        }

        let response = request.send().await.map_err(classify_send_error)?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(TransportError::Transient)
    }
}

fn classify_send_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(error)
    }
}
