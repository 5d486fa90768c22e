//! The Job/JobResult/StreamFragment/ProgressUpdate data model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of work handed out by the control plane's acquisition endpoint.
///
/// Two `Job`s are equal iff their identifiers match, regardless of input.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub id: String,
    #[serde(default = "serde_json::Value::default")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            input,
            webhook: None,
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {}", self.id)
    }
}

/// The acquisition endpoint may hand back either a single `Job` or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AcquiredJobs {
    One(Job),
    Many(Vec<Job>),
}

impl AcquiredJobs {
    pub fn into_vec(self) -> Vec<Job> {
        match self {
            AcquiredJobs::One(job) => vec![job],
            AcquiredJobs::Many(jobs) => jobs,
        }
    }
}

/// The runtime-error envelope carried inside a `JobResult::RuntimeError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeErrorEnvelope {
    pub error_type: String,
    pub error_message: String,
    pub error_traceback: String,
    pub hostname: String,
    pub worker_id: String,
    pub runpod_version: String,
}

/// The terminal outcome of a job: exactly one of these is ever posted per job.
#[derive(Debug, Clone)]
pub enum JobResult {
    Success {
        output: serde_json::Value,
        refresh_worker: bool,
    },
    UserError {
        message: String,
        refresh_worker: bool,
    },
    RuntimeError {
        envelope: RuntimeErrorEnvelope,
        refresh_worker: bool,
    },
}

impl JobResult {
    pub fn refresh_worker(&self) -> bool {
        match self {
            JobResult::Success { refresh_worker, .. }
            | JobResult::UserError { refresh_worker, .. }
            | JobResult::RuntimeError { refresh_worker, .. } => *refresh_worker,
        }
    }

    /// The JSON body posted to the result endpoint: `{"output": ...}` or `{"error": ...}`.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            JobResult::Success { output, .. } => serde_json::json!({ "output": output }),
            JobResult::UserError { message, .. } => serde_json::json!({ "error": message }),
            JobResult::RuntimeError { envelope, .. } => {
                serde_json::json!({ "error": envelope })
            }
        }
    }
}

/// A non-terminal partial emitted by a streaming handler; posted to the stream
/// endpoint and never removes the job from the registry.
#[derive(Debug, Clone, Serialize)]
pub struct StreamFragment {
    pub output: serde_json::Value,
}

impl StreamFragment {
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({ "output": self.output })
    }
}

/// A best-effort, out-of-band message emitted from within a handler via the
/// progress-update channel (C8). Unrelated to the terminal result.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_compare_by_id_only() {
        let a = Job::new("abc", serde_json::json!({"x": 1}));
        let b = Job::new("abc", serde_json::json!({"x": 2}));
        let c = Job::new("xyz", serde_json::json!({"x": 1}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn acquired_jobs_single_object() {
        let parsed: AcquiredJobs =
            serde_json::from_value(serde_json::json!({"id": "A", "input": {"x": 21}})).unwrap();
        let jobs = parsed.into_vec();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "A");
    }

    #[test]
    fn acquired_jobs_array() {
        let parsed: AcquiredJobs = serde_json::from_value(serde_json::json!([
            {"id": "A", "input": {}},
            {"id": "B", "input": {}},
        ]))
        .unwrap();
        let jobs = parsed.into_vec();
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn success_result_body() {
        let result = JobResult::Success {
            output: serde_json::json!(42),
            refresh_worker: false,
        };
        assert_eq!(result.to_body(), serde_json::json!({"output": 42}));
    }

    #[test]
    fn user_error_result_body() {
        let result = JobResult::UserError {
            message: "bad input".to_string(),
            refresh_worker: false,
        };
        assert_eq!(
            result.to_body(),
            serde_json::json!({"error": "bad input"})
        );
    }
}
