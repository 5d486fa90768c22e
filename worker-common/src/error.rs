use thiserror::Error;

/// Errors surfaced by the progress registry (C1): persistence failed, so the
/// in-memory set must not be considered mutated.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to acquire advisory lock on {path}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read registry file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse registry file {path} as a JSON array of job ids")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to durably write registry file {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a single HTTP Transport (C2) call.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited by the control plane")]
    RateLimited,
    #[error("control plane returned a transient error: {0}")]
    Transient(#[source] reqwest::Error),
    #[error("failed to build or send request")]
    Request(#[source] reqwest::Error),
    #[error("failed to parse response body")]
    Decode(#[source] reqwest::Error),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::Transient(_)
        )
    }
}
