use thiserror::Error;

/// Errors that can abort worker startup or the top-level run loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("startup fitness check '{name}' failed: {reason}")]
    FitnessCheckFailed { name: String, reason: String },
    #[error("failed to load the progress registry")]
    Registry(#[from] worker_common::error::RegistryError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to bind the metrics/health server")]
    Bind(#[source] std::io::Error),
}
