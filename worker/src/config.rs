use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Worker runtime configuration (C10), loaded once at startup from the
/// process environment. Every field maps to one of the `RUNPOD_*`/`BIND_*`
/// variables documented for this worker.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "RUNPOD_WEBHOOK_GET_JOB")]
    pub webhook_get_job: String,

    #[envconfig(from = "RUNPOD_WEBHOOK_POST_OUTPUT")]
    pub webhook_post_output: String,

    #[envconfig(from = "RUNPOD_WEBHOOK_POST_STREAM")]
    pub webhook_post_stream: String,

    #[envconfig(from = "RUNPOD_WEBHOOK_PING")]
    pub webhook_ping: String,

    #[envconfig(from = "RUNPOD_PING_INTERVAL", default = "10")]
    pub ping_interval_seconds: u64,

    #[envconfig(from = "RUNPOD_POD_ID", default = "local")]
    pub pod_id: String,

    #[envconfig(from = "RUNPOD_POD_HOSTNAME", default = "")]
    pub pod_hostname: String,

    #[envconfig(from = "RUNPOD_DEBUG_LEVEL", default = "INFO")]
    pub debug_level: String,

    #[envconfig(from = "RUNPOD_MAX_CONCURRENCY", default = "4")]
    pub max_concurrency: usize,

    #[envconfig(from = "RUNPOD_MAX_OUTPUT_BYTES", default = "2097152")]
    pub max_output_bytes: usize,

    #[envconfig(from = "RUNPOD_REGISTRY_PATH", default = "./in_progress_jobs.json")]
    pub registry_path: String,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub progress_channel_capacity: usize,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.ping_interval_seconds)
    }

    /// Worker identity used in ping parameters and runtime-error envelopes:
    /// falls back to `pod_id` if no explicit hostname was given.
    pub fn worker_id(&self) -> &str {
        if self.pod_hostname.is_empty() {
            &self.pod_id
        } else {
            &self.pod_hostname
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
