use std::time::Duration;

/// The Fibonacci backoff schedule used for result-POST retries: an initial
/// send plus up to 3 retries (4 sends total), waiting 1s, then 1s, then 2s
/// between consecutive sends.
///
/// Deliberately short and fixed rather than open-ended: the worker must not loop
/// forever on a dead control plane, since at-least-once delivery is already
/// guaranteed by the progress registry re-surfacing the job to the control
/// plane's own timeout.
#[derive(Debug, Clone, Copy)]
pub struct FibonacciBackoff {
    delays: [Duration; 3],
}

impl FibonacciBackoff {
    /// Total sends attempted, counting the initial send: 1 initial + 3 retries.
    pub const MAX_ATTEMPTS: u32 = 4;

    pub fn new() -> Self {
        Self {
            delays: [
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
        }
    }

    /// The delay to wait before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delays[(attempt as usize).min(self.delays.len() - 1)]
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new()
    }
}
