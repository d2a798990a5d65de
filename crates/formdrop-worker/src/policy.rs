use std::time::Duration;

use formdrop_core::Config;

/// Retry, stall and retention policy applied by the job queue.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    /// Delay after the first failed attempt; doubles for every further failure.
    pub backoff_base: Duration,
    pub max_stalled_count: i32,
    pub lease: Duration,
    pub completed_retention: chrono::Duration,
    pub completed_retention_count: i64,
    pub failed_retention: chrono::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(2000),
            max_stalled_count: 1,
            lease: Duration::from_secs(30),
            completed_retention: chrono::Duration::hours(24),
            completed_retention_count: 1000,
            failed_retention: chrono::Duration::days(7),
        }
    }
}

/// Largest exponent applied to the backoff base; keeps the shift in range.
const MAX_BACKOFF_EXPONENT: u32 = 20;

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.job_max_attempts(),
            backoff_base: config.job_backoff_base(),
            max_stalled_count: config.job_max_stalled_count(),
            lease: config.job_lease(),
            completed_retention: config.job_completed_retention(),
            completed_retention_count: config.job_completed_retention_count(),
            failed_retention: config.job_failed_retention(),
        }
    }

    /// Delay before the next attempt once `attempts_made` attempts have failed:
    /// `base * 2^(attempts_made - 1)`.
    pub fn backoff_for(&self, attempts_made: i32) -> Duration {
        let exponent = (attempts_made.max(1) - 1).min(MAX_BACKOFF_EXPONENT as i32) as u32;
        self.backoff_base.saturating_mul(1u32 << exponent)
    }

    pub fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// How often a worker renews its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(1))
    }
}
