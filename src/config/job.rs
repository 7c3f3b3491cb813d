//! Job lifecycle, retry and cost configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backends::BackendKind;

/// Limits applied to job records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// Backend used for newly created jobs
    pub default_backend: BackendKind,

    /// Smallest time limit a job may request, in seconds
    pub min_time_limit_secs: u32,

    /// Largest time limit a job may request, in seconds
    pub max_time_limit_secs: u32,

    /// Time limit of jobs that do not request one, in seconds
    pub default_time_limit_secs: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::AmazonSageMakerBatch,
            min_time_limit_secs: 60,
            max_time_limit_secs: 3600,
            default_time_limit_secs: 3600,
        }
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Times a throttled or rejected step is retried before the job fails
    pub max_step_retries: u32,

    /// Delay before the first step retry, in seconds
    pub base_delay_secs: u64,

    /// Upper bound of the step retry delay, in seconds
    pub max_delay_secs: u64,

    /// Total attempts a job may use when the provider has no capacity
    pub max_capacity_attempts: u8,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 10,
            base_delay_secs: 10,
            max_delay_secs: 600,
            max_capacity_attempts: 10,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given (zero based) retry number
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.min(32));
        let secs = self.base_delay_secs.saturating_mul(factor);
        Duration::from_secs(secs.min(self.max_delay_secs))
    }
}

/// Conversion of provider prices into recorded compute costs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostConfig {
    /// Euro per US dollar
    pub usd_to_eur: f64,

    /// Tax added on top of the provider price
    pub tax_rate: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            usd_to_eur: 0.92,
            tax_rate: 0.21,
        }
    }
}

impl CostConfig {
    /// Cost of running for `duration` at `usd_cents_per_hour`, in euro
    /// millicents including tax, rounded up
    pub fn euro_millicents(&self, duration: chrono::Duration, usd_cents_per_hour: u32) -> u64 {
        let hours = duration.num_milliseconds().max(0) as f64 / 3_600_000.0;
        let millicents =
            hours * f64::from(usd_cents_per_hour) * 1000.0 * self.usd_to_eur * (1.0 + self.tax_rate);
        millicents.ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_config_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.default_backend, BackendKind::AmazonSageMakerBatch);
        assert_eq!(config.min_time_limit_secs, 60);
        assert_eq!(config.max_time_limit_secs, 3600);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(10));
        assert_eq!(config.backoff(3), Duration::from_secs(80));
        assert_eq!(config.backoff(10), Duration::from_secs(600));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn test_euro_millicents() {
        let config = CostConfig {
            usd_to_eur: 1.0,
            tax_rate: 0.0,
        };
        assert_eq!(config.euro_millicents(chrono::Duration::hours(1), 51), 51_000);
        assert_eq!(config.euro_millicents(chrono::Duration::seconds(1), 51), 15);
        assert_eq!(config.euro_millicents(chrono::Duration::zero(), 51), 0);
    }
}
