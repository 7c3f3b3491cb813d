//! Executor backend configuration

use serde::{Deserialize, Serialize};

use crate::backends::logs::LOGLINES;

/// Configuration shared by the executor backends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Prefix of every remote job name, also used for the container registry
    pub registry_prefix: String,

    /// Bucket that receives invocation manifests
    pub input_bucket_name: String,

    /// Bucket that batch transform jobs write their results to
    pub output_bucket_name: String,

    /// Log group the provider writes transform job logs to
    pub log_group_name: String,

    /// Aggregation period in seconds for the utilisation metrics
    pub metrics_period_secs: u32,

    /// Number of log lines fetched for a finished job
    pub log_lines: usize,

    /// Attempts allowed for jobs failing with a provider internal error
    pub max_internal_error_attempts: u8,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            registry_prefix: "gc".to_string(),
            input_bucket_name: "grand-challenge-components-inputs".to_string(),
            output_bucket_name: "grand-challenge-components-outputs".to_string(),
            log_group_name: "/aws/sagemaker/TransformJobs".to_string(),
            metrics_period_secs: 60,
            log_lines: LOGLINES,
            max_internal_error_attempts: 3,
        }
    }
}
