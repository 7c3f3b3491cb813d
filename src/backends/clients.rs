//! Remote service capabilities used by the executors
//!
//! Executors never construct service clients themselves. The handles are
//! created by the caller and injected through [`BackendClients`], which keeps
//! concurrent invocations independent and lets tests substitute fakes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{ProviderError, StorageError};

/// Blob storage addressed by bucket and key
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError>;

    /// Returns [`StorageError::NotFound`] if the object does not exist
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete every object whose key starts with `prefix`, returning the
    /// number of objects removed
    fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, StorageError>;
}

/// A batch transform job submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformJobRequest {
    pub name: String,
    pub model_name: String,
    pub input_uri: String,
    pub output_uri: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub invocations_timeout_secs: u32,
    pub invocations_max_retries: u32,
    pub environment: BTreeMap<String, String>,
}

/// The remote batch execution service
pub trait TransformJobApi: Send + Sync {
    fn create_transform_job(&self, request: &TransformJobRequest) -> Result<(), ProviderError>;

    fn stop_transform_job(&self, name: &str) -> Result<(), ProviderError>;
}

/// One page of a log stream listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogStreams {
    pub names: Vec<String>,
    /// True if the provider has further pages
    pub has_more: bool,
}

/// A raw log line as returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub message: String,
}

pub trait LogsApi: Send + Sync {
    fn describe_log_streams(&self, log_group: &str, name_prefix: &str) -> Result<LogStreams>;

    fn get_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        limit: usize,
        start_from_head: bool,
    ) -> Result<Vec<LogEvent>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataQuery {
    pub id: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataResult {
    pub id: String,
    pub label: String,
    pub status_code: String,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDataResponse {
    pub results: Vec<MetricDataResult>,
    pub next_token: Option<String>,
}

pub trait MetricsApi: Send + Sync {
    fn get_metric_data(
        &self,
        queries: &[MetricDataQuery],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MetricDataResponse>;
}

/// Service handles shared by all executors of a worker
#[derive(Clone)]
pub struct BackendClients {
    pub storage: Arc<dyn ObjectStore>,
    pub transform: Arc<dyn TransformJobApi>,
    pub logs: Arc<dyn LogsApi>,
    pub metrics: Arc<dyn MetricsApi>,
}
