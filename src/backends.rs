//! Compute backends that run component jobs
//!
//! A backend is selected per job through [`BackendKind`] and instantiated for
//! a single attempt with [`create_executor`]. The external services a backend
//! talks to are passed in as [`BackendClients`] so that workers share one set
//! of service handles.

pub mod clients;
pub mod common;
pub mod executor;
pub mod instances;
pub mod invocation;
pub mod io_copy;
pub mod logs;
pub mod sagemaker_batch;

pub use clients::{
    BackendClients, LogEvent, LogStreams, LogsApi, MetricDataQuery, MetricDataResponse,
    MetricDataResult, MetricsApi, ObjectStore, TransformJobApi, TransformJobRequest,
};
pub use common::{ExecutorParams, InstanceMetrics, MetricSeries, Outcome, RuntimeMetrics};
pub use executor::Executor;
pub use instances::{GpuType, InstanceCatalog, InstanceType};
pub use io_copy::IoCopyExecutor;
pub use sagemaker_batch::SageMakerBatchExecutor;

use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::errors::ExecutorError;

/// Registered executor backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    #[serde(rename = "amazon_sagemaker_batch")]
    AmazonSageMakerBatch,
    IoCopy,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::AmazonSageMakerBatch, BackendKind::IoCopy];
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::AmazonSageMakerBatch => write!(f, "amazon_sagemaker_batch"),
            BackendKind::IoCopy => write!(f, "io_copy"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "amazon_sagemaker_batch" => Ok(BackendKind::AmazonSageMakerBatch),
            "io_copy" => Ok(BackendKind::IoCopy),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Factory function to create the executor for one attempt of a job
pub fn create_executor(
    kind: BackendKind,
    params: ExecutorParams,
    clients: &BackendClients,
    config: &ExecutorConfig,
) -> Result<Box<dyn Executor>, ExecutorError> {
    match kind {
        BackendKind::AmazonSageMakerBatch => Ok(Box::new(SageMakerBatchExecutor::new(
            params,
            clients.clone(),
            config,
        )?)),
        BackendKind::IoCopy => Ok(Box::new(IoCopyExecutor::new(
            params,
            clients.clone(),
            config,
        )?)),
    }
}
