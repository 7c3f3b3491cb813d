//! Types shared between the executor backends and the job lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instances::{GpuType, InstanceType};
use crate::naming::JobDescriptor;

/// Result of an executor operation, as seen by the task layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed
    Success,
    /// A transient rejection of this step. Retry the same step for the same
    /// attempt; no remote state was created.
    RetryStep { reason: String },
    /// The attempt failed for a recoverable reason. Retry the whole job as a
    /// new attempt.
    RetryJob { reason: String },
    /// The remote job was stopped
    Cancelled,
    /// The job failed for a reason the user can act on. Never retried.
    Fatal { message: String },
}

impl Outcome {
    pub fn retry_step(reason: impl Into<String>) -> Self {
        Outcome::RetryStep {
            reason: reason.into(),
        }
    }

    pub fn retry_job(reason: impl Into<String>) -> Self {
        Outcome::RetryJob {
            reason: reason.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Outcome::Fatal {
            message: message.into(),
        }
    }
}

/// Everything an executor needs to know about the attempt it drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorParams {
    pub descriptor: JobDescriptor,
    /// Repository and tag of the container image to run
    pub exec_image_repo_tag: String,
    pub memory_limit_gb: f64,
    pub time_limit_secs: u32,
    pub requires_gpu: bool,
}

/// The instance a job ran on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub name: String,
    pub cpu: u32,
    pub memory: f64,
    pub gpus: u32,
    pub gpu_type: Option<GpuType>,
}

impl From<&InstanceType> for InstanceMetrics {
    fn from(instance: &InstanceType) -> Self {
        Self {
            name: instance.name.clone(),
            cpu: instance.cpu,
            memory: instance.memory_gb,
            gpus: instance.gpus,
            gpu_type: instance.gpu_type,
        }
    }
}

/// One utilisation time series (e.g. `CPUUtilization`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub label: String,
    pub status: String,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

/// Resource usage recorded for a finished job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub instance: InstanceMetrics,
    pub metrics: Vec<MetricSeries>,
}

impl RuntimeMetrics {
    /// Chart title, e.g. `ml.g4dn.xlarge / 4 CPU / 16 GB Memory / 1x T4 GPU`
    pub fn title(&self) -> String {
        let gpu = match (self.instance.gpus, self.instance.gpu_type) {
            (0, _) => "No".to_string(),
            (n, Some(gpu_type)) => format!("{}x {}", n, gpu_type),
            (n, None) => format!("{}x", n),
        };
        format!(
            "{} / {} CPU / {} GB Memory / {} GPU",
            self.instance.name, self.instance.cpu, self.instance.memory, gpu
        )
    }

    /// Upper bound of the CPU utilisation axis; each vCPU contributes 100%
    pub fn cpu_limit(&self) -> u32 {
        100 * self.instance.cpu
    }
}
