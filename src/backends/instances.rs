//! Compute instance catalog for the SageMaker batch backend
//!
//! The catalog lists the instance types that jobs may be scheduled on together
//! with their resources and hourly price. Jobs run on the cheapest instance
//! that satisfies their memory and GPU requirements.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::errors::NoSuitableInstanceError;

/// GPU models available in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuType {
    V100,
    K80,
    T4,
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuType::V100 => write!(f, "V100"),
            GpuType::K80 => write!(f, "K80"),
            GpuType::T4 => write!(f, "T4"),
        }
    }
}

/// GPU jobs are pinned to a single T4
pub const GPU_JOB_GPU_COUNT: u32 = 1;
pub const GPU_JOB_GPU_TYPE: GpuType = GpuType::T4;

/// A compute instance type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Instance type name (as used in the TransformResources request)
    pub name: String,

    /// Number of vCPUs
    pub cpu: u32,

    /// Memory in GB
    pub memory_gb: f64,

    /// On-demand price in USD cents per hour
    pub usd_cents_per_hour: u32,

    /// Number of GPUs
    #[serde(default)]
    pub gpus: u32,

    /// GPU model, if the instance has GPUs
    #[serde(default)]
    pub gpu_type: Option<GpuType>,
}

impl InstanceType {
    /// Check whether this instance fits a job with the given requirements
    pub fn can_satisfy(&self, requires_gpu: bool, memory_limit_gb: f64) -> bool {
        let (gpus, gpu_type) = if requires_gpu {
            (GPU_JOB_GPU_COUNT, Some(GPU_JOB_GPU_TYPE))
        } else {
            (0, None)
        };

        self.gpus == gpus && self.gpu_type == gpu_type && self.memory_gb >= memory_limit_gb
    }
}

/// Read-only list of instance types, in preference order for equal prices
#[derive(Debug, Clone, Default)]
pub struct InstanceCatalog {
    instances: Vec<InstanceType>,
}

impl InstanceCatalog {
    pub fn new(instances: Vec<InstanceType>) -> Self {
        Self { instances }
    }

    /// The built-in SageMaker catalog, constructed once per process
    pub fn builtin() -> &'static InstanceCatalog {
        static CATALOG: OnceLock<InstanceCatalog> = OnceLock::new();
        CATALOG.get_or_init(|| InstanceCatalog::new(sagemaker_instances()))
    }

    pub fn instances(&self) -> &[InstanceType] {
        &self.instances
    }

    pub fn get(&self, name: &str) -> Option<&InstanceType> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// All entries that can run a job with these requirements
    pub fn find_matching(&self, requires_gpu: bool, memory_limit_gb: f64) -> Vec<&InstanceType> {
        self.instances
            .iter()
            .filter(|i| i.can_satisfy(requires_gpu, memory_limit_gb))
            .collect()
    }

    /// The cheapest entry that can run a job with these requirements.
    /// Ties go to the entry listed first.
    pub fn select(
        &self,
        requires_gpu: bool,
        memory_limit_gb: f64,
    ) -> Result<&InstanceType, NoSuitableInstanceError> {
        self.find_matching(requires_gpu, memory_limit_gb)
            .into_iter()
            .min_by_key(|i| i.usd_cents_per_hour)
            .ok_or(NoSuitableInstanceError {
                requires_gpu,
                memory_limit_gb,
            })
    }
}

fn cpu_instance(name: &str, cpu: u32, memory_gb: f64, usd_cents_per_hour: u32) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        cpu,
        memory_gb,
        usd_cents_per_hour,
        gpus: 0,
        gpu_type: None,
    }
}

fn gpu_instance(
    name: &str,
    cpu: u32,
    memory_gb: f64,
    usd_cents_per_hour: u32,
    gpus: u32,
    gpu_type: GpuType,
) -> InstanceType {
    InstanceType {
        gpus,
        gpu_type: Some(gpu_type),
        ..cpu_instance(name, cpu, memory_gb, usd_cents_per_hour)
    }
}

/// SageMaker instance types and eu-west-1 pricing, retrieved 06-JUN-2022
fn sagemaker_instances() -> Vec<InstanceType> {
    vec![
        cpu_instance("ml.m5.large", 2, 8.0, 13),
        cpu_instance("ml.m5.xlarge", 4, 16.0, 26),
        cpu_instance("ml.m5.2xlarge", 8, 32.0, 51),
        cpu_instance("ml.m5.4xlarge", 16, 64.0, 103),
        cpu_instance("ml.m5.12xlarge", 48, 192.0, 308),
        cpu_instance("ml.m5.24xlarge", 96, 384.0, 616),
        cpu_instance("ml.m4.xlarge", 4, 16.0, 27),
        cpu_instance("ml.m4.2xlarge", 8, 32.0, 53),
        cpu_instance("ml.m4.4xlarge", 16, 64.0, 107),
        cpu_instance("ml.m4.10xlarge", 40, 160.0, 266),
        cpu_instance("ml.m4.16xlarge", 64, 256.0, 426),
        cpu_instance("ml.c5.xlarge", 4, 8.0, 23),
        cpu_instance("ml.c5.2xlarge", 8, 16.0, 46),
        cpu_instance("ml.c5.4xlarge", 16, 32.0, 92),
        cpu_instance("ml.c5.9xlarge", 36, 72.0, 207),
        cpu_instance("ml.c5.18xlarge", 72, 144.0, 415),
        cpu_instance("ml.c4.xlarge", 4, 7.5, 27),
        cpu_instance("ml.c4.2xlarge", 8, 15.0, 54),
        cpu_instance("ml.c4.4xlarge", 16, 30.0, 109),
        cpu_instance("ml.c4.8xlarge", 36, 60.0, 217),
        gpu_instance("ml.p3.2xlarge", 8, 61.0, 413, 1, GpuType::V100),
        gpu_instance("ml.p3.8xlarge", 32, 244.0, 1586, 4, GpuType::V100),
        gpu_instance("ml.p3.16xlarge", 64, 488.0, 3041, 8, GpuType::V100),
        gpu_instance("ml.p2.xlarge", 4, 61.0, 122, 1, GpuType::K80),
        gpu_instance("ml.p2.8xlarge", 32, 488.0, 933, 8, GpuType::K80),
        gpu_instance("ml.p2.16xlarge", 64, 732.0, 1789, 16, GpuType::K80),
        gpu_instance("ml.g4dn.xlarge", 4, 16.0, 82, 1, GpuType::T4),
        gpu_instance("ml.g4dn.2xlarge", 8, 32.0, 105, 1, GpuType::T4),
        gpu_instance("ml.g4dn.4xlarge", 16, 64.0, 168, 1, GpuType::T4),
        gpu_instance("ml.g4dn.12xlarge", 48, 192.0, 545, 4, GpuType::T4),
        gpu_instance("ml.g4dn.16xlarge", 64, 256.0, 607, 1, GpuType::T4),
    ]
}
