//! Error types for the component execution backend
//!
//! Errors returned from this crate are operator-facing: they are propagated so
//! that they show up in alerting. User-facing failures (out of memory, time
//! limit exceeded, non-zero exit) are not errors, they are
//! [`Outcome::Fatal`](crate::backends::Outcome::Fatal) values.

use uuid::Uuid;

use crate::jobs::JobStatus;
use crate::naming::JobKind;

/// A remote job name or kind code table that does not follow the naming scheme
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidNameError {
    #[error("invalid job name {0:?}")]
    Malformed(String),

    #[error("invalid registry prefix {0:?}: {1}")]
    Prefix(String, &'static str),

    #[error("attempt {0} cannot be encoded in a two digit job name suffix")]
    Attempt(u32),

    #[error("job key {0} is not a version 4 UUID")]
    NotUuid4(Uuid),

    #[error("job kind code table is not injective: {0}")]
    KindCodes(String),

    #[error("event payload does not contain a TransformJobName")]
    MissingName,
}

/// No catalog entry satisfies the resource requirements of a job
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "no suitable instance type for job (requires_gpu={requires_gpu}, memory_limit_gb={memory_limit_gb})"
)]
pub struct NoSuitableInstanceError {
    pub requires_gpu: bool,
    pub memory_limit_gb: f64,
}

/// An error reported by a remote provider API
///
/// `code` is the machine-readable error code (e.g. `ThrottlingException`),
/// `message` is the human-readable text that accompanies it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

/// Object store failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Operator-facing executor failures
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),

    #[error(transparent)]
    NoSuitableInstance(#[from] NoSuitableInstanceError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to serialize invocation: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid executor parameters: {0}")]
    InvalidParams(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("event for {actual} delivered to the executor of {expected}")]
    EventMismatch { expected: String, actual: String },

    #[error("invalid transform job status {0:?}")]
    InvalidJobStatus(String),

    #[error("unrecognized failure reason: {}", .0.as_deref().unwrap_or("<none>"))]
    UnrecognizedFailure(Option<String>),

    #[error("the {0} backend is not event driven")]
    NotEventDriven(&'static str),
}

/// Job lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {pk} is {current} and cannot transition to {requested}")]
    TerminalState {
        pk: Uuid,
        current: JobStatus,
        requested: JobStatus,
    },

    #[error("job {0} has exhausted the available attempt numbers")]
    AttemptsExhausted(Uuid),

    #[error("time limit of {requested}s is outside the allowed range {min}..={max}")]
    InvalidTimeLimit { requested: u32, min: u32, max: u32 },

    #[error("failed to persist job {pk}")]
    Persist {
        pk: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to enqueue follow-up task for job {pk}")]
    Enqueue {
        pk: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),
}

/// Failures of the queue tasks that drive jobs
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{kind} {pk} does not exist")]
    JobNotFound { kind: JobKind, pk: Uuid },

    #[error("failed to load job {pk}")]
    Load {
        pk: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to enqueue {task}")]
    Enqueue {
        task: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not deprovision {job_id}: {reason}")]
    Deprovision { job_id: String, reason: String },

    #[error(transparent)]
    InvalidName(#[from] InvalidNameError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Job(#[from] JobError),
}
