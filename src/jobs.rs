//! Component job records and their status lifecycle
//!
//! A [`ComponentJob`] is the durable record of one logical job (an algorithm
//! run or an evaluation). Its status fields are private and only change
//! through [`ComponentJob::update_status`], which persists the record before
//! any follow-up work is scheduled.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::backends::{BackendKind, ExecutorParams, RuntimeMetrics};
use crate::config::JobConfig;
use crate::errors::JobError;
use crate::naming::{JobDescriptor, JobKind, MAX_ATTEMPT};
use crate::tasks::{Task, TaskQueue};
use crate::values::ComponentInterfaceValue;

/// Longest error message kept on a job, in characters
pub const MAX_ERROR_MESSAGE_LENGTH: usize = 1024;

/// Status of a component job. Stored as the integer codes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobStatus {
    #[default]
    Pending,
    Started,
    Retry,
    Failure,
    Success,
    Cancelled,
    Provisioning,
    Provisioned,
    Executing,
    Executed,
    Parsing,
    ExecutingPrerequisites,
}

impl JobStatus {
    pub const ALL: [JobStatus; 12] = [
        JobStatus::Pending,
        JobStatus::Started,
        JobStatus::Retry,
        JobStatus::Failure,
        JobStatus::Success,
        JobStatus::Cancelled,
        JobStatus::Provisioning,
        JobStatus::Provisioned,
        JobStatus::Executing,
        JobStatus::Executed,
        JobStatus::Parsing,
        JobStatus::ExecutingPrerequisites,
    ];

    pub fn to_int(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Started => 1,
            JobStatus::Retry => 2,
            JobStatus::Failure => 3,
            JobStatus::Success => 4,
            JobStatus::Cancelled => 5,
            JobStatus::Provisioning => 6,
            JobStatus::Provisioned => 7,
            JobStatus::Executing => 8,
            JobStatus::Executed => 9,
            JobStatus::Parsing => 10,
            JobStatus::ExecutingPrerequisites => 11,
        }
    }

    pub fn from_int(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.to_int() == code)
    }

    /// Human readable label
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Pending => "Queued",
            JobStatus::Started => "Started",
            JobStatus::Retry => "Re-Queued",
            JobStatus::Failure => "Failed",
            JobStatus::Success => "Succeeded",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::Provisioning => "Provisioning",
            JobStatus::Provisioned => "Provisioned",
            JobStatus::Executing => "Executing",
            JobStatus::Executed => "Executed",
            JobStatus::Parsing => "Parsing Outputs",
            JobStatus::ExecutingPrerequisites => "Executing Algorithm",
        }
    }

    /// Terminal states are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        )
    }

    /// States that start the job's clock
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            JobStatus::Started | JobStatus::ExecutingPrerequisites | JobStatus::Executing
        )
    }

    /// Whether work is currently being done for the job
    pub fn animate(self) -> bool {
        matches!(
            self,
            JobStatus::Started
                | JobStatus::Provisioning
                | JobStatus::Provisioned
                | JobStatus::Executing
                | JobStatus::Executed
                | JobStatus::Parsing
                | JobStatus::ExecutingPrerequisites
        )
    }
}

impl From<JobStatus> for u8 {
    fn from(status: JobStatus) -> Self {
        status.to_int()
    }
}

impl TryFrom<u8> for JobStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        JobStatus::from_int(code).ok_or_else(|| format!("Invalid job status code: {}", code))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Started => "STARTED",
            JobStatus::Retry => "RETRY",
            JobStatus::Failure => "FAILURE",
            JobStatus::Success => "SUCCESS",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Provisioning => "PROVISIONING",
            JobStatus::Provisioned => "PROVISIONED",
            JobStatus::Executing => "EXECUTING",
            JobStatus::Executed => "EXECUTED",
            JobStatus::Parsing => "PARSING",
            JobStatus::ExecutingPrerequisites => "EXECUTING_PREREQUISITES",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == upper)
            .ok_or_else(|| format!("Invalid job status: {}", s))
    }
}

/// The container image a job runs and its resource requirements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerImage {
    pub repo_tag: String,
    pub requires_gpu: bool,
    pub requires_memory_gb: f64,
}

/// A status change and the data reported with it
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub stdout: String,
    pub stderr: String,
    pub error_message: String,
    pub duration: Option<Duration>,
    pub compute_cost_euro_millicents: Option<u64>,
    pub runtime_metrics: Option<RuntimeMetrics>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            error_message: String::new(),
            duration: None,
            compute_cost_euro_millicents: None,
            runtime_metrics: None,
        }
    }

    pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    pub fn compute_cost(mut self, euro_millicents: Option<u64>) -> Self {
        self.compute_cost_euro_millicents = euro_millicents;
        self
    }

    pub fn runtime_metrics(mut self, metrics: Option<RuntimeMetrics>) -> Self {
        self.runtime_metrics = metrics;
        self
    }
}

/// Durable storage of job records
pub trait JobStore: Send + Sync {
    fn get(&self, kind: JobKind, pk: Uuid) -> anyhow::Result<Option<ComponentJob>>;

    /// Persist the job if the stored record still has the `expected` status
    /// and attempt. Returns once the write is durable, or `false` without
    /// writing when another worker changed the record first.
    fn save_if_status(
        &self,
        job: &ComponentJob,
        expected: JobStatus,
        expected_attempt: u8,
    ) -> anyhow::Result<bool>;
}

/// The durable record of a component job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentJob {
    kind: JobKind,
    pk: Uuid,
    status: JobStatus,
    attempt: u8,
    stdout: String,
    stderr: String,
    error_message: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    compute_cost_euro_millicents: Option<u64>,
    runtime_metrics: Option<RuntimeMetrics>,
    /// Run time reported before the job reached a terminal state
    reported_duration_ms: Option<i64>,
    time_limit_secs: u32,

    pub backend: BackendKind,
    pub container: ContainerImage,
    pub inputs: Vec<ComponentInterfaceValue>,
    /// Directory each input value is nested under, keyed by value id
    pub input_prefixes: BTreeMap<i64, String>,
    /// Serialized task signature run after the job succeeds
    pub task_on_success: Option<serde_json::Value>,
    /// Serialized task signature run after the job fails or is cancelled
    pub task_on_failure: Option<serde_json::Value>,
}

impl ComponentJob {
    pub fn new(
        kind: JobKind,
        container: ContainerImage,
        inputs: Vec<ComponentInterfaceValue>,
        config: &JobConfig,
    ) -> Self {
        Self {
            kind,
            pk: Uuid::new_v4(),
            status: JobStatus::Pending,
            attempt: 0,
            stdout: String::new(),
            stderr: String::new(),
            error_message: String::new(),
            started_at: None,
            completed_at: None,
            compute_cost_euro_millicents: None,
            runtime_metrics: None,
            reported_duration_ms: None,
            time_limit_secs: config.default_time_limit_secs,
            backend: config.default_backend,
            container,
            inputs,
            input_prefixes: BTreeMap::new(),
            task_on_success: None,
            task_on_failure: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn pk(&self) -> Uuid {
        self.pk
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn attempt(&self) -> u8 {
        self.attempt
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn compute_cost_euro_millicents(&self) -> Option<u64> {
        self.compute_cost_euro_millicents
    }

    pub fn runtime_metrics(&self) -> Option<&RuntimeMetrics> {
        self.runtime_metrics.as_ref()
    }

    pub fn time_limit_secs(&self) -> u32 {
        self.time_limit_secs
    }

    /// Set the time limit, which must lie within the configured bounds
    pub fn set_time_limit(&mut self, secs: u32, config: &JobConfig) -> Result<(), JobError> {
        if !(config.min_time_limit_secs..=config.max_time_limit_secs).contains(&secs) {
            return Err(JobError::InvalidTimeLimit {
                requested: secs,
                min: config.min_time_limit_secs,
                max: config.max_time_limit_secs,
            });
        }
        self.time_limit_secs = secs;
        Ok(())
    }

    /// The current attempt of this job
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor::new(self.kind, self.pk, self.attempt)
    }

    /// Parameters for the executor that runs the current attempt
    pub fn executor_params(&self) -> ExecutorParams {
        ExecutorParams {
            descriptor: self.descriptor(),
            exec_image_repo_tag: self.container.repo_tag.clone(),
            memory_limit_gb: self.container.requires_memory_gb,
            time_limit_secs: self.time_limit_secs,
            requires_gpu: self.container.requires_gpu,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn animate(&self) -> bool {
        self.status.animate()
    }

    /// Display context of the current status
    pub fn status_context(&self) -> &'static str {
        match self.status {
            JobStatus::Success if !self.stderr.is_empty() => "warning",
            JobStatus::Success => "success",
            JobStatus::Failure | JobStatus::Cancelled => "danger",
            _ => "info",
        }
    }

    /// Time between start and completion, if both are known
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Apply a status change to this record without persisting it. Returns
    /// true when the job entered a terminal state.
    pub fn apply_status(
        &mut self,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, JobError> {
        if self.status.is_terminal() {
            if self.status == update.status {
                debug!("Job {} is already {}", self.pk, self.status);
                return Ok(false);
            }
            return Err(JobError::TerminalState {
                pk: self.pk,
                current: self.status,
                requested: update.status,
            });
        }

        if update.status == JobStatus::Retry {
            self.attempt = self
                .attempt
                .checked_add(1)
                .filter(|attempt| *attempt <= MAX_ATTEMPT)
                .ok_or(JobError::AttemptsExhausted(self.pk))?;
            // The reported duration belonged to the previous attempt
            self.reported_duration_ms = None;
        }

        self.status = update.status;

        if !update.stdout.is_empty() {
            self.stdout = update.stdout;
        }
        if !update.stderr.is_empty() {
            self.stderr = update.stderr;
        }
        if !update.error_message.is_empty() {
            self.error_message = update
                .error_message
                .chars()
                .take(MAX_ERROR_MESSAGE_LENGTH)
                .collect();
        }

        if let Some(duration) = update.duration {
            self.reported_duration_ms = Some(duration.num_milliseconds());
        }

        if self.status.is_in_progress() && self.started_at.is_none() {
            self.started_at = Some(now);
        }

        let entered_terminal = self.status.is_terminal();
        if entered_terminal {
            let completed_at = *self.completed_at.get_or_insert(now);
            if let Some(ms) = self.reported_duration_ms {
                self.started_at = Some(completed_at - Duration::milliseconds(ms));
            }
        }

        if update.compute_cost_euro_millicents.is_some() {
            self.compute_cost_euro_millicents = update.compute_cost_euro_millicents;
        }
        if update.runtime_metrics.is_some() {
            self.runtime_metrics = update.runtime_metrics;
        }

        Ok(entered_terminal)
    }

    /// Change the job's status, persist it, and schedule the follow-up work
    /// of a terminal state once the record is saved
    ///
    /// Returns `false` when another worker changed the stored record since it
    /// was loaded. Nothing is scheduled in that case and `self` is reloaded
    /// from the store.
    pub fn update_status(
        &mut self,
        update: StatusUpdate,
        store: &dyn JobStore,
        queue: &dyn TaskQueue,
    ) -> Result<bool, JobError> {
        let mut next = self.clone();
        let entered_terminal = next.apply_status(update, Utc::now())?;

        let saved = store
            .save_if_status(&next, self.status, self.attempt)
            .map_err(|source| JobError::Persist {
                pk: next.pk,
                source,
            })?;

        if !saved {
            info!(
                "Job {} was changed concurrently, not applying {}",
                self.pk, next.status
            );
            if let Some(current) = store
                .get(self.kind, self.pk)
                .map_err(|source| JobError::Persist {
                    pk: self.pk,
                    source,
                })?
            {
                *self = current;
            }
            return Ok(false);
        }

        *self = next;
        debug!("Job {} is now {}", self.pk, self.status);

        if entered_terminal {
            self.schedule_follow_up(queue)?;
        }
        Ok(true)
    }

    fn schedule_follow_up(&self, queue: &dyn TaskQueue) -> Result<(), JobError> {
        let enqueue = |task: Task| {
            queue.enqueue(task, None).map_err(|source| JobError::Enqueue {
                pk: self.pk,
                source,
            })
        };

        enqueue(Task::DeprovisionJob {
            descriptor: self.descriptor(),
            backend: self.backend,
            step_retries: 0,
        })?;

        let continuation = if self.status == JobStatus::Success {
            &self.task_on_success
        } else {
            &self.task_on_failure
        };
        if let Some(signature) = continuation {
            info!("Scheduling continuation of job {}", self.pk);
            enqueue(Task::Continuation {
                signature: signature.clone(),
            })?;
        }
        Ok(())
    }
}

/// Average run time of the jobs whose duration is known
pub fn average_duration(jobs: &[ComponentJob]) -> Option<Duration> {
    let durations: Vec<Duration> = jobs.iter().filter_map(ComponentJob::duration).collect();
    if durations.is_empty() {
        return None;
    }
    let total = durations.iter().fold(Duration::zero(), |total, d| total + *d);
    Some(total / durations.len() as i32)
}

/// Summed run time of the jobs whose duration is known
pub fn total_duration(jobs: &[ComponentJob]) -> Option<Duration> {
    jobs.iter()
        .filter_map(ComponentJob::duration)
        .reduce(|total, duration| total + duration)
}
