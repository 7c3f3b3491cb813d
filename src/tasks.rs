//! Queue tasks that drive component jobs through their lifecycle
//!
//! The queue itself belongs to the host application and is reached through
//! [`TaskQueue`]. A [`TaskRunner`] runs the tasks concerned with executing a
//! job: provisioning an attempt, handling the backend's events and cleaning
//! up. Output parsing and continuations are returned to the host by
//! [`TaskRunner::dispatch`].

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backends::{BackendClients, BackendKind, Executor, ExecutorParams, Outcome, create_executor};
use crate::config::ComponentsConfig;
use crate::errors::TaskError;
use crate::jobs::{ComponentJob, JobStatus, JobStore, StatusUpdate};
use crate::naming::{JobDescriptor, JobKind, JobNamer};

/// Message recorded on jobs that failed for a reason only an operator can act on
pub const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred";

/// A unit of work placed on the task queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    ProvisionJob {
        kind: JobKind,
        pk: Uuid,
        step_retries: u32,
    },
    HandleJobEvent {
        event: serde_json::Value,
        step_retries: u32,
    },
    ParseJobOutputs {
        kind: JobKind,
        pk: Uuid,
    },
    DeprovisionJob {
        descriptor: JobDescriptor,
        backend: BackendKind,
        step_retries: u32,
    },
    /// A task signature supplied by the host, run after a job finishes
    Continuation { signature: serde_json::Value },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ProvisionJob { .. } => "provision_job",
            Task::HandleJobEvent { .. } => "handle_job_event",
            Task::ParseJobOutputs { .. } => "parse_job_outputs",
            Task::DeprovisionJob { .. } => "deprovision_job",
            Task::Continuation { .. } => "continuation",
        }
    }
}

/// The host's task queue
pub trait TaskQueue: Send + Sync {
    /// Schedule `task`, after `countdown` if given
    fn enqueue(&self, task: Task, countdown: Option<Duration>) -> anyhow::Result<()>;
}

/// Runs the execution tasks of component jobs
pub struct TaskRunner {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    clients: BackendClients,
    config: ComponentsConfig,
    namer: JobNamer,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        clients: BackendClients,
        config: ComponentsConfig,
    ) -> Result<Self, TaskError> {
        JobKind::verify_codes()?;
        let namer = JobNamer::new(&config.executor.registry_prefix)?;
        Ok(Self {
            store,
            queue,
            clients,
            config,
            namer,
        })
    }

    /// Run a task. Tasks handled by the host are handed back.
    pub fn dispatch(&self, task: Task) -> Result<Option<Task>, TaskError> {
        debug!("Running task {}", task.name());
        match task {
            Task::ProvisionJob {
                kind,
                pk,
                step_retries,
            } => self.provision_job(kind, pk, step_retries).map(|_| None),
            Task::HandleJobEvent {
                event,
                step_retries,
            } => self.handle_job_event(&event, step_retries).map(|_| None),
            Task::DeprovisionJob {
                descriptor,
                backend,
                step_retries,
            } => self
                .deprovision_job(descriptor, backend, step_retries)
                .map(|_| None),
            task @ (Task::ParseJobOutputs { .. } | Task::Continuation { .. }) => Ok(Some(task)),
        }
    }

    /// Submit the current attempt of a job to its backend
    pub fn provision_job(&self, kind: JobKind, pk: Uuid, step_retries: u32) -> Result<(), TaskError> {
        let mut job = self.load_job(kind, pk)?;

        if !matches!(
            job.status(),
            JobStatus::Pending | JobStatus::Retry | JobStatus::Provisioning
        ) {
            warn!(
                "Not provisioning job_id={} with status {}",
                job.descriptor(),
                job.status()
            );
            return Ok(());
        }

        if !self.transition(&mut job, StatusUpdate::new(JobStatus::Provisioning))? {
            return Ok(());
        }

        let mut executor = match self.executor_for(&job) {
            Ok(executor) => executor,
            Err(e) => return self.fail_unexpected(&mut job, e),
        };

        match executor.execute(&job.inputs, &job.input_prefixes) {
            Ok(Outcome::Success) => {
                if !self.transition(&mut job, StatusUpdate::new(JobStatus::Executing))? {
                    return Ok(());
                }
                info!(
                    "Submitted job_id={} to {}",
                    job.descriptor(),
                    executor.backend_name()
                );
                if !executor.is_event_driven() {
                    self.record_executed(&mut job, executor.as_ref())?;
                }
                Ok(())
            }
            Ok(Outcome::RetryStep { reason }) => self.retry_step(
                &mut job,
                step_retries,
                &reason,
                Task::ProvisionJob {
                    kind,
                    pk,
                    step_retries: step_retries + 1,
                },
            ),
            Ok(Outcome::RetryJob { reason }) => self.retry_job(&mut job, &reason),
            Ok(Outcome::Cancelled) => self.update(&mut job, StatusUpdate::new(JobStatus::Cancelled)),
            Ok(Outcome::Fatal { message }) => self.update(
                &mut job,
                StatusUpdate::new(JobStatus::Failure).error_message(message),
            ),
            Err(e) => self.fail_unexpected(&mut job, e),
        }
    }

    /// Handle a state change event reported by a backend
    pub fn handle_job_event(
        &self,
        event: &serde_json::Value,
        step_retries: u32,
    ) -> Result<(), TaskError> {
        let descriptor = self.namer.parse_event(event)?;
        let mut job = self.load_job(descriptor.kind, descriptor.pk)?;

        if job.attempt() != descriptor.attempt {
            info!(
                "Ignoring event for job_id={}, the current attempt is {}",
                descriptor,
                job.attempt()
            );
            return Ok(());
        }
        if job.status().is_terminal()
            || matches!(job.status(), JobStatus::Executed | JobStatus::Parsing)
        {
            info!(
                "Ignoring event for job_id={} with status {}",
                descriptor,
                job.status()
            );
            return Ok(());
        }

        let mut executor = match self.executor_for(&job) {
            Ok(executor) => executor,
            Err(e) => return self.fail_unexpected(&mut job, e),
        };

        match executor.handle_event(event) {
            Ok(Outcome::Success) => self.record_executed(&mut job, executor.as_ref()),
            Ok(Outcome::RetryStep { reason }) => self.retry_step(
                &mut job,
                step_retries,
                &reason,
                Task::HandleJobEvent {
                    event: event.clone(),
                    step_retries: step_retries + 1,
                },
            ),
            Ok(Outcome::RetryJob { reason }) => self.retry_job(&mut job, &reason),
            Ok(Outcome::Cancelled) => {
                info!("Job job_id={} was cancelled", descriptor);
                self.update(&mut job, StatusUpdate::new(JobStatus::Cancelled))
            }
            Ok(Outcome::Fatal { message }) => {
                let update = self
                    .executor_report(JobStatus::Failure, executor.as_ref())
                    .error_message(message);
                self.update(&mut job, update)
            }
            Err(e) => self.fail_unexpected(&mut job, e),
        }
    }

    /// Stop the remote job of an attempt and remove its objects
    pub fn deprovision_job(
        &self,
        descriptor: JobDescriptor,
        backend: BackendKind,
        step_retries: u32,
    ) -> Result<(), TaskError> {
        // Cleanup only needs the attempt's identity
        let params = ExecutorParams {
            descriptor,
            exec_image_repo_tag: String::new(),
            memory_limit_gb: 0.0,
            time_limit_secs: self.config.job.default_time_limit_secs,
            requires_gpu: false,
        };
        let mut executor = create_executor(backend, params, &self.clients, &self.config.executor)?;

        match executor.deprovision()? {
            Outcome::Success => {
                debug!("Deprovisioned job_id={}", descriptor);
                Ok(())
            }
            Outcome::RetryStep { reason } if step_retries < self.config.retry.max_step_retries => {
                let delay = self.config.retry.backoff(step_retries);
                warn!(
                    "Deprovisioning job_id={} delayed by {:?}: {}",
                    descriptor, delay, reason
                );
                self.enqueue(
                    Task::DeprovisionJob {
                        descriptor,
                        backend,
                        step_retries: step_retries + 1,
                    },
                    Some(delay),
                )
            }
            outcome => {
                error!(
                    "Could not deprovision job_id={}: {:?}",
                    descriptor, outcome
                );
                let reason = match outcome {
                    Outcome::RetryStep { reason } => {
                        format!("gave up after {} retries: {}", step_retries, reason)
                    }
                    other => format!("unexpected outcome {:?}", other),
                };
                Err(TaskError::Deprovision {
                    job_id: descriptor.job_id(),
                    reason,
                })
            }
        }
    }

    fn load_job(&self, kind: JobKind, pk: Uuid) -> Result<ComponentJob, TaskError> {
        self.store
            .get(kind, pk)
            .map_err(|source| TaskError::Load { pk, source })?
            .ok_or(TaskError::JobNotFound { kind, pk })
    }

    fn executor_for(&self, job: &ComponentJob) -> Result<Box<dyn Executor>, TaskError> {
        Ok(create_executor(
            job.backend,
            job.executor_params(),
            &self.clients,
            &self.config.executor,
        )?)
    }

    fn update(&self, job: &mut ComponentJob, update: StatusUpdate) -> Result<(), TaskError> {
        self.transition(job, update).map(|_| ())
    }

    /// Like `update`, but reports whether this worker made the change
    fn transition(&self, job: &mut ComponentJob, update: StatusUpdate) -> Result<bool, TaskError> {
        Ok(job.update_status(update, self.store.as_ref(), self.queue.as_ref())?)
    }

    fn enqueue(&self, task: Task, countdown: Option<Duration>) -> Result<(), TaskError> {
        let name = task.name();
        self.queue
            .enqueue(task, countdown)
            .map_err(|source| TaskError::Enqueue { task: name, source })
    }

    /// The executor's logs, timing, cost and metrics as a status update
    fn executor_report(&self, status: JobStatus, executor: &dyn Executor) -> StatusUpdate {
        let cost = executor
            .compute_cost_euro_millicents(&self.config.costs)
            .unwrap_or_else(|e| {
                warn!("Could not determine the compute cost: {}", e);
                None
            });

        StatusUpdate::new(status)
            .stdout(executor.stdout())
            .stderr(executor.stderr())
            .duration(executor.duration())
            .compute_cost(cost)
            .runtime_metrics(executor.runtime_metrics().cloned())
    }

    fn record_executed(&self, job: &mut ComponentJob, executor: &dyn Executor) -> Result<(), TaskError> {
        let update = self.executor_report(JobStatus::Executed, executor);
        if !self.transition(job, update)? {
            return Ok(());
        }
        self.enqueue(
            Task::ParseJobOutputs {
                kind: job.kind(),
                pk: job.pk(),
            },
            None,
        )
    }

    fn retry_step(
        &self,
        job: &mut ComponentJob,
        step_retries: u32,
        reason: &str,
        next: Task,
    ) -> Result<(), TaskError> {
        if step_retries >= self.config.retry.max_step_retries {
            warn!(
                "Giving up on job_id={} after {} retries: {}",
                job.descriptor(),
                step_retries,
                reason
            );
            return self.update(
                job,
                StatusUpdate::new(JobStatus::Failure).error_message(reason),
            );
        }

        let delay = self.config.retry.backoff(step_retries);
        info!(
            "Retrying {} for job_id={} in {:?}: {}",
            next.name(),
            job.descriptor(),
            delay,
            reason
        );
        self.enqueue(next, Some(delay))
    }

    fn retry_job(&self, job: &mut ComponentJob, reason: &str) -> Result<(), TaskError> {
        let previous = job.descriptor();

        if u32::from(previous.attempt) + 1 >= u32::from(self.config.retry.max_capacity_attempts) {
            warn!(
                "Job job_id={} used all of its {} attempts: {}",
                previous, self.config.retry.max_capacity_attempts, reason
            );
            return self.update(
                job,
                StatusUpdate::new(JobStatus::Failure).error_message(reason),
            );
        }

        info!("Retrying job_id={} as a new attempt: {}", previous, reason);
        if !self.transition(job, StatusUpdate::new(JobStatus::Retry))? {
            return Ok(());
        }
        self.enqueue(
            Task::DeprovisionJob {
                descriptor: previous,
                backend: job.backend,
                step_retries: 0,
            },
            None,
        )?;
        self.enqueue(
            Task::ProvisionJob {
                kind: job.kind(),
                pk: job.pk(),
                step_retries: 0,
            },
            None,
        )
    }

    fn fail_unexpected(
        &self,
        job: &mut ComponentJob,
        err: impl Into<TaskError>,
    ) -> Result<(), TaskError> {
        let err = err.into();
        error!("Unexpected error for job_id={}: {}", job.descriptor(), err);

        if let Err(e) = self.update(
            job,
            StatusUpdate::new(JobStatus::Failure).error_message(UNEXPECTED_ERROR_MESSAGE),
        ) {
            error!("Could not mark job_id={} as failed: {}", job.descriptor(), e);
        }
        Err(err)
    }
}
