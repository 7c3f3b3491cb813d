//! Amazon SageMaker Batch Transform executor
//!
//! Each attempt is run as a single-instance batch transform job. Submission
//! returns as soon as the provider accepts the job; the outcome is learned from
//! the transform job state change event that the provider pushes when the job
//! stops, completes or fails.
//!
//! # Failure handling
//!
//! Failures are split by where they happen:
//!
//! - Rejections while submitting (no capacity, throttling) create no remote
//!   state, so the submission step is retried for the same attempt.
//! - Failures reported for a running job (no capacity, provider internal
//!   error) may leave artifacts behind, so the whole job is retried as a new
//!   attempt with a fresh name and fresh object keys.
//! - Failures the user can act on (out of memory, time limit, non-zero exit)
//!   are fatal outcomes and never retried.
//! - Anything not recognised is returned as an error for an operator to look at.

use anyhow::bail;
use chrono::Duration;
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use super::clients::{BackendClients, MetricDataQuery, TransformJobRequest};
use super::common::{ExecutorParams, Outcome, RuntimeMetrics};
use super::executor::Executor;
use super::instances::{InstanceCatalog, InstanceType};
use super::invocation::{build_invocation, upload_invocation};
use super::logs::{extract_metric_series, json_ms_timestamp, metrics_query, split_task_logs, user_error};
use crate::config::ExecutorConfig;
use crate::errors::{ExecutorError, NoSuitableInstanceError, StorageError};
use crate::naming::{JobDescriptor, JobNamer, MAX_JOB_NAME_LENGTH};
use crate::values::ComponentInterfaceValue;

/// Failure reason reported when no instance of the requested type is available
pub const CAPACITY_ERROR_REASON: &str = "CapacityError: Unable to provision requested ML compute capacity. Please retry using a different ML instance type.";

/// Failure reason reported for provider internal errors. Note the two spaces.
pub const INTERNAL_ERROR_REASON: &str =
    "InternalServerError: We encountered an internal error.  Please try again.";

/// Written to the data log when an invocation exceeds its timeout
pub const TIME_LIMIT_MARKER: &str = "Model server did not respond to /invocations request within";

const RESOURCE_LIMIT_EXCEEDED: &str = "ResourceLimitExceeded";
const THROTTLING_EXCEPTION: &str = "ThrottlingException";
const VALIDATION_EXCEPTION: &str = "ValidationException";

const STOP_IGNORABLE_MESSAGES: [&str; 2] = [
    // The job already stopped, completed or failed
    "The request was rejected because the transform job is in status",
    // The job was never created
    "Could not find job to update with name",
];

const METRICS_QUERY_ID: &str = "q";

/// Known failure reasons of a transform job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NoCapacity,
    InternalError,
    Unclassified,
}

/// Map the provider's failure reason text onto a known cause. The provider
/// strings are matched exactly; review this when the provider changes them.
pub fn classify_failure_reason(reason: Option<&str>) -> FailureReason {
    match reason {
        Some(CAPACITY_ERROR_REASON) => FailureReason::NoCapacity,
        Some(INTERNAL_ERROR_REASON) => FailureReason::InternalError,
        _ => FailureReason::Unclassified,
    }
}

/// Name of the SageMaker model created for a container image, derived from
/// the image's repository and tag
pub fn sagemaker_model_name(repo_tag: &str) -> Result<String, ExecutorError> {
    let image = repo_tag.rsplit('/').next().unwrap_or(repo_tag);
    let sanitized: String = image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let name: String = sanitized
        .trim_matches('-')
        .chars()
        .take(MAX_JOB_NAME_LENGTH)
        .collect();

    if name.is_empty() {
        return Err(ExecutorError::InvalidParams(format!(
            "cannot derive a model name from {:?}",
            repo_tag
        )));
    }
    Ok(name)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TransformResources {
    instance_type: String,
}

/// The fields of a transform job state change event that are used here
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TransformJobEvent {
    transform_job_status: String,
    #[serde(default)]
    transform_start_time: Option<serde_json::Value>,
    #[serde(default)]
    transform_end_time: Option<serde_json::Value>,
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default)]
    transform_resources: Option<TransformResources>,
}

/// Executor for SageMaker batch transform jobs
pub struct SageMakerBatchExecutor {
    params: ExecutorParams,
    config: ExecutorConfig,
    namer: JobNamer,
    job_name: String,
    clients: BackendClients,
    catalog: &'static InstanceCatalog,
    /// Instance the transform job reported running on
    reported_instance: Option<&'static InstanceType>,
    duration: Option<Duration>,
    runtime_metrics: Option<RuntimeMetrics>,
    stdout: String,
    stderr: String,
}

impl SageMakerBatchExecutor {
    pub fn new(
        params: ExecutorParams,
        clients: BackendClients,
        config: &ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        let namer = JobNamer::new(&config.registry_prefix)?;
        let job_name = namer.format(&params.descriptor)?;

        if params.time_limit_secs == 0 {
            return Err(ExecutorError::InvalidParams(
                "time limit must be positive".to_string(),
            ));
        }
        if !params.memory_limit_gb.is_finite() || params.memory_limit_gb < 0.0 {
            return Err(ExecutorError::InvalidParams(format!(
                "invalid memory limit {}",
                params.memory_limit_gb
            )));
        }

        Ok(Self {
            params,
            config: config.clone(),
            namer,
            job_name,
            clients,
            catalog: InstanceCatalog::builtin(),
            reported_instance: None,
            duration: None,
            runtime_metrics: None,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    /// Use a different instance catalog
    pub fn with_catalog(mut self, catalog: &'static InstanceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    fn descriptor(&self) -> &JobDescriptor {
        &self.params.descriptor
    }

    /// The cheapest instance that can run this job
    pub fn instance_type(&self) -> Result<&'static InstanceType, NoSuitableInstanceError> {
        let catalog: &'static InstanceCatalog = self.catalog;
        catalog.select(self.params.requires_gpu, self.params.memory_limit_gb)
    }

    fn create_invocation_json(
        &self,
        inputs: &[ComponentInterfaceValue],
        input_prefixes: &BTreeMap<i64, String>,
    ) -> Result<(), ExecutorError> {
        let descriptor = self.descriptor();
        let manifest = build_invocation(
            &self.job_name,
            inputs,
            input_prefixes,
            &self.config.output_bucket_name,
            &descriptor.invocation_prefix(),
        )?;
        upload_invocation(
            self.clients.storage.as_ref(),
            &self.config.input_bucket_name,
            &descriptor.invocation_key(),
            &manifest,
        )
    }

    fn create_transform_job(&self, instance: &InstanceType) -> Result<Outcome, ExecutorError> {
        let descriptor = self.descriptor();
        let request = TransformJobRequest {
            name: self.job_name.clone(),
            model_name: sagemaker_model_name(&self.params.exec_image_repo_tag)?,
            input_uri: format!(
                "s3://{}/{}",
                self.config.input_bucket_name,
                descriptor.invocation_key()
            ),
            output_uri: format!(
                "s3://{}/{}",
                self.config.output_bucket_name,
                descriptor.invocation_prefix()
            ),
            instance_type: instance.name.clone(),
            instance_count: 1,
            invocations_timeout_secs: self.params.time_limit_secs,
            invocations_max_retries: 0,
            environment: BTreeMap::from([
                ("LOG_LEVEL".to_string(), "INFO".to_string()),
                ("no_proxy".to_string(), "amazonaws.com".to_string()),
            ]),
        };

        match self.clients.transform.create_transform_job(&request) {
            Ok(()) => {
                info!(
                    "Created transform job {} on {}",
                    self.job_name, instance.name
                );
                Ok(Outcome::Success)
            }
            Err(e) if e.is_code(RESOURCE_LIMIT_EXCEEDED) => {
                warn!("Capacity limit exceeded for {}: {}", self.job_name, e.message);
                Ok(Outcome::retry_step("Capacity Limit Exceeded"))
            }
            Err(e) if e.is_code(THROTTLING_EXCEPTION) => {
                warn!("Request to create {} throttled", self.job_name);
                Ok(Outcome::retry_step("Request throttled"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_duration(&mut self, event: &TransformJobEvent) {
        let started = json_ms_timestamp(event.transform_start_time.as_ref());
        let stopped = json_ms_timestamp(event.transform_end_time.as_ref());

        self.duration = match (started, stopped) {
            (Some(started), Some(stopped)) if stopped >= started => Some(stopped - started),
            _ => {
                warn!("Invalid start or end time, duration undetermined");
                None
            }
        };
    }

    fn log_stream_name(&self, data_log: bool) -> anyhow::Result<String> {
        let streams = self
            .clients
            .logs
            .describe_log_streams(&self.config.log_group_name, &format!("{}/", self.job_name))?;

        if streams.has_more {
            bail!("Too many log streams found for {}", self.job_name);
        }

        let matching: BTreeSet<String> = streams
            .names
            .into_iter()
            .filter(|name| name.ends_with("/data-log") == data_log)
            .collect();

        if matching.len() == 1 {
            Ok(matching.into_iter().next().unwrap_or_default())
        } else {
            bail!("Log stream not found for {}", self.job_name)
        }
    }

    fn set_task_logs(&mut self) {
        let log_stream = match self.log_stream_name(false) {
            Ok(name) => name,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        match self.clients.logs.get_log_events(
            &self.config.log_group_name,
            &log_stream,
            self.config.log_lines,
            false,
        ) {
            Ok(events) => {
                let logs = split_task_logs(&events);
                self.stdout = logs.stdout_text();
                self.stderr = logs.stderr_text();
            }
            Err(e) => warn!("Could not fetch logs of {}: {:#}", self.job_name, e),
        }
    }

    fn job_data_log(&self) -> anyhow::Result<Vec<String>> {
        let events = self.clients.logs.get_log_events(
            &self.config.log_group_name,
            &self.log_stream_name(true)?,
            self.config.log_lines,
            false,
        )?;
        Ok(events.into_iter().map(|e| e.message).collect())
    }

    fn set_reported_instance(&mut self, event: &TransformJobEvent) {
        let Some(resources) = &event.transform_resources else {
            return;
        };
        let catalog: &'static InstanceCatalog = self.catalog;
        self.reported_instance = catalog.get(&resources.instance_type);
        if self.reported_instance.is_none() {
            warn!(
                "Transform job {} ran on unknown instance type {}",
                self.job_name, resources.instance_type
            );
        }
    }

    /// The instance the job ran on, falling back to the one it would be
    /// submitted to
    fn used_instance(&self) -> Result<&'static InstanceType, NoSuitableInstanceError> {
        match self.reported_instance {
            Some(instance) => Ok(instance),
            None => self.instance_type(),
        }
    }

    fn set_runtime_metrics(&mut self, event: &TransformJobEvent) {
        let started = json_ms_timestamp(event.transform_start_time.as_ref());
        let stopped = json_ms_timestamp(event.transform_end_time.as_ref());
        let (Some(started), Some(stopped)) = (started, stopped) else {
            warn!("Invalid start or end time, metrics undetermined");
            return;
        };

        let Ok(instance) = self.used_instance() else {
            warn!("Unknown instance type, metrics undetermined");
            return;
        };

        let query = MetricDataQuery {
            id: METRICS_QUERY_ID.to_string(),
            expression: metrics_query(
                &self.config.log_group_name,
                &self.job_name,
                self.config.metrics_period_secs,
            ),
        };

        // Metrics are delivered with a delay, widen the window to catch them
        match self.clients.metrics.get_metric_data(
            &[query],
            started - Duration::minutes(1),
            stopped + Duration::minutes(5),
        ) {
            Ok(response) => {
                self.runtime_metrics = Some(RuntimeMetrics {
                    instance: instance.into(),
                    metrics: extract_metric_series(&response, METRICS_QUERY_ID),
                });
            }
            Err(e) => warn!("Could not fetch metrics of {}: {:#}", self.job_name, e),
        }
    }

    /// Read the return code from the result object. `Ok(Err(message))` means
    /// the result was unusable.
    fn task_return_code(&self) -> Result<Result<i64, &'static str>, ExecutorError> {
        let invalid_output = "The invocation request did not return valid output";

        let body = match self
            .clients
            .storage
            .get(&self.config.output_bucket_name, &self.descriptor().result_key())
        {
            Ok(body) => body,
            Err(StorageError::NotFound { bucket, key }) => {
                warn!("Result object s3://{}/{} not found", bucket, key);
                return Ok(Err(invalid_output));
            }
            Err(e) => return Err(e.into()),
        };

        let Ok(result) = serde_json::from_slice::<serde_json::Value>(&body) else {
            return Ok(Err(invalid_output));
        };
        info!("Invocation result of {}: {}", self.job_name, result);

        let return_code = result.get("return_code").and_then(|code| {
            code.as_i64()
                .or_else(|| code.as_str().and_then(|s| s.trim().parse().ok()))
        });
        Ok(return_code.ok_or("The invocation response object is not valid"))
    }

    fn handle_completed_job(&self) -> Result<Outcome, ExecutorError> {
        let return_code = match self.task_return_code()? {
            Ok(code) => code,
            Err(message) => return Ok(Outcome::fatal(message)),
        };

        match return_code {
            0 => Ok(Outcome::Success),
            137 => Ok(Outcome::fatal("The container ran out of memory.")),
            code => Ok(Outcome::fatal(user_error(&self.stderr).unwrap_or_else(|| {
                format!("The container exited with return code {}", code)
            }))),
        }
    }

    fn handle_failed_job(&self, event: &TransformJobEvent) -> Result<Outcome, ExecutorError> {
        let reason = event.failure_reason.as_deref();

        match classify_failure_reason(reason) {
            FailureReason::NoCapacity => Ok(Outcome::retry_job(
                "No current capacity for the chosen instance type",
            )),
            FailureReason::InternalError => {
                if self.descriptor().attempt < self.config.max_internal_error_attempts {
                    Ok(Outcome::retry_job("Retrying due to internal server error"))
                } else {
                    Ok(Outcome::fatal("Algorithm container image would not start"))
                }
            }
            FailureReason::Unclassified => {
                let data_log = self.job_data_log().unwrap_or_else(|e| {
                    warn!("{}", e);
                    Vec::new()
                });

                if data_log.iter().any(|line| line.contains(TIME_LIMIT_MARKER)) {
                    Ok(Outcome::fatal("Time limit exceeded"))
                } else {
                    Err(ExecutorError::UnrecognizedFailure(reason.map(String::from)))
                }
            }
        }
    }

    fn stop_transform_job(&self) -> Result<Outcome, ExecutorError> {
        match self.clients.transform.stop_transform_job(&self.job_name) {
            Ok(()) => {
                info!("Stopped transform job {}", self.job_name);
                Ok(Outcome::Success)
            }
            Err(e) if e.is_code(THROTTLING_EXCEPTION) => Ok(Outcome::retry_step("Request throttled")),
            Err(e)
                if e.is_code(VALIDATION_EXCEPTION)
                    && STOP_IGNORABLE_MESSAGES.iter().any(|m| e.message.contains(m)) =>
            {
                info!("The job could not be stopped: {}", e);
                Ok(Outcome::Success)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Executor for SageMakerBatchExecutor {
    fn backend_name(&self) -> &'static str {
        "amazon_sagemaker_batch"
    }

    fn is_event_driven(&self) -> bool {
        true
    }

    fn params(&self) -> &ExecutorParams {
        &self.params
    }

    fn execute(
        &mut self,
        inputs: &[ComponentInterfaceValue],
        input_prefixes: &BTreeMap<i64, String>,
    ) -> Result<Outcome, ExecutorError> {
        // Resolve the instance first so an unsatisfiable job leaves nothing behind
        let instance = self.instance_type()?;
        self.create_invocation_json(inputs, input_prefixes)?;
        self.create_transform_job(instance)
    }

    fn handle_event(&mut self, event: &serde_json::Value) -> Result<Outcome, ExecutorError> {
        let descriptor = self.namer.parse_event(event)?;
        if descriptor != self.params.descriptor {
            return Err(ExecutorError::EventMismatch {
                expected: self.params.descriptor.job_id(),
                actual: descriptor.job_id(),
            });
        }

        let event: TransformJobEvent = serde_json::from_value(event.clone())
            .map_err(|e| ExecutorError::MalformedEvent(e.to_string()))?;
        debug!(
            "Handling {} event for {}",
            event.transform_job_status, self.job_name
        );

        match event.transform_job_status.as_str() {
            "Stopped" => Ok(Outcome::Cancelled),
            status @ ("Completed" | "Failed") => {
                self.set_reported_instance(&event);
                self.set_duration(&event);
                self.set_task_logs();
                self.set_runtime_metrics(&event);

                if status == "Completed" {
                    self.handle_completed_job()
                } else {
                    self.handle_failed_job(&event)
                }
            }
            other => Err(ExecutorError::InvalidJobStatus(other.to_string())),
        }
    }

    fn deprovision(&mut self) -> Result<Outcome, ExecutorError> {
        let outcome = self.stop_transform_job()?;
        if outcome != Outcome::Success {
            return Ok(outcome);
        }

        let prefix = format!("{}/", self.descriptor().invocation_prefix());
        for bucket in [
            &self.config.input_bucket_name,
            &self.config.output_bucket_name,
        ] {
            let deleted = self.clients.storage.delete_prefix(bucket, &prefix)?;
            debug!("Deleted {} objects from s3://{}/{}", deleted, bucket, prefix);
        }

        Ok(Outcome::Success)
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn runtime_metrics(&self) -> Option<&RuntimeMetrics> {
        self.runtime_metrics.as_ref()
    }

    fn stdout(&self) -> &str {
        &self.stdout
    }

    fn stderr(&self) -> &str {
        &self.stderr
    }

    fn usd_cents_per_hour(&self) -> Result<u32, ExecutorError> {
        Ok(self.used_instance()?.usd_cents_per_hour)
    }
}
