//! In-memory stand-ins for the services the backend talks to

#![allow(dead_code)]

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use gc_components::backends::{
    BackendClients, LogEvent, LogStreams, LogsApi, MetricDataQuery, MetricDataResponse,
    MetricsApi, ObjectStore, TransformJobApi, TransformJobRequest,
};
use gc_components::config::ComponentsConfig;
use gc_components::errors::{ProviderError, StorageError};
use gc_components::jobs::{ComponentJob, ContainerImage, JobStatus, JobStore};
use gc_components::naming::{JobDescriptor, JobKind, JobNamer};
use gc_components::tasks::{Task, TaskQueue, TaskRunner};
use gc_components::values::{
    ComponentInterface, ComponentInterfaceValue, InterfaceKind, ValueReference,
};
use rstest::fixture;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// 2022-06-06T12:00:00Z in milliseconds
pub const START_MS: i64 = 1_654_516_800_000;

pub const CAPACITY_REASON: &str = "CapacityError: Unable to provision requested ML compute capacity. Please retry using a different ML instance type.";
pub const INTERNAL_REASON: &str =
    "InternalServerError: We encountered an internal error.  Please try again.";

// ============== Object store ==============

#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl FakeObjectStore {
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    pub fn insert_json(&self, bucket: &str, key: &str, value: &Value) {
        self.insert(bucket, key, serde_json::to_vec(value).unwrap());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn json(&self, bucket: &str, key: &str) -> Option<Value> {
        self.object(bucket, key)
            .map(|body| serde_json::from_slice(&body).unwrap())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

impl ObjectStore for FakeObjectStore {
    fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        self.insert(bucket, key, body);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.object(bucket, key).ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, StorageError> {
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|(b, k), _| !(b == bucket && k.starts_with(prefix)));
        Ok(before - objects.len())
    }
}

// ============== Transform jobs ==============

#[derive(Default)]
pub struct FakeTransformApi {
    created: Mutex<Vec<TransformJobRequest>>,
    stopped: Mutex<Vec<String>>,
    create_errors: Mutex<VecDeque<ProviderError>>,
    stop_errors: Mutex<VecDeque<ProviderError>>,
}

impl FakeTransformApi {
    pub fn fail_next_create(&self, code: &str, message: &str) {
        self.create_errors
            .lock()
            .unwrap()
            .push_back(ProviderError::new(code, message));
    }

    pub fn fail_next_stop(&self, code: &str, message: &str) {
        self.stop_errors
            .lock()
            .unwrap()
            .push_back(ProviderError::new(code, message));
    }

    pub fn created(&self) -> Vec<TransformJobRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl TransformJobApi for FakeTransformApi {
    fn create_transform_job(&self, request: &TransformJobRequest) -> Result<(), ProviderError> {
        if let Some(err) = self.create_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.created.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn stop_transform_job(&self, name: &str) -> Result<(), ProviderError> {
        if let Some(err) = self.stop_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut stopped = self.stopped.lock().unwrap();
        if stopped.iter().any(|n| n == name) {
            return Err(ProviderError::new(
                "ValidationException",
                format!(
                    "The request was rejected because the transform job is in status Stopped. {}",
                    name
                ),
            ));
        }
        stopped.push(name.to_string());
        Ok(())
    }
}

// ============== Logs ==============

#[derive(Default)]
pub struct FakeLogs {
    streams: Mutex<BTreeMap<String, Vec<LogEvent>>>,
    has_more: AtomicBool,
    unavailable: AtomicBool,
}

impl FakeLogs {
    pub fn add_stream(&self, name: &str, messages: &[String]) {
        let events = messages
            .iter()
            .enumerate()
            .map(|(i, message)| LogEvent {
                timestamp: START_MS + i as i64 * 1000,
                message: message.clone(),
            })
            .collect();
        self.streams
            .lock()
            .unwrap()
            .insert(name.to_string(), events);
    }

    pub fn set_has_more(&self, has_more: bool) {
        self.has_more.store(has_more, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl LogsApi for FakeLogs {
    fn describe_log_streams(&self, _log_group: &str, name_prefix: &str) -> Result<LogStreams> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("logs service unavailable");
        }
        Ok(LogStreams {
            names: self
                .streams
                .lock()
                .unwrap()
                .keys()
                .filter(|name| name.starts_with(name_prefix))
                .cloned()
                .collect(),
            has_more: self.has_more.load(Ordering::SeqCst),
        })
    }

    fn get_log_events(
        &self,
        _log_group: &str,
        log_stream: &str,
        limit: usize,
        _start_from_head: bool,
    ) -> Result<Vec<LogEvent>> {
        let streams = self.streams.lock().unwrap();
        let Some(events) = streams.get(log_stream) else {
            bail!("no stream {}", log_stream);
        };
        let skip = events.len().saturating_sub(limit);
        Ok(events[skip..].to_vec())
    }
}

// ============== Metrics ==============

#[derive(Default)]
pub struct FakeMetrics {
    response: Mutex<MetricDataResponse>,
    windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl FakeMetrics {
    pub fn set_response(&self, response: MetricDataResponse) {
        *self.response.lock().unwrap() = response;
    }

    pub fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().unwrap().clone()
    }
}

impl MetricsApi for FakeMetrics {
    fn get_metric_data(
        &self,
        _queries: &[MetricDataQuery],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MetricDataResponse> {
        self.windows.lock().unwrap().push((start, end));
        Ok(self.response.lock().unwrap().clone())
    }
}

// ============== Job store and queue ==============

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<BTreeMap<Uuid, ComponentJob>>,
    saves: Mutex<usize>,
    fail_saves: AtomicBool,
}

impl InMemoryJobStore {
    pub fn job(&self, pk: Uuid) -> ComponentJob {
        self.jobs.lock().unwrap().get(&pk).cloned().unwrap()
    }

    pub fn insert(&self, job: &ComponentJob) {
        self.jobs.lock().unwrap().insert(job.pk(), job.clone());
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, _kind: JobKind, pk: Uuid) -> Result<Option<ComponentJob>> {
        Ok(self.jobs.lock().unwrap().get(&pk).cloned())
    }

    fn save_if_status(
        &self,
        job: &ComponentJob,
        expected: JobStatus,
        expected_attempt: u8,
    ) -> Result<bool> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("database unavailable");
        }
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(stored) = jobs.get(&job.pk())
            && (stored.status() != expected || stored.attempt() != expected_attempt)
        {
            return Ok(false);
        }
        *self.saves.lock().unwrap() += 1;
        jobs.insert(job.pk(), job.clone());
        Ok(true)
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<(Task, Option<Duration>)>>,
}

impl RecordingQueue {
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|(task, _)| task.clone())
            .collect()
    }

    pub fn scheduled(&self) -> Vec<(Task, Option<Duration>)> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.lock().unwrap().iter().map(|(t, _)| t.name()).collect()
    }

    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }
}

impl TaskQueue for RecordingQueue {
    fn enqueue(&self, task: Task, countdown: Option<Duration>) -> Result<()> {
        self.tasks.lock().unwrap().push((task, countdown));
        Ok(())
    }
}

// ============== Harness ==============

pub struct Harness {
    pub storage: Arc<FakeObjectStore>,
    pub transform: Arc<FakeTransformApi>,
    pub logs: Arc<FakeLogs>,
    pub metrics: Arc<FakeMetrics>,
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<RecordingQueue>,
    pub config: ComponentsConfig,
}

impl Harness {
    pub fn clients(&self) -> BackendClients {
        BackendClients {
            storage: self.storage.clone(),
            transform: self.transform.clone(),
            logs: self.logs.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn runner(&self) -> TaskRunner {
        TaskRunner::new(
            self.store.clone(),
            self.queue.clone(),
            self.clients(),
            self.config.clone(),
        )
        .unwrap()
    }

    pub fn job_name(&self, descriptor: &JobDescriptor) -> String {
        JobNamer::new(&self.config.executor.registry_prefix)
            .unwrap()
            .format(descriptor)
            .unwrap()
    }

    pub fn input_bucket(&self) -> &str {
        &self.config.executor.input_bucket_name
    }

    pub fn output_bucket(&self) -> &str {
        &self.config.executor.output_bucket_name
    }

    /// Store the result object a finished invocation writes
    pub fn write_result(&self, descriptor: &JobDescriptor, return_code: i64) {
        self.storage.insert_json(
            self.output_bucket(),
            &descriptor.result_key(),
            &json!({"pk": self.job_name(descriptor), "return_code": return_code}),
        );
    }

    /// Register the task log stream of an attempt
    pub fn write_task_log(&self, descriptor: &JobDescriptor, lines: &[(&str, &str)]) {
        let messages: Vec<String> = lines
            .iter()
            .map(|(source, line)| log_message(source, line))
            .collect();
        self.logs.add_stream(
            &format!("{}/i-0123456789abcdef0", self.job_name(descriptor)),
            &messages,
        );
    }

    /// Register the data log stream of an attempt
    pub fn write_data_log(&self, descriptor: &JobDescriptor, lines: &[&str]) {
        let messages: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        self.logs.add_stream(
            &format!("{}/i-0123456789abcdef0/data-log", self.job_name(descriptor)),
            &messages,
        );
    }
}

#[fixture]
pub fn harness() -> Harness {
    Harness {
        storage: Arc::new(FakeObjectStore::default()),
        transform: Arc::new(FakeTransformApi::default()),
        logs: Arc::new(FakeLogs::default()),
        metrics: Arc::new(FakeMetrics::default()),
        store: Arc::new(InMemoryJobStore::default()),
        queue: Arc::new(RecordingQueue::default()),
        config: ComponentsConfig::default(),
    }
}

// ============== Builders ==============

pub fn log_message(source: &str, line: &str) -> String {
    json!({"log": line, "source": source, "level": "INFO"}).to_string()
}

/// A transform job state change event as delivered by the provider
pub fn transform_event(name: &str, status: &str, failure_reason: Option<&str>) -> Value {
    let mut event = json!({
        "TransformJobName": name,
        "TransformJobStatus": status,
        "TransformStartTime": START_MS,
        "TransformEndTime": START_MS + 90_000,
        "TransformResources": {"InstanceType": "ml.m5.large", "InstanceCount": 1},
    });
    if let Some(reason) = failure_reason {
        event["FailureReason"] = json!(reason);
    }
    event
}

pub fn json_input(id: i64, slug: &str, value: Value) -> ComponentInterfaceValue {
    ComponentInterfaceValue::inline(
        id,
        ComponentInterface {
            slug: slug.to_string(),
            kind: InterfaceKind::Json,
            relative_path: format!("{}.json", slug),
        },
        value,
    )
}

pub fn image_input(id: i64, bucket: &str, key: &str, file_name: &str) -> ComponentInterfaceValue {
    ComponentInterfaceValue {
        id,
        interface: ComponentInterface {
            slug: "generic-medical-image".to_string(),
            kind: InterfaceKind::Image,
            relative_path: "images/generic-medical-image".to_string(),
        },
        value: ValueReference::Image {
            bucket: bucket.to_string(),
            key: key.to_string(),
            file_name: file_name.to_string(),
        },
    }
}

pub fn container(memory_gb: f64, requires_gpu: bool) -> ContainerImage {
    ContainerImage {
        repo_tag: "123456789012.dkr.ecr.eu-west-1.amazonaws.com/gc/algorithms/algorithmimage:5d1b7c4e"
            .to_string(),
        requires_gpu,
        requires_memory_gb: memory_gb,
    }
}

/// Create and store a pending algorithm job
pub fn create_job(harness: &Harness, memory_gb: f64, inputs: Vec<ComponentInterfaceValue>) -> ComponentJob {
    let job = ComponentJob::new(
        JobKind::AlgorithmsJob,
        container(memory_gb, false),
        inputs,
        &harness.config.job,
    );
    harness.store.insert(&job);
    job
}
