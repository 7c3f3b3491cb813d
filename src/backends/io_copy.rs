//! Executor that copies a job's inputs to its output location
//!
//! Nothing is run remotely, so the attempt is complete when `execute`
//! returns. Useful for exercising the job lifecycle without provisioning
//! compute.

use chrono::{Duration, Utc};
use log::{debug, info};
use std::collections::BTreeMap;

use super::clients::BackendClients;
use super::common::{ExecutorParams, Outcome, RuntimeMetrics};
use super::executor::Executor;
use super::invocation::safe_join;
use crate::config::ExecutorConfig;
use crate::errors::ExecutorError;
use crate::values::{ComponentInterfaceValue, ValueReference};

pub struct IoCopyExecutor {
    params: ExecutorParams,
    output_bucket_name: String,
    clients: BackendClients,
    duration: Option<Duration>,
    stdout: String,
}

impl IoCopyExecutor {
    pub fn new(
        params: ExecutorParams,
        clients: BackendClients,
        config: &ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        Ok(Self {
            params,
            output_bucket_name: config.output_bucket_name.clone(),
            clients,
            duration: None,
            stdout: String::new(),
        })
    }

    fn output_key(&self, relative_path: &str) -> Result<String, ExecutorError> {
        let prefix = self.params.descriptor.invocation_prefix();
        safe_join(Some(&prefix), relative_path)
    }

    fn copy_input(
        &self,
        input: &ComponentInterfaceValue,
        input_prefixes: &BTreeMap<i64, String>,
    ) -> Result<String, ExecutorError> {
        input.validate().map_err(ExecutorError::InvalidInput)?;

        let relative_path = safe_join(
            input_prefixes.get(&input.id).map(String::as_str),
            &input.relative_path(),
        )?;
        let key = self.output_key(&relative_path)?;

        let body = match &input.value {
            ValueReference::Inline { value } => serde_json::to_vec(value)?,
            ValueReference::File { bucket, key } | ValueReference::Image { bucket, key, .. } => {
                self.clients.storage.get(bucket, key)?
            }
        };
        self.clients
            .storage
            .put(&self.output_bucket_name, &key, body)?;

        debug!("Copied value {} to s3://{}/{}", input.id, self.output_bucket_name, key);
        Ok(key)
    }
}

impl Executor for IoCopyExecutor {
    fn backend_name(&self) -> &'static str {
        "io_copy"
    }

    fn is_event_driven(&self) -> bool {
        false
    }

    fn params(&self) -> &ExecutorParams {
        &self.params
    }

    fn execute(
        &mut self,
        inputs: &[ComponentInterfaceValue],
        input_prefixes: &BTreeMap<i64, String>,
    ) -> Result<Outcome, ExecutorError> {
        let started = Utc::now();

        let mut copied = Vec::with_capacity(inputs.len());
        for input in inputs {
            copied.push(self.copy_input(input, input_prefixes)?);
        }

        self.duration = Some(Utc::now() - started);
        info!(
            "Copied {} inputs of {}",
            copied.len(),
            self.params.descriptor
        );
        self.stdout = copied
            .into_iter()
            .map(|key| format!("Copied {}", key))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Outcome::Success)
    }

    fn handle_event(&mut self, _event: &serde_json::Value) -> Result<Outcome, ExecutorError> {
        Err(ExecutorError::NotEventDriven(self.backend_name()))
    }

    fn deprovision(&mut self) -> Result<Outcome, ExecutorError> {
        // The copies are the job's outputs and stay in place
        Ok(Outcome::Success)
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn runtime_metrics(&self) -> Option<&RuntimeMetrics> {
        None
    }

    fn stdout(&self) -> &str {
        &self.stdout
    }

    fn stderr(&self) -> &str {
        ""
    }

    fn usd_cents_per_hour(&self) -> Result<u32, ExecutorError> {
        Ok(0)
    }
}
