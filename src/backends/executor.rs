//! The executor abstraction implemented by every backend

use chrono::Duration;
use std::collections::BTreeMap;

use super::common::{ExecutorParams, Outcome, RuntimeMetrics};
use crate::config::CostConfig;
use crate::errors::ExecutorError;
use crate::values::ComponentInterfaceValue;

/// Drives one attempt of one job on a compute backend
///
/// An executor is built for a single attempt and discarded afterwards;
/// submission and event handling happen in separate task invocations with
/// separate executor instances, connected only through the job record and the
/// remote job name.
pub trait Executor: Send {
    /// Identifier of the backend, used in log messages
    fn backend_name(&self) -> &'static str;

    /// Whether completion is reported through [`Executor::handle_event`]
    /// rather than being known when `execute` returns
    fn is_event_driven(&self) -> bool;

    fn params(&self) -> &ExecutorParams;

    /// Submit the attempt. `input_prefixes` maps interface value ids to the
    /// directory the value is placed under.
    fn execute(
        &mut self,
        inputs: &[ComponentInterfaceValue],
        input_prefixes: &BTreeMap<i64, String>,
    ) -> Result<Outcome, ExecutorError>;

    /// Interpret a state change event reported by the backend
    fn handle_event(&mut self, event: &serde_json::Value) -> Result<Outcome, ExecutorError>;

    /// Stop anything still running and remove the attempt's objects. Safe to
    /// call more than once.
    fn deprovision(&mut self) -> Result<Outcome, ExecutorError>;

    /// Run time as reported by the backend, if known
    fn duration(&self) -> Option<Duration>;

    fn runtime_metrics(&self) -> Option<&RuntimeMetrics>;

    fn stdout(&self) -> &str;

    fn stderr(&self) -> &str;

    /// Price of the compute used by this attempt
    fn usd_cents_per_hour(&self) -> Result<u32, ExecutorError>;

    /// Compute cost of the attempt in euro millicents, if the duration is known
    fn compute_cost_euro_millicents(&self, costs: &CostConfig) -> Result<Option<u64>, ExecutorError> {
        match self.duration() {
            Some(duration) => Ok(Some(
                costs.euro_millicents(duration, self.usd_cents_per_hour()?),
            )),
            None => Ok(None),
        }
    }
}
