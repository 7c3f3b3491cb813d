//! Component job execution backend for Grand Challenge
//!
//! Algorithm and evaluation jobs are submitted to a compute backend, the
//! backend's completion events are interpreted, and the job records are driven
//! through their lifecycle with retries, cancellation and cost accounting.

pub mod backends;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod naming;
pub mod tasks;
pub mod values;

pub use backends::{BackendClients, BackendKind, Executor, Outcome, create_executor};
pub use config::ComponentsConfig;
pub use jobs::{ComponentJob, JobStatus, JobStore, StatusUpdate};
pub use naming::{JobDescriptor, JobKind, JobNamer};
pub use tasks::{Task, TaskQueue, TaskRunner};
