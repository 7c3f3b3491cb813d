//! Configuration management
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. System config (`/etc/gc-components/config.toml`)
//! 3. User config (`~/.config/gc-components/config.toml`)
//! 4. Local config (`gc-components.toml` in the working directory)
//! 5. Environment variables (`GC_COMPONENTS_<SECTION>__<KEY>`)

mod executor;
mod job;

pub use executor::ExecutorConfig;
pub use job::{CostConfig, JobConfig, RetryConfig};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::naming::{JobNamer, MAX_ATTEMPT};

const ENV_PREFIX: &str = "GC_COMPONENTS_";
const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComponentsConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    pub executor: ExecutorConfig,

    pub job: JobConfig,

    pub retry: RetryConfig,

    pub costs: CostConfig,
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            executor: ExecutorConfig::default(),
            job: JobConfig::default(),
            retry: RetryConfig::default(),
            costs: CostConfig::default(),
        }
    }
}

/// Locations searched for configuration files
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub user: Option<PathBuf>,
    pub local: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPaths {
    pub fn new() -> Self {
        Self {
            system: PathBuf::from("/etc/gc-components/config.toml"),
            user: dirs::config_dir().map(|d| d.join("gc-components").join("config.toml")),
            local: PathBuf::from("gc-components.toml"),
        }
    }

    /// All configured paths in priority order (lowest first)
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.system.clone()];
        if let Some(user) = &self.user {
            paths.push(user.clone());
        }
        paths.push(self.local.clone());
        paths
    }

    /// The configured paths that exist on disk, in priority order
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        self.all_paths().into_iter().filter(|p| p.exists()).collect()
    }
}

impl ComponentsConfig {
    /// Load configuration from the default locations and the environment
    pub fn load() -> Result<Self> {
        Self::load_with_paths(&ConfigPaths::new())
    }

    pub fn load_with_paths(paths: &ConfigPaths) -> Result<Self> {
        Self::figment_for_files(&paths.existing_paths())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load configuration")
    }

    /// Load configuration from the given files only, later files taking
    /// precedence. Missing files are skipped.
    pub fn load_from_files(files: &[PathBuf]) -> Result<Self> {
        Self::figment_for_files(files)
            .extract()
            .context("Failed to load configuration")
    }

    fn figment_for_files(files: &[PathBuf]) -> Figment {
        files.iter().fold(
            Figment::from(Serialized::defaults(ComponentsConfig::default())),
            |figment, path| figment.merge(Toml::file(path)),
        )
    }

    /// Validate the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(format!(
                "log_level must be one of {:?}, got {:?}",
                VALID_LOG_LEVELS, self.log_level
            ));
        }

        if let Err(e) = JobNamer::new(&self.executor.registry_prefix) {
            errors.push(format!("executor.registry_prefix: {}", e));
        }
        if self.executor.input_bucket_name.is_empty() {
            errors.push("executor.input_bucket_name must not be empty".to_string());
        }
        if self.executor.output_bucket_name.is_empty() {
            errors.push("executor.output_bucket_name must not be empty".to_string());
        }
        if self.executor.log_lines == 0 {
            errors.push("executor.log_lines must be positive".to_string());
        }
        if self.executor.metrics_period_secs == 0 {
            errors.push("executor.metrics_period_secs must be positive".to_string());
        }
        if !(1..=MAX_ATTEMPT).contains(&self.executor.max_internal_error_attempts) {
            errors.push(format!(
                "executor.max_internal_error_attempts must be between 1 and {}",
                MAX_ATTEMPT
            ));
        }

        let job = &self.job;
        if job.min_time_limit_secs == 0 {
            errors.push("job.min_time_limit_secs must be positive".to_string());
        }
        if job.min_time_limit_secs > job.max_time_limit_secs {
            errors.push("job.min_time_limit_secs must not exceed job.max_time_limit_secs".to_string());
        }
        if !(job.min_time_limit_secs..=job.max_time_limit_secs).contains(&job.default_time_limit_secs)
        {
            errors.push("job.default_time_limit_secs must lie within the time limit bounds".to_string());
        }

        if self.retry.base_delay_secs == 0 {
            errors.push("retry.base_delay_secs must be positive".to_string());
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            errors.push("retry.max_delay_secs must not be less than retry.base_delay_secs".to_string());
        }
        if !(1..=MAX_ATTEMPT).contains(&self.retry.max_capacity_attempts) {
            errors.push(format!(
                "retry.max_capacity_attempts must be between 1 and {}",
                MAX_ATTEMPT
            ));
        }

        if self.costs.usd_to_eur <= 0.0 {
            errors.push("costs.usd_to_eur must be positive".to_string());
        }
        if self.costs.tax_rate < 0.0 {
            errors.push("costs.tax_rate must not be negative".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, Self::default().to_toml()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
