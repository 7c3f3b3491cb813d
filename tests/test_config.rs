use gc_components::backends::BackendKind;
use gc_components::config::{ComponentsConfig, ConfigPaths};
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn nonexistent_paths() -> ConfigPaths {
    ConfigPaths {
        system: PathBuf::from("/nonexistent/system/config.toml"),
        user: Some(PathBuf::from("/nonexistent/user/config.toml")),
        local: PathBuf::from("/nonexistent/local/gc-components.toml"),
    }
}

// ============== Defaults ==============

#[rstest]
fn test_default_config() {
    let config = ComponentsConfig::default();
    assert_eq!(config.log_level, "info");
    assert_eq!(config.executor.registry_prefix, "gc");
    assert_eq!(config.executor.max_internal_error_attempts, 3);
    assert_eq!(config.job.default_backend, BackendKind::AmazonSageMakerBatch);
    assert_eq!(config.retry.max_step_retries, 10);
    assert_eq!(config.retry.max_capacity_attempts, 10);
}

#[rstest]
fn test_config_paths_new() {
    let paths = ConfigPaths::new();
    assert_eq!(paths.system, PathBuf::from("/etc/gc-components/config.toml"));
    assert_eq!(paths.local, PathBuf::from("gc-components.toml"));
    assert_eq!(paths.all_paths().first(), Some(&paths.system));
    assert_eq!(paths.all_paths().last(), Some(&paths.local));
}

#[rstest]
fn test_existing_paths_only_lists_files_on_disk() {
    assert!(nonexistent_paths().existing_paths().is_empty());

    let temp_dir = TempDir::new().unwrap();
    let user = temp_dir.path().join("config.toml");
    fs::write(&user, "log_level = \"debug\"\n").unwrap();
    let paths = ConfigPaths {
        user: Some(user.clone()),
        ..nonexistent_paths()
    };
    assert_eq!(paths.existing_paths(), vec![user]);
}

// ============== Loading ==============

#[rstest]
fn test_load_returns_defaults_when_no_files() {
    figment::Jail::expect_with(|_jail| {
        let config = ComponentsConfig::load_with_paths(&nonexistent_paths()).unwrap();
        assert_eq!(config, ComponentsConfig::default());
        Ok(())
    });
}

#[rstest]
fn test_load_from_toml_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
log_level = "debug"

[executor]
registry_prefix = "staging"
log_lines = 500

[job]
default_backend = "io_copy"
max_time_limit_secs = 7200

[retry]
base_delay_secs = 5
"#,
    )
    .unwrap();

    let config = ComponentsConfig::load_from_files(&[config_path]).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.executor.registry_prefix, "staging");
    assert_eq!(config.executor.log_lines, 500);
    assert_eq!(config.job.default_backend, BackendKind::IoCopy);
    assert_eq!(config.job.max_time_limit_secs, 7200);
    assert_eq!(config.retry.base_delay_secs, 5);
    // untouched values keep their defaults
    assert_eq!(config.executor.metrics_period_secs, 60);
    assert_eq!(config.retry.max_delay_secs, 600);
}

#[rstest]
fn test_later_files_take_precedence() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("first.toml");
    let second = temp_dir.path().join("second.toml");
    fs::write(
        &first,
        "[executor]\nregistry_prefix = \"first\"\nlog_lines = 100\n",
    )
    .unwrap();
    fs::write(&second, "[executor]\nregistry_prefix = \"second\"\n").unwrap();

    let config = ComponentsConfig::load_from_files(&[first, second]).unwrap();
    assert_eq!(config.executor.registry_prefix, "second");
    assert_eq!(config.executor.log_lines, 100);
}

#[rstest]
fn test_missing_files_are_skipped() {
    let config =
        ComponentsConfig::load_from_files(&[PathBuf::from("/nonexistent/config.toml")]).unwrap();
    assert_eq!(config, ComponentsConfig::default());
}

#[rstest]
fn test_invalid_toml_type_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[executor]\nlog_lines = \"many\"\n").unwrap();

    assert!(ComponentsConfig::load_from_files(&[config_path]).is_err());
}

#[rstest]
fn test_environment_overrides_files() {
    figment::Jail::expect_with(|jail| {
        jail.create_file(
            "gc-components.toml",
            "[executor]\nregistry_prefix = \"from-file\"\nlog_lines = 100\n",
        )?;
        jail.set_env("GC_COMPONENTS_EXECUTOR__REGISTRY_PREFIX", "from-env");
        jail.set_env("GC_COMPONENTS_RETRY__MAX_STEP_RETRIES", "3");

        let paths = ConfigPaths {
            local: jail.directory().join("gc-components.toml"),
            ..nonexistent_paths()
        };
        let config = ComponentsConfig::load_with_paths(&paths).unwrap();
        assert_eq!(config.executor.registry_prefix, "from-env");
        assert_eq!(config.executor.log_lines, 100);
        assert_eq!(config.retry.max_step_retries, 3);
        Ok(())
    });
}

// ============== Validation ==============

#[rstest]
fn test_validate_default_config() {
    assert!(ComponentsConfig::default().validate().is_ok());
}

#[rstest]
#[case::log_level(|c: &mut ComponentsConfig| c.log_level = "loud".to_string(), "log_level")]
#[case::registry_prefix(|c: &mut ComponentsConfig| c.executor.registry_prefix = "-gc".to_string(), "registry_prefix")]
#[case::input_bucket(|c: &mut ComponentsConfig| c.executor.input_bucket_name.clear(), "input_bucket_name")]
#[case::log_lines(|c: &mut ComponentsConfig| c.executor.log_lines = 0, "log_lines")]
#[case::internal_attempts(|c: &mut ComponentsConfig| c.executor.max_internal_error_attempts = 0, "max_internal_error_attempts")]
#[case::time_limits(|c: &mut ComponentsConfig| c.job.min_time_limit_secs = 7200, "min_time_limit_secs")]
#[case::default_time_limit(|c: &mut ComponentsConfig| c.job.default_time_limit_secs = 10, "default_time_limit_secs")]
#[case::max_delay(|c: &mut ComponentsConfig| c.retry.max_delay_secs = 1, "max_delay_secs")]
#[case::capacity_attempts(|c: &mut ComponentsConfig| c.retry.max_capacity_attempts = 100, "max_capacity_attempts")]
#[case::exchange_rate(|c: &mut ComponentsConfig| c.costs.usd_to_eur = 0.0, "usd_to_eur")]
fn test_validate_rejects(#[case] modify: fn(&mut ComponentsConfig), #[case] field: &str) {
    let mut config = ComponentsConfig::default();
    modify(&mut config);

    let errors = config.validate().unwrap_err();
    assert!(
        errors.iter().any(|e| e.contains(field)),
        "no error mentioning {field} in {errors:?}"
    );
}

#[rstest]
fn test_validate_reports_every_problem() {
    let mut config = ComponentsConfig::default();
    config.log_level = "loud".to_string();
    config.executor.log_lines = 0;
    config.costs.tax_rate = -1.0;

    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
}

// ============== Serialization ==============

#[rstest]
fn test_to_toml_lists_every_section() {
    let toml_str = ComponentsConfig::default().to_toml().unwrap();
    for section in ["[executor]", "[job]", "[retry]", "[costs]"] {
        assert!(toml_str.contains(section), "missing {section}");
    }
    assert!(toml_str.contains("default_backend = \"amazon_sagemaker_batch\""));
}

#[rstest]
fn test_roundtrip_serialization() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let mut original = ComponentsConfig::default();
    original.executor.registry_prefix = "roundtrip".to_string();
    original.job.default_backend = BackendKind::IoCopy;
    original.retry.max_capacity_attempts = 4;
    original.costs.tax_rate = 0.19;
    fs::write(&config_path, original.to_toml().unwrap()).unwrap();

    let loaded = ComponentsConfig::load_from_files(&[config_path]).unwrap();
    assert_eq!(loaded, original);
}

#[rstest]
fn test_write_default_creates_parent_directories() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nested").join("config.toml");

    ComponentsConfig::write_default(&config_path).unwrap();

    let loaded = ComponentsConfig::load_from_files(&[config_path]).unwrap();
    assert_eq!(loaded, ComponentsConfig::default());
}
