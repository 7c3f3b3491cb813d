//! Operator tool for the component execution backend

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, builder::styling};
use env_logger::Builder;
use log::{LevelFilter, debug};
use std::path::PathBuf;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use uuid::Uuid;

use gc_components::backends::{InstanceCatalog, InstanceType};
use gc_components::config::{ComponentsConfig, ConfigPaths};
use gc_components::naming::{JobDescriptor, JobKind, JobNamer};

const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::Green.on_default().bold())
    .usage(styling::AnsiColor::Green.on_default().bold())
    .literal(styling::AnsiColor::Cyan.on_default().bold())
    .placeholder(styling::AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "gc-components")]
#[command(about = "Inspect job names, instance selection and configuration of the component backend", long_about = None)]
#[command(version)]
#[command(styles = STYLES)]
struct Cli {
    /// Configuration file to use instead of the default locations
    #[arg(short, long, env = "GC_COMPONENTS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(long)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format and parse remote job names
    #[command(subcommand)]
    Name(NameCommands),

    /// Inspect the instance catalog
    #[command(subcommand)]
    Instances(InstanceCommands),

    /// Show, validate or create configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum NameCommands {
    /// Print the remote job name of an attempt
    Format {
        /// Job kind (algorithms-job or evaluation-evaluation)
        #[arg(short, long)]
        kind: JobKind,

        /// Primary key of the job
        #[arg(short, long)]
        pk: Uuid,

        /// Attempt number
        #[arg(short, long, default_value_t = 0)]
        attempt: u8,
    },

    /// Print the job an attempt name refers to
    Parse {
        /// Remote job name
        name: String,
    },
}

#[derive(Args, Debug)]
struct Requirements {
    /// Only consider instances with a GPU
    #[arg(long)]
    gpu: bool,

    /// Memory the job requires, in GB
    #[arg(short, long, default_value_t = 0.0)]
    memory_gb: f64,
}

#[derive(Subcommand, Debug)]
enum InstanceCommands {
    /// List the instances that satisfy the requirements, cheapest first
    List(Requirements),

    /// Print the instance a job with these requirements would run on
    Select(Requirements),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Check the effective configuration
    Validate,

    /// Write a configuration file with the default values
    Init {
        /// Destination of the file
        #[arg(default_value = "gc-components.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List the configuration files that are read, in priority order
    Paths,
}

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "CPUs")]
    cpu: u32,
    #[tabled(rename = "Memory (GB)")]
    memory_gb: f64,
    #[tabled(rename = "GPUs")]
    gpus: String,
    #[tabled(rename = "USD/hour")]
    usd_per_hour: String,
}

impl From<&InstanceType> for InstanceRow {
    fn from(instance: &InstanceType) -> Self {
        let gpus = match instance.gpu_type {
            Some(gpu_type) => format!("{} x {}", instance.gpus, gpu_type),
            None => "-".to_string(),
        };
        Self {
            name: instance.name.clone(),
            cpu: instance.cpu,
            memory_gb: instance.memory_gb,
            gpus,
            usd_per_hour: format!("{:.2}", f64::from(instance.usd_cents_per_hour) / 100.0),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ComponentsConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                bail!("Configuration file {} does not exist", path.display());
            }
            ComponentsConfig::load_from_files(std::slice::from_ref(path))
        }
        None => ComponentsConfig::load(),
    }
}

fn run_name(command: NameCommands, config: &ComponentsConfig) -> Result<()> {
    let namer = JobNamer::new(&config.executor.registry_prefix)?;
    match command {
        NameCommands::Format { kind, pk, attempt } => {
            let descriptor = JobDescriptor::new(kind, pk, attempt);
            println!("{}", namer.format(&descriptor)?);
        }
        NameCommands::Parse { name } => {
            let descriptor = namer.parse(&name)?;
            println!("kind:       {}", descriptor.kind);
            println!("pk:         {}", descriptor.pk);
            println!("attempt:    {}", descriptor.attempt);
            println!("invocation: {}", descriptor.invocation_key());
        }
    }
    Ok(())
}

fn run_instances(command: InstanceCommands) -> Result<()> {
    let catalog = InstanceCatalog::builtin();
    match command {
        InstanceCommands::List(req) => {
            let mut matching = catalog.find_matching(req.gpu, req.memory_gb);
            matching.sort_by_key(|instance| instance.usd_cents_per_hour);
            let rows: Vec<InstanceRow> = matching.into_iter().map(InstanceRow::from).collect();
            let count = rows.len();
            println!("{}", Table::new(rows).with(Style::rounded()));
            println!("{} instances", count);
        }
        InstanceCommands::Select(req) => {
            let instance = catalog.select(req.gpu, req.memory_gb)?;
            println!("{}", Table::new([InstanceRow::from(instance)]).with(Style::rounded()));
        }
    }
    Ok(())
}

fn run_config(command: ConfigCommands, config: &ComponentsConfig) -> Result<()> {
    match command {
        ConfigCommands::Show => print!("{}", config.to_toml()?),
        ConfigCommands::Validate => match config.validate() {
            Ok(()) => println!("Configuration is valid"),
            Err(errors) => {
                for error in &errors {
                    eprintln!("  - {}", error);
                }
                bail!("Configuration has {} errors", errors.len());
            }
        },
        ConfigCommands::Init { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            ComponentsConfig::write_default(&path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommands::Paths => {
            let paths = ConfigPaths::new();
            for path in paths.all_paths() {
                let marker = if path.exists() { "found" } else { "missing" };
                println!("{:8} {}", marker, path.display());
            }
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    let level = match cli.log_level {
        Some(level) => level,
        None => config
            .log_level
            .parse()
            .with_context(|| format!("Invalid log level {:?}", config.log_level))?,
    };
    Builder::from_default_env().filter_level(level).init();
    debug!("Loaded configuration: {:?}", config);

    JobKind::verify_codes()?;

    match cli.command {
        Commands::Name(command) => run_name(command, &config),
        Commands::Instances(command) => run_instances(command),
        Commands::Config(command) => run_config(command, &config),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
