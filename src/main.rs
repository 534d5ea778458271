//! Geo Batch Submit CLI
//!
//! Entry point for the `geo-batch-submit` command-line tool.

use clap::{Parser, Subcommand};
use geo_batch_submit::config::{overrides_to_value, DEFAULT_HOST_CONFIG};
use geo_batch_submit::environment::host_env_snapshot;
use geo_batch_submit::submit::SparkSubmitLauncher;
use geo_batch_submit::{EffectiveConfig, JobRequest, SubmissionPipeline, SubmitError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geo-batch-submit")]
#[command(about = "Submit geospatial batch jobs to the cluster", version)]
struct Cli {
    /// Host config file (default: /etc/geo-batch-submit/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Directory searched for packages and auxiliary files
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Config override, e.g. resources.queue=bigjobs (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job request (JSON or TOML file)
    Submit {
        job: PathBuf,

        /// Write the environment audit to this file
        #[arg(long)]
        audit: Option<PathBuf>,
    },

    /// Prepare a job and print the launch command without submitting
    Plan { job: PathBuf },

    /// Show which identity a job for this user would run under
    ResolveAuth { user: String },

    /// Print the effective configuration
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = load_config(&cli).and_then(|config| match &cli.command {
        Commands::Submit { job, audit } => run_submit(&config, job, audit.as_deref(), cli.json),
        Commands::Plan { job } => run_plan(&config, job, cli.json),
        Commands::ResolveAuth { user } => run_resolve_auth(&config, user, cli.json),
        Commands::Config => run_config(&config),
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if let SubmitError::Submission(submission) = &e {
            eprintln!("{}", submission.diagnostic());
        }
        process::exit(e.exit_code());
    }
}

fn load_config(cli: &Cli) -> Result<EffectiveConfig, SubmitError> {
    let mut overlay = overrides_to_value(cli.overrides.as_slice())?;
    if let Some(dir) = &cli.work_dir {
        let work_dir = overrides_to_value(&[format!("artifacts.work_dir={}", dir.display())])?;
        overlay = geo_batch_submit::config::deep_merge(overlay, work_dir);
    }
    let overlay = match &overlay {
        Value::Object(map) if map.is_empty() => None,
        _ => Some(overlay),
    };

    let host = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_CONFIG));
    if cli.config.is_some() && !host.exists() {
        return Err(geo_batch_submit::ConfigError::IoError(format!(
            "config file not found: {}",
            host.display()
        ))
        .into());
    }

    Ok(EffectiveConfig::build(Some(&host), overlay)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), SubmitError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SubmitError::Io(std::io::Error::other(e)))?;
    println!("{}", json);
    Ok(())
}

fn run_submit(config: &EffectiveConfig, job: &Path, audit: Option<&Path>, json: bool) -> Result<(), SubmitError> {
    let job = JobRequest::from_file(job)?;
    let pipeline = SubmissionPipeline::from_config(config, host_env_snapshot())?;

    let envelope = pipeline.prepare(&job)?;
    if let Some(path) = audit {
        envelope.environment.audit.write_to_file(path)?;
    }
    let handle = pipeline.submit(&envelope)?;

    if json {
        print_json(&handle)
    } else {
        println!("Submitted {} as {}", job.job_id, handle.application_id);
        println!("  Identity: {}", envelope.identity);
        println!("  Envelope: {}", envelope.envelope_key);
        Ok(())
    }
}

fn run_plan(config: &EffectiveConfig, job: &Path, json: bool) -> Result<(), SubmitError> {
    let job = JobRequest::from_file(job)?;
    let pipeline = SubmissionPipeline::from_config(config, host_env_snapshot())?;
    let plan = pipeline.plan(&job)?;

    if json {
        return print_json(&plan);
    }

    let launcher = SparkSubmitLauncher::new(
        config.settings().cluster.clone(),
        pipeline.auth().credential().cloned(),
        config.settings().timeouts.submit(),
    );
    println!("Job: {}", plan.envelope.job_id);
    println!("Identity: {}", plan.envelope.identity);
    println!("Envelope: {}", plan.envelope.envelope_key);
    println!();
    println!("{}", launcher.command_line(&plan.request));
    Ok(())
}

fn run_resolve_auth(config: &EffectiveConfig, user: &str, json: bool) -> Result<(), SubmitError> {
    let pipeline = SubmissionPipeline::from_config(config, host_env_snapshot())?;
    let mode = pipeline.auth().resolve(Some(user))?;

    if json {
        print_json(&mode)
    } else {
        println!("{}", mode);
        Ok(())
    }
}

fn run_config(config: &EffectiveConfig) -> Result<(), SubmitError> {
    let json = config
        .to_json()
        .map_err(|e| SubmitError::Io(std::io::Error::other(e)))?;
    println!("{}", json);
    Ok(())
}
