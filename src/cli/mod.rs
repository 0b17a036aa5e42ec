//! Command-line interface for deploygate.
//!
//! Provides commands for running gated deployments, inspecting run
//! journals, health-checking a pipeline, and clearing stale locks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{LocalProvisioner, PlaybookProvisioner, Provisioner};
use crate::config;
use crate::core::{DeployGate, Journal, Pipeline};
use crate::domain::{LockToken, ProvisionBundle, RunState};
use crate::lock::FileLockService;

/// deploygate - serialize deployments behind a named lock
#[derive(Parser, Debug)]
#[command(name = "deploygate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a gated deployment
    Deploy {
        /// Pipeline name (looks for pipelines/<name>.yaml) or a path to
        /// a pipeline file
        pipeline: String,

        /// Git ref that triggered this deploy; skipped unless it matches
        /// the pipeline's designated branch
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Deploy onto the local filesystem at this web root instead of
        /// invoking the playbook runner
        #[arg(long)]
        local_web_root: Option<PathBuf>,

        /// Environment file destination for --local-web-root
        /// (defaults to <web-root>/.env)
        #[arg(long)]
        local_env_file: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Also print the captured provisioner transcript
        #[arg(short, long)]
        transcript: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Verify a pipeline can deploy: provisioner health, playbook and
    /// inventory presence
    Check {
        /// Pipeline name or path
        pipeline: String,
    },

    /// Clear a stale lock left behind by a dead runner
    Unlock {
        /// Lock token to clear
        token: String,

        /// Required confirmation; breaks mutual exclusion if the holder
        /// is still alive
        #[arg(long)]
        force: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Deploy {
                pipeline,
                git_ref,
                local_web_root,
                local_env_file,
            } => deploy(&pipeline, git_ref, local_web_root, local_env_file).await,
            Commands::Status { run_id, transcript } => status(&run_id, transcript).await,
            Commands::Runs { limit } => runs(limit).await,
            Commands::Check { pipeline } => check(&pipeline).await,
            Commands::Unlock { token, force } => unlock(&token, force),
            Commands::Config => show_config(),
        }
    }
}

/// Resolve a pipeline argument: an existing path wins, otherwise the
/// name is looked up under the configured pipelines directory
fn load_pipeline(arg: &str) -> Result<Pipeline> {
    let as_path = PathBuf::from(arg);
    let path = if as_path.exists() {
        as_path
    } else {
        config::config()?.pipeline_path(arg)
    };

    let pipeline = Pipeline::from_file(&path)?;
    pipeline.validate()?;
    Ok(pipeline)
}

fn build_provisioner(
    local_web_root: Option<PathBuf>,
    local_env_file: Option<PathBuf>,
) -> Result<Arc<dyn Provisioner>> {
    match local_web_root {
        Some(web_root) => {
            let env_file = local_env_file.unwrap_or_else(|| web_root.join(".env"));
            Ok(Arc::new(LocalProvisioner::new(web_root, env_file)))
        }
        None => {
            let binary = config::config()?.gate.ansible_binary.clone();
            Ok(Arc::new(PlaybookProvisioner::with_binary_path(binary)))
        }
    }
}

async fn deploy(
    pipeline_arg: &str,
    git_ref: Option<String>,
    local_web_root: Option<PathBuf>,
    local_env_file: Option<PathBuf>,
) -> Result<()> {
    let pipeline = load_pipeline(pipeline_arg)?;

    if let Some(ref git_ref) = git_ref {
        if !pipeline.matches_ref(git_ref) {
            println!(
                "Skipping: ref '{}' does not match designated branch '{}'",
                git_ref,
                pipeline.branch.as_deref().unwrap_or("<any>")
            );
            return Ok(());
        }
    }

    let bundle = ProvisionBundle::new(&pipeline.playbook, &pipeline.inventory)
        .with_secrets_from_env(&pipeline.secrets)?;

    let locks = Arc::new(FileLockService::new(config::locks_dir()?)?);
    let provisioner = build_provisioner(local_web_root, local_env_file)?;
    let gate = DeployGate::new(locks, provisioner);

    let run = gate.run(&pipeline, bundle, git_ref).await?;

    println!("Run:      {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("Lock:     {}", run.lock_token);
    print_state(&run.state);

    match run.state {
        RunState::Succeeded => Ok(()),
        ref state => anyhow::bail!("deployment did not succeed: {}", state_label(state)),
    }
}

async fn status(run_id: &str, with_transcript: bool) -> Result<()> {
    let run_id = Uuid::parse_str(run_id).context("run ID must be a UUID")?;
    let journal = Journal::open_in(&config::runs_dir()?, run_id).await?;
    let run = journal
        .load_run()
        .await
        .with_context(|| format!("run {} not found", run_id))?;

    println!("Run:      {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("Lock:     {}", run.lock_token);
    if let Some(ref git_ref) = run.git_ref {
        println!("Ref:      {}", git_ref);
    }
    if let Some(ref fingerprint) = run.bundle_fingerprint {
        println!("Bundle:   {}", fingerprint);
    }
    println!("Started:  {}", run.started_at.to_rfc3339());
    if let Some(completed) = run.completed_at {
        println!("Finished: {}", completed.to_rfc3339());
    }
    print_state(&run.state);

    if with_transcript {
        match journal.load_transcript().await? {
            Some(transcript) => {
                println!("\n--- transcript ---");
                println!("{}", transcript);
            }
            None => println!("\n(no transcript captured)"),
        }
    }

    Ok(())
}

async fn runs(limit: usize) -> Result<()> {
    let base = config::runs_dir()?;
    let run_ids = Journal::list_runs_in(&base).await?;

    let mut runs = Vec::new();
    for run_id in run_ids {
        let journal = Journal::open_in(&base, run_id).await?;
        if let Ok(run) = journal.load_run().await {
            runs.push(run);
        }
    }

    // Most recent first
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {}  {}  {}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.pipeline_name,
            state_label(&run.state)
        );
    }

    Ok(())
}

async fn check(pipeline_arg: &str) -> Result<()> {
    let pipeline = load_pipeline(pipeline_arg)?;

    if !pipeline.playbook.exists() {
        anyhow::bail!("playbook not found: {}", pipeline.playbook.display());
    }
    if !pipeline.inventory.exists() {
        anyhow::bail!("inventory not found: {}", pipeline.inventory.display());
    }

    let binary = config::config()?.gate.ansible_binary.clone();
    let provisioner = PlaybookProvisioner::with_binary_path(binary);
    provisioner
        .health_check()
        .await
        .context("playbook runner health check failed")?;

    println!("Pipeline '{}' is deployable.", pipeline.name);
    Ok(())
}

fn unlock(token: &str, force: bool) -> Result<()> {
    if !force {
        anyhow::bail!("refusing to clear lock '{}' without --force", token);
    }

    let locks = FileLockService::new(config::locks_dir()?)?;
    locks.force_unlock(&LockToken::from(token))?;
    println!("Lock '{}' cleared.", token);
    Ok(())
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("Home:      {}", config.home.display());
    println!("Runs:      {}", config.runs_dir().display());
    println!("Locks:     {}", config.locks_dir().display());
    println!("Pipelines: {}", config.pipelines.display());
    match &config.config_file {
        Some(path) => println!("Config:    {}", path.display()),
        None => println!("Config:    (none found, using defaults)"),
    }
    println!("Ceiling:   {}s (default)", config.gate.timeout_seconds);
    println!("Runner:    {}", config.gate.ansible_binary);
    Ok(())
}

fn print_state(state: &RunState) {
    println!("State:    {}", state_label(state));
    if let RunState::Failed { error } = state {
        println!("Error:    {}", error);
    }
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Waiting => "waiting",
        RunState::Provisioning => "provisioning",
        RunState::Succeeded => "succeeded",
        RunState::Failed { .. } => "failed",
        RunState::TimedOut => "timed out",
        RunState::Superseded => "superseded",
    }
}
