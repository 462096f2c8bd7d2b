use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use recordcopy::config::{AppConfig, StatusChannelKind};
use recordcopy::core::{
    AutoConfirm, ConfirmPrompt, Confirmer, CopyOutcome, DirectoryCache, JobIdentity, JobPhase,
    JobState,
};
use recordcopy::logging::{self, LogConfig};
use recordcopy::session::{CopySession, SessionDeps};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "recordcopy")]
#[command(about = "Copy a content record to another workspace and follow the job", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// List destination workspaces and their environments
    Workspaces(WorkspacesArgs),
    /// Copy a record and wait for the job to finish
    Copy(CopyArgs),
    /// Follow job status for a record until interrupted
    Watch(RecordArgs),
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    copy_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, value_enum)]
    status_channel: Option<StatusChannelKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct WorkspacesArgs {
    #[arg(long)]
    source_workspace: String,
}

#[derive(Args)]
struct RecordArgs {
    #[arg(long)]
    record: String,

    #[arg(long)]
    source_workspace: String,

    #[arg(long)]
    source_environment: String,
}

impl RecordArgs {
    fn identity(&self) -> JobIdentity {
        JobIdentity::new(&self.record, &self.source_workspace, &self.source_environment)
    }
}

#[derive(Args)]
struct CopyArgs {
    #[command(flatten)]
    record: RecordArgs,

    #[arg(long)]
    workspace: Option<String>,

    #[arg(long)]
    environment: Option<String>,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    yes: bool,
}

/// Asks on the terminal.
struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        let message = prompt.message();
        tokio::task::spawn_blocking(move || {
            use std::io::{Write, stdin, stdout};

            print!("{} [y/N] ", message);
            if stdout().flush().is_err() {
                return false;
            }
            let mut input = String::new();
            if stdin().read_line(&mut input).is_err() {
                return false;
            }
            input.trim().eq_ignore_ascii_case("y")
        })
        .await
        .unwrap_or(false)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match &cli.command {
        Commands::Workspaces(args) => run_workspaces(&config, args)
            .await
            .context("Failed to list workspaces"),
        Commands::Copy(args) => run_copy(&config, args).await.context("Copy failed"),
        Commands::Watch(args) => run_watch(&config, args)
            .await
            .context("Failed to watch job status"),
    }
}

async fn run_workspaces(config: &AppConfig, args: &WorkspacesArgs) -> Result<()> {
    let deps = SessionDeps::from_config(config, Arc::new(AutoConfirm(false)))?;
    let mut directory = DirectoryCache::new(deps.directory, args.source_workspace.clone());
    directory.refresh().await?;

    let ids: Vec<String> = directory
        .list_workspaces()
        .iter()
        .map(|entry| entry.id.clone())
        .collect();

    for id in ids {
        let environments = directory.list_environments(&id).await?;
        let name = directory
            .workspace(&id)
            .map_or(id.as_str(), |entry| entry.name.as_str());
        println!("{} ({})", name, id);
        for env in environments {
            println!("    {} ({})", env.name, env.id);
        }
    }

    Ok(())
}

async fn run_copy(config: &AppConfig, args: &CopyArgs) -> Result<()> {
    let confirmer: Arc<dyn Confirmer> = if args.yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(TerminalConfirmer)
    };
    let deps = SessionDeps::from_config(config, confirmer)?;
    let mut session = CopySession::mount(args.record.identity(), config, deps).await;

    if let Some(reason) = session.orchestrator().directory().unavailable_reason() {
        bail!("workspace directory unavailable: {}", reason);
    }
    if let Some(workspace) = &args.workspace {
        session.orchestrator_mut().select_workspace(workspace).await?;
    }
    if let Some(environment) = &args.environment {
        session
            .orchestrator_mut()
            .select_environment(environment)?;
    }

    let selection = session.orchestrator().selection().clone();
    println!(
        "Space: {}  Environment: {}",
        selection.workspace_id, selection.environment_id
    );

    match session.request_copy().await? {
        CopyOutcome::Declined => {
            println!("Copy cancelled");
            Ok(())
        }
        CopyOutcome::Started(job_id) => {
            println!("Copy job {} accepted", job_id);
            let last = follow(session.watch_state(), true).await?;
            session.unmount();
            match last.phase {
                JobPhase::Failed(reason) => bail!("job failed: {}", reason),
                _ => Ok(()),
            }
        }
    }
}

async fn run_watch(config: &AppConfig, args: &RecordArgs) -> Result<()> {
    let deps = SessionDeps::from_config(config, Arc::new(AutoConfirm(false)))?;
    let mut session = CopySession::mount(args.identity(), config, deps).await;

    tokio::select! {
        result = follow(session.watch_state(), false) => { result?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    session.unmount();
    Ok(())
}

/// Print every state change. Returns the terminal state when `until_terminal` is set.
async fn follow(mut rx: watch::Receiver<JobState>, until_terminal: bool) -> Result<JobState> {
    loop {
        let state = rx.borrow_and_update().clone();
        println!("{}", describe(&state));

        if until_terminal && state.phase.is_terminal() {
            return Ok(state);
        }
        if rx.changed().await.is_err() {
            bail!("status channel closed");
        }
    }
}

fn describe(state: &JobState) -> String {
    match &state.phase {
        JobPhase::Idle => "Idle".to_string(),
        JobPhase::Exporting(p) => format!("Exporting... {} Entries", p.total),
        JobPhase::QueuedAt(position) => format!("Queued at position {}", position),
        JobPhase::Importing(p) => format!("Copying... {} of {} Entries", p.processed, p.total),
        JobPhase::Done(at) => format!("Copy content successful! ({})", at.to_rfc3339()),
        JobPhase::Failed(reason) => format!("Something went wrong: {}", reason),
    }
}
