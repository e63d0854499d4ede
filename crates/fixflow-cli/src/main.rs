//! fixflow CLI.
//!
//! - `demo`: run a batch of synthetic issues through the pipeline with offline capabilities
//! - `status`: read task records from a JSON store directory
//! - `config`: print, initialize, or validate the TOML configuration

mod demo;
mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fixflow_core::app::{Config, OrchestratorBuilder, TaskStatus, load_config, write_config};
use fixflow_core::domain::{TaskId, TaskState};
use fixflow_core::impls::JsonFileTaskStore;
use fixflow_core::ports::TaskStore;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "fixflow.toml";

#[derive(Parser)]
#[command(name = "fixflow", version, about = "Automated issue resolution orchestrator")]
struct Cli {
    /// Config file (defaults apply if it does not exist).
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run synthetic issues end to end and print their outcome.
    Demo {
        /// Directory for task records (JSON). In-memory if omitted.
        #[arg(long)]
        store: Option<PathBuf>,
        /// Overrides `workspace.root`.
        #[arg(long)]
        workspaces: Option<PathBuf>,
        /// Repository name used for the synthetic issues.
        #[arg(long, default_value = "acme/widgets")]
        repository: String,
    },
    /// Print task records from a JSON store directory.
    Status {
        #[arg(long)]
        store: PathBuf,
        /// Only this task.
        task_id: Option<String>,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective config.
    Show,
    /// Write the default config to the config path.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the config file.
    Validate,
}

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            store,
            workspaces,
            repository,
        } => cmd_demo(&cli.config, store, workspaces, &repository).await,
        Command::Status { store, task_id } => cmd_status(&store, task_id.as_deref()).await,
        Command::Config(ConfigCommand::Show) => cmd_config_show(&cli.config),
        Command::Config(ConfigCommand::Init { force }) => cmd_config_init(&cli.config, force),
        Command::Config(ConfigCommand::Validate) => cmd_config_validate(&cli.config),
    }
}

async fn cmd_demo(
    config_path: &Path,
    store: Option<PathBuf>,
    workspaces: Option<PathBuf>,
    repository: &str,
) -> Result<()> {
    let mut config = load_config(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    if let Some(root) = workspaces {
        config.workspace.root = root;
    }

    let mut builder = OrchestratorBuilder::new(config)
        .analyzer(demo::LabelAnalyzer)
        .resolver(demo::NoteResolver)
        .reviewer(demo::RoundReviewer)
        .integrator(demo::LocalIntegrator);
    if let Some(dir) = store {
        builder = builder.task_store(Arc::new(JsonFileTaskStore::new(dir)));
    }
    let orch = builder.build().context("build orchestrator")?;
    let scheduler = orch.start_scheduler();

    let mut ids = Vec::new();
    for spec in demo::issues(repository) {
        let ack = orch.submit(spec).await.context("submit issue")?;
        ids.push(ack.task_id);
    }
    info!(tasks = ids.len(), "demo issues submitted");

    let interrupt = {
        let orch = Arc::clone(&orch);
        let ids = ids.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling demo tasks");
                for task_id in ids {
                    if let Err(err) = orch.cancel(task_id).await {
                        warn!(task_id = %task_id, error = %err, "cancel failed");
                    }
                }
            }
        })
    };

    for task_id in ids {
        let status = orch
            .wait(task_id)
            .await
            .with_context(|| format!("wait for {task_id}"))?;
        print_summary(&status);
    }
    interrupt.abort();
    scheduler.shutdown_and_join().await;

    let counts = orch.counts().await.context("count tasks")?;
    println!(
        "\ncompleted={} escalated={} aborted={}",
        counts.completed, counts.escalated, counts.aborted
    );
    Ok(())
}

fn print_summary(status: &TaskStatus) {
    println!(
        "{} {:<10} {} ({} entries)",
        status.task_id,
        status.state.as_str(),
        status.source,
        status.history.len()
    );
    for entry in &status.history {
        println!(
            "    {:>11} -> {:<11} {:?} attempt={}{}",
            entry.from.as_str(),
            entry.to.as_str(),
            entry.outcome,
            entry.attempt,
            entry
                .reason
                .as_deref()
                .map(|r| format!("  {r}"))
                .unwrap_or_default()
        );
    }
    if let Some(workspace) = &status.workspace
        && status.state != TaskState::Completed
    {
        println!("    workspace kept at {}", workspace.root.display());
    }
}

async fn cmd_status(store_dir: &Path, task_id: Option<&str>) -> Result<()> {
    if !store_dir.is_dir() {
        bail!("store directory not found: {}", store_dir.display());
    }
    let store = JsonFileTaskStore::new(store_dir);

    let records = match task_id {
        Some(raw) => {
            let id: TaskId = raw.parse().with_context(|| format!("parse task id {raw:?}"))?;
            let record = store
                .get(id)
                .await
                .context("read task record")?
                .with_context(|| format!("no record for {id}"))?;
            vec![record]
        }
        None => store.list().await.context("list task records")?,
    };

    let statuses: Vec<TaskStatus> = records.into_iter().map(TaskStatus::from).collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&statuses).context("encode statuses")?
    );
    Ok(())
}

fn cmd_config_show(path: &Path) -> Result<()> {
    let config =
        load_config(path).with_context(|| format!("load config {}", path.display()))?;
    print!("{}", toml::to_string_pretty(&config).context("encode config")?);
    Ok(())
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &Config::default())
        .with_context(|| format!("write config {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn cmd_config_validate(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    load_config(path).with_context(|| format!("validate {}", path.display()))?;
    println!("{} is valid", path.display());
    Ok(())
}
