use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use excon_protocol::{CommandInfo, ContainerId, ExecutorInfo, Resources};
use excon_runtime::{Containerizer, ExconConfig, LaunchSpec, RecoveryState, RunState, Sandbox};
use tracing_subscriber::{EnvFilter, fmt};

const STATE_FILE: &str = "recovery.json";

#[derive(Parser)]
#[command(
    name = "excon",
    about = "excon - run containers through an external containerizer helper"
)]
struct Cli {
    /// Path to excon.toml (default: ./excon.toml, then ~/.excon/excon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a container, wait for it to terminate and print the
    /// termination as JSON. Ctrl-C destroys the container.
    Run {
        #[arg(long)]
        container_id: String,

        /// Sandbox directory, created if missing
        #[arg(long)]
        directory: PathBuf,

        /// Run every helper invocation as this user
        #[arg(long)]
        user: Option<String>,

        #[arg(long, default_value = "default")]
        executor_id: String,

        #[arg(long, default_value = "excon")]
        framework_id: String,

        /// Executor command, run by the helper inside the container
        #[arg(long, default_value = "/bin/true")]
        command: String,

        #[arg(long)]
        cpus: Option<f64>,

        /// Memory in MB
        #[arg(long)]
        mem: Option<f64>,
    },
    /// Take over containers from a previous run and wait for them
    Recover {
        /// Recovery state file (default: <agent.work_dir>/recovery.json)
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output, so logs go to stderr
    fmt()
        .with_env_filter(EnvFilter::from_env("EXCON_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Run {
            container_id,
            directory,
            user,
            executor_id,
            framework_id,
            command,
            cpus,
            mem,
        } => {
            let mut resources = Resources::new();
            if let Some(cpus) = cpus {
                resources = resources.with("cpus", cpus);
            }
            if let Some(mem) = mem {
                resources = resources.with("mem", mem);
            }
            let executor = ExecutorInfo {
                executor_id,
                framework_id,
                name: None,
                command: CommandInfo {
                    value: command,
                    arguments: Vec::new(),
                    environment: BTreeMap::new(),
                },
                resources,
            };
            run(&config, ContainerId::new(container_id), directory, user, executor).await
        }
        Command::Recover { state } => {
            let state = state.unwrap_or_else(|| config.agent.work_dir.join(STATE_FILE));
            recover(&config, &state).await
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ExconConfig> {
    match path {
        Some(path) => ExconConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => ExconConfig::discover().context("failed to load config"),
    }
}

async fn run(
    config: &ExconConfig,
    id: ContainerId,
    directory: PathBuf,
    user: Option<String>,
    executor: ExecutorInfo,
) -> Result<()> {
    if id.is_empty() {
        bail!("--container-id must not be empty");
    }
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("failed to create sandbox {}", directory.display()))?;
    let directory = std::path::absolute(&directory)?;
    let sandbox = Sandbox::new(&directory, user.clone());

    let state_path = config.agent.work_dir.join(STATE_FILE);
    update_state(&state_path, |state| {
        state.runs.retain(|run| run.container_id != id);
        state.runs.push(RunState {
            container_id: id.clone(),
            directory: directory.clone(),
            user: user.clone(),
            completed: false,
        });
    })?;

    let containerizer = Containerizer::from_config(config);
    tracing::info!(container_id = %id, helper = %config.helper.path.display(), "Launching");

    let launch = containerizer.launch(LaunchSpec {
        container_id: id.clone(),
        task_info: None,
        executor_info: executor,
        sandbox,
        agent_id: config.agent.id.clone(),
        agent_pid: config.agent.pid.clone(),
        checkpoint: false,
    });
    // Registered before the launch completes so a container that exits
    // immediately is still observed.
    let waiter = containerizer.wait(&id);
    launch
        .await
        .with_context(|| format!("failed to launch container {id}"))?;
    tokio::pin!(waiter);
    let termination = tokio::select! {
        outcome = &mut waiter => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(container_id = %id, "Interrupted, destroying container");
            if let Err(e) = containerizer.destroy(&id).await {
                tracing::warn!(container_id = %id, "Destroy failed: {e}");
            }
            waiter.await
        }
    };

    update_state(&state_path, |state| {
        for run in state.runs.iter_mut().filter(|run| run.container_id == id) {
            run.completed = true;
        }
    })?;

    let termination = termination.with_context(|| format!("container {id} failed"))?;
    println!("{}", serde_json::to_string(&termination)?);
    Ok(())
}

async fn recover(config: &ExconConfig, state_path: &Path) -> Result<()> {
    let state = RecoveryState::load(state_path)?;
    let containerizer = Containerizer::from_config(config);
    containerizer.recover(state).await?;

    let mut ids: Vec<ContainerId> = containerizer.containers().await?.into_iter().collect();
    ids.sort();
    println!("{}", serde_json::to_string(&ids)?);

    let waiters: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let termination = containerizer.wait(&id);
            tokio::spawn(async move { (id, termination.await) })
        })
        .collect();

    for waiter in waiters {
        let (id, outcome) = waiter.await?;
        let line = match outcome {
            Ok(termination) => {
                serde_json::json!({ "container_id": id, "termination": termination })
            }
            Err(e) => {
                tracing::warn!(container_id = %id, "Wait failed: {e}");
                serde_json::json!({ "container_id": id, "error": e.to_string() })
            }
        };
        println!("{line}");
        update_state(state_path, |state| {
            for run in state.runs.iter_mut().filter(|run| run.container_id == id) {
                run.completed = true;
            }
        })?;
    }
    Ok(())
}

/// Read-modify-write the recovery state file.
fn update_state(path: &Path, change: impl FnOnce(&mut RecoveryState)) -> Result<()> {
    let mut state = RecoveryState::load(path)?.unwrap_or_default();
    change(&mut state);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    state
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
