//! weft - 1 project の task graph を複数 worker で回すための CLI
//!
//! 状態は `--dir` 配下の `<project>.json` に置きます。
//! 出力はすべて stdout への JSON、ログは stderr です。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_core::CoordinationConfig;
use weft_core::app::{Coordinator, ReaperLoop, TaskDraft};
use weft_core::domain::{Priority, RegisterRequest, TaskId, WorkerId};
use weft_core::impls::JsonFileStore;
use weft_core::ports::SystemClock;

#[derive(Debug, Parser)]
#[command(name = "weft", version, about = "Dependency-aware task coordination")]
struct Cli {
    /// TOML config; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding project files
    #[arg(long, global = true, default_value = ".weft")]
    dir: PathBuf,

    #[arg(long, short, global = true, default_value = "default")]
    project: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty project
    Init,
    AddTask {
        title: String,
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
        /// Estimated duration in minutes
        #[arg(long)]
        estimate: Option<u64>,
        #[arg(long = "depends-on")]
        depends_on: Vec<TaskId>,
        #[arg(long = "requires")]
        requires: Vec<String>,
    },
    /// Add or remove a dependency edge (`task` waits on `on`)
    Depend {
        task: TaskId,
        on: TaskId,
        #[arg(long)]
        remove: bool,
    },
    /// Print readiness, depths and the critical path
    Graph,
    /// Propose assignments of ready tasks to live workers
    Allocate,
    Register {
        name: String,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    Heartbeat {
        worker: WorkerId,
    },
    Deregister {
        worker: WorkerId,
    },
    Claim {
        task: TaskId,
        worker: WorkerId,
    },
    Release {
        task: TaskId,
        worker: WorkerId,
    },
    Complete {
        task: TaskId,
        worker: WorkerId,
    },
    Fail {
        task: TaskId,
        worker: WorkerId,
    },
    /// Remove stale sessions once and release their claims
    Sweep,
    /// Sweep periodically until ctrl-c
    Reap {
        /// Overrides `sweep_interval_ms`
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

type CliCoordinator = Coordinator<JsonFileStore, SystemClock>;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<CoordinationConfig> {
    match path {
        Some(path) => CoordinationConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(CoordinationConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,weft_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    if matches!(cli.command, Command::Init) {
        tokio::fs::create_dir_all(&cli.dir)
            .await
            .with_context(|| format!("creating {}", cli.dir.display()))?;
    }

    let coordinator = Coordinator::new(
        JsonFileStore::new(&cli.dir),
        SystemClock,
        config,
        cli.project.as_str(),
    );

    run(coordinator, cli.command).await
}

async fn run(coordinator: CliCoordinator, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            coordinator.init().await?;
            info!(project = coordinator.project(), "project created");
        }
        Command::AddTask {
            title,
            priority,
            estimate,
            depends_on,
            requires,
        } => {
            let mut draft = TaskDraft::new(title).with_priority(priority.into());
            if let Some(minutes) = estimate {
                draft = draft.with_estimated_duration(minutes);
            }
            for dep in depends_on {
                draft = draft.depends_on(dep);
            }
            for capability in requires {
                draft = draft.with_required_capability(capability);
            }
            print_json(&coordinator.add_task(draft).await?)?;
        }
        Command::Depend { task, on, remove } => {
            if remove {
                coordinator.remove_dependency(task, on).await?;
            } else {
                coordinator.add_dependency(task, on).await?;
            }
            let snapshot = coordinator.snapshot().await?;
            let updated = snapshot
                .tasks
                .iter()
                .find(|t| t.id == task)
                .with_context(|| format!("{task} vanished after update"))?;
            print_json(updated)?;
        }
        Command::Graph => print_json(&coordinator.graph().await?)?,
        Command::Allocate => print_json(&coordinator.allocate().await?)?,
        Command::Register {
            name,
            capabilities,
            max_concurrent,
        } => {
            let mut request = RegisterRequest::new(name);
            for capability in capabilities {
                request = request.with_capability(capability);
            }
            if let Some(max) = max_concurrent {
                request = request.with_max_concurrent_tasks(max);
            }
            print_json(&coordinator.register(request).await?)?;
        }
        Command::Heartbeat { worker } => print_json(&coordinator.heartbeat(worker).await?)?,
        Command::Deregister { worker } => print_json(&coordinator.deregister(worker).await?)?,
        Command::Claim { task, worker } => print_json(&coordinator.claim(task, worker).await?)?,
        Command::Release { task, worker } => {
            print_json(&coordinator.release(task, worker).await?)?
        }
        Command::Complete { task, worker } => {
            print_json(&coordinator.complete(task, worker).await?)?
        }
        Command::Fail { task, worker } => print_json(&coordinator.fail(task, worker).await?)?,
        Command::Sweep => print_json(&coordinator.sweep().await?)?,
        Command::Reap { interval_ms } => {
            let interval = interval_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| coordinator.config().sweep_interval());
            let coordinator = Arc::new(coordinator);
            info!(
                project = coordinator.project(),
                interval_ms = interval.as_millis() as u64,
                "reaper started"
            );
            let reaper = ReaperLoop::spawn(Arc::clone(&coordinator), interval);
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            reaper.shutdown_and_join().await;
            info!(project = coordinator.project(), "reaper stopped");
        }
    }
    Ok(())
}
