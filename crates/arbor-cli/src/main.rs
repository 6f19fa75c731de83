//! CLI binary for validating Arbor plans and simulating their execution
//! against the in-memory store. A simulation can be stopped with its state
//! saved to disk and resumed later.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use arbor_engine::{
    Edition, EngineConfig, InMemoryStore, OrchestrationEngine, OrchestrationEvent, Plan,
    QueuedTaskExecutor, Severity, StartRequest, StaticLicenseClient,
};
use arbor_types::{
    ExecutableResponse, Interrupt, InterruptConfig, InterruptType, PlanExecution, Status,
};

#[derive(Parser)]
#[command(name = "arbor", version, about = "Hierarchical plan execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan YAML file
    Validate {
        /// Path to the plan file
        plan: PathBuf,
    },

    /// Show the admission limits in effect for each edition
    Limits {
        /// Engine config YAML (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a plan to completion against an in-memory store
    Simulate {
        /// Path to the plan file
        plan: PathBuf,

        /// Engine config YAML
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Edition reported for the simulated account
        #[arg(long, value_enum, default_value = "free")]
        edition: EditionArg,

        /// Execution input YAML given to every node that waits for input.
        /// Nodes continue with template defaults when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Report every task as failed instead of succeeded
        #[arg(long)]
        fail_tasks: bool,

        /// Abort the execution after this many rounds of external completions
        #[arg(long)]
        abort_after: Option<u32>,

        /// Stop after this many rounds and leave the rest for `arbor resume`
        #[arg(long, requires = "state")]
        stop_after: Option<u32>,

        /// Directory the store and pending waits are saved to
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Continue a simulation saved with `simulate --state`
    Resume {
        /// Directory holding the saved state
        state: PathBuf,

        /// Engine config YAML
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Edition reported for the simulated account
        #[arg(long, value_enum, default_value = "free")]
        edition: EditionArg,

        /// Execution input YAML given to every node that waits for input
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Report every task as failed instead of succeeded
        #[arg(long)]
        fail_tasks: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EditionArg {
    Free,
    Team,
    Enterprise,
}

impl From<EditionArg> for Edition {
    fn from(arg: EditionArg) -> Self {
        match arg {
            EditionArg::Free => Edition::Free,
            EditionArg::Team => Edition::Team,
            EditionArg::Enterprise => Edition::Enterprise,
        }
    }
}

const ACCOUNT: &str = "local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Validate { plan } => cmd_validate(&plan)?,
        Commands::Limits { config } => cmd_limits(config.as_deref()).await?,
        Commands::Simulate {
            plan,
            config,
            edition,
            input,
            fail_tasks,
            abort_after,
            stop_after,
            state,
        } => {
            let options = SimulateOptions {
                edition: edition.into(),
                input: read_input(input.as_deref())?,
                fail_tasks,
                abort_after,
                stop_after,
                state,
            };
            cmd_simulate(&plan, config.as_deref(), options).await?;
        }
        Commands::Resume {
            state,
            config,
            edition,
            input,
            fail_tasks,
        } => {
            let options = SimulateOptions {
                edition: edition.into(),
                input: read_input(input.as_deref())?,
                fail_tasks,
                abort_after: None,
                stop_after: None,
                state: Some(state),
            };
            cmd_resume(config.as_deref(), options).await?;
        }
    }

    Ok(())
}

fn read_input(path: Option<&Path>) -> anyhow::Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
        )),
        None => Ok(None),
    }
}

fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let source =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Plan::from_yaml_str(&source)?)
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::load(path).await?),
        None => Ok(EngineConfig::default()),
    }
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let plan = load_plan(path)?;
    let diagnostics = arbor_engine::validate(&plan);

    if diagnostics.is_empty() {
        println!("Plan is valid ({} nodes)", plan.nodes.len());
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.node_id {
            Some(node) => println!("[{severity}] {} ({node}): {}", diag.rule, diag.message),
            None => println!("[{severity}] {}: {}", diag.rule, diag.message),
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_limits(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config).await?;
    let r = &config.restrictions;

    println!(
        "{:<12} {:>10} {:>14} {:>16} {:>16} {:>12}",
        "EDITION", "ENFORCED", "RUNNING/PIPE", "PIPELINES", "MAX_CONCURRENCY", "STOP_AT"
    );
    for edition in [Edition::Free, Edition::Team, Edition::Enterprise] {
        println!(
            "{:<12} {:>10} {:>14} {:>16} {:>16} {:>12}",
            edition.to_string(),
            r.uses_restriction(edition),
            r.plan_execution_restriction.for_edition(edition),
            r.pipeline_creation_restriction.for_edition(edition),
            r.max_concurrency_restriction.for_edition(edition),
            r.total_parallelism_stop_restriction.for_edition(edition),
        );
    }
    println!("\nLicense cache TTL: {}s", config.license_cache_ttl_secs);
    println!("Interrupt batch size: {}", config.interrupt_batch_size);
    Ok(())
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

struct SimulateOptions {
    edition: Edition,
    input: Option<String>,
    fail_tasks: bool,
    abort_after: Option<u32>,
    stop_after: Option<u32>,
    state: Option<PathBuf>,
}

/// Engine, store, and task executor of one simulated run.
struct Simulation {
    engine: OrchestrationEngine,
    store: Arc<InMemoryStore>,
    tasks: Arc<QueuedTaskExecutor>,
}

impl Simulation {
    fn new(store: InMemoryStore, config: EngineConfig, edition: Edition) -> Self {
        let store = Arc::new(store);
        let tasks = Arc::new(QueuedTaskExecutor::new());
        let engine = OrchestrationEngine::new(
            store.clone(),
            config,
            Arc::new(StaticLicenseClient::new(edition)),
            tasks.clone(),
        );
        Self {
            engine,
            store,
            tasks,
        }
    }
}

async fn cmd_simulate(
    path: &Path,
    config: Option<&Path>,
    options: SimulateOptions,
) -> anyhow::Result<()> {
    let plan = load_plan(path)?;
    let config = load_config(config).await?;
    let sim = Simulation::new(InMemoryStore::new(), config, options.edition);
    let mut events = sim.engine.subscribe();

    let plan_id = plan.uuid.clone();
    for diag in sim.engine.submit_plan(plan).await? {
        println!("[WARN] {}: {}", diag.rule, diag.message);
    }
    let execution = sim
        .engine
        .start_plan_execution(StartRequest::new(
            &plan_id, ACCOUNT, "default", "default", &plan_id,
        ))
        .await?;
    println!("Plan execution: {} ({})", execution.uuid, execution.status);
    if execution.status == Status::Queued {
        println!("Execution was queued by admission control");
        return Ok(());
    }

    drive(&sim, &execution.uuid, &options, &mut events).await
}

async fn cmd_resume(config: Option<&Path>, options: SimulateOptions) -> anyhow::Result<()> {
    let Some(dir) = options.state.as_deref() else {
        anyhow::bail!("resume needs a state directory");
    };
    let Some(mut snapshot) = InMemoryStore::load_snapshot(dir).await? else {
        anyhow::bail!("no saved state in {}", dir.display());
    };
    let running: Vec<String> = snapshot
        .plan_executions
        .iter()
        .filter(|pe| !pe.is_finished())
        .map(|pe| pe.uuid.clone())
        .collect();
    let [plan_execution_id] = running.as_slice() else {
        anyhow::bail!(
            "expected one unfinished plan execution in {}, found {}",
            dir.display(),
            running.len()
        );
    };
    let waits = std::mem::take(&mut snapshot.waits);

    let config = load_config(config).await?;
    let sim = Simulation::new(InMemoryStore::restore(snapshot), config, options.edition);
    let mut events = sim.engine.subscribe();
    sim.engine.restore_waits(waits);
    println!("Resuming plan execution {plan_execution_id}");

    drive(&sim, plan_execution_id, &options, &mut events).await
}

/// Alternate between draining engine work and completing external work until
/// the execution finishes, stalls, or `stop_after` rounds have run.
async fn drive(
    sim: &Simulation,
    plan_execution_id: &str,
    options: &SimulateOptions,
    events: &mut tokio::sync::broadcast::Receiver<OrchestrationEvent>,
) -> anyhow::Result<()> {
    let engine = &sim.engine;
    let mut delivered = HashSet::new();
    let mut rounds = 0u32;
    loop {
        engine.run_until_idle().await;
        print_events(events);

        let current = engine.plan_execution(plan_execution_id).await?;
        if current.is_finished() {
            save_state(sim, options).await?;
            return summarize(engine, &current).await;
        }

        if options.stop_after == Some(rounds) {
            if let Some(path) = save_state(sim, options).await? {
                println!("Stopped after {rounds} rounds; state saved to {}", path.display());
            }
            return Ok(());
        }

        if options.abort_after == Some(rounds) {
            println!("Aborting after {rounds} rounds");
            let abort = Interrupt::new(
                InterruptType::AbortAll,
                plan_execution_id,
                None,
                InterruptConfig::manual("arbor-cli").with_reason("Aborted from the command line"),
            );
            engine.register_interrupt(abort).await?;
            rounds += 1;
            continue;
        }

        let progressed =
            complete_external_work(sim, plan_execution_id, options, &mut delivered).await?;
        if !progressed {
            let current = engine.plan_execution(plan_execution_id).await?;
            println!("No further progress possible; execution is {}", current.status);
            save_state(sim, options).await?;
            return summarize(engine, &current).await;
        }
        rounds += 1;
    }
}

async fn save_state(
    sim: &Simulation,
    options: &SimulateOptions,
) -> anyhow::Result<Option<PathBuf>> {
    let Some(dir) = options.state.as_deref() else {
        return Ok(None);
    };
    let path = sim
        .store
        .save_snapshot(dir, sim.engine.wait_snapshot())
        .await
        .with_context(|| format!("saving state to {}", dir.display()))?;
    Ok(Some(path))
}

/// Play the outside world: finish tasks, answer callbacks, supply input, and
/// resolve interventions. Returns whether anything was delivered.
///
/// Task ids are read back from the waiting nodes, since tasks queued before a
/// resume never reached this process's executor. `delivered` keeps an id
/// from being answered twice.
async fn complete_external_work(
    sim: &Simulation,
    plan_execution_id: &str,
    options: &SimulateOptions,
    delivered: &mut HashSet<String>,
) -> anyhow::Result<bool> {
    let engine = &sim.engine;
    let mut progressed = false;
    sim.tasks.drain_pending();

    for node in engine.node_executions(plan_execution_id).await? {
        match (node.status, node.last_executable_response()) {
            (Status::TaskWaiting, Some(ExecutableResponse::Task { task_id })) => {
                if delivered.insert(task_id.clone()) {
                    let payload = if options.fail_tasks {
                        serde_json::json!({
                            "status": "FAILED",
                            "message": "simulated task failure"
                        })
                    } else {
                        serde_json::json!({ "exit_code": 0 })
                    };
                    engine.task_completed(task_id, payload)?;
                    progressed = true;
                }
            }
            (Status::AsyncWaiting, Some(ExecutableResponse::Async { callback_ids })) => {
                for id in callback_ids {
                    if delivered.insert(id.clone()) {
                        engine.notify(id, serde_json::json!({ "simulated": true }))?;
                        progressed = true;
                    }
                }
            }
            (Status::InputWaiting, _) => {
                let accepted = match &options.input {
                    Some(input) => engine.submit_execution_input(&node.uuid, input).await?,
                    None => engine.continue_with_default(&node.uuid).await?,
                };
                progressed |= accepted;
            }
            (Status::InterventionWaiting, _) => {
                println!("  {} needs intervention, marking it failed", node.identifier);
                let interrupt = Interrupt::new(
                    InterruptType::MarkFailed,
                    plan_execution_id,
                    Some(node.uuid.clone()),
                    InterruptConfig::manual("arbor-cli"),
                );
                engine.register_interrupt(interrupt).await?;
                progressed = true;
            }
            _ => {}
        }
    }
    Ok(progressed)
}

fn print_events(events: &mut tokio::sync::broadcast::Receiver<OrchestrationEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestrationEvent::NodeStatusUpdated {
                identifier, status, ..
            } => println!("  {identifier:<24} {status}"),
            OrchestrationEvent::ChildrenSpawned {
                child_count,
                max_concurrency,
                ..
            } => println!("  spawned {child_count} children (max concurrency {max_concurrency})"),
            OrchestrationEvent::NodesDiscontinuing { count, .. } => {
                println!("  discontinuing {count} nodes")
            }
            _ => {}
        }
    }
}

async fn summarize(engine: &OrchestrationEngine, execution: &PlanExecution) -> anyhow::Result<()> {
    println!("\nPlan execution {}: {}", execution.uuid, execution.status);
    for node in engine.node_executions(&execution.uuid).await? {
        if node.old_retry {
            continue;
        }
        let failure = node
            .failure_info
            .as_ref()
            .map(|f| format!(" - {}", f.error_message))
            .unwrap_or_default();
        println!("  {:<24} {}{}", node.identifier, node.status, failure);
    }
    if execution.status != Status::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
