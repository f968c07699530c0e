use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use gridflow::dsl;
use gridflow::dsl::loader::load_job_from_yaml;
use gridflow::flow::evaluator::ExprFlowEvaluator;
use gridflow::runtime::engine::{Collaborators, Engine, TaskOutcome};
use gridflow::runtime::job::JobStatus;
use gridflow::runtime::ports::{
    FifoPolicy, InMemoryNodePool, NotificationSink, NullNotificationSink, ScheduleCronPredictor,
};
use gridflow::runtime::redis_sink::RedisNotificationSink;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a job definition without running it
    Validate {
        /// Path to the job YAML file
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Run a job against an in-memory node pool, completing tasks
    /// instantly (Standalone Mode)
    Run {
        /// Path to the job YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Size of the simulated node pool
        #[arg(long, default_value_t = 4)]
        nodes: usize,

        /// Job variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Publish job events to this Redis URL instead of discarding them
        #[arg(long)]
        publish: Option<String>,

        /// Redis channel for published events
        #[arg(long, default_value = "gridflow:events")]
        channel: String,

        /// Give up after this many scheduling cycles
        #[arg(long, default_value_t = 256)]
        max_cycles: usize,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value pair: {s}"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let def = load_job_from_yaml(&file)?;
            let (job, _) = dsl::build(def).context("invalid job definition")?;
            println!("OK: {} ({} tasks)", job.name, job.total_tasks());
            Ok(())
        }
        Commands::Run {
            file,
            nodes,
            vars,
            publish,
            channel,
            max_cycles,
        } => run_job(file, nodes, vars, publish, channel, max_cycles).await,
    }
}

async fn run_job(
    file: PathBuf,
    nodes: usize,
    vars: Vec<(String, serde_json::Value)>,
    publish: Option<String>,
    channel: String,
    max_cycles: usize,
) -> Result<()> {
    let mut def = load_job_from_yaml(&file)?;
    for (key, value) in vars {
        def.variables.insert(key, value);
    }

    let sink: Arc<dyn NotificationSink> = match publish {
        Some(url) => {
            let client = redis::Client::open(url.as_str())
                .with_context(|| format!("invalid Redis URL {url}"))?;
            Arc::new(RedisNotificationSink::new(client, channel))
        }
        None => Arc::new(NullNotificationSink),
    };

    let engine = Engine::new(Collaborators {
        policy: Arc::new(FifoPolicy),
        resources: Arc::new(InMemoryNodePool::new(nodes)),
        evaluator: Arc::new(ExprFlowEvaluator),
        cron: Arc::new(ScheduleCronPredictor),
        sink,
    });

    let job_id = engine.submit(def).await?;
    info!(job = %job_id, nodes, "running job");

    for cycle in 0..max_cycles {
        let report = engine.run_scheduling_cycle().await;
        if report.started.is_empty() {
            let info = engine.job_info(job_id).await?;
            if info.status.is_terminal() {
                break;
            }
            // nothing startable: either done, gated on a future cron
            // fire time, or stuck on an unsatisfiable dependency
            info!(
                cycle,
                pending = info.pending_tasks,
                "no task could be started, stopping"
            );
            break;
        }
        for (job, task) in report.started {
            engine.on_task_started(job, task).await?;
            engine
                .on_task_terminated(job, task, TaskOutcome::success())
                .await?;
        }
    }

    let info = engine.job_info(job_id).await?;
    println!(
        "job {} -> {:?} ({} finished / {} total)",
        info.name, info.status, info.finished_tasks, info.total_tasks
    );
    for task in engine.task_snapshots(job_id).await? {
        println!(
            "  [{:>3}] {:<24} {:?}{}",
            task.id,
            task.name,
            task.status,
            task.provenance
                .as_deref()
                .map(|p| format!("  ({p})"))
                .unwrap_or_default()
        );
    }
    if let Some(reason) = info.failure_reason {
        bail!("job failed: {reason}");
    }
    if info.status != JobStatus::Finished {
        info!("job did not finish within {max_cycles} cycles");
    }
    Ok(())
}
