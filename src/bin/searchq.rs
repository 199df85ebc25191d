//! searchq CLI: run the engine and inspect jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use searchq::broker::Broker;
use searchq::config::secrets::ExposeSecret;
use searchq::config::{Config, EngineConfig};
use searchq::db::{Db, PgmqBroker};
use searchq::engine::{Engine, recover_stale};
use searchq::executor::CommandExecutor;
use searchq::model::{JobId, JobState};
use searchq::status::StatusService;
use searchq::store::JobStore;
use searchq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "searchq", about = "Durable queue for search-scraping jobs")]
struct Cli {
    /// pgmq queue carrying job references
    #[arg(long, global = true, default_value = "searchq_jobs")]
    queue: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an engine instance until Ctrl-C
    Serve {
        /// Engine settings (TOML). Falls back to SEARCHQ_* variables.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Program run once per attempt; payload on stdin, result on stdout
        #[arg(long)]
        executor: PathBuf,
        /// Extra arguments for the executor program
        #[arg(last = true)]
        executor_args: Vec<String>,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Run one crash-recovery sweep and exit
    Recover {
        /// Engine settings (TOML). Falls back to SEARCHQ_* variables.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a job
    Submit {
        /// JSON payload handed to the executor
        payload: String,
    },
    /// Show one job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// List jobs, newest first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Cancel a pending or claimed job
    Cancel {
        /// Job ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "searchq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    match cli.command {
        Command::Serve {
            config,
            executor,
            executor_args,
        } => cmd_serve(db, &cli.queue, config.as_deref(), executor, executor_args).await,
        Command::Recover { config } => cmd_recover(db, &cli.queue, config.as_deref()).await,
        Command::Job { action } => match action {
            JobAction::Submit { payload } => cmd_job_submit(db, &cli.queue, &payload).await,
            JobAction::Show { id } => cmd_job_show(&db, &id).await,
            JobAction::List { state, limit } => cmd_job_list(&db, state, limit).await,
            JobAction::Cancel { id } => cmd_job_cancel(db, &id).await,
        },
    }
}

fn engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    Ok(match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    })
}

async fn cmd_serve(
    db: Arc<Db>,
    queue: &str,
    config_path: Option<&Path>,
    program: PathBuf,
    args: Vec<String>,
) -> anyhow::Result<()> {
    let engine_config = engine_config(config_path)?;
    let broker = Arc::new(
        PgmqBroker::open(
            Arc::clone(&db),
            queue,
            engine_config.visibility_timeout,
            engine_config.poll_interval,
        )
        .await?,
    );
    let executor = args
        .into_iter()
        .fold(CommandExecutor::new(program), |executor, arg| executor.arg(arg));

    let engine = Engine::new(db, broker.clone(), Arc::new(executor), engine_config)?;

    let ctrl = engine.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    engine.run().await?;
    broker.close();
    Ok(())
}

async fn cmd_recover(db: Arc<Db>, queue: &str, config_path: Option<&Path>) -> anyhow::Result<()> {
    let engine_config = engine_config(config_path)?;
    let broker = PgmqBroker::open(
        Arc::clone(&db),
        queue,
        engine_config.visibility_timeout,
        engine_config.poll_interval,
    )
    .await?;

    let report = recover_stale(
        &*db,
        &broker,
        engine_config.staleness_threshold,
        engine_config.retry_ceiling,
        chrono::Utc::now(),
    )
    .await?;

    println!(
        "requeued: {}  failed: {}  resent: {}",
        report.requeued, report.failed, report.resent
    );
    Ok(())
}

async fn cmd_job_submit(db: Arc<Db>, queue: &str, payload: &str) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    // Submitting never reads, so the timeouts are unused.
    let broker = PgmqBroker::open(
        Arc::clone(&db),
        queue,
        std::time::Duration::from_secs(30),
        std::time::Duration::from_secs(1),
    )
    .await?;

    let job = db.create(payload).await?;
    match broker.enqueue(job.id).await {
        Ok(()) => println!("Submitted: {}", job.id),
        Err(e) => println!("Submitted: {} (enqueue failed: {e}; recovery will resend)", job.id),
    }
    Ok(())
}

async fn resolve_id(db: &Db, id_str: &str) -> anyhow::Result<JobId> {
    if id_str.len() >= 36 {
        return Ok(id_str.parse()?);
    }
    let jobs = db.list_jobs(None, 100).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id_str))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no job matching prefix '{id_str}'"),
        [job] => Ok(job.id),
        many => anyhow::bail!("{} jobs match prefix '{id_str}', be more specific", many.len()),
    }
}

async fn cmd_job_show(db: &Db, id_str: &str) -> anyhow::Result<()> {
    let id = resolve_id(db, id_str).await?;
    let job = db.get(id).await?;

    println!("ID:         {}", job.id);
    println!("State:      {}", job.state);
    println!("Attempts:   {}", job.attempts);
    println!("Version:    {}", job.version);
    println!("Claimed By: {}", job.claimed_by.as_deref().unwrap_or("-"));
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(ref result) = job.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref error) = job.error {
        println!("Error:      {error}");
    }
    Ok(())
}

async fn cmd_job_list(db: &Db, state: Option<String>, limit: i64) -> anyhow::Result<()> {
    let state: Option<JobState> = state.map(|s| s.parse()).transpose()?;
    let jobs = db.list_jobs(state, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<8}  {:<24}  CREATED",
        "ID", "STATE", "ATTEMPTS", "CLAIMED_BY"
    );
    println!("{}", "-".repeat(80));
    for job in &jobs {
        let id = job.id.to_string();
        println!(
            "{:<8}  {:<10}  {:<8}  {:<24}  {}",
            &id[..8],
            job.state,
            job.attempts,
            job.claimed_by.as_deref().unwrap_or("-"),
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_cancel(db: Arc<Db>, id_str: &str) -> anyhow::Result<()> {
    let id = resolve_id(&db, id_str).await?;
    let view = StatusService::new(db).cancel_job(id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
