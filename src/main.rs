use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use stowd::adapters::{self, FilesystemSink};
use stowd::config::AppConfig;
use stowd::core::{Orchestrator, verify_archive};
use stowd::logging::{self, LogConfig};
use stowd::rpc::{RpcClient, RpcServer};
use stowd::{context, db};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "stowd")]
#[command(about = "Scheduled backups for container volumes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon RPC address for client commands (defaults to the configured rpc_bind)
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup daemon
    Daemon(ServerArgs),
    /// Show daemon health, targets and upcoming runs
    Status,
    /// Inspect job history
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Start a backup of one target now
    Trigger { target_id: String },
    /// Check an archive against its embedded manifest
    Verify { archive: PathBuf },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Recent jobs, newest first
    List {
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// One job with its phase history
    Show { id: String },
    /// Jobs currently running
    Active,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    archive_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_jobs: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&ServerArgs>)?,
    };
    let rpc_addr = cli.rpc.unwrap_or(config.rpc_bind);

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig::from(&config));
            run_daemon(config).await.context("Daemon failed")?
        }
        Commands::Status => run_status(rpc_addr)
            .await
            .context("Failed to check status of daemon")?,
        Commands::Jobs { command } => run_jobs(rpc_addr, command)
            .await
            .context("Failed to query jobs")?,
        Commands::Trigger { target_id } => run_trigger(rpc_addr, &target_id)
            .await
            .context("Failed to trigger backup")?,
        Commands::Verify { archive } => {
            logging::init(LogConfig {
                verbose: config.verbose,
                ..Default::default()
            });
            run_verify(&archive).await?
        }
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let db_conn = if config.simulation {
        db::open_in_memory().await?
    } else {
        db::init(&config.database_path).await?
    };
    let ctx = context::AppContext::new(config, db_conn);

    tokio::fs::create_dir_all(&ctx.config.archive_directory)
        .await
        .with_context(|| {
            format!(
                "Failed to create archive directory {}",
                ctx.config.archive_directory.display()
            )
        })?;
    let sink = Arc::new(FilesystemSink::new(ctx.config.archive_directory.clone()));
    let runtime =
        adapters::get_runtime(&ctx.config).context("Failed to set up the container runtime")?;
    let orchestrator = Arc::new(Orchestrator::new(ctx.clone(), runtime, sink));

    let shutdown = CancellationToken::new();
    let rpc = RpcServer::bind(orchestrator.clone(), ctx.config.rpc_bind)
        .await
        .with_context(|| format!("Failed to bind RPC server on {}", ctx.config.rpc_bind))?;
    let rpc_shutdown = shutdown.clone();
    let rpc_task = tokio::spawn(async move {
        if let Err(e) = rpc.start(rpc_shutdown).await {
            error!(error = %e, "RPC server stopped");
        }
    });

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = orchestrator.start(shutdown.clone()).await;
    shutdown.cancel();
    let _ = rpc_task.await;
    result
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

async fn run_status(addr: SocketAddr) -> Result<()> {
    let client = RpcClient::new(addr);
    let status: Value = client.call_no_params("daemon.status").await?;
    let targets: Vec<Value> = client.call_no_params("targets.list").await?;
    let upcoming: Vec<Value> = client.call_no_params("scheduler.upcoming").await?;

    println!(
        "stowd {} up {}s{}",
        text(&status, "version"),
        status["uptime_secs"].as_i64().unwrap_or(0),
        if status["shutting_down"].as_bool().unwrap_or(false) {
            " (shutting down)"
        } else {
            ""
        }
    );
    println!(
        "targets: {}  running jobs: {}",
        status["targets"], status["running_jobs"]
    );

    if targets.is_empty() {
        println!("\nNo backup targets discovered.");
        return Ok(());
    }

    println!("\n{:<24} {:<26} {:<10} NEXT RUN", "TARGET", "SCHEDULE", "RUNNING");
    for target in &targets {
        let id = text(target, "id");
        let next = upcoming
            .iter()
            .find(|u| text(u, "target_id") == id)
            .map(|u| match u.get("error").and_then(Value::as_str) {
                Some(error) => format!("never ({})", error),
                None => text(u, "next_fire").to_string(),
            })
            .unwrap_or_else(|| "-".to_string());
        let running = target
            .get("running_job")
            .and_then(Value::as_str)
            .map(short_id)
            .unwrap_or("-");
        println!(
            "{:<24} {:<26} {:<10} {}",
            id,
            text(target, "schedule"),
            running,
            next
        );
    }
    Ok(())
}

async fn run_jobs(addr: SocketAddr, command: JobsCommand) -> Result<()> {
    let client = RpcClient::new(addr);
    match command {
        JobsCommand::List { target, limit } => {
            let jobs: Vec<Value> = client
                .call("jobs.list", Some(json!({ "target_id": target, "limit": limit })))
                .await?;
            if jobs.is_empty() {
                println!("No jobs recorded.");
                return Ok(());
            }
            println!(
                "{:<10} {:<20} {:<10} {:<10} {:<26} SIZE",
                "JOB", "TARGET", "PHASE", "TRIGGER", "STARTED"
            );
            for job in &jobs {
                let size = job["total_size"]
                    .as_u64()
                    .map(|b| format!("{:.1} MB", b as f64 / (1024.0 * 1024.0)))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<10} {:<20} {:<10} {:<10} {:<26} {}",
                    short_id(text(job, "id")),
                    text(job, "target_id"),
                    text(job, "phase"),
                    text(job, "trigger"),
                    text(job, "started_at"),
                    size
                );
            }
        }
        JobsCommand::Show { id } => {
            let job: Value = client.call("jobs.get", Some(json!({ "id": id }))).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCommand::Active => {
            let active: Value = client.call_no_params("jobs.active").await?;
            let jobs = active["jobs"].as_array().cloned().unwrap_or_default();
            if jobs.is_empty() {
                println!("No jobs running.");
            }
            for job in &jobs {
                println!(
                    "{} {:<20} {:<10} volumes {}/{} ({} bytes)",
                    short_id(text(job, "job_id")),
                    text(job, "target_id"),
                    text(job, "phase"),
                    job["volumes_captured"],
                    job["volumes_total"],
                    job["bytes_captured"]
                );
            }
        }
    }
    Ok(())
}

async fn run_trigger(addr: SocketAddr, target_id: &str) -> Result<()> {
    let client = RpcClient::new(addr);
    let admission: Value = client
        .call("jobs.trigger", Some(json!({ "target_id": target_id })))
        .await?;

    match text(&admission, "status") {
        "admitted" => println!("Started job {} for {}", text(&admission, "job_id"), target_id),
        _ => {
            let reason = &admission["reason"];
            match text(reason, "reason") {
                "already_running" => println!(
                    "Not started: job {} is already running for {}",
                    text(reason, "job_id"),
                    target_id
                ),
                "shutting_down" => println!("Not started: daemon is shutting down"),
                other => println!("Not started: {}", other),
            }
        }
    }
    Ok(())
}

async fn run_verify(archive: &std::path::Path) -> Result<()> {
    let result = verify_archive(archive)
        .await
        .with_context(|| format!("Verification of {} failed", archive.display()))?;
    println!(
        "OK: {} volume(s), {} bytes match the manifest of {}",
        result.volumes_verified, result.bytes_verified, result.manifest.archive
    );
    Ok(())
}
