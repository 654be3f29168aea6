//! leaseq CLI: operator interface to a leaseq deployment.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use leaseq::config::Config;
use leaseq::config::secrets::ExposeSecret;
use leaseq::error::Error;
use leaseq::keys::STATE;
use leaseq::state::StateHandlerRegistry;
use leaseq::storage::Storage;
use leaseq::telemetry::{TelemetryConfig, init_telemetry};
use leaseq::transaction::JobState;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "leaseq", about = "Distributed locks and crash-safe work queues on Redis")]
struct Cli {
    /// TOML config file; environment variables are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the visibility watcher until Ctrl-C
    Watch,
    /// Create a job and push it onto a queue
    Enqueue {
        queue: String,
        /// Job field as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        /// Job record lifetime
        #[arg(long, default_value_t = 86_400)]
        expire_secs: u64,
    },
    /// Lease jobs from queues in priority order
    Work {
        /// Queue name, highest priority first (repeatable)
        #[arg(long = "queue", required = true)]
        queues: Vec<String>,
        /// Stop after one job
        #[arg(long)]
        once: bool,
        /// Requeue instead of acknowledging (dry run)
        #[arg(long)]
        requeue: bool,
    },
    /// Hold a lock for a while
    Lock {
        resource: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 5)]
        hold_secs: u64,
    },
    /// Show a job's fields
    Show { job_id: String },
    /// Pending and in-flight counts per known queue
    Stats,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leaseq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let storage = Storage::connect(config.redis_url.expose_secret(), config.storage.clone())
        .await
        .context("connecting to redis")?;

    match cli.command {
        Command::Watch => cmd_watch(&storage).await,
        Command::Enqueue {
            queue,
            fields,
            expire_secs,
        } => cmd_enqueue(&storage, &queue, fields, expire_secs).await,
        Command::Work {
            queues,
            once,
            requeue,
        } => cmd_work(&storage, &queues, once, requeue).await,
        Command::Lock {
            resource,
            timeout_secs,
            hold_secs,
        } => cmd_lock(&storage, &resource, timeout_secs, hold_secs).await,
        Command::Show { job_id } => cmd_show(&storage, &job_id).await,
        Command::Stats => cmd_stats(&storage).await,
    }
}

/// Cancellation token that fires on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        trigger.cancel();
    });
    cancel
}

async fn cmd_watch(storage: &Storage) -> anyhow::Result<()> {
    let watcher = storage.watcher()?;
    watcher.run(&ctrl_c_token()).await;
    Ok(())
}

async fn cmd_enqueue(
    storage: &Storage,
    queue: &str,
    fields: Vec<(String, String)>,
    expire_secs: u64,
) -> anyhow::Result<()> {
    let job_id = storage
        .create_job(fields, Duration::from_secs(expire_secs))
        .await?;
    let registry = StateHandlerRegistry::with_defaults();
    let mut tx = storage.begin();
    let enqueued = JobState::new("Enqueued").with_data("Queue", queue);
    registry.apply_transition(&mut tx, &job_id, None, &enqueued);
    tx.add_to_queue(queue, &job_id);
    tx.commit().await?;
    println!("Enqueued: {job_id} on {queue}");
    Ok(())
}

async fn cmd_work(
    storage: &Storage,
    queues: &[String],
    once: bool,
    requeue: bool,
) -> anyhow::Result<()> {
    let registry = StateHandlerRegistry::with_defaults();
    let fetcher = storage.fetcher();
    let cancel = ctrl_c_token();

    loop {
        let mut lease = match fetcher.fetch_next(queues, &cancel).await {
            Ok(lease) => lease,
            Err(Error::Cancelled) => {
                info!("worker stopped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let job_id = lease.job_id().to_string();
        let current = storage.job_parameter(&job_id, STATE).await?;
        let processing = JobState::new("Processing").with_data("Queue", lease.queue());
        let marked = match storage
            .transition_job(&registry, &job_id, current.as_deref(), &processing)
            .await
        {
            Ok(()) => Some("Processing".to_string()),
            Err(e) => {
                warn!(%job_id, "could not mark job processing: {e}");
                current
            }
        };

        let fields = storage.job_fields(&job_id).await?;
        println!("Leased: {job_id} from {} ({} fields)", lease.queue(), fields.len());

        if requeue {
            lease.requeue().await?;
            println!("Requeued: {job_id}");
        } else {
            let succeeded = JobState::new("Succeeded");
            storage
                .transition_job(&registry, &job_id, marked.as_deref(), &succeeded)
                .await?;
            lease.acknowledge().await?;
            println!("Acknowledged: {job_id}");
        }

        if once {
            return Ok(());
        }
    }
}

async fn cmd_lock(
    storage: &Storage,
    resource: &str,
    timeout_secs: u64,
    hold_secs: u64,
) -> anyhow::Result<()> {
    let guard = storage
        .acquire_lock(resource, Duration::from_secs(timeout_secs))
        .await?;
    println!("Holding {} as {} for {hold_secs}s", guard.resource(), guard.owner());
    tokio::time::sleep(Duration::from_secs(hold_secs)).await;
    guard.release().await?;
    println!("Released {resource}");
    Ok(())
}

async fn cmd_show(storage: &Storage, job_id: &str) -> anyhow::Result<()> {
    let fields = storage.job_fields(job_id).await?;
    if fields.is_empty() {
        anyhow::bail!("no job with id '{job_id}'");
    }
    let mut fields: Vec<_> = fields.into_iter().collect();
    fields.sort();
    println!("ID: {job_id}");
    for (name, value) in fields {
        println!("  {name:<12} {value}");
    }
    Ok(())
}

async fn cmd_stats(storage: &Storage) -> anyhow::Result<()> {
    let queues = storage.queues().await?;
    if queues.is_empty() {
        println!("No queues found.");
        return Ok(());
    }

    println!("{:<24}  {:>8}  {:>9}", "QUEUE", "PENDING", "IN-FLIGHT");
    for queue in &queues {
        println!(
            "{:<24}  {:>8}  {:>9}",
            queue,
            storage.pending_count(queue).await?,
            storage.in_flight_count(queue).await?
        );
    }
    Ok(())
}
