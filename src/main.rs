use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;

use taskbus::telemetry::{init_tracing_with, LogFormat};
use taskbus::{
    AdminClient, BusConfig, HealthSnapshot, PriorityClass, SubmitOptions, TaskBus, Verdict,
};

#[derive(Parser, Debug)]
#[command(
    name = "taskbus",
    version,
    about = "Serve a task bus or administer a running one"
)]
struct Cli {
    /// Base URL of the bus
    #[arg(long, global = true, env = "TASKBUS_URL", default_value = "http://127.0.0.1:7878")]
    url: String,
    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the broker, lease reaper, health monitor and HTTP surface
    Serve {
        /// Listen address
        #[arg(long, env = "TASKBUS_LISTEN")]
        listen: Option<String>,
        /// TOML configuration file
        #[arg(long, env = "TASKBUS_CONFIG")]
        config: Option<PathBuf>,
    },
    #[command(flatten)]
    Admin(AdminCommand),
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Queue depths and verdicts
    Status {
        /// Only this queue
        #[arg(long)]
        queue: Option<String>,
        /// Refresh every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Full health snapshot (exit code 2 when unhealthy)
    Health,
    /// Worker heartbeats with staleness
    Workers,
    /// Drop every pending task of a queue
    Purge {
        #[arg(long)]
        queue: String,
        /// Required; purging cannot be undone
        #[arg(long)]
        confirm: bool,
    },
    /// Revoke a task
    Cancel {
        #[arg(long)]
        task_id: String,
    },
    /// Submit a task
    Submit {
        #[arg(long)]
        task_type: String,
        /// Inline JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
        /// Route to the queue registered for this class
        #[arg(long)]
        priority: Option<PriorityClass>,
        /// Route to this queue
        #[arg(long)]
        queue: Option<String>,
        /// Delay before the task becomes eligible (e.g. 30s, 5m)
        #[arg(long)]
        delay: Option<humantime::Duration>,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Dead-letter operations
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommand {
    List,
    Inspect { id: String },
    /// Move back to pending with a fresh attempt budget
    Requeue { id: String },
    Discard { id: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let default_filter = match cli.command {
        Command::Serve { .. } => "info",
        Command::Admin(_) => "warn",
    };
    init_tracing_with(LogFormat::from_env()?, default_filter);

    match cli.command {
        Command::Serve { listen, config } => serve(listen, config).await,
        Command::Admin(command) => {
            let admin = AdminClient::new(&cli.url)?;
            run_admin(&admin, command, cli.json).await
        }
    }
}

async fn serve(listen: Option<String>, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let mut config = BusConfig::load(config_path.as_deref()).context("loading configuration")?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    // `serve` always hosts the broker
    config.broker_url = "memory://".to_string();

    let bus = Arc::new(TaskBus::connect(config).await?);
    bus.start().await;

    let listen = bus.config().listen.clone();
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    taskbus::server::serve(bus.clone(), listener, shutdown_signal()).await?;

    bus.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "taskbus.cli: cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("taskbus.cli: shutdown requested");
}

async fn run_admin(admin: &AdminClient, command: AdminCommand, json: bool) -> Result<ExitCode> {
    match command {
        AdminCommand::Status { queue, watch } => match watch {
            None => {
                let snapshot = admin.health().await?;
                print_status(&snapshot, queue.as_deref(), json)?;
            }
            Some(secs) => {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let snapshot = admin.health().await?;
                            print_status(&snapshot, queue.as_deref(), json)?;
                        }
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            }
        },
        AdminCommand::Health => {
            let snapshot = admin.health().await?;
            if json {
                print_json(&snapshot)?;
            } else {
                print_health(&snapshot);
            }
            if snapshot.verdict == Verdict::Unhealthy {
                return Ok(ExitCode::from(2));
            }
        }
        AdminCommand::Workers => {
            let snapshot = admin.health().await?;
            if json {
                print_json(&snapshot.workers)?;
            } else {
                println!(
                    "{:<28} {:<16} {:>5} {:>6} {:>9} {:>6}  {:<6} QUEUES",
                    "WORKER", "HOST", "SLOTS", "ACTIVE", "PROCESSED", "FAILED", "STATE"
                );
                for worker in &snapshot.workers {
                    let hb = &worker.heartbeat;
                    let state = if hb.stopping {
                        "stop"
                    } else if worker.stale {
                        "stale"
                    } else {
                        "live"
                    };
                    println!(
                        "{:<28} {:<16} {:>5} {:>6} {:>9} {:>6}  {:<6} {}",
                        hb.worker_id,
                        hb.hostname,
                        hb.slots,
                        hb.active,
                        hb.processed,
                        hb.failed,
                        state,
                        hb.queues.join(",")
                    );
                }
            }
        }
        AdminCommand::Purge { queue, confirm } => {
            let purged = admin.purge(&queue, confirm).await?;
            if json {
                print_json(&serde_json::json!({"queue": queue, "purged": purged}))?;
            } else {
                println!("purged {} task(s) from {}", purged, queue);
            }
        }
        AdminCommand::Cancel { task_id } => {
            admin.cancel(&task_id).await?;
            if json {
                print_json(&serde_json::json!({"task_id": task_id, "revoked": true}))?;
            } else {
                println!("revoked {}", task_id);
            }
        }
        AdminCommand::Submit {
            task_type,
            payload,
            priority,
            queue,
            delay,
            max_attempts,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let options = SubmitOptions {
                priority_override: priority,
                queue,
                delay: delay.map(Into::into),
                max_attempts,
            };
            let task_id = admin.submit(&task_type, payload, options).await?;
            if json {
                print_json(&serde_json::json!({"task_id": task_id}))?;
            } else {
                println!("{}", task_id);
            }
        }
        AdminCommand::DeadLetter(action) => dead_letter(admin, action, json).await?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn dead_letter(admin: &AdminClient, action: DeadLetterCommand, json: bool) -> Result<()> {
    match action {
        DeadLetterCommand::List => {
            let letters = admin.dead_letters().await?;
            if json {
                return print_json(&letters);
            }
            println!(
                "{:<36} {:<24} {:<16} {:>8}  {:<20} ERROR",
                "TASK", "TYPE", "QUEUE", "ATTEMPTS", "FAILED AT"
            );
            for letter in &letters {
                println!(
                    "{:<36} {:<24} {:<16} {:>8}  {:<20} {}",
                    letter.task_id,
                    letter.task_type,
                    letter.queue_name,
                    letter.attempts,
                    letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    letter.error
                );
            }
        }
        DeadLetterCommand::Inspect { id } => {
            // Full history is only readable as JSON
            print_json(&admin.inspect(&id).await?)?;
        }
        DeadLetterCommand::Requeue { id } => {
            let envelope = admin.requeue(&id).await?;
            if json {
                return print_json(&envelope);
            }
            println!("requeued {} onto {}", envelope.id, envelope.queue_name);
        }
        DeadLetterCommand::Discard { id } => {
            admin.discard(&id).await?;
            if !json {
                println!("discarded {}", id);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_status(snapshot: &HealthSnapshot, queue: Option<&str>, json: bool) -> Result<()> {
    let queues: Vec<_> = snapshot
        .queues
        .iter()
        .filter(|q| queue.map_or(true, |name| q.queue == name))
        .collect();
    if let Some(name) = queue {
        if queues.is_empty() {
            anyhow::bail!("unknown queue '{}'", name);
        }
    }
    if json {
        return print_json(&queues);
    }

    println!(
        "{:<20} {:<8} {:>7} {:>7} {:>7} {:>10} {:>8} {:>7}  VERDICT",
        "QUEUE", "CLASS", "DEPTH", "DELAYED", "LEASED", "OLDEST", "FAILURE", "WORKERS"
    );
    for q in queues {
        println!(
            "{:<20} {:<8} {:>7} {:>7} {:>7} {:>10} {:>7.1}% {:>7}  {}",
            q.queue,
            q.class,
            q.depth,
            q.delayed,
            q.leased,
            humantime::format_duration(Duration::from_secs(q.oldest_pending_age_ms / 1000))
                .to_string(),
            q.failure_rate * 100.0,
            q.active_workers,
            q.verdict
        );
    }
    Ok(())
}

fn print_health(snapshot: &HealthSnapshot) {
    println!("verdict:        {}", snapshot.verdict);
    println!("pending:        {}", snapshot.total_pending);
    println!("leased:         {}", snapshot.total_leased);
    println!("dead letters:   {}", snapshot.dead_letter_count);
    println!("active workers: {}", snapshot.active_workers);
    for q in &snapshot.queues {
        if q.reasons.is_empty() {
            continue;
        }
        println!("{} ({}):", q.queue, q.verdict);
        for reason in &q.reasons {
            println!("  - {}", reason);
        }
    }
}
