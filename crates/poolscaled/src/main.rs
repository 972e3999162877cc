//! poolscaled: the poolscale daemon.
//!
//! Single binary that assembles the autoscaler:
//! - State store (redb)
//! - Signal engine with a local archive fetcher
//! - Controller with one context per pool
//! - Drain worker
//! - Background loop ticking every pool
//!
//! # Usage
//!
//! ```text
//! poolscaled --config /etc/poolscale/poolscale.toml run
//! poolscaled --config poolscale.toml manage --pool batch --dry-run
//! poolscaled --config poolscale.toml pause --pool batch --minutes 30
//! poolscaled --config poolscale.toml evict --pool batch --reason spot_interruption --instance i-0abc
//! ```
//!
//! Sending SIGHUP to a running daemon re-reads the configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use poolscale_controller::{Controller, RunMode, SlotFactory};
use poolscale_core::{PoolscaleConfig, TerminationReason};
use poolscale_pool::{drain_queue, DrainSink};
use poolscale_signal::{LocalArchiveFetcher, SignalEngine, WorkerTimeouts};
use poolscale_state::StateStore;

const DEFAULT_LOG_FILTER: &str = "info,poolscaled=debug,poolscale=debug";

#[derive(Parser)]
#[command(name = "poolscaled", about = "poolscale autoscaler daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "/etc/poolscale/poolscale.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Autoscale every configured pool until interrupted.
    Run,

    /// Run a single tick for one pool and print what happened.
    Manage {
        #[arg(long)]
        pool: String,

        /// Compute everything, change nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show target and fulfilled capacity of a pool's groups.
    Status {
        #[arg(long)]
        pool: String,
    },

    /// Evaluate a pool's signal and print the request.
    Signal {
        #[arg(long)]
        pool: String,
    },

    /// Pause autoscaling for a pool.
    Pause {
        #[arg(long)]
        pool: String,

        /// Resume automatically after this many minutes.
        #[arg(long)]
        minutes: Option<u64>,
    },

    /// Resume autoscaling for a paused pool.
    Resume {
        #[arg(long)]
        pool: String,
    },

    /// Remove specific instances without changing group targets.
    Evict {
        #[arg(long)]
        pool: String,

        /// scaling_down, spot_interruption or node_migration.
        #[arg(long)]
        reason: TerminationReason,

        #[arg(long = "instance", required = true)]
        instances: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = PoolscaleConfig::from_file(&cli.config)?;
    match cli.command {
        Command::Run => run_daemon(config, &cli.config).await,
        Command::Manage { pool, dry_run } => manage(&config, &pool, dry_run).await,
        Command::Status { pool } => {
            let controller = build_controller(&config, None)?;
            let status = controller.status(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Signal { pool } => {
            let controller = build_controller(&config, None)?;
            let request = controller.evaluate_signal(&pool).await;
            controller.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&json!({ "pool": pool, "request": request? }))?);
            Ok(())
        }
        Command::Pause { pool, minutes } => {
            let controller = build_controller(&config, None)?;
            let until = minutes.map(|m| epoch_secs() + m * 60);
            controller.pause(&pool, until)?;
            println!("paused {pool}");
            Ok(())
        }
        Command::Resume { pool } => {
            let controller = build_controller(&config, None)?;
            if controller.resume(&pool)? {
                println!("resumed {pool}");
            } else {
                println!("{pool} was not paused");
            }
            Ok(())
        }
        Command::Evict {
            pool,
            reason,
            instances,
        } => {
            let controller = build_controller(&config, None)?;
            let result = controller.evict(&pool, &instances, reason).await;
            controller.shutdown().await;
            let report = result?;
            let summary = json!({
                "pool": report.pool,
                "reason": report.reason.to_string(),
                "removed": report.removed,
                "blocked": report.selection.blocked.iter().map(|b| b.to_string()).collect::<Vec<_>>(),
                "unknown": report.unknown,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_controller(
    config: &PoolscaleConfig,
    drain: Option<Arc<dyn DrainSink>>,
) -> anyhow::Result<Controller> {
    let service = &config.service;
    std::fs::create_dir_all(&service.data_dir)?;
    let db_path = service.data_dir.join("poolscale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let fetcher = Arc::new(LocalArchiveFetcher::new(
        service.signal_archive_dir.clone(),
        service.signal_cache_dir.clone(),
    ));
    let engine = Arc::new(SignalEngine::new(
        fetcher,
        &service.cluster,
        WorkerTimeouts {
            init: service.signal_init_timeout(),
            eval: service.signal_eval_timeout(),
        },
    ));

    let mut builder = Controller::builder(config.clone(), store, Arc::new(SlotFactory::new(engine)));
    if let Some(drain) = drain {
        builder = builder.with_drain(drain);
    }
    Ok(builder.build()?)
}

async fn run_daemon(config: PoolscaleConfig, config_path: &Path) -> anyhow::Result<()> {
    info!(
        cluster = %config.service.cluster,
        pools = config.pools.len(),
        "poolscaled starting"
    );

    let (queue, worker) = drain_queue();
    let controller = Arc::new(build_controller(&config, Some(Arc::new(queue)))?);

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain_handle = tokio::spawn(worker.run(controller.adapters(), shutdown_rx.clone()));
    let loop_handle = tokio::spawn(poolscale_controller::run(
        Arc::clone(&controller),
        shutdown_rx,
    ));

    // ── Signals ────────────────────────────────────────────────

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutdown signal received");
                break;
            }
            _ = hangup.recv() => reload(&controller, config_path).await,
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;
    let drained = drain_handle.await.unwrap_or_default();
    info!(drained, "poolscaled stopped");
    Ok(())
}

async fn reload(controller: &Controller, path: &Path) {
    info!(path = ?path, "reloading configuration");
    match PoolscaleConfig::from_file(path) {
        Ok(config) => {
            if let Err(e) = controller.apply_config(&config).await {
                warn!(error = %e, "configuration rejected, keeping current");
            }
        }
        Err(e) => warn!(error = %e, "configuration unreadable, keeping current"),
    }
}

async fn manage(config: &PoolscaleConfig, pool: &str, dry_run: bool) -> anyhow::Result<()> {
    let controller = build_controller(config, None)?;
    let result = controller.run_once(pool, RunMode::Manual, dry_run).await;
    controller.shutdown().await;
    let report = result?;

    let decision = &report.decision;
    let summary = json!({
        "pool": report.pool,
        "dry_run": report.dry_run,
        "origin": report.origin,
        "request": report.request,
        "current_total": decision.current_total,
        "desired_total": decision.desired_total,
        "clamped_total": decision.clamped_total,
        "delta": decision.delta,
        "reason": decision.reason.as_str(),
        "rate_limited": decision.rate_limited,
        "targets": report.plan.as_ref().map(|p| &p.targets),
        "candidates": report.selection.candidates,
        "blocked": report.selection.blocked.iter().map(|b| b.to_string()).collect::<Vec<_>>(),
        "removed": report.removed,
        "partial_groups": report.partial_groups,
        "lost_instances": report.lost_instances,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
