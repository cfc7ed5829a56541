// meterguard - Main Entry Point
//
// Command-line front end for the quota core:
// - check-config: load, validate and print the effective configuration
// - simulate: run a reserve/commit scenario against an in-memory store
// - maintain: run resets, expiry sweeps and reconciliation in the background

use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::{Parser, Subcommand};
use meterguard::account::{Account, ResourceLimits, Tier};
use meterguard::admission::AdmissionController;
use meterguard::clock::ManualClock;
use meterguard::config::{Config, StoreBackend};
use meterguard::maintenance::MaintenanceRunner;
use meterguard::scheduler::ResetScheduler;
use meterguard::store::{MemoryStore, Stores};
use meterguard::{logging, metrics_server, AdmissionDecision};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// meterguard: token quotas and admission control for metered model APIs
#[derive(Parser, Debug)]
#[command(name = "meterguard")]
#[command(version)]
#[command(about = "Hierarchical token quotas and admission control", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// Reserve and commit against a fresh in-memory account, printing JSON
    Simulate {
        /// Monthly token limit of the simulated account
        #[arg(long, default_value_t = 1000)]
        monthly_limit: u64,

        /// Tokens already consumed this billing period
        #[arg(long, default_value_t = 950)]
        tokens_used: u64,

        /// Estimated amounts to reserve, in order
        #[arg(long, num_args = 1.., value_delimiter = ',', default_values_t = vec![60, 50])]
        reserve: Vec<u64>,

        /// Actual consumption committed for each admitted reservation
        #[arg(long, default_value_t = 45)]
        commit: u64,
    },
    /// Run the maintenance loops until interrupted
    Maintain {
        /// Run every job once, print the report and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    logging::init(&config.logging, args.verbose)?;

    match args.command {
        Some(Commands::CheckConfig) => check_config(&config)?,
        Some(Commands::Simulate {
            monthly_limit,
            tokens_used,
            reserve,
            commit,
        }) => simulate(&config, monthly_limit, tokens_used, &reserve, commit).await?,
        Some(Commands::Maintain { once }) => maintain(&config, once).await?,
        None => {
            info!("No command specified. Use \"meterguard --help\" for usage.");
        }
    }

    Ok(())
}

/// Print the effective configuration as TOML
fn check_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{rendered}");
    println!("# configuration OK");
    Ok(())
}

/// Drive one account through reserve and commit on a frozen clock
async fn simulate(
    config: &Config,
    monthly_limit: u64,
    tokens_used: u64,
    amounts: &[u64],
    commit: u64,
) -> Result<()> {
    let start = Utc
        .with_ymd_and_hms(2026, 1, 15, 12, 0, 0)
        .single()
        .context("Invalid simulation start time")?;
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(MemoryStore::new());

    let controller = AdmissionController::builder(Stores::from_backend(store))
        .clock(clock.clone())
        .store_timeout(config.store.timeout())
        .ledger_config(config.ledger.clone())
        .usage_config(config.usage.clone())
        .build();

    let account = Account::new("sim-account", Tier::Pro, start + Duration::days(17))
        .with_monthly_limit(monthly_limit)
        .with_tokens_used(tokens_used.min(monthly_limit))
        .with_limits(ResourceLimits::unlimited());
    controller.accounts().create_account(account).await?;

    let mut steps = Vec::new();
    for &amount in amounts {
        let decision = controller
            .reserve_tokens("sim-account", "/v1/messages", "sim-model", amount)
            .await;
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                steps.push(json!({"reserve": amount, "error": err.code(), "message": err.to_string()}));
                continue;
            }
        };
        match decision {
            AdmissionDecision::Admitted(reservation) => {
                let committed = controller.commit_tokens(&reservation.id, commit).await?;
                steps.push(json!({
                    "reserve": amount,
                    "decision": "admitted",
                    "reservation_id": reservation.id,
                    "commit": committed,
                }));
            }
            AdmissionDecision::Denied(reason) => {
                steps.push(json!({
                    "reserve": amount,
                    "decision": "denied",
                    "code": reason.code(),
                    "reason": reason,
                }));
            }
        }
        clock.advance(Duration::seconds(1));
    }

    controller.recorder().flush().await;
    let balance = controller.get_balance("sim-account").await?;
    let usage = controller
        .get_usage("sim-account", start, None, 100)
        .await?;

    let report = json!({
        "steps": steps,
        "balance": balance,
        "usage_entries": usage.entries.len(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render simulation report")?
    );
    Ok(())
}

/// Run the background jobs against the configured store
async fn maintain(config: &Config, once: bool) -> Result<()> {
    if config.store.backend == StoreBackend::Memory {
        warn!("Memory store is private to this process; no serving instance's state is maintained");
    }
    let stores = config.store.open().await?;
    let timeout = config.store.timeout();

    let controller = AdmissionController::builder(stores.clone())
        .store_timeout(timeout)
        .ledger_config(config.ledger.clone())
        .rate_limit_config(config.rate_limit.clone())
        .hierarchy_config(config.hierarchy.clone())
        .usage_config(config.usage.clone())
        .build();
    let scheduler = Arc::new(ResetScheduler::new(
        stores.accounts.clone(),
        config.scheduler.clone(),
        timeout,
        Arc::new(meterguard::clock::SystemClock),
    ));
    let runner = Arc::new(MaintenanceRunner::new(
        controller.ledger().clone(),
        scheduler,
        controller.rate_limiter().clone(),
        controller.recorder().clone(),
        config.maintenance.clone(),
    ));

    if once {
        let report = runner.run_once().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to render maintenance report")?
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = runner.spawn(shutdown_rx.clone());

    let metrics = if config.metrics.enabled {
        let listener = metrics_server::bind(config.metrics.port).await?;
        Some(tokio::spawn(metrics_server::serve(listener, shutdown_rx)))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    maintenance.await.context("Maintenance task panicked")?;
    if let Some(metrics) = metrics {
        if let Err(e) = metrics.await.context("Metrics task panicked")? {
            warn!("Metrics server exited with error: {:#}", e);
        }
    }
    Ok(())
}
