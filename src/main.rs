//! sheetops - coordinator demo binary
//!
//! Runs a concurrent synthetic workload of spreadsheet transactions against
//! the in-memory backend, with the admission controller adapting to the
//! backend's emulated concurrency ceiling, and reports the coordinator stats.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use sheetops::config::Config;
use sheetops::endpoints;
use sheetops::simulation::InMemorySheets;
use sheetops::transaction::{ClientRouter, Operation, TransactionCoordinator};
use sheetops::types::{BeginOptions, IsolationLevel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "SHEETOPS_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Metrics port (overrides the config file)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Transactions in the synthetic workload
    #[arg(long, default_value = "40")]
    transactions: usize,

    /// Spreadsheets the workload spreads over
    #[arg(long, default_value = "4")]
    resources: usize,

    /// Concurrent calls the simulated backend accepts before answering 429
    #[arg(long, default_value = "6")]
    server_ceiling: usize,

    /// Keep serving metrics after the workload until Ctrl-C
    #[arg(long)]
    hold: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.json_logs)?;

    info!("Starting sheetops coordinator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    info!("Loading configuration from: {}", args.config);
    let mut config = load_config(&args.config)?;
    if let Some(port) = args.metrics_port {
        config.monitoring.metrics_port = port;
    }

    let sheets = Arc::new(InMemorySheets::new());
    sheets.set_latency(Some((Duration::from_millis(5), Duration::from_millis(25))));
    sheets.set_concurrency_ceiling(Some(args.server_ceiling));

    let coordinator = Arc::new(TransactionCoordinator::from_config(
        &config,
        sheets.clone(),
        ClientRouter::single(sheets.clone()),
    ));

    // Initialize metrics
    if config.monitoring.enable_metrics {
        let metrics_port = config.monitoring.metrics_port;
        info!("Starting metrics server on port {}", metrics_port);
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(metrics_port, coordinator).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    run_workload(&coordinator, args.transactions, args.resources.max(1)).await;

    let stats = coordinator.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("Failed to encode stats")?
    );
    info!(
        throttled = sheets.throttled_calls(),
        peak_in_flight = sheets.peak_in_flight(),
        "Workload finished"
    );

    if args.hold {
        run_event_loop(&coordinator).await?;
    }

    coordinator.shutdown();
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "sheetops=debug,info"
    } else {
        "sheetops=info,warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(true)))
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        Config::from_env().context("Invalid configuration from environment")
    }
}

/// One synthetic transaction: formatting patches that merge, value writes
/// on adjacent rows, and a header sheet
fn workload_operations(resource_id: &str, index: usize) -> Vec<Operation> {
    let row = index % 50 + 1;
    let mut ops = vec![
        Operation::new("format", "set_background", resource_id)
            .with_range(format!("A{}:D{}", row, row))
            .with_params(json!({ "backgroundColor": { "red": 0.9 } }))
            .field_patch(),
        Operation::new("format", "set_text_format", resource_id)
            .with_range(format!("A{}:D{}", row, row))
            .with_params(json!({ "textFormat": { "bold": true } }))
            .field_patch(),
    ];

    for offset in 0..3 {
        ops.push(
            Operation::new("values", "write", resource_id)
                .with_range(format!("F{}", row + offset))
                .with_params(json!({ "values": [[index, offset]] })),
        );
    }

    ops
}

async fn run_workload(coordinator: &Arc<TransactionCoordinator>, transactions: usize, resources: usize) {
    info!(transactions, resources, "Running synthetic workload");

    let tasks = (0..transactions).map(|index| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let resource_id = format!("sheet-{}", index % resources);
            let options = BeginOptions::default()
                .with_auto_rollback(index % 3 == 0)
                .with_isolation(match index % 5 {
                    0 => IsolationLevel::Serializable,
                    1 => IsolationLevel::ReadUncommitted,
                    _ => IsolationLevel::ReadCommitted,
                });

            let id = coordinator.begin(&resource_id, options).await?;
            for operation in workload_operations(&resource_id, index) {
                coordinator.queue(id, operation)?;
            }
            coordinator.commit(id).await
        })
    });

    let mut failed = 0;
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(Ok(commit)) if commit.succeeded => {}
            Ok(Ok(commit)) => {
                failed += 1;
                warn!(transaction_id = %commit.transaction_id, effect = ?commit.effect, "Workload commit failed");
            }
            Ok(Err(e)) => {
                failed += 1;
                warn!(code = e.code(), "Workload transaction rejected: {}", e);
            }
            Err(e) => {
                failed += 1;
                error!("Workload task panicked: {}", e);
            }
        }
    }

    info!(failed, "Synthetic workload complete");
}

/// Serve metrics until Ctrl-C, pruning finished transactions periodically
async fn run_event_loop(coordinator: &Arc<TransactionCoordinator>) -> Result<()> {
    info!("Holding; press Ctrl-C to exit");

    let mut prune_interval = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = prune_interval.tick() => {
                let removed = coordinator.prune_finished();
                let snapshot = coordinator.admission().snapshot();
                info!(
                    removed,
                    current_limit = snapshot.current_limit,
                    in_flight = snapshot.in_flight,
                    "Periodic maintenance"
                );
            }

            // Graceful shutdown signal
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Shutting down gracefully...");
    Ok(())
}
