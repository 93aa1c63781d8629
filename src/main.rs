//! Zero-DTE Broker - command line entry point
//!
//! Operator commands for checking the gateway session, inspecting the
//! account and chains, and flattening open orders.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::Path;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use zero_dte_broker::account::AssignmentEvent;
use zero_dte_broker::config::Config;
use zero_dte_broker::persistence::{OrderLedger, SqliteStore};
use zero_dte_broker::BrokerClient;

/// Zero-DTE Broker CLI
#[derive(Parser)]
#[command(name = "zero-dte-broker")]
#[command(version, about = "Client portal session and order tooling for 0DTE options")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the session and print per-phase diagnostics
    Status,

    /// Show balances and margin
    Account,

    /// Show option positions
    Positions {
        /// Also report stock holdings that grew since the previous run
        #[arg(long)]
        assignments: bool,
    },

    /// Show the underlying quote and volatility proxy
    Quote {
        symbol: String,
    },

    /// Show the option chain inside the volatility band
    Chain {
        symbol: String,

        /// Expiration (YYYY-MM-DD); defaults to the current trading day
        #[arg(short, long)]
        expiration: Option<String>,
    },

    /// List open orders at the gateway
    OpenOrders,

    /// Cancel every open order
    CancelAll,

    /// Pull upstream order status into the local ledger
    Reconcile,

    /// Show open ledger entries and recent audit events (offline)
    Ledger {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of audit events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if let Commands::Ledger { db, limit } = &cli.command {
        let path = db.clone().unwrap_or_else(|| config.persistence.db_path.clone());
        return show_ledger(&path, *limit);
    }

    config.validate_credentials().context("Missing credentials")?;
    let client = BrokerClient::from_config(&config).context("Failed to create broker client")?;

    let outcome = run(&client, &config, cli.command).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }
    outcome
}

async fn run(client: &BrokerClient, config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            if let Err(e) = client.ensure_ready().await {
                error!(error = %e, retryable = e.is_retryable(), "Session not ready");
            }
            print_json(&client.diagnostics().await)
        }
        Commands::Account => print_json(&client.get_account().await?),
        Commands::Positions { assignments } => {
            print_json(&client.get_positions().await?)?;
            if assignments {
                print_json(&detect_assignments(client, &config.persistence.db_path).await?)?;
            }
            Ok(())
        }
        Commands::Quote { symbol } => print_json(&client.get_market_data(&symbol).await?),
        Commands::Chain { symbol, expiration } => {
            let expiration = expiration
                .as_deref()
                .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
                .transpose()
                .context("Invalid expiration format. Use YYYY-MM-DD")?;
            let chain = client.get_option_chain_with_strikes(&symbol, expiration).await?;
            info!(
                symbol = %chain.symbol,
                strikes = chain.strikes.len(),
                low = %chain.range.low,
                high = %chain.range.high,
                is_historical = chain.is_historical,
                "Chain loaded"
            );
            print_json(&chain)
        }
        Commands::OpenOrders => print_json(&client.get_open_orders().await?),
        Commands::CancelAll => print_json(&client.cancel_all_orders().await?),
        Commands::Reconcile => print_json(&client.reconcile_orders().await?),
        Commands::Ledger { .. } => Ok(()),
    }
}

/// Compare holdings against the baseline saved by the previous run, then
/// save the current holdings for the next one.
async fn detect_assignments(client: &BrokerClient, db_path: &str) -> Result<Vec<AssignmentEvent>> {
    let store = SqliteStore::new(db_path)?;
    match store.load_stock_baseline()? {
        Some(baseline) => client.seed_assignment_baseline(baseline),
        None => info!("No stock baseline yet, this run records one"),
    }

    let events = client.detect_assignments().await?;
    if let Some(current) = client.assignment_baseline() {
        store.save_stock_baseline(&current, Utc::now())?;
    }
    Ok(events)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn show_ledger(db_path: &str, limit: usize) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;
    let open = store.open_orders()?;
    println!("Open ledger orders: {}", open.len());
    for order in &open {
        println!(
            "  {} {} {} {} x{} status={} upstream={}",
            order.submitted_at.format("%Y-%m-%d %H:%M:%S"),
            order.side.as_str(),
            order.order_type.as_str(),
            order.symbol,
            order.quantity,
            order.status.as_str(),
            order.upstream_id.as_deref().unwrap_or("-"),
        );
    }

    let events = store.recent_audit_events(limit)?;
    println!("\nRecent audit events: {}", events.len());
    for event in &events {
        println!(
            "  {} {:<16} {:<8} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.status,
            event.detail
        );
    }
    Ok(())
}

/// Initialize logging with file and console output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "zero-dte-broker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    // stdout carries command output, so console logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("zero_dte_broker=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stderr.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}
