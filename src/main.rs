//! PerpLemma - Main Entry Point
//!
//! Drives the position manager against the in-memory perpetual protocol and
//! inspects what a run persisted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use perp_lemma::config::Config;
use perp_lemma::ledger::{Address, MockAggregator, PositionChanged, SimulatedLedger};
use perp_lemma::lemma::{CollateralBalances, LeverageReport, PerpLemma, RebalanceParams};
use perp_lemma::persistence::PersistenceManager;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// PerpLemma CLI
#[derive(Parser)]
#[command(name = "perp-lemma")]
#[command(version, about = "Exact-collateral perpetual position manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open, rebalance and close on the simulated protocol
    Scenario {
        /// Collateral handed to the manager by the USD issuer
        #[arg(short, long, default_value = "1000")]
        collateral: Decimal,

        /// Signed base amount for the rebalance step (0 skips it)
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        rebalance: Decimal,

        /// Path to SQLite database
        #[arg(short, long, default_value = "data/perp_lemma.db")]
        db: String,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show persisted settings and the position journal
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/perp_lemma.db")]
        db: String,
    },

    /// Print ABI-encoded rebalance params as hex
    EncodeRebalance {
        /// Price limit in quote per base (omit for none)
        #[arg(short, long)]
        price_limit: Option<Decimal>,

        /// RFC 3339 deadline (omit for none)
        #[arg(short, long)]
        deadline: Option<DateTime<Utc>>,
    },
}

/// Everything a scenario run produced.
#[derive(Debug, Serialize)]
struct ScenarioReport {
    manager: Address,
    opened: PositionChanged,
    leverage_after_open: LeverageReport,
    rebalanced: Option<PositionChanged>,
    closes: Vec<PositionChanged>,
    collateral_released: Decimal,
    final_balances: CollateralBalances,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Commands::Scenario {
            collateral,
            rebalance,
            db,
            json,
        } => run_scenario(collateral, rebalance, &db, json).await,
        Commands::Status { db } => show_status(&db),
        Commands::EncodeRebalance {
            price_limit,
            deadline,
        } => {
            let params = RebalanceParams::new(price_limit, deadline)?;
            println!("0x{}", hex::encode(params.encode()));
            Ok(())
        }
    }
}

/// Initialize logging with console and rolling file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "perp-lemma.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("perp_lemma=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Market: {} / {}", config.market.base_token, config.market.quote_token);
    info!("   Direction: {}", config.lemma.direction);
    info!("   Target Leverage: {}x", config.lemma.target_leverage);
    match config.lemma.max_position {
        Some(cap) => info!("   Max Position: {}", cap),
        None => info!("   Max Position: unbounded"),
    }
    info!(
        "   Pool: {} base / {} quote, fee {:.2}%",
        config.simulation.base_reserve,
        config.simulation.quote_reserve,
        config.simulation.fee_ratio * dec!(100)
    );
}

async fn run_scenario(collateral: Decimal, rebalance: Decimal, db_path: &str, json: bool) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for {db_path}"))?;
    }
    let persistence = PersistenceManager::new(db_path)?;

    let controller_config = config.controller_config();
    let settings = config.lemma_settings()?;
    let usd_issuer = settings.usd_issuer;

    let ledger = Arc::new(SimulatedLedger::new(config.simulated_ledger_config()));
    ledger
        .add_market(
            controller_config.base_token,
            config.simulation.base_reserve,
            config.simulation.quote_reserve,
            config.simulation.fee_ratio,
        )
        .await;
    let oracle = Arc::new(MockAggregator::new(config.simulation.collateral_price));

    let lemma = PerpLemma::new(controller_config, settings, ledger.clone(), oracle);
    lemma.reset_approvals().await?;

    // USD issuer funds the manager
    ledger.mint(&usd_issuer, collateral).await;
    lemma.collateral().receive(&usd_issuer, collateral).await?;

    let opened = lemma.open_with_exact_collateral(&usd_issuer, collateral).await?;
    persistence.record_event("open", &opened.event)?;

    let leverage_after_open = lemma.leverage().await?;
    if !leverage_after_open.is_within(config.lemma.target_leverage, config.lemma.leverage_tolerance) {
        warn!(
            leverage = %leverage_after_open.leverage,
            target = %config.lemma.target_leverage,
            "Leverage outside tolerance after open"
        );
    }

    let rebalanced = match (rebalance.is_zero(), lemma.settings().await.rebalancer) {
        (true, _) => None,
        (false, None) => {
            warn!("No rebalancer configured, skipping rebalance step");
            None
        }
        (false, Some(rebalancer)) => {
            let aux = RebalanceParams::unbounded().encode();
            let event = lemma.rebalance(&usd_issuer, &rebalancer, rebalance, &aux).await?;
            if let Some(event) = &event {
                persistence.record_event("rebalance", event)?;
            }
            event
        }
    };

    // Close in two halves
    let mut closes = Vec::new();
    let mut collateral_released = Decimal::ZERO;
    let half = lemma.position().await?.size.abs() / dec!(2);
    for step in 0..2 {
        let amount = if step == 0 {
            half
        } else {
            lemma.position().await?.size.abs()
        };
        if amount.is_zero() {
            break;
        }
        let outcome = lemma.close_with_exact_collateral(&usd_issuer, amount).await?;
        persistence.record_event("close", &outcome.event)?;
        collateral_released += outcome.collateral_released;
        closes.push(outcome.event);
    }

    persistence.save_settings(&lemma.settings().await)?;

    let report = ScenarioReport {
        manager: lemma.address(),
        opened: opened.event,
        leverage_after_open,
        rebalanced,
        closes,
        collateral_released,
        final_balances: lemma.collateral_balances().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, collateral);
    }
    Ok(())
}

fn print_report(report: &ScenarioReport, collateral: Decimal) {
    println!("Scenario for manager {}", report.manager);
    println!("   ├─ Collateral In:   {}", collateral);
    println!(
        "   ├─ Opened:          {} base for {} quote",
        report.opened.exchanged_base, report.opened.exchanged_quote
    );
    println!("   ├─ Leverage:        {:.4}x", report.leverage_after_open.leverage);
    if let Some(event) = &report.rebalanced {
        println!("   ├─ Rebalanced:      {} base", event.exchanged_base);
    }
    for (idx, close) in report.closes.iter().enumerate() {
        println!(
            "   ├─ Close #{}:        {} base, realized {:.6}",
            idx + 1,
            close.exchanged_base,
            close.realized_pnl
        );
    }
    println!("   ├─ Released:        {}", report.collateral_released);
    println!("   └─ Un-deployed:     {}", report.final_balances.undeployed);
}

/// Show persisted settings and journal.
fn show_status(db_path: &str) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Database not found: {}", db_path);
        println!("   Run `perp-lemma scenario` first, or check the database path.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;

    match persistence.load_settings()? {
        Some(settings) => {
            println!("Settings");
            println!("   ├─ Owner:         {}", settings.owner);
            println!("   ├─ USD Issuer:    {}", settings.usd_issuer);
            match settings.rebalancer {
                Some(rebalancer) => println!("   ├─ Rebalancer:    {}", rebalancer),
                None => println!("   ├─ Rebalancer:    (unset)"),
            }
            println!("   ├─ Referrer Code: {:?}", settings.referrer_code.as_string());
            if settings.max_position == Decimal::MAX {
                println!("   └─ Max Position:  unbounded");
            } else {
                println!("   └─ Max Position:  {}", settings.max_position);
            }
        }
        None => println!("No saved settings found in database."),
    }

    let entries = persistence.events()?;
    println!("\nPosition Journal ({} events)", entries.len());
    for entry in &entries {
        println!(
            "   ├─ #{} {} base {} quote {} pnl {:.6} @ {}",
            entry.id,
            entry.operation,
            entry.event.exchanged_base,
            entry.event.exchanged_quote,
            entry.event.realized_pnl,
            entry.event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    println!();
    Ok(())
}
