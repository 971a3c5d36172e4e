//! Tickgate CLI
//!
//! Entry points for the scheduled pipeline stages. An external scheduler is
//! expected to invoke these in order per cycle: `ingest`, then `features`,
//! then `stability` (the feature stage must run strictly after the ingestion
//! cycle it reads from), with `gate` serving the downstream consumer and
//! `cleanup` handling replayed-bar retention.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tickgate::config::{Config, SourceMode};
use tickgate::feed::live::LiveBarFeed;
use tickgate::feed::replay::ReplayBarFeed;
use tickgate::feed::SessionGuard;
use tickgate::features::FeatureEngine;
use tickgate::gate;
use tickgate::ingest::IngestionPipeline;
use tickgate::stability::StabilityTester;
use tickgate::storage::MarketStore;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tickgate")]
#[command(about = "Tick ingestion, feature computation and stability gating")]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long, env = "TICKGATE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured source (live | recycler) through the ingestion
    /// pipeline until the stream ends or Ctrl-C.
    Ingest,

    /// Compute features for the trailing window ending at --as-of.
    Features {
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Comma-separated override of the configured symbol list.
        #[arg(long)]
        symbols: Option<String>,
    },

    /// Run the stability tests and persist a verdict per symbol.
    Stability {
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long)]
        symbols: Option<String>,
    },

    /// Print gated (stable-only) features as JSON lines.
    Gate {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long, default_value = "1000")]
        limit: usize,
    },

    /// Delete replayed bars older than the retention horizon.
    Cleanup,

    /// Show row counts and latest timestamps.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tickgate=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let store = MarketStore::open(&config.db_path)?;

    match args.command {
        Commands::Ingest => cmd_ingest(&config, store).await,
        Commands::Features { as_of, symbols } => {
            cmd_features(&config, store, resolve_as_of(as_of), symbols)
        }
        Commands::Stability { as_of, symbols } => {
            cmd_stability(&config, store, resolve_as_of(as_of), symbols).await
        }
        Commands::Gate { start, limit } => cmd_gate(store, start, limit),
        Commands::Cleanup => cmd_cleanup(&config, store),
        Commands::Status => cmd_status(store),
    }
}

fn resolve_as_of(as_of: Option<NaiveDate>) -> NaiveDate {
    as_of.unwrap_or_else(|| Utc::now().date_naive())
}

fn resolve_symbols(config: &Config, override_csv: Option<String>) -> Vec<String> {
    match override_csv {
        Some(csv) => csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => config.symbols.clone(),
    }
}

async fn cmd_ingest(config: &Config, store: MarketStore) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, shutting down after the current batch");
            shutdown_tx.send(true).ok();
        }
    });

    let pipeline = IngestionPipeline::new(store.clone(), config.ingest.clone());

    let summary = match config.mode {
        SourceMode::Live => {
            let _guard = SessionGuard::acquire("live", &config.symbols)?;
            let mut feed = LiveBarFeed::connect(
                config.live.clone(),
                config.symbols.clone(),
                shutdown_rx.clone(),
            );
            pipeline.run(&mut feed, shutdown_rx).await?
        }
        SourceMode::Recycler => {
            let _guard = SessionGuard::acquire("replay", &config.symbols)?;
            let mut feed = ReplayBarFeed::from_store(
                &store,
                &config.replay,
                config.symbols.clone(),
                shutdown_rx.clone(),
            )?;
            pipeline.run(&mut feed, shutdown_rx).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_features(
    config: &Config,
    store: MarketStore,
    as_of: NaiveDate,
    symbols: Option<String>,
) -> Result<()> {
    let symbols = resolve_symbols(config, symbols);
    let engine = FeatureEngine::new(store, config.features.clone());
    let written = engine.run_cycle(&symbols, as_of);
    println!("features written: {}", written);
    Ok(())
}

/// Each symbol's statistical computation runs on the blocking pool under a
/// wall-clock budget: a pathological window fails that symbol's unit of
/// work, never the whole cycle.
async fn cmd_stability(
    config: &Config,
    store: MarketStore,
    as_of: NaiveDate,
    symbols: Option<String>,
) -> Result<()> {
    let symbols = resolve_symbols(config, symbols);
    let budget = Duration::from_millis(config.stability.test_timeout_ms);

    let mut stable = 0usize;
    let mut filtered = 0usize;
    let mut failed = 0usize;
    for symbol in &symbols {
        let tester = StabilityTester::new(store.clone(), config.stability.clone());
        let sym = symbol.clone();
        let result = timeout(
            budget,
            tokio::task::spawn_blocking(move || tester.test_stability(&sym, as_of)),
        )
        .await;

        match result {
            Ok(Ok(Ok(verdict))) => {
                store.upsert_verdict(&verdict)?;
                if verdict.is_stable {
                    stable += 1;
                } else {
                    filtered += 1;
                    info!(
                        symbol = %symbol,
                        reason = ?verdict.filter_reason,
                        "symbol filtered"
                    );
                }
            }
            Ok(Ok(Err(e))) => {
                failed += 1;
                error!(symbol = %symbol, error = %e, "stability test failed");
            }
            Ok(Err(e)) => {
                failed += 1;
                error!(symbol = %symbol, error = %e, "stability task panicked");
            }
            Err(_) => {
                failed += 1;
                error!(symbol = %symbol, "stability test exceeded {:?} budget", budget);
            }
        }
    }

    println!(
        "stability {}: {} stable, {} filtered, {} failed",
        as_of, stable, filtered, failed
    );
    Ok(())
}

fn cmd_gate(store: MarketStore, start: NaiveDate, limit: usize) -> Result<()> {
    let features = gate::stable_features(&store, start, limit)?;
    for feature in &features {
        println!("{}", serde_json::to_string(feature)?);
    }
    info!(rows = features.len(), "gate query served");
    Ok(())
}

fn cmd_cleanup(config: &Config, store: MarketStore) -> Result<()> {
    if !config.retention.auto_cleanup {
        info!("auto_cleanup disabled; nothing to do");
        return Ok(());
    }
    let cutoff = Utc::now()
        - ChronoDuration::try_days(config.retention.retention_days)
            .context("retention_days out of range")?;
    let deleted = store.delete_replayed_before(cutoff)?;
    println!("deleted {} replayed bars older than {}", deleted, cutoff);
    Ok(())
}

fn cmd_status(store: MarketStore) -> Result<()> {
    println!("bars:      {}", store.bar_count()?);
    println!("features:  {}", store.feature_count()?);
    println!("verdicts:  {}", store.verdict_count()?);
    match store.latest_bar_timestamp()? {
        Some(ts) => println!("latest bar: {}", ts),
        None => println!("latest bar: (none)"),
    }
    Ok(())
}
