//! End-to-end pipeline test: recorded bars -> replay -> ingestion ->
//! features -> stability -> gate, on a temporary database.

use chrono::{NaiveDate, TimeZone, Utc};
use tempfile::TempDir;
use tickgate::config::{FeatureConfig, IngestConfig, ReplayConfig, StabilityConfig};
use tickgate::feed::replay::ReplayBarFeed;
use tickgate::features::FeatureEngine;
use tickgate::gate;
use tickgate::ingest::IngestionPipeline;
use tickgate::models::{Bar, BarSource, FilterReason};
use tickgate::stability::StabilityTester;
use tickgate::storage::MarketStore;
use tokio::sync::watch;

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 20).unwrap()
}

/// Daily bars whose closes follow the given log-return path.
fn bars_from_returns(symbol: &str, returns: &[f64]) -> Vec<Bar> {
    let base = Utc.with_ymd_and_hms(2026, 1, 5, 21, 0, 0).unwrap();
    let mut close = 100.0;
    let mut bars = Vec::with_capacity(returns.len() + 1);
    for (i, r) in std::iter::once(&0.0).chain(returns.iter()).enumerate() {
        close *= r.exp();
        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp: base + chrono::Duration::days(i as i64),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 10_000,
            source: BarSource::Live,
        });
    }
    bars
}

/// Steady compounding: passes every stability check.
fn steady_returns(count: usize) -> Vec<f64> {
    vec![0.01; count]
}

/// Two volatility regimes, alternating sign: a textbook ARCH failure.
fn clustered_returns(count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| {
            let magnitude = if i < count / 2 { 0.001 } else { 0.05 };
            if i % 2 == 0 {
                magnitude
            } else {
                -magnitude
            }
        })
        .collect()
}

#[tokio::test]
async fn test_replay_to_gate_full_pipeline() {
    let dir = TempDir::new().unwrap();
    // The recording lives in one database, the pipeline writes to another,
    // like a replay service feeding a fresh ingestion target.
    let recording = MarketStore::open(dir.path().join("recorded.db").to_str().unwrap()).unwrap();
    let store = MarketStore::open(dir.path().join("pipeline.db").to_str().unwrap()).unwrap();

    recording
        .upsert_bars(&bars_from_returns("AAPL", &steady_returns(39)))
        .unwrap();
    recording
        .upsert_bars(&bars_from_returns("BADCO", &clustered_returns(39)))
        .unwrap();

    // Replay the recording at high speed and ingest it.
    let replay_config = ReplayConfig {
        mode: "single_pass".to_string(),
        speed_multiplier: 10_000.0,
        ..Default::default()
    };
    let (_tx, shutdown) = watch::channel(false);
    let mut feed = ReplayBarFeed::from_store(
        &recording,
        &replay_config,
        vec!["AAPL".to_string(), "BADCO".to_string()],
        shutdown.clone(),
    )
    .unwrap();

    let pipeline = IngestionPipeline::new(store.clone(), IngestConfig::default());
    let summary = pipeline.run(&mut feed, shutdown).await.unwrap();
    assert_eq!(summary.bars_received, 80);
    assert_eq!(summary.bars_committed, 80);
    assert_eq!(summary.batches_failed, 0);
    assert_eq!(store.bar_count().unwrap(), 80);

    // Everything ingested through replay is tagged replayed.
    let ingested = store.load_bars(&["AAPL".to_string()], None).unwrap();
    assert!(ingested.iter().all(|b| b.source == BarSource::Replayed));

    // Feature cycle runs strictly after the ingestion cycle completed.
    let symbols = vec!["AAPL".to_string(), "BADCO".to_string()];
    let engine = FeatureEngine::new(store.clone(), FeatureConfig::default());
    let written = engine.run_cycle(&symbols, as_of());
    assert_eq!(written, 60);

    // Stability cycle persists one verdict per symbol.
    let tester = StabilityTester::new(store.clone(), StabilityConfig::default());
    let verdicts = tester.run_cycle(&symbols, as_of());
    assert_eq!(verdicts.len(), 2);

    let aapl = verdicts.iter().find(|v| v.symbol == "AAPL").unwrap();
    assert!(aapl.is_stable, "steady series must pass: {:?}", aapl);

    let badco = verdicts.iter().find(|v| v.symbol == "BADCO").unwrap();
    assert!(!badco.is_stable);
    assert_eq!(badco.filter_reason, Some(FilterReason::ArchTestFailed));
    assert!(badco.arch_test_pvalue.unwrap() < 0.05);

    // The gate serves only the stable symbol's features.
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let gated = gate::stable_features(&store, start, 1_000).unwrap();
    assert_eq!(gated.len(), 30);
    assert!(gated.iter().all(|f| f.symbol == "AAPL"));

    // Restartable pure read: a second run returns the same rows.
    let again = gate::stable_features(&store, start, 1_000).unwrap();
    assert_eq!(gated, again);
}

#[tokio::test]
async fn test_recompute_cycles_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = MarketStore::open(dir.path().join("p.db").to_str().unwrap()).unwrap();
    store
        .upsert_bars(&bars_from_returns("AAPL", &steady_returns(39)))
        .unwrap();

    let symbols = vec!["AAPL".to_string()];
    let engine = FeatureEngine::new(store.clone(), FeatureConfig::default());
    let tester = StabilityTester::new(store.clone(), StabilityConfig::default());

    engine.run_cycle(&symbols, as_of());
    let first_features = store.load_features_for_date("AAPL", as_of()).unwrap();
    let first_verdicts = tester.run_cycle(&symbols, as_of());

    // Re-running the same cycles overwrites the same keys with the same rows.
    engine.run_cycle(&symbols, as_of());
    let second_features = store.load_features_for_date("AAPL", as_of()).unwrap();
    let second_verdicts = tester.run_cycle(&symbols, as_of());

    assert_eq!(first_features, second_features);
    assert_eq!(first_verdicts[0], second_verdicts[0]);
    assert_eq!(store.feature_count().unwrap(), 30);
    assert_eq!(store.verdict_count().unwrap(), 1);
}
