//! Feature Engine
//!
//! Derives log-returns, trailing rolling statistics and annualized
//! volatility from raw bars. Recomputing for the same (symbol, as_of) over
//! the same input window is bit-identical and overwrites the same keys.

use crate::config::FeatureConfig;
use crate::models::Feature;
use crate::storage::MarketStore;
use anyhow::Result;
use chrono::NaiveDate;
use statrs::statistics::Statistics;
use tracing::{debug, info};

pub const COMPUTATION_METHOD: &str = "rolling_log_return_v1";

pub struct FeatureEngine {
    store: MarketStore,
    config: FeatureConfig,
}

impl FeatureEngine {
    pub fn new(store: MarketStore, config: FeatureConfig) -> Self {
        Self { store, config }
    }

    /// Compute and persist features for the trailing window ending at
    /// `as_of`. Twice the window of bars is loaded so every written row has
    /// trailing history for its rolling statistics.
    pub fn compute_features(&self, symbol: &str, as_of: NaiveDate) -> Result<Vec<Feature>> {
        let window = self.config.window;
        let bars = self.store.load_trailing_bars(symbol, as_of, window * 2)?;

        // ln(close) is only defined for close > 0; reject bad observations
        // instead of writing poisoned rows.
        let mut skipped = 0usize;
        let bars: Vec<_> = bars
            .into_iter()
            .filter(|b| {
                if b.close > 0.0 {
                    true
                } else {
                    skipped += 1;
                    false
                }
            })
            .collect();
        if skipped > 0 {
            debug!(symbol, skipped, "skipped bars with non-positive close");
        }
        if bars.is_empty() {
            return Ok(Vec::new());
        }

        let log_closes: Vec<f64> = bars.iter().map(|b| b.close.ln()).collect();
        let log_returns: Vec<Option<f64>> = log_closes
            .iter()
            .enumerate()
            .map(|(i, lc)| {
                if i == 0 {
                    None
                } else {
                    Some(lc - log_closes[i - 1])
                }
            })
            .collect();

        let vol_scale = self.config.annualization_factor.sqrt();
        let mut features = Vec::with_capacity(bars.len());
        for (i, bar) in bars.iter().enumerate() {
            let trailing: Vec<f64> = log_returns[i.saturating_sub(window.saturating_sub(1))..=i]
                .iter()
                .flatten()
                .copied()
                .collect();

            // Sample statistics need at least two returns.
            let (rolling_mean, rolling_std) = if trailing.len() >= 2 {
                (
                    Some(trailing.as_slice().mean()),
                    Some(trailing.as_slice().std_dev()),
                )
            } else {
                (None, None)
            };

            let z_score = match (log_returns[i], rolling_mean, rolling_std) {
                (Some(r), Some(mean), Some(std)) if std > 0.0 => Some((r - mean) / std),
                _ => None,
            };

            features.push(Feature {
                symbol: symbol.to_string(),
                timestamp: bar.timestamp,
                log_close: log_closes[i],
                log_return: log_returns[i],
                z_score,
                rolling_std,
                rolling_mean,
                volatility_annualized: rolling_std.map(|s| s * vol_scale),
                feature_date: as_of,
                computation_method: COMPUTATION_METHOD.to_string(),
            });
        }

        // Persist only the trailing window; earlier rows were warm-up.
        let start = features.len().saturating_sub(window);
        let out: Vec<Feature> = features.split_off(start);
        self.store.upsert_features(&out)?;
        Ok(out)
    }

    /// One scheduled cycle over a symbol set. Per-symbol failures are logged
    /// and do not abort the remaining symbols.
    pub fn run_cycle(&self, symbols: &[String], as_of: NaiveDate) -> usize {
        let mut written = 0usize;
        for symbol in symbols {
            match self.compute_features(symbol, as_of) {
                Ok(features) => {
                    debug!(symbol = %symbol, rows = features.len(), "features computed");
                    written += features.len();
                }
                Err(e) => {
                    tracing::error!(symbol = %symbol, error = %e, "feature computation failed");
                }
            }
        }
        info!(as_of = %as_of, rows = written, "feature cycle complete");
        written
    }
}
