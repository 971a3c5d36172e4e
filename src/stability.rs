//! Variance-Stability Tester
//!
//! Classifies each symbol/day as usable or filtered for downstream model
//! training. Three checks run against the trailing log-return window, first
//! failure wins: insufficient data, ARCH heteroskedasticity, rolling-std
//! coefficient of variation, Ljung-Box autocorrelation.
//!
//! Thresholds are pure configuration: a p-value threshold of 0.0 disables
//! that test (strict vs relaxed regimes are both legitimate).

use crate::config::StabilityConfig;
use crate::models::{FilterReason, StabilityVerdict};
use crate::storage::MarketStore;
use anyhow::Result;
use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, error, info};

const EPS: f64 = 1e-12;

pub struct StabilityTester {
    store: MarketStore,
    config: StabilityConfig,
}

impl StabilityTester {
    pub fn new(store: MarketStore, config: StabilityConfig) -> Self {
        Self { store, config }
    }

    /// Deterministic verdict for the trailing window ending at `as_of`.
    /// Insufficient data is a verdict, not an error.
    pub fn test_stability(&self, symbol: &str, as_of: NaiveDate) -> Result<StabilityVerdict> {
        let features =
            self.store
                .load_trailing_features(symbol, as_of, self.config.test_window)?;

        let returns: Vec<f64> = features.iter().filter_map(|f| f.log_return).collect();
        let rolling_stds: Vec<f64> = features.iter().filter_map(|f| f.rolling_std).collect();
        let record_count = returns.len();

        let mut verdict = StabilityVerdict {
            symbol: symbol.to_string(),
            test_date: as_of,
            record_count,
            arch_test_pvalue: None,
            rolling_std_cv: None,
            ljung_box_pvalue: None,
            is_stable: false,
            filter_reason: None,
            test_window: self.config.test_window,
            arch_lags: self.config.arch_lags,
        };

        if record_count < self.config.min_records {
            verdict.filter_reason = Some(FilterReason::InsufficientData);
            return Ok(verdict);
        }

        verdict.arch_test_pvalue = arch_lm_test(&returns, self.config.arch_lags);
        verdict.rolling_std_cv = coefficient_of_variation(&rolling_stds);
        verdict.ljung_box_pvalue = ljung_box_test(&returns, self.config.ljung_box_lags);

        verdict.filter_reason = self.first_failure(&verdict);
        verdict.is_stable = verdict.filter_reason.is_none();

        debug!(
            symbol,
            arch_p = ?verdict.arch_test_pvalue,
            cv = ?verdict.rolling_std_cv,
            lb_p = ?verdict.ljung_box_pvalue,
            stable = verdict.is_stable,
            "stability tested"
        );
        Ok(verdict)
    }

    /// Priority order: ARCH, then CV, then Ljung-Box. A check that could not
    /// be computed is skipped rather than failed; too-short windows were
    /// already caught by the min_records gate.
    fn first_failure(&self, v: &StabilityVerdict) -> Option<FilterReason> {
        if let Some(p) = v.arch_test_pvalue {
            if p < self.config.arch_pvalue_threshold {
                return Some(FilterReason::ArchTestFailed);
            }
        }
        if let Some(cv) = v.rolling_std_cv {
            if cv > self.config.cv_threshold {
                return Some(FilterReason::HighVolatility);
            }
        }
        if let Some(p) = v.ljung_box_pvalue {
            if p < self.config.ljung_box_pvalue_threshold {
                return Some(FilterReason::AutocorrelationDetected);
            }
        }
        None
    }

    /// One scheduled cycle: test and persist a verdict per symbol. Filtered
    /// symbols are reported through the stability store, never dropped. A
    /// symbol whose test or write fails is logged and skipped; the rest of
    /// the cycle proceeds.
    pub fn run_cycle(&self, symbols: &[String], as_of: NaiveDate) -> Vec<StabilityVerdict> {
        let mut verdicts = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let verdict = match self.test_stability(symbol, as_of) {
                Ok(v) => v,
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "stability test failed");
                    continue;
                }
            };
            if let Err(e) = self.store.upsert_verdict(&verdict) {
                error!(symbol = %symbol, error = %e, "verdict write failed");
                continue;
            }
            verdicts.push(verdict);
        }
        let stable = verdicts.iter().filter(|v| v.is_stable).count();
        info!(
            as_of = %as_of,
            tested = verdicts.len(),
            stable,
            filtered = verdicts.len() - stable,
            "stability cycle complete"
        );
        verdicts
    }
}

/// Engle's Lagrange-multiplier test for autoregressive conditional
/// heteroskedasticity: regress squared demeaned returns on their own lags,
/// LM = n_eff * R^2 ~ chi-squared(lags) under the null of no ARCH effects.
/// Returns None when the window is too short to fit the regression; a
/// zero-variance regressand is defined as p = 1.0 (no ARCH evidence).
pub fn arch_lm_test(returns: &[f64], lags: usize) -> Option<f64> {
    let n = returns.len();
    if lags == 0 || n < lags + lags + 2 {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / n as f64;
    let e2: Vec<f64> = returns.iter().map(|r| (r - mean).powi(2)).collect();

    let n_eff = n - lags;
    let cols = lags + 1;
    if n_eff <= cols {
        return None;
    }

    let y_mean = e2[lags..].iter().sum::<f64>() / n_eff as f64;
    let ss_tot: f64 = e2[lags..].iter().map(|v| (v - y_mean).powi(2)).sum();
    if ss_tot <= EPS {
        // Constant squared residuals: nothing for the regression to explain.
        return Some(1.0);
    }

    let mut x = DMatrix::<f64>::zeros(n_eff, cols);
    let mut y = DVector::<f64>::zeros(n_eff);
    for t in 0..n_eff {
        x[(t, 0)] = 1.0;
        for lag in 1..=lags {
            x[(t, lag)] = e2[lags + t - lag];
        }
        y[t] = e2[lags + t];
    }

    let svd = x.clone().svd(true, true);
    let beta = svd.solve(&y, EPS).ok()?;
    let residuals = &y - &x * beta;
    let ss_res = residuals.norm_squared();

    let r2 = (1.0 - ss_res / ss_tot).clamp(0.0, 1.0);
    let lm = n_eff as f64 * r2;
    chi_squared_sf(lm, lags as f64)
}

/// Ljung-Box Q statistic for residual autocorrelation:
/// Q = n(n+2) * sum_{k=1..h} rho_k^2 / (n - k), ~ chi-squared(h) under the
/// null of no autocorrelation. A zero-variance series is defined as p = 1.0.
pub fn ljung_box_test(returns: &[f64], lags: usize) -> Option<f64> {
    let n = returns.len();
    if lags == 0 || n <= lags + 1 {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / n as f64;
    let e: Vec<f64> = returns.iter().map(|r| r - mean).collect();
    let denom: f64 = e.iter().map(|v| v * v).sum();
    if denom <= EPS {
        return Some(1.0);
    }

    let mut q = 0.0;
    for k in 1..=lags {
        let rho: f64 = e[k..]
            .iter()
            .zip(e.iter())
            .map(|(a, b)| a * b)
            .sum::<f64>()
            / denom;
        q += rho * rho / (n - k) as f64;
    }
    q *= n as f64 * (n as f64 + 2.0);
    chi_squared_sf(q, lags as f64)
}

/// Coefficient of variation of the window's rolling standard deviations,
/// a volatility-of-volatility proxy. None when fewer than two observations.
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();

    if mean.abs() <= EPS {
        if std <= EPS {
            return Some(0.0);
        }
        return Some(f64::INFINITY);
    }
    Some(std / mean.abs())
}

/// Survival function of the chi-squared distribution.
fn chi_squared_sf(stat: f64, freedom: f64) -> Option<f64> {
    let dist = ChiSquared::new(freedom).ok()?;
    Some((1.0 - dist.cdf(stat)).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Feature;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn test_store() -> (TempDir, MarketStore) {
        let dir = TempDir::new().unwrap();
        let store = MarketStore::open(dir.path().join("s.db").to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 20).unwrap()
    }

    /// Write a feature row per return so the tester has a window to read.
    fn seed_features(store: &MarketStore, symbol: &str, returns: &[f64], rolling_stds: &[f64]) {
        let base = Utc.with_ymd_and_hms(2026, 2, 2, 21, 0, 0).unwrap();
        let features: Vec<Feature> = returns
            .iter()
            .enumerate()
            .map(|(i, r)| Feature {
                symbol: symbol.to_string(),
                timestamp: base + chrono::Duration::days(i as i64),
                log_close: 4.6,
                log_return: Some(*r),
                z_score: None,
                rolling_std: rolling_stds.get(i).copied(),
                rolling_mean: Some(0.0),
                volatility_annualized: None,
                feature_date: as_of(),
                computation_method: "rolling_log_return_v1".to_string(),
            })
            .collect();
        store.upsert_features(&features).unwrap();
    }

    /// Alternating-sign returns: constant squared residuals (no ARCH signal)
    /// but extreme negative lag-1 autocorrelation.
    fn alternating(magnitude: f64, count: usize) -> Vec<f64> {
        (0..count)
            .map(|i| if i % 2 == 0 { magnitude } else { -magnitude })
            .collect()
    }

    /// Two volatility regimes: tiny returns then large ones, both alternating
    /// in sign. Squared residuals are strongly predictable from their lags.
    fn regime_switch(count: usize) -> Vec<f64> {
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

    fn strict_config() -> StabilityConfig {
        StabilityConfig {
            test_window: 30,
            min_records: 20,
            arch_lags: 2,
            ljung_box_lags: 5,
            arch_pvalue_threshold: 0.05,
            cv_threshold: 1.5,
            ljung_box_pvalue_threshold: 0.05,
            test_timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_arch_detects_volatility_clustering() {
        let p = arch_lm_test(&regime_switch(30), 2).unwrap();
        assert!(p < 0.05, "expected ARCH rejection, p = {}", p);
    }

    #[test]
    fn test_arch_passes_constant_variance() {
        // Constant squared residuals: degenerate regression, p = 1.0.
        let p = arch_lm_test(&alternating(0.01, 30), 2).unwrap();
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_arch_too_short_window() {
        assert!(arch_lm_test(&[0.01, -0.01, 0.02], 2).is_none());
    }

    #[test]
    fn test_ljung_box_detects_autocorrelation() {
        let p = ljung_box_test(&alternating(0.01, 30), 5).unwrap();
        assert!(p < 0.001, "expected autocorrelation rejection, p = {}", p);
    }

    #[test]
    fn test_ljung_box_zero_variance() {
        let p = ljung_box_test(&vec![0.0; 30], 5).unwrap();
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cv_basics() {
        assert_eq!(coefficient_of_variation(&[0.01]), None);
        assert_eq!(coefficient_of_variation(&[0.0, 0.0, 0.0]), Some(0.0));
        let cv = coefficient_of_variation(&[0.01, 0.01, 0.01]).unwrap();
        assert!(cv.abs() < 1e-9);
        let spiky = coefficient_of_variation(&[0.001, 0.1, 0.001, 0.1]).unwrap();
        assert!(spiky > 1.0);
    }

    #[test]
    fn test_insufficient_data_wins_regardless_of_values() {
        let (_dir, store) = test_store();
        // Five wild returns, far below min_records = 20.
        seed_features(&store, "AAPL", &regime_switch(6), &[0.01; 6]);

        let tester = StabilityTester::new(store, strict_config());
        let verdict = tester.test_stability("AAPL", as_of()).unwrap();
        assert!(!verdict.is_stable);
        assert_eq!(verdict.filter_reason, Some(FilterReason::InsufficientData));
        assert_eq!(verdict.arch_test_pvalue, None);
        assert_eq!(verdict.ljung_box_pvalue, None);
    }

    #[test]
    fn test_arch_failure_reason() {
        let (_dir, store) = test_store();
        seed_features(&store, "AAPL", &regime_switch(30), &[0.01; 30]);

        let tester = StabilityTester::new(store, strict_config());
        let verdict = tester.test_stability("AAPL", as_of()).unwrap();
        assert!(!verdict.is_stable);
        // ARCH outranks the (also failing) Ljung-Box check.
        assert_eq!(verdict.filter_reason, Some(FilterReason::ArchTestFailed));
        assert!(verdict.arch_test_pvalue.unwrap() < 0.05);
    }

    #[test]
    fn test_high_volatility_reason() {
        let (_dir, store) = test_store();
        // Constant variance (ARCH passes) but a huge rolling_std spike.
        let mut stds = vec![0.001; 30];
        stds[29] = 0.5;
        seed_features(&store, "AAPL", &alternating(0.01, 30), &stds);

        let mut config = strict_config();
        // Disable the Ljung-Box check to isolate the CV branch.
        config.ljung_box_pvalue_threshold = 0.0;
        let tester = StabilityTester::new(store, config);
        let verdict = tester.test_stability("AAPL", as_of()).unwrap();
        assert_eq!(verdict.filter_reason, Some(FilterReason::HighVolatility));
        assert!(verdict.rolling_std_cv.unwrap() > 1.5);
    }

    #[test]
    fn test_autocorrelation_reason() {
        let (_dir, store) = test_store();
        // Constant variance and constant rolling_std: only Ljung-Box fails.
        seed_features(&store, "AAPL", &alternating(0.01, 30), &[0.01; 30]);

        let tester = StabilityTester::new(store, strict_config());
        let verdict = tester.test_stability("AAPL", as_of()).unwrap();
        assert_eq!(
            verdict.filter_reason,
            Some(FilterReason::AutocorrelationDetected)
        );
        assert!((verdict.arch_test_pvalue.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_relaxed_regime_disables_checks() {
        let (_dir, store) = test_store();
        seed_features(&store, "AAPL", &alternating(0.01, 30), &[0.01; 30]);

        // 0.0 p-value thresholds disable both statistical tests.
        let config = StabilityConfig {
            arch_pvalue_threshold: 0.0,
            ljung_box_pvalue_threshold: 0.0,
            cv_threshold: f64::INFINITY,
            ..strict_config()
        };
        let tester = StabilityTester::new(store, config);
        let verdict = tester.test_stability("AAPL", as_of()).unwrap();
        assert!(verdict.is_stable);
        assert_eq!(verdict.filter_reason, None);
        // Test values are still recorded for the audit trail.
        assert!(verdict.ljung_box_pvalue.is_some());
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let (_dir, store) = test_store();
        seed_features(&store, "AAPL", &regime_switch(30), &[0.01; 30]);

        let tester = StabilityTester::new(store, strict_config());
        let first = tester.test_stability("AAPL", as_of()).unwrap();
        let second = tester.test_stability("AAPL", as_of()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_run_cycle_persists_verdicts() {
        let (_dir, store) = test_store();
        seed_features(&store, "AAPL", &regime_switch(30), &[0.01; 30]);
        seed_features(&store, "MSFT", &alternating(0.01, 30), &[0.01; 30]);

        let tester = StabilityTester::new(store.clone(), strict_config());
        let verdicts = tester.run_cycle(&["AAPL".to_string(), "MSFT".to_string()], as_of());
        assert_eq!(verdicts.len(), 2);
        assert_eq!(store.verdict_count().unwrap(), 2);
        assert!(store.load_verdict("AAPL", as_of()).unwrap().is_some());
    }

    #[test]
    fn test_run_cycle_isolates_per_symbol_failures() {
        let (_dir, store) = test_store();
        seed_features(&store, "AAPL", &alternating(0.01, 30), &[0.01; 30]);
        // A feature row the loader cannot parse: text where a number belongs.
        store
            .execute_raw(
                "INSERT INTO features (symbol, timestamp, log_close, feature_date, \
                                       computation_method) \
                 VALUES ('BADROW', 1767300000000, 'bogus', '2026-03-20', \
                         'rolling_log_return_v1')",
            )
            .unwrap();

        let tester = StabilityTester::new(store.clone(), strict_config());
        let verdicts = tester.run_cycle(&["BADROW".to_string(), "AAPL".to_string()], as_of());

        // The broken symbol is skipped; the rest of the cycle still runs.
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].symbol, "AAPL");
        assert!(store.load_verdict("AAPL", as_of()).unwrap().is_some());
        assert!(store.load_verdict("BADROW", as_of()).unwrap().is_none());
    }
}
