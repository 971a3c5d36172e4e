//! Pipeline Configuration
//!
//! Immutable configuration value loaded once at startup (TOML file, then
//! TICKGATE_* environment overrides) and passed into each component
//! constructor. Nothing in the pipeline reads ambient global state.

use crate::models::ReplayMode;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Which source adapter drives ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Subscribe to the external push feed.
    Live,
    /// Re-emit previously recorded bars (replay).
    Recycler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// WebSocket endpoint of the push-based market data provider.
    pub ws_url: String,
    pub connect_timeout_ms: u64,
    /// Backoff: base delay, doubled per failure up to the cap, +-30% jitter.
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://feed.example.com/bars".to_string(),
            connect_timeout_ms: 10_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// single_pass | loop | date_range
    pub mode: String,
    pub speed_multiplier: f64,
    /// Full passes for loop modes; -1 loops forever.
    pub loop_count: i64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// For date_range mode: loop within the range instead of a single pass.
    pub loop_in_range: bool,
    /// Explicit symbol substitution: requested symbol -> recorded symbol
    /// whose series is replayed under the requested name.
    pub proxies: HashMap<String, String>,
    /// Optional cap on the scaled inter-bar sleep. Uncapped by default so
    /// emission spacing is exactly recorded_gap / speed_multiplier; set a
    /// finite value to keep multi-day recording gaps from stalling a session.
    pub max_inter_bar_delay_secs: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mode: "single_pass".to_string(),
            speed_multiplier: 1.0,
            loop_count: 1,
            start_date: None,
            end_date: None,
            loop_in_range: false,
            proxies: HashMap::new(),
            max_inter_bar_delay_secs: f64::INFINITY,
        }
    }
}

impl ReplayConfig {
    pub fn parsed_mode(&self) -> Result<ReplayMode> {
        ReplayMode::parse(&self.mode)
            .with_context(|| format!("Unknown replay mode: {}", self.mode))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    /// Whole-batch retries before the batch is reported failed and skipped.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval_ms: 2_000,
            max_retries: 3,
            retry_delay_ms: 250,
            write_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Trailing observation count per (symbol, as_of) computation.
    pub window: usize,
    /// sqrt-of-this scales rolling_std to annualized volatility
    /// (252 trading days for daily bars).
    pub annualization_factor: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window: 30,
            annualization_factor: 252.0,
        }
    }
}

/// Statistical thresholds are pure configuration: a p-value threshold of 0.0
/// disables that test, a CV threshold of `inf` disables the CV check. Both
/// strict and relaxed regimes are legitimate; the defaults are the strict ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub test_window: usize,
    /// Below this many usable returns the verdict is insufficient_data.
    pub min_records: usize,
    pub arch_lags: usize,
    pub ljung_box_lags: usize,
    /// Fail when ARCH p-value < this.
    pub arch_pvalue_threshold: f64,
    /// Fail when rolling-std coefficient of variation > this.
    pub cv_threshold: f64,
    /// Fail when Ljung-Box p-value < this.
    pub ljung_box_pvalue_threshold: f64,
    /// Wall-clock budget for one symbol's test computation.
    pub test_timeout_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
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
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub auto_cleanup: bool,
    /// Replayed bars older than this many days are deleted by cleanup.
    /// Live bars are never deleted.
    pub retention_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            auto_cleanup: false,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: SourceMode,
    pub db_path: String,
    pub symbols: Vec<String>,
    pub live: LiveConfig,
    pub replay: ReplayConfig,
    pub ingest: IngestConfig,
    pub features: FeatureConfig,
    pub stability: StabilityConfig,
    pub retention: RetentionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: SourceMode::Recycler,
            db_path: "tickgate.db".to_string(),
            symbols: vec!["AAPL".to_string()],
            live: LiveConfig::default(),
            replay: ReplayConfig::default(),
            ingest: IngestConfig::default(),
            features: FeatureConfig::default(),
            stability: StabilityConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file if present, apply env overrides, then validate.
    /// Any validation failure is fatal: the session must not start.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) if Path::new(p).exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {}", p))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file: {}", p))?
            }
            Some(p) => bail!("Config file not found: {}", p),
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the knobs operators flip most often.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TICKGATE_MODE") {
            match v.as_str() {
                "live" => self.mode = SourceMode::Live,
                "recycler" => self.mode = SourceMode::Recycler,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("TICKGATE_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("TICKGATE_SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Ok(v) = std::env::var("TICKGATE_WS_URL") {
            self.live.ws_url = v;
        }
        if let Ok(v) = std::env::var("TICKGATE_REPLAY_MODE") {
            self.replay.mode = v;
        }
        if let Ok(v) = std::env::var("TICKGATE_REPLAY_SPEED") {
            self.replay.speed_multiplier = v.parse().unwrap_or(self.replay.speed_multiplier);
        }
        if let Ok(v) = std::env::var("TICKGATE_REPLAY_LOOP_COUNT") {
            self.replay.loop_count = v.parse().unwrap_or(self.replay.loop_count);
        }
        if let Ok(v) = std::env::var("TICKGATE_RETENTION_DAYS") {
            self.retention.retention_days = v.parse().unwrap_or(self.retention.retention_days);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("Config error: symbol list is empty");
        }
        let mode = self.replay.parsed_mode()?;
        if self.replay.speed_multiplier <= 0.0 || !self.replay.speed_multiplier.is_finite() {
            bail!(
                "Config error: speed_multiplier must be a positive number, got {}",
                self.replay.speed_multiplier
            );
        }
        if self.replay.loop_count == 0 || self.replay.loop_count < -1 {
            bail!(
                "Config error: loop_count must be positive or -1 (infinite), got {}",
                self.replay.loop_count
            );
        }
        if mode == ReplayMode::DateRange {
            match (self.replay.start_date, self.replay.end_date) {
                (Some(start), Some(end)) if start > end => {
                    bail!("Config error: date_range start {} is after end {}", start, end);
                }
                (Some(_), Some(_)) => {}
                _ => bail!("Config error: date_range mode requires start_date and end_date"),
            }
        }
        if self.replay.max_inter_bar_delay_secs.is_nan()
            || self.replay.max_inter_bar_delay_secs < 0.0
        {
            bail!(
                "Config error: max_inter_bar_delay_secs must be non-negative, got {}",
                self.replay.max_inter_bar_delay_secs
            );
        }
        if self.ingest.batch_size == 0 {
            bail!("Config error: batch_size must be at least 1");
        }
        if self.features.window < 2 {
            bail!("Config error: feature window must be at least 2");
        }
        if self.features.annualization_factor <= 0.0 {
            bail!("Config error: annualization_factor must be positive");
        }
        if self.stability.arch_lags == 0 || self.stability.ljung_box_lags == 0 {
            bail!("Config error: lag orders must be at least 1");
        }
        if self.retention.retention_days < 0 {
            bail!("Config error: retention_days must be non-negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_non_positive_speed_is_fatal() {
        let mut config = Config::default();
        config.replay.speed_multiplier = 0.0;
        assert!(config.validate().is_err());
        config.replay.speed_multiplier = -2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_replay_mode_is_fatal() {
        let mut config = Config::default();
        config.replay.mode = "shuffle".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_date_range_requires_bounds() {
        let mut config = Config::default();
        config.replay.mode = "date_range".to_string();
        assert!(config.validate().is_err());

        config.replay.start_date = NaiveDate::from_ymd_opt(2026, 1, 10);
        config.replay.end_date = NaiveDate::from_ymd_opt(2026, 1, 5);
        assert!(config.validate().is_err());

        config.replay.end_date = NaiveDate::from_ymd_opt(2026, 1, 20);
        config.validate().unwrap();
    }

    #[test]
    fn test_inter_bar_delay_cap_defaults_off() {
        let config = Config::default();
        assert!(config.replay.max_inter_bar_delay_secs.is_infinite());
        config.validate().unwrap();

        let mut config = Config::default();
        config.replay.max_inter_bar_delay_secs = f64::NAN;
        assert!(config.validate().is_err());
        config.replay.max_inter_bar_delay_secs = -1.0;
        assert!(config.validate().is_err());
        config.replay.max_inter_bar_delay_secs = 60.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_parse() {
        let raw = r#"
            mode = "live"
            db_path = "/tmp/bars.db"
            symbols = ["AAPL", "MSFT"]

            [replay]
            mode = "loop"
            speed_multiplier = 4.0
            loop_count = 3

            [stability]
            arch_pvalue_threshold = 0.0
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.mode, SourceMode::Live);
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.replay.loop_count, 3);
        // 0.0 threshold disables the ARCH check; still a valid config.
        assert_eq!(config.stability.arch_pvalue_threshold, 0.0);
        config.validate().unwrap();
    }
}
