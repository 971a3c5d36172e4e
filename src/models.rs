use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Provenance of a stored bar. Live data always wins over replayed data
/// when both arrive for the same (symbol, timestamp) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarSource {
    Live,
    Replayed,
}

impl BarSource {
    /// Higher number wins on upsert conflicts.
    pub fn priority(&self) -> u8 {
        match self {
            BarSource::Live => 1,
            BarSource::Replayed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BarSource::Live => "live",
            BarSource::Replayed => "replayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(BarSource::Live),
            "replayed" => Some(BarSource::Replayed),
            _ => None,
        }
    }
}

/// One OHLCV observation for a symbol at a timestamp.
/// Unique per (symbol, timestamp); never mutated after commit except by
/// a higher-priority upsert for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub source: BarSource,
}

impl Bar {
    /// Relabel the bar under a proxy symbol, keeping the price series.
    pub fn relabeled(mut self, symbol: &str) -> Self {
        self.symbol = symbol.to_string();
        self
    }
}

/// Replay emission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    SinglePass,
    Loop,
    DateRange,
}

impl ReplayMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single_pass" => Some(ReplayMode::SinglePass),
            "loop" => Some(ReplayMode::Loop),
            "date_range" => Some(ReplayMode::DateRange),
            _ => None,
        }
    }
}

/// Explicit, serializable replay state machine. Mutated by the replay feed
/// on every emitted bar; reset (not discarded) when looping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySession {
    pub mode: ReplayMode,
    /// > 1.0 compresses wall-clock spacing, < 1.0 expands it. Must be > 0.
    pub speed_multiplier: f64,
    /// Number of full passes for loop modes; -1 means loop forever.
    pub loop_count: i64,
    /// Inclusive bounds, only meaningful for `DateRange` mode.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub symbols: Vec<String>,
    /// Position within the ordered recorded sequence.
    pub cursor: usize,
    /// Completed full passes so far.
    pub passes_done: i64,
}

impl ReplaySession {
    pub fn new(
        mode: ReplayMode,
        speed_multiplier: f64,
        loop_count: i64,
        date_range: Option<(NaiveDate, NaiveDate)>,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            mode,
            speed_multiplier,
            loop_count,
            date_range,
            symbols,
            cursor: 0,
            passes_done: 0,
        }
    }
}

/// Derived statistics for one (symbol, timestamp) observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub log_close: f64,
    /// None for the first observation of a series.
    pub log_return: Option<f64>,
    /// None when rolling_std is zero or undefined.
    pub z_score: Option<f64>,
    pub rolling_std: Option<f64>,
    pub rolling_mean: Option<f64>,
    pub volatility_annualized: Option<f64>,
    pub feature_date: NaiveDate,
    pub computation_method: String,
}

/// Why a symbol/day was filtered out by the stability gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    InsufficientData,
    ArchTestFailed,
    HighVolatility,
    AutocorrelationDetected,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::InsufficientData => "insufficient_data",
            FilterReason::ArchTestFailed => "arch_test_failed",
            FilterReason::HighVolatility => "high_volatility",
            FilterReason::AutocorrelationDetected => "autocorrelation_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insufficient_data" => Some(FilterReason::InsufficientData),
            "arch_test_failed" => Some(FilterReason::ArchTestFailed),
            "high_volatility" => Some(FilterReason::HighVolatility),
            "autocorrelation_detected" => Some(FilterReason::AutocorrelationDetected),
            _ => None,
        }
    }
}

/// Pass/fail variance-stability verdict for one symbol/day.
/// Unique per (symbol, test_date); re-running overwrites the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityVerdict {
    pub symbol: String,
    pub test_date: NaiveDate,
    pub record_count: usize,
    pub arch_test_pvalue: Option<f64>,
    pub rolling_std_cv: Option<f64>,
    pub ljung_box_pvalue: Option<f64>,
    pub is_stable: bool,
    pub filter_reason: Option<FilterReason>,
    pub test_window: usize,
    pub arch_lags: usize,
}

/// User-visible summary of one ingestion run. Failed batches are reported
/// here, never silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestSummary {
    pub bars_received: u64,
    pub bars_committed: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub duplicates_collapsed: u64,
}
