//! Market Store
//!
//! Durable sqlite-backed store for bars, features and stability verdicts.
//! The keyed upserts here are the only coordination primitive between
//! concurrent worker contexts: writers for disjoint symbols never conflict,
//! and writers for the same key converge because writes are idempotent.
//!
//! - WAL mode for concurrent reads during writes
//! - Batch upserts inside transactions (a batch is atomic)
//! - Live bars take precedence over replayed bars on key conflicts

use crate::models::{
    Bar, BarSource, Feature, FilterReason, StabilityVerdict,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,        -- epoch millis
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    source TEXT NOT NULL,              -- 'live' | 'replayed'
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (symbol, timestamp)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_source_ts
    ON bars(source, timestamp);

CREATE TABLE IF NOT EXISTS features (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,        -- epoch millis
    log_close REAL NOT NULL,
    log_return REAL,
    z_score REAL,
    rolling_std REAL,
    rolling_mean REAL,
    volatility_annualized REAL,
    feature_date TEXT NOT NULL,        -- YYYY-MM-DD
    computation_method TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (symbol, timestamp)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_features_date
    ON features(feature_date, symbol, timestamp);

CREATE TABLE IF NOT EXISTS stability (
    symbol TEXT NOT NULL,
    test_date TEXT NOT NULL,           -- YYYY-MM-DD
    record_count INTEGER NOT NULL,
    arch_test_pvalue REAL,
    rolling_std_cv REAL,
    ljung_box_pvalue REAL,
    is_stable INTEGER NOT NULL,
    filter_reason TEXT,
    test_window INTEGER NOT NULL,
    arch_lags INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (symbol, test_date)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_stability_stable
    ON stability(is_stable, test_date);
"#;

/// Upsert that only lets equal-or-higher-priority sources overwrite OHLCV:
/// live beats replayed, replayed beats replayed, replayed never beats live.
const UPSERT_BAR_SQL: &str = r#"
INSERT INTO bars (symbol, timestamp, open, high, low, close, volume, source)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(symbol, timestamp) DO UPDATE SET
    open = excluded.open,
    high = excluded.high,
    low = excluded.low,
    close = excluded.close,
    volume = excluded.volume,
    source = excluded.source
WHERE excluded.source = 'live' OR bars.source = 'replayed'
"#;

const UPSERT_FEATURE_SQL: &str = r#"
INSERT INTO features (symbol, timestamp, log_close, log_return, z_score,
                      rolling_std, rolling_mean, volatility_annualized,
                      feature_date, computation_method)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(symbol, timestamp) DO UPDATE SET
    log_close = excluded.log_close,
    log_return = excluded.log_return,
    z_score = excluded.z_score,
    rolling_std = excluded.rolling_std,
    rolling_mean = excluded.rolling_mean,
    volatility_annualized = excluded.volatility_annualized,
    feature_date = excluded.feature_date,
    computation_method = excluded.computation_method,
    updated_at = strftime('%s', 'now')
"#;

const FEATURE_COLUMNS: &str = "symbol, timestamp, log_close, log_return, z_score, \
     rolling_std, rolling_mean, volatility_annualized, feature_date, computation_method";

/// Shared handle to the market database. Cheap to clone.
#[derive(Clone)]
pub struct MarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl MarketStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Market store initialized at {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // BARS
    // =========================================================================

    /// Upsert a batch of bars in a single transaction (atomic: all or none).
    /// Returns the number of rows actually written, which can be smaller than
    /// the batch when a replayed bar hits an existing live row.
    pub fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let mut written = 0usize;
        {
            let mut stmt = tx
                .prepare_cached(UPSERT_BAR_SQL)
                .context("Failed to prepare bar upsert")?;
            for bar in bars {
                written += stmt.execute(params![
                    bar.symbol,
                    bar.timestamp.timestamp_millis(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.source.as_str(),
                ])?;
            }
        }
        tx.commit().context("Failed to commit bar batch")?;
        debug!(batch = bars.len(), written, "bar batch committed");
        Ok(written)
    }

    /// Ordered recorded series for a symbol set, optionally restricted to an
    /// inclusive date range. This is the replay adapter's source sequence.
    pub fn load_bars(
        &self,
        symbols: &[String],
        date_range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<Bar>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; symbols.len()].join(", ");
        let mut sql = format!(
            "SELECT symbol, timestamp, open, high, low, close, volume, source \
             FROM bars WHERE symbol IN ({})",
            placeholders
        );
        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = symbols
            .iter()
            .map(|s| Box::new(s.clone()) as Box<dyn rusqlite::types::ToSql>)
            .collect();

        if let Some((start, end)) = date_range {
            sql.push_str(" AND timestamp >= ? AND timestamp <= ?");
            params_vec.push(Box::new(day_start_millis(start)));
            params_vec.push(Box::new(day_end_millis(end)));
        }
        sql.push_str(" ORDER BY timestamp ASC, symbol ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            row_to_bar,
        )?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }
        Ok(bars)
    }

    /// Trailing `limit` bars for one symbol with timestamp at or before the
    /// end of `as_of`, ascending. Feeds the feature engine's window.
    pub fn load_trailing_bars(
        &self,
        symbol: &str,
        as_of: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, timestamp, open, high, low, close, volume, source \
             FROM bars WHERE symbol = ?1 AND timestamp <= ?2 \
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![symbol, day_end_millis(as_of), limit as i64],
            row_to_bar,
        )?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }
        bars.reverse();
        Ok(bars)
    }

    /// Retention cleanup: removes replayed bars older than the cutoff.
    /// Live bars are never deleted.
    pub fn delete_replayed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM bars WHERE source = 'replayed' AND timestamp < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "retention cleanup removed replayed bars");
        }
        Ok(deleted)
    }

    pub fn bar_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM bars", [], |row| row.get(0))?)
    }

    pub fn latest_bar_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ms: Option<i64> =
            conn.query_row("SELECT MAX(timestamp) FROM bars", [], |row| row.get(0))?;
        Ok(ms.and_then(millis_to_datetime))
    }

    // =========================================================================
    // FEATURES
    // =========================================================================

    /// Idempotent last-write-wins upsert, one transaction per call.
    pub fn upsert_features(&self, features: &[Feature]) -> Result<usize> {
        if features.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(UPSERT_FEATURE_SQL)
                .context("Failed to prepare feature upsert")?;
            for f in features {
                stmt.execute(params![
                    f.symbol,
                    f.timestamp.timestamp_millis(),
                    f.log_close,
                    f.log_return,
                    f.z_score,
                    f.rolling_std,
                    f.rolling_mean,
                    f.volatility_annualized,
                    f.feature_date.to_string(),
                    f.computation_method,
                ])?;
            }
        }
        tx.commit().context("Failed to commit feature batch")?;
        Ok(features.len())
    }

    /// Trailing `limit` features for one symbol ending at `as_of`, ascending.
    pub fn load_trailing_features(
        &self,
        symbol: &str,
        as_of: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Feature>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM features \
             WHERE symbol = ?1 AND timestamp <= ?2 \
             ORDER BY timestamp DESC LIMIT ?3",
            FEATURE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![symbol, day_end_millis(as_of), limit as i64],
            row_to_feature,
        )?;

        let mut features = Vec::new();
        for row in rows {
            features.push(row?);
        }
        features.reverse();
        Ok(features)
    }

    /// All features for one (symbol, feature_date), ascending by timestamp.
    pub fn load_features_for_date(
        &self,
        symbol: &str,
        feature_date: NaiveDate,
    ) -> Result<Vec<Feature>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM features \
             WHERE symbol = ?1 AND feature_date = ?2 \
             ORDER BY timestamp ASC",
            FEATURE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![symbol, feature_date.to_string()], row_to_feature)?;

        let mut features = Vec::new();
        for row in rows {
            features.push(row?);
        }
        Ok(features)
    }

    pub fn feature_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))?)
    }

    // =========================================================================
    // STABILITY
    // =========================================================================

    /// One verdict per (symbol, test_date); re-running overwrites the key.
    pub fn upsert_verdict(&self, verdict: &StabilityVerdict) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stability (symbol, test_date, record_count, arch_test_pvalue, \
                                    rolling_std_cv, ljung_box_pvalue, is_stable, \
                                    filter_reason, test_window, arch_lags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(symbol, test_date) DO UPDATE SET \
                 record_count = excluded.record_count, \
                 arch_test_pvalue = excluded.arch_test_pvalue, \
                 rolling_std_cv = excluded.rolling_std_cv, \
                 ljung_box_pvalue = excluded.ljung_box_pvalue, \
                 is_stable = excluded.is_stable, \
                 filter_reason = excluded.filter_reason, \
                 test_window = excluded.test_window, \
                 arch_lags = excluded.arch_lags",
            params![
                verdict.symbol,
                verdict.test_date.to_string(),
                verdict.record_count as i64,
                verdict.arch_test_pvalue,
                verdict.rolling_std_cv,
                verdict.ljung_box_pvalue,
                verdict.is_stable as i64,
                verdict.filter_reason.map(|r| r.as_str()),
                verdict.test_window as i64,
                verdict.arch_lags as i64,
            ],
        )?;
        Ok(())
    }

    pub fn load_verdict(
        &self,
        symbol: &str,
        test_date: NaiveDate,
    ) -> Result<Option<StabilityVerdict>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, test_date, record_count, arch_test_pvalue, rolling_std_cv, \
                    ljung_box_pvalue, is_stable, filter_reason, test_window, arch_lags \
             FROM stability WHERE symbol = ?1 AND test_date = ?2",
        )?;
        let mut rows = stmt.query_map(params![symbol, test_date.to_string()], row_to_verdict)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn verdict_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM stability", [], |row| row.get(0))?)
    }

    // =========================================================================
    // GATE QUERY
    // =========================================================================

    /// Features for symbols verdicted stable: the join of features and
    /// stability on (symbol, feature_date = test_date) with is_stable = 1.
    /// Pure read, ordered by (symbol, timestamp), truncated at `limit`.
    pub fn stable_features(&self, start_date: NaiveDate, limit: usize) -> Result<Vec<Feature>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT f.symbol, f.timestamp, f.log_close, f.log_return, f.z_score, \
                    f.rolling_std, f.rolling_mean, f.volatility_annualized, \
                    f.feature_date, f.computation_method \
             FROM features f \
             JOIN stability s \
               ON s.symbol = f.symbol AND s.test_date = f.feature_date \
             WHERE s.is_stable = 1 AND f.feature_date >= ?1 \
             ORDER BY f.symbol ASC, f.timestamp ASC \
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![start_date.to_string(), limit as i64], row_to_feature)?;

        let mut features = Vec::new();
        for row in rows {
            features.push(row?);
        }
        Ok(features)
    }

    /// Raw SQL hook for failure injection in tests.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(sql)?;
        Ok(())
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn row_to_bar(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bar> {
    let ms: i64 = row.get(1)?;
    let source: String = row.get(7)?;
    Ok(Bar {
        symbol: row.get(0)?,
        timestamp: millis_to_datetime(ms).unwrap_or_else(|| Utc.timestamp_nanos(0)),
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get(6)?,
        source: BarSource::parse(&source).unwrap_or(BarSource::Replayed),
    })
}

fn row_to_feature(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feature> {
    let ms: i64 = row.get(1)?;
    let date_str: String = row.get(8)?;
    Ok(Feature {
        symbol: row.get(0)?,
        timestamp: millis_to_datetime(ms).unwrap_or_else(|| Utc.timestamp_nanos(0)),
        log_close: row.get(2)?,
        log_return: row.get(3)?,
        z_score: row.get(4)?,
        rolling_std: row.get(5)?,
        rolling_mean: row.get(6)?,
        volatility_annualized: row.get(7)?,
        feature_date: date_str.parse().unwrap_or_default(),
        computation_method: row.get(9)?,
    })
}

fn row_to_verdict(row: &rusqlite::Row<'_>) -> rusqlite::Result<StabilityVerdict> {
    let date_str: String = row.get(1)?;
    let record_count: i64 = row.get(2)?;
    let is_stable: i64 = row.get(6)?;
    let filter_reason: Option<String> = row.get(7)?;
    let test_window: i64 = row.get(8)?;
    let arch_lags: i64 = row.get(9)?;
    Ok(StabilityVerdict {
        symbol: row.get(0)?,
        test_date: date_str.parse().unwrap_or_default(),
        record_count: record_count as usize,
        arch_test_pvalue: row.get(3)?,
        rolling_std_cv: row.get(4)?,
        ljung_box_pvalue: row.get(5)?,
        is_stable: is_stable != 0,
        filter_reason: filter_reason.as_deref().and_then(FilterReason::parse),
        test_window: test_window as usize,
        arch_lags: arch_lags as usize,
    })
}

fn day_start_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

fn day_end_millis(date: NaiveDate) -> i64 {
    date.and_hms_milli_opt(23, 59, 59, 999)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(i64::MAX)
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
