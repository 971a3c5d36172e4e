//! Gate Query
//!
//! Read-only view joining the feature store and stability store: only
//! features for symbol/days verdicted stable reach the downstream model
//! trainer. Restartable, finite, no side effects.

use crate::models::Feature;
use crate::storage::MarketStore;
use anyhow::Result;
use chrono::NaiveDate;

/// Features whose (symbol, feature_date) has an `is_stable = true` verdict
/// and `feature_date >= start_date`, ordered by (symbol, timestamp),
/// truncated at `limit`.
pub fn stable_features(
    store: &MarketStore,
    start_date: NaiveDate,
    limit: usize,
) -> Result<Vec<Feature>> {
    store.stable_features(start_date, limit)
}
