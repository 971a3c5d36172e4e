//! Source Adapters
//!
//! One trait, two implementations: a live push-feed adapter and a replay
//! adapter over previously recorded bars, selected at session construction.

pub mod live;
pub mod replay;

use crate::models::Bar;
use anyhow::{bail, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashSet;

/// A lazy, possibly-infinite sequence of bars. `Ok(None)` signals a finite
/// stream's normal end (replay exhausted); the live variant never returns it
/// except on shutdown. Within one instance, emitted bars preserve ascending
/// timestamp order.
#[async_trait]
pub trait BarFeed: Send {
    async fn next_bar(&mut self) -> Result<Option<Bar>>;

    /// True once the feed has signalled end-of-stream.
    fn is_exhausted(&self) -> bool;

    /// Feed identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }
}

lazy_static! {
    static ref ACTIVE_SESSIONS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// At most one live and one replay session per symbol set; a second writer
/// for the same (kind, symbol set) would duplicate ingestion.
pub struct SessionGuard {
    key: String,
}

impl SessionGuard {
    pub fn acquire(kind: &str, symbols: &[String]) -> Result<Self> {
        let mut sorted: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
        sorted.sort_unstable();
        let key = format!("{}:{}", kind, sorted.join(","));

        let mut active = ACTIVE_SESSIONS.lock();
        if !active.insert(key.clone()) {
            bail!("A {} session is already active for this symbol set", kind);
        }
        Ok(Self { key })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard_rejects_duplicates() {
        let symbols = vec!["GRD1".to_string(), "GRD2".to_string()];
        let guard = SessionGuard::acquire("replay", &symbols).unwrap();

        // Same kind + same set (order-insensitive) is rejected.
        let reordered = vec!["GRD2".to_string(), "GRD1".to_string()];
        assert!(SessionGuard::acquire("replay", &reordered).is_err());

        // A live session over the same set is a distinct writer slot.
        let live = SessionGuard::acquire("live", &symbols).unwrap();

        drop(guard);
        let reacquired = SessionGuard::acquire("replay", &symbols).unwrap();
        drop(reacquired);
        drop(live);
    }
}
