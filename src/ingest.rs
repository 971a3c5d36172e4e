//! Ingestion Pipeline
//!
//! Consumes a source adapter's output, collapses duplicate keys, and commits
//! to the bar store in atomic batches. A failed batch is retried a bounded
//! number of times, then reported and skipped; later batches are unaffected.

use crate::config::IngestConfig;
use crate::feed::BarFeed;
use crate::models::{Bar, IngestSummary};
use crate::storage::MarketStore;
use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct IngestionPipeline {
    store: MarketStore,
    config: IngestConfig,
}

impl IngestionPipeline {
    pub fn new(store: MarketStore, config: IngestConfig) -> Self {
        Self { store, config }
    }

    /// Drain the feed until end-of-stream or shutdown. Flushes on batch size
    /// or batch interval, whichever comes first; the pending batch is always
    /// flushed before returning, so cancellation never strands a partial
    /// batch (each flush is one transaction).
    pub async fn run(
        &self,
        feed: &mut (dyn BarFeed + Send),
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut pending: HashMap<(String, i64), Bar> = HashMap::new();

        let mut flush_tick = interval(Duration::from_millis(self.config.batch_interval_ms.max(1)));
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_tick.tick().await; // first tick fires immediately; consume it

        let mut cancel_alive = true;
        info!(feed = feed.name(), "ingestion started");

        loop {
            tokio::select! {
                bar = feed.next_bar() => {
                    match bar? {
                        Some(bar) => {
                            summary.bars_received += 1;
                            collapse(&mut pending, bar, &mut summary);
                            if pending.len() >= self.config.batch_size {
                                self.flush(&mut pending, &mut summary).await;
                            }
                        }
                        None => {
                            debug!("feed signalled end-of-stream");
                            break;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, &mut summary).await;
                    }
                }
                changed = shutdown.changed(), if cancel_alive => {
                    match changed {
                        Ok(()) => {
                            if *shutdown.borrow() {
                                info!("ingestion shutdown requested");
                                break;
                            }
                        }
                        Err(_) => cancel_alive = false,
                    }
                }
            }
        }

        self.flush(&mut pending, &mut summary).await;
        info!(
            received = summary.bars_received,
            committed = summary.bars_committed,
            batches = summary.batches_committed,
            failed_batches = summary.batches_failed,
            "ingestion finished"
        );
        Ok(summary)
    }

    /// Commit the pending batch with bounded retries. On exhaustion the batch
    /// is reported failed and dropped; the pipeline keeps going.
    async fn flush(&self, pending: &mut HashMap<(String, i64), Bar>, summary: &mut IngestSummary) {
        if pending.is_empty() {
            return;
        }
        let batch: Vec<Bar> = pending.drain().map(|(_, bar)| bar).collect();

        let mut attempt = 0u32;
        loop {
            match self.write_batch(batch.clone()).await {
                Ok(written) => {
                    summary.bars_committed += written as u64;
                    summary.batches_committed += 1;
                    return;
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.config.max_retries,
                        error = %e,
                        "batch write failed, retrying"
                    );
                    sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                Err(e) => {
                    error!(
                        bars = batch.len(),
                        error = %e,
                        "batch write failed after {} retries, skipping batch",
                        self.config.max_retries
                    );
                    summary.batches_failed += 1;
                    return;
                }
            }
        }
    }

    async fn write_batch(&self, batch: Vec<Bar>) -> Result<usize> {
        let store = self.store.clone();
        let write = tokio::task::spawn_blocking(move || store.upsert_bars(&batch));
        timeout(Duration::from_millis(self.config.write_timeout_ms), write)
            .await
            .context("batch write timed out")?
            .context("batch write task panicked")?
    }
}

/// Deduplicate by (symbol, timestamp) within the pending batch; a later bar
/// replaces an earlier one only at equal-or-higher source priority, matching
/// the store's upsert rule.
fn collapse(
    pending: &mut HashMap<(String, i64), Bar>,
    bar: Bar,
    summary: &mut IngestSummary,
) {
    let key = (bar.symbol.clone(), bar.timestamp.timestamp_millis());
    match pending.get(&key) {
        Some(existing) if bar.source.priority() < existing.source.priority() => {
            summary.duplicates_collapsed += 1;
        }
        Some(_) => {
            summary.duplicates_collapsed += 1;
            pending.insert(key, bar);
        }
        None => {
            pending.insert(key, bar);
        }
    }
}
