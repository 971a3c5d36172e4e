//! Replay Adapter
//!
//! Re-emits previously recorded bars under an explicit `ReplaySession` state
//! machine. Emission timing reproduces the recorded inter-bar spacing scaled
//! by the speed multiplier; looping resets the cursor with no inter-loop gap.

use crate::config::ReplayConfig;
use crate::feed::BarFeed;
use crate::models::{Bar, BarSource, ReplayMode, ReplaySession};
use crate::storage::MarketStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info};

pub struct ReplayBarFeed {
    session: ReplaySession,
    /// Recorded sequence, ordered by (timestamp, symbol), proxies resolved.
    bars: Vec<Bar>,
    /// Total passes to emit; None = loop forever.
    total_passes: Option<i64>,
    last_emitted_ts: Option<DateTime<Utc>>,
    /// Deadline of the pending emission. Kept across polls: callers race
    /// `next_bar` against timers and drop the losing future, so the delay
    /// must resume where it left off rather than restart.
    next_deadline: Option<Instant>,
    max_delay: Duration,
    shutdown: watch::Receiver<bool>,
    exhausted: bool,
    name: String,
}

impl ReplayBarFeed {
    /// Build the replay source sequence from the store. Mode and date-range
    /// filtering happen here; a non-positive speed multiplier is rejected
    /// (the config layer already treats it as fatal at startup).
    pub fn from_store(
        store: &MarketStore,
        config: &ReplayConfig,
        symbols: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let mode = config.parsed_mode()?;
        if config.speed_multiplier <= 0.0 || !config.speed_multiplier.is_finite() {
            bail!(
                "Replay speed_multiplier must be positive, got {}",
                config.speed_multiplier
            );
        }

        let date_range = match mode {
            ReplayMode::DateRange => match (config.start_date, config.end_date) {
                (Some(start), Some(end)) => Some((start, end)),
                _ => bail!("date_range replay requires start_date and end_date"),
            },
            _ => None,
        };

        let total_passes = match mode {
            ReplayMode::SinglePass => Some(1),
            ReplayMode::Loop => pass_budget(config.loop_count)?,
            ReplayMode::DateRange => {
                if config.loop_in_range {
                    pass_budget(config.loop_count)?
                } else {
                    Some(1)
                }
            }
        };

        // Resolve explicit proxy substitutions: a requested symbol absent from
        // recorded data may be served another symbol's series under its name.
        let mut direct = Vec::new();
        let mut proxied: Vec<(String, String)> = Vec::new();
        for symbol in &symbols {
            match config.proxies.get(symbol) {
                Some(recorded) => proxied.push((symbol.clone(), recorded.clone())),
                None => direct.push(symbol.clone()),
            }
        }

        let mut bars = store.load_bars(&direct, date_range)?;
        for (requested, recorded) in &proxied {
            let series = store.load_bars(std::slice::from_ref(recorded), date_range)?;
            debug!(
                requested = %requested,
                recorded = %recorded,
                bars = series.len(),
                "replay proxy substitution"
            );
            bars.extend(series.into_iter().map(|b| b.relabeled(requested)));
        }

        bars.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        for bar in &mut bars {
            bar.source = BarSource::Replayed;
        }

        info!(
            bars = bars.len(),
            mode = ?mode,
            speed = config.speed_multiplier,
            "replay session loaded"
        );

        let session = ReplaySession::new(
            mode,
            config.speed_multiplier,
            config.loop_count,
            date_range,
            symbols,
        );

        Ok(Self {
            session,
            bars,
            total_passes,
            last_emitted_ts: None,
            next_deadline: None,
            max_delay: if config.max_inter_bar_delay_secs.is_finite() {
                Duration::from_secs_f64(config.max_inter_bar_delay_secs.max(0.0))
            } else {
                Duration::MAX
            },
            shutdown,
            exhausted: false,
            name: format!("ReplayBarFeed({:?})", mode),
        })
    }

    /// Snapshot of the session state machine (pausable/inspectable).
    pub fn session(&self) -> &ReplaySession {
        &self.session
    }

    /// Scaled wall-clock delay before emitting `next`. Uncapped unless a
    /// finite max_inter_bar_delay_secs is configured.
    fn delay_before(&self, next: &Bar) -> Duration {
        let Some(prev) = self.last_emitted_ts else {
            return Duration::ZERO;
        };
        let gap_ms = (next.timestamp - prev).num_milliseconds().max(0) as f64;
        let scaled = Duration::from_secs_f64(gap_ms / 1000.0 / self.session.speed_multiplier);
        scaled.min(self.max_delay)
    }
}

fn pass_budget(loop_count: i64) -> Result<Option<i64>> {
    match loop_count {
        -1 => Ok(None),
        n if n > 0 => Ok(Some(n)),
        n => bail!("loop_count must be positive or -1 (infinite), got {}", n),
    }
}

#[async_trait]
impl BarFeed for ReplayBarFeed {
    async fn next_bar(&mut self) -> Result<Option<Bar>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.bars.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        if self.session.cursor >= self.bars.len() {
            self.session.passes_done += 1;
            let keep_looping = match self.total_passes {
                None => true,
                Some(n) => self.session.passes_done < n,
            };
            if !keep_looping {
                debug!(passes = self.session.passes_done, "replay exhausted");
                self.exhausted = true;
                return Ok(None);
            }
            // Reset for the next pass; no gap is introduced between loops.
            self.session.cursor = 0;
            self.last_emitted_ts = None;
        }

        let bar = self.bars[self.session.cursor].clone();

        // Cancellable between emissions: checked before each delay.
        if *self.shutdown.borrow() {
            self.exhausted = true;
            return Ok(None);
        }

        // The deadline is computed once per emission and stored; a re-poll
        // after this future was dropped mid-sleep resumes the remainder.
        let deadline = match self.next_deadline {
            Some(d) => d,
            None => {
                let d = Instant::now() + self.delay_before(&bar);
                self.next_deadline = Some(d);
                d
            }
        };
        if deadline > Instant::now() {
            let slept = sleep_until(deadline);
            tokio::pin!(slept);
            loop {
                tokio::select! {
                    _ = &mut slept => break,
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            // Sender gone: no cancel can arrive, finish the delay.
                            (&mut slept).await;
                            break;
                        }
                        if *self.shutdown.borrow() {
                            self.exhausted = true;
                            return Ok(None);
                        }
                    }
                }
            }
        }

        self.next_deadline = None;
        self.session.cursor += 1;
        self.last_emitted_ts = Some(bar.timestamp);
        Ok(Some(bar))
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn name(&self) -> &str {
        &self.name
    }
}
