//! Live Push-Feed Adapter
//!
//! Persistent websocket subscription to the external market-data provider.
//! Connection loss is recovered with jittered exponential backoff and
//! unlimited attempts while the session is active. No history is buffered:
//! each tick is forwarded as soon as it is received.

use crate::config::LiveConfig;
use crate::feed::BarFeed;
use crate::models::{Bar, BarSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Subscribe message sent after the websocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsSubscribeMessage {
    pub action: String, // "subscribe"
    pub channel: String, // "bars"
    pub symbols: Vec<String>,
}

/// One tick/bar event from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsBarMessage {
    pub symbol: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl WsBarMessage {
    fn into_bar(self) -> Option<Bar> {
        let timestamp: DateTime<Utc> = Utc.timestamp_millis_opt(self.timestamp).single()?;
        Some(Bar {
            symbol: self.symbol,
            timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            source: BarSource::Live,
        })
    }
}

/// Live adapter: a background connection task feeds bars into an mpsc
/// channel; `next_bar` is the pull side. The stream is infinite until the
/// shutdown signal closes the connection, which unblocks any pending receive.
pub struct LiveBarFeed {
    rx: mpsc::Receiver<Bar>,
    exhausted: bool,
    name: String,
}

impl LiveBarFeed {
    pub fn connect(
        config: LiveConfig,
        symbols: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let name = format!("LiveBarFeed({})", config.ws_url);

        tokio::spawn(connection_loop(config, symbols, tx, shutdown));

        Self {
            rx,
            exhausted: false,
            name,
        }
    }
}

#[async_trait]
impl BarFeed for LiveBarFeed {
    async fn next_bar(&mut self) -> Result<Option<Bar>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(bar) => Ok(Some(bar)),
            None => {
                // Connection task exited: only happens on shutdown.
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs forever, reconnecting on failures, until shutdown flips.
async fn connection_loop(
    config: LiveConfig,
    symbols: Vec<String>,
    tx: mpsc::Sender<Bar>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect_delay = Duration::from_millis(config.reconnect_base_ms);
    let max_delay = Duration::from_millis(config.reconnect_max_ms);
    // Per-symbol high-water mark: the adapter's ascending-order guarantee.
    let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();

    loop {
        if *shutdown.borrow() {
            info!("live feed shutdown requested");
            return;
        }

        match run_session(&config, &symbols, &tx, &mut shutdown, &mut last_seen).await {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::StreamClosed) => {
                warn!("live feed stream ended, reconnecting in {:?}", reconnect_delay);
            }
            Err(e) => {
                warn!(error = %e, "live feed connection error, reconnecting in {:?}", reconnect_delay);
            }
        }

        // Jittered backoff so a fleet of clients does not reconnect in lockstep.
        let jitter = rand::thread_rng().gen_range(0.7..1.3);
        let delay = reconnect_delay.mul_f64(jitter);
        let slept = sleep(delay);
        tokio::pin!(slept);
        loop {
            tokio::select! {
                _ = &mut slept => break,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        (&mut slept).await;
                        break;
                    }
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
        reconnect_delay = (reconnect_delay * 2).min(max_delay);
    }
}

enum SessionEnd {
    Shutdown,
    StreamClosed,
}

async fn run_session(
    config: &LiveConfig,
    symbols: &[String],
    tx: &mpsc::Sender<Bar>,
    shutdown: &mut watch::Receiver<bool>,
    last_seen: &mut HashMap<String, DateTime<Utc>>,
) -> Result<SessionEnd> {
    let connect = connect_async(&config.ws_url);
    let (ws_stream, _response) = timeout(
        Duration::from_millis(config.connect_timeout_ms),
        connect,
    )
    .await
    .context("WebSocket connect timed out")?
    .with_context(|| format!("Failed to connect to {}", config.ws_url))?;

    let (mut write, mut read) = ws_stream.split();

    let subscribe = WsSubscribeMessage {
        action: "subscribe".to_string(),
        channel: "bars".to_string(),
        symbols: symbols.to_vec(),
    };
    write
        .send(Message::Text(serde_json::to_string(&subscribe)?))
        .await
        .context("Failed to send subscribe message")?;

    info!(symbols = symbols.len(), url = %config.ws_url, "live feed subscribed");

    let mut cancel_alive = true;
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsBarMessage>(&text) {
                            Ok(tick) => {
                                let Some(bar) = tick.into_bar() else {
                                    debug!("dropping tick with invalid timestamp");
                                    continue;
                                };
                                if let Some(prev) = last_seen.get(&bar.symbol) {
                                    if bar.timestamp < *prev {
                                        debug!(symbol = %bar.symbol, "dropping out-of-order tick");
                                        continue;
                                    }
                                }
                                last_seen.insert(bar.symbol.clone(), bar.timestamp);
                                if tx.send(bar).await.is_err() {
                                    // Consumer gone: treat like shutdown.
                                    return Ok(SessionEnd::Shutdown);
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring unparseable feed message");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(SessionEnd::StreamClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(e).context("WebSocket read error");
                    }
                }
            }
            changed = shutdown.changed(), if cancel_alive => {
                match changed {
                    Ok(()) => {
                        if *shutdown.borrow() {
                            write.send(Message::Close(None)).await.ok();
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    // Sender dropped: stop polling a dead channel.
                    Err(_) => cancel_alive = false,
                }
            }
        }
    }
}
