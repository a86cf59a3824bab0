// =============================================================================
// Fetch/Ingest manager — candle fan-out bus, periodic fetch, catch-up replay
// =============================================================================
//
// Candles enter the pipeline here, either from the periodic poll against the
// configured source, from a catch-up replay, or pushed by an external
// producer through `FeedHandle::send_market_update`. Every candle is
// delivered to the subscribers *in registration order* (Market before
// PriceAction), awaiting each subscriber's `Processed` ack before moving on,
// so a downstream request for "the latest candles" always observes the
// candle currently being traversed. The producer's own ack fires once the
// candle has traversed every subscriber.
//
// Candle delivery is lossless: sends into subscriber channels await
// capacity. Non-candle signals use the drop-and-log overflow policy.
// =============================================================================

pub mod http;
pub mod source;

pub use http::HttpCandleSource;
pub use source::{CandleSource, ReplaySource};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::market_data::Candle;
use crate::types::{ack_processed, StatusAck, Timeframe, WorkStatus};

/// Bound on a subscriber finishing one candle or caught-up signal.
const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Messages
// -----------------------------------------------------------------------------

/// A candle traveling through the pipeline, with its status-ack.
#[derive(Debug)]
pub struct CandleMsg {
    pub candle: Candle,
    pub ack: StatusAck,
}

/// Notification that a market finished replaying its historical window.
#[derive(Debug)]
pub struct CaughtUpMsg {
    pub market: String,
    pub ack: StatusAck,
}

/// Request to fetch and replay `[start, now]` for one market.
#[derive(Debug, Clone)]
pub struct CatchUpSignal {
    pub market: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
}

/// One registered consumer of the candle bus.
pub struct Subscriber {
    pub name: &'static str,
    pub update_tx: mpsc::Sender<CandleMsg>,
    pub caught_up_tx: mpsc::Sender<CaughtUpMsg>,
}

// -----------------------------------------------------------------------------
// Handle + channels
// -----------------------------------------------------------------------------

/// Cloneable producer-side handle to the feed manager.
#[derive(Clone)]
pub struct FeedHandle {
    ingest_tx: mpsc::Sender<CandleMsg>,
    catch_up_tx: mpsc::Sender<CatchUpSignal>,
}

impl FeedHandle {
    /// Push one candle into the pipeline and wait until it has traversed
    /// Market and PriceAction.
    pub async fn send_market_update(&self, candle: Candle) -> Result<WorkStatus> {
        let (ack, ack_rx) = oneshot::channel();
        self.ingest_tx
            .send(CandleMsg { candle, ack })
            .await
            .map_err(|_| EngineError::Internal("feed manager is gone".to_string()))?;

        match timeout(PROCESS_TIMEOUT, ack_rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(EngineError::Internal(
                "candle ack dropped before completion".to_string(),
            )),
            Err(_) => Err(EngineError::Timeout("candle processing ack".to_string())),
        }
    }

    /// Ask the feed to replay history for one market. Non-blocking; logged
    /// and dropped when the channel is full.
    pub fn send_catch_up_signal(&self, signal: CatchUpSignal) {
        if let Err(err) = self.catch_up_tx.try_send(signal) {
            warn!(error = %err, "catch-up channel at capacity, dropping signal");
        }
    }
}

/// Receiver side of the feed channels, owned by the manager.
pub struct FeedChannels {
    ingest_rx: mpsc::Receiver<CandleMsg>,
    catch_up_rx: mpsc::Receiver<CatchUpSignal>,
}

/// Build the feed handle/channel pair.
pub fn channels(capacity: usize) -> (FeedHandle, FeedChannels) {
    let (ingest_tx, ingest_rx) = mpsc::channel(capacity);
    let (catch_up_tx, catch_up_rx) = mpsc::channel(capacity);
    (
        FeedHandle {
            ingest_tx,
            catch_up_tx,
        },
        FeedChannels {
            ingest_rx,
            catch_up_rx,
        },
    )
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

/// Feed manager settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub markets: Vec<String>,
    pub timeframe: Timeframe,
    /// Backtests replay recorded candles; the periodic poll stays off.
    pub backtest: bool,
}

/// Owns the candle source, the subscriber list and the ingest loop.
pub struct FeedManager {
    cfg: FeedConfig,
    source: Arc<dyn CandleSource>,
    subscribers: Vec<Subscriber>,
    channels: FeedChannels,
    shutdown: watch::Receiver<bool>,
    /// Last candle date delivered per market; the next poll resumes there.
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl FeedManager {
    pub fn new(
        cfg: FeedConfig,
        source: Arc<dyn CandleSource>,
        subscribers: Vec<Subscriber>,
        channels: FeedChannels,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            source,
            subscribers,
            channels,
            shutdown,
            last_seen: HashMap::new(),
        }
    }

    /// Supervisor loop. Returns promptly on shutdown.
    pub async fn run(mut self) {
        info!(
            markets = ?self.cfg.markets,
            timeframe = %self.cfg.timeframe,
            backtest = self.cfg.backtest,
            "feed manager started"
        );

        let mut poll = interval(
            self.cfg
                .timeframe
                .duration()
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(300)),
        );
        // The first tick fires immediately; skip it so catch-up runs first.
        poll.tick().await;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("feed manager stopping");
                        return;
                    }
                }
                Some(msg) = self.channels.ingest_rx.recv() => {
                    let CandleMsg { candle, ack } = msg;
                    self.publish(candle).await;
                    ack_processed(ack);
                }
                Some(signal) = self.channels.catch_up_rx.recv() => {
                    self.handle_catch_up(signal).await;
                }
                _ = poll.tick(), if !self.cfg.backtest => {
                    self.poll_markets().await;
                }
            }
        }
    }

    /// Deliver one candle to every subscriber in order, awaiting each ack.
    async fn publish(&mut self, candle: Candle) {
        for subscriber in &self.subscribers {
            let (ack, ack_rx) = oneshot::channel();
            let msg = CandleMsg {
                candle: candle.clone(),
                ack,
            };

            if subscriber.update_tx.send(msg).await.is_err() {
                error!(
                    subscriber = subscriber.name,
                    market = %candle.market,
                    "subscriber channel closed, candle not delivered"
                );
                continue;
            }

            match timeout(PROCESS_TIMEOUT, ack_rx).await {
                Ok(Ok(WorkStatus::Processed)) => {}
                Ok(Err(_)) => warn!(
                    subscriber = subscriber.name,
                    market = %candle.market,
                    "subscriber dropped candle ack"
                ),
                Err(_) => warn!(
                    subscriber = subscriber.name,
                    market = %candle.market,
                    "timed out waiting for candle ack"
                ),
            }
        }

        let entry = self
            .last_seen
            .entry(candle.market.clone())
            .or_insert(candle.date);
        if candle.date > *entry {
            *entry = candle.date;
        }
    }

    /// Fetch and replay `[signal.start, now]`, then announce caught-up to
    /// every subscriber.
    async fn handle_catch_up(&mut self, signal: CatchUpSignal) {
        let now = Utc::now();
        info!(
            market = %signal.market,
            start = %signal.start,
            "catch-up fetch starting"
        );

        let candles = match self
            .source
            .fetch(&signal.market, signal.timeframe, signal.start, now)
            .await
        {
            Ok(candles) => candles,
            Err(err) => {
                error!(market = %signal.market, error = %err, "catch-up fetch failed");
                return;
            }
        };

        let replayed = candles.len();
        for candle in candles {
            self.publish(candle).await;
        }

        for subscriber in &self.subscribers {
            let (ack, ack_rx) = oneshot::channel();
            let msg = CaughtUpMsg {
                market: signal.market.clone(),
                ack,
            };
            if subscriber.caught_up_tx.send(msg).await.is_err() {
                error!(
                    subscriber = subscriber.name,
                    market = %signal.market,
                    "subscriber channel closed, caught-up signal not delivered"
                );
                continue;
            }
            if timeout(PROCESS_TIMEOUT, ack_rx).await.is_err() {
                warn!(
                    subscriber = subscriber.name,
                    market = %signal.market,
                    "timed out waiting for caught-up ack"
                );
            }
        }

        info!(market = %signal.market, candles = replayed, "catch-up complete");
    }

    /// Fetch any candles newer than the last delivered one, per market.
    async fn poll_markets(&mut self) {
        let now = Utc::now();
        for market in self.cfg.markets.clone() {
            let start = self
                .last_seen
                .get(&market)
                .map(|last| *last + chrono::Duration::seconds(1))
                .unwrap_or_else(|| now - self.cfg.timeframe.duration());

            match self
                .source
                .fetch(&market, self.cfg.timeframe, start, now)
                .await
            {
                Ok(candles) => {
                    debug!(market = %market, count = candles.len(), "poll fetched candles");
                    for candle in candles {
                        self.publish(candle).await;
                    }
                }
                Err(err) => {
                    warn!(market = %market, error = %err, "periodic fetch failed");
                }
            }
        }
    }
}
