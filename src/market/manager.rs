// =============================================================================
// Market Manager — per-market workers + shared request pool
// =============================================================================
//
// The supervisor multiplexes three inbound channels:
//
//   candle updates    -> the market's dedicated worker (capacity 4, single
//                        consumer: per-market updates stay serialized)
//   caught-up signals -> same worker channel, so they order with updates
//   data requests     -> shared pool of 8 request workers
//
// Every candle/caught-up work unit writes `Processed` to its status-ack when
// the worker finishes. Data requests answer through the oneshot carried in
// the request instead. On startup (outside backtests) the manager emits one
// catch-up signal per market from the market's last session open.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::error::{EngineError, Result};
use crate::feed::{CandleMsg, CatchUpSignal, CaughtUpMsg, Subscriber};
use crate::indicators::VwapEntry;
use crate::market::Market;
use crate::market_data::Candle;
use crate::poi::Level;
use crate::session;
use crate::types::{ack_processed, Timeframe};

/// Capacity of each per-market worker channel.
const MARKET_WORKER_CAPACITY: usize = 4;
/// Concurrent data-request handlers.
const REQUEST_WORKERS: usize = 8;
/// Bound on a data request/response round trip.
const DATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback used to kick off a historical fetch for one market.
pub type CatchUpFn = Arc<dyn Fn(CatchUpSignal) + Send + Sync>;
/// Callback invoked for every level born from a closed session.
pub type SignalLevelFn = Arc<dyn Fn(Arc<Level>) + Send + Sync>;

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// On-demand data requests served from market snapshots.
#[derive(Debug)]
pub enum MarketRequest {
    PriceData {
        market: String,
        count: usize,
        respond_to: oneshot::Sender<Vec<Candle>>,
    },
    VwapData {
        market: String,
        count: usize,
        respond_to: oneshot::Sender<Vec<VwapEntry>>,
    },
    VwapAtTime {
        market: String,
        at: DateTime<Utc>,
        respond_to: oneshot::Sender<Option<VwapEntry>>,
    },
    AverageVolume {
        market: String,
        count: usize,
        respond_to: oneshot::Sender<Option<f64>>,
    },
}

impl MarketRequest {
    fn market(&self) -> &str {
        match self {
            Self::PriceData { market, .. }
            | Self::VwapData { market, .. }
            | Self::VwapAtTime { market, .. }
            | Self::AverageVolume { market, .. } => market,
        }
    }
}

/// Work routed through a market's dedicated worker channel.
enum MarketJob {
    Update(CandleMsg),
    CaughtUp(CaughtUpMsg),
}

// -----------------------------------------------------------------------------
// Handle + channels
// -----------------------------------------------------------------------------

/// Cloneable sender-side handle to the market manager.
#[derive(Clone)]
pub struct MarketHandle {
    update_tx: mpsc::Sender<CandleMsg>,
    caught_up_tx: mpsc::Sender<CaughtUpMsg>,
    request_tx: mpsc::Sender<MarketRequest>,
}

impl MarketHandle {
    /// Register this manager on the candle bus.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            name: "market",
            update_tx: self.update_tx.clone(),
            caught_up_tx: self.caught_up_tx.clone(),
        }
    }

    /// Enqueue a request, dropping it with a warning when the channel is
    /// full.
    fn enqueue(&self, request: MarketRequest) -> Result<()> {
        self.request_tx.try_send(request).map_err(|err| {
            warn!(error = %err, "market request channel at capacity, dropping request");
            EngineError::Internal("market request channel full".to_string())
        })
    }

    /// The most recent `count` candles for `market`, oldest first.
    pub async fn request_price_data(&self, market: &str, count: usize) -> Result<Vec<Candle>> {
        let (respond_to, response) = oneshot::channel();
        self.enqueue(MarketRequest::PriceData {
            market: market.to_string(),
            count,
            respond_to,
        })?;
        await_response(response, "price data").await
    }

    /// The most recent `count` VWAP observations for `market`, oldest first.
    pub async fn request_vwap_data(&self, market: &str, count: usize) -> Result<Vec<VwapEntry>> {
        let (respond_to, response) = oneshot::channel();
        self.enqueue(MarketRequest::VwapData {
            market: market.to_string(),
            count,
            respond_to,
        })?;
        await_response(response, "vwap data").await
    }

    /// The current VWAP observation for `market`.
    pub async fn request_vwap(&self, market: &str) -> Result<Option<VwapEntry>> {
        Ok(self.request_vwap_data(market, 1).await?.pop())
    }

    /// The VWAP observation recorded exactly at `at`.
    pub async fn request_vwap_at(
        &self,
        market: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<VwapEntry>> {
        let (respond_to, response) = oneshot::channel();
        self.enqueue(MarketRequest::VwapAtTime {
            market: market.to_string(),
            at,
            respond_to,
        })?;
        await_response(response, "vwap at time").await
    }

    /// Mean volume of the `count` candles before the most recent.
    pub async fn request_average_volume(&self, market: &str, count: usize) -> Result<Option<f64>> {
        let (respond_to, response) = oneshot::channel();
        self.enqueue(MarketRequest::AverageVolume {
            market: market.to_string(),
            count,
            respond_to,
        })?;
        await_response(response, "average volume").await
    }
}

/// Await a request's oneshot response under the shared data timeout.
async fn await_response<T>(response: oneshot::Receiver<T>, what: &str) -> Result<T> {
    match timeout(DATA_REQUEST_TIMEOUT, response).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(EngineError::Internal(format!("{what} responder dropped"))),
        Err(_) => Err(EngineError::Timeout(format!("{what} response"))),
    }
}

/// Receiver side of the market manager channels.
pub struct MarketChannels {
    update_rx: mpsc::Receiver<CandleMsg>,
    caught_up_rx: mpsc::Receiver<CaughtUpMsg>,
    request_rx: mpsc::Receiver<MarketRequest>,
}

/// Build the market handle/channel pair.
pub fn channels(capacity: usize) -> (MarketHandle, MarketChannels) {
    let (update_tx, update_rx) = mpsc::channel(capacity);
    let (caught_up_tx, caught_up_rx) = mpsc::channel(capacity);
    let (request_tx, request_rx) = mpsc::channel(capacity);
    (
        MarketHandle {
            update_tx,
            caught_up_tx,
            request_tx,
        },
        MarketChannels {
            update_rx,
            caught_up_rx,
            request_rx,
        },
    )
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

/// Market manager settings and collaborator callbacks.
pub struct MarketManagerConfig {
    pub markets: Vec<String>,
    pub timeframe: Timeframe,
    pub backtest: bool,
    pub catch_up: CatchUpFn,
    pub signal_level: SignalLevelFn,
}

/// Owns every per-market context and serves the data-request API.
pub struct MarketManager {
    cfg: MarketManagerConfig,
    markets: HashMap<String, Arc<Market>>,
    workers: HashMap<String, mpsc::Sender<MarketJob>>,
    request_workers: Arc<Semaphore>,
    channels: MarketChannels,
    shutdown: watch::Receiver<bool>,
}

impl MarketManager {
    pub fn new(
        cfg: MarketManagerConfig,
        channels: MarketChannels,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let mut markets = HashMap::new();
        let mut workers = HashMap::new();

        for name in &cfg.markets {
            let market = Arc::new(Market::new(name.clone(), cfg.timeframe)?);
            let (job_tx, job_rx) = mpsc::channel(MARKET_WORKER_CAPACITY);
            tokio::spawn(market_worker(
                market.clone(),
                job_rx,
                cfg.signal_level.clone(),
            ));
            markets.insert(name.clone(), market);
            workers.insert(name.clone(), job_tx);
        }

        Ok(Self {
            cfg,
            markets,
            workers,
            request_workers: Arc::new(Semaphore::new(REQUEST_WORKERS)),
            channels,
            shutdown,
        })
    }

    /// Supervisor loop. Returns promptly on shutdown; in-flight workers
    /// finish naturally.
    pub async fn run(mut self) {
        info!(markets = ?self.cfg.markets, "market manager started");

        if !self.cfg.backtest {
            let now = Utc::now();
            for market in &self.cfg.markets {
                let signal = CatchUpSignal {
                    market: market.clone(),
                    timeframe: self.cfg.timeframe,
                    start: session::last_session_open(now),
                };
                (self.cfg.catch_up)(signal);
            }
        }

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("market manager stopping");
                        return;
                    }
                }
                Some(msg) = self.channels.update_rx.recv() => {
                    self.dispatch(msg.candle.market.clone(), MarketJob::Update(msg)).await;
                }
                Some(msg) = self.channels.caught_up_rx.recv() => {
                    self.dispatch(msg.market.clone(), MarketJob::CaughtUp(msg)).await;
                }
                Some(request) = self.channels.request_rx.recv() => {
                    self.dispatch_request(request).await;
                }
            }
        }
    }

    /// Route a job to its market's worker channel, preserving per-market
    /// FIFO. The send blocks when the worker is saturated (backpressure).
    async fn dispatch(&self, market: String, job: MarketJob) {
        let Some(worker) = self.workers.get(&market) else {
            let err = EngineError::NotFound(format!("market {market}"));
            error!(error = %err, "candle job dropped");
            match job {
                MarketJob::Update(msg) => ack_processed(msg.ack),
                MarketJob::CaughtUp(msg) => ack_processed(msg.ack),
            }
            return;
        };

        if worker.send(job).await.is_err() {
            error!(market = %market, "market worker is gone");
        }
    }

    /// Serve a data request on the shared pool.
    async fn dispatch_request(&self, request: MarketRequest) {
        let market = match self.markets.get(request.market()) {
            Some(market) => market.clone(),
            None => {
                let err = EngineError::NotFound(format!("market {}", request.market()));
                error!(error = %err, "data request answered empty");
                respond_empty(request);
                return;
            }
        };

        let permit = self
            .request_workers
            .clone()
            .acquire_owned()
            .await
            .expect("request worker semaphore closed");

        tokio::spawn(async move {
            let _permit = permit;
            handle_request(&market, request);
        });
    }
}

/// Dedicated consumer loop for one market.
async fn market_worker(
    market: Arc<Market>,
    mut jobs: mpsc::Receiver<MarketJob>,
    signal_level: SignalLevelFn,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            MarketJob::Update(msg) => {
                let levels = market.update(msg.candle);
                for level in levels {
                    (signal_level)(level);
                }
                ack_processed(msg.ack);
            }
            MarketJob::CaughtUp(msg) => {
                market.set_caught_up(true);
                info!(market = %market.name(), "market caught up");
                ack_processed(msg.ack);
            }
        }
    }
}

/// Answer one data request from the market's snapshots.
fn handle_request(market: &Market, request: MarketRequest) {
    match request {
        MarketRequest::PriceData {
            count, respond_to, ..
        } => {
            let _ = respond_to.send(market.last_candles(count));
        }
        MarketRequest::VwapData {
            count, respond_to, ..
        } => {
            let _ = respond_to.send(market.vwap_data(count));
        }
        MarketRequest::VwapAtTime { at, respond_to, .. } => {
            let _ = respond_to.send(market.vwap_at(at));
        }
        MarketRequest::AverageVolume {
            count, respond_to, ..
        } => {
            let _ = respond_to.send(market.average_volume(count));
        }
    }
}

/// Answer a request for an unknown market with its empty value.
fn respond_empty(request: MarketRequest) {
    match request {
        MarketRequest::PriceData { respond_to, .. } => {
            let _ = respond_to.send(Vec::new());
        }
        MarketRequest::VwapData { respond_to, .. } => {
            let _ = respond_to.send(Vec::new());
        }
        MarketRequest::VwapAtTime { respond_to, .. } => {
            let _ = respond_to.send(None);
        }
        MarketRequest::AverageVolume { respond_to, .. } => {
            let _ = respond_to.send(None);
        }
    }
}
