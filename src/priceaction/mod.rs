// =============================================================================
// PriceAction Manager — POI bookkeeping, tag detection, reaction synthesis
// =============================================================================
//
// The supervisor multiplexes level signals, candle updates, caught-up
// signals and candle-metadata requests. Level signals and candle work for
// one market share that market's dedicated worker channel (capacity 4), so
// a level born from candle T is tracked before T itself is evaluated — the
// ingest bus only delivers T here after the market manager acked it.
//
// Metadata requests are served from a shared request pool; the handler
// pulls the last five candles from the market manager and derives metadata
// for every candle after the first.
// =============================================================================

pub mod market;
pub mod reaction;

pub use market::{PoiTracker, PriceActionMarket, VwapPoi, TAG_DEBOUNCE_UPDATES};
pub use reaction::{PoiRef, Reaction};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::engine::EngineHandle;
use crate::error::{EngineError, Result};
use crate::feed::{CandleMsg, CaughtUpMsg, Subscriber};
use crate::market::MarketHandle;
use crate::market_data::{Candle, CandleMetadata};
use crate::poi::{Level, LevelKind};
use crate::types::{ack_processed, Timeframe};

/// Candles in the window a reaction is synthesized from.
const REACTION_WINDOW: usize = 4;
/// Candles pulled for a metadata request (window + predecessor baseline).
const METADATA_WINDOW: usize = 5;
/// Capacity of each per-market worker channel.
const MARKET_WORKER_CAPACITY: usize = 4;
/// Concurrent metadata-request handlers.
const REQUEST_WORKERS: usize = 8;
/// Bound on a metadata request/response round trip.
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Requests + jobs
// -----------------------------------------------------------------------------

/// Request for the derived metadata of a market's trailing candles.
#[derive(Debug)]
pub struct CandleMetadataRequest {
    pub market: String,
    pub respond_to: oneshot::Sender<Vec<CandleMetadata>>,
}

/// Work routed through a market's dedicated worker channel.
enum PriceActionJob {
    Update(CandleMsg),
    CaughtUp(CaughtUpMsg),
    Level(Arc<Level>),
}

// -----------------------------------------------------------------------------
// Handle + channels
// -----------------------------------------------------------------------------

/// Cloneable sender-side handle to the price-action manager.
#[derive(Clone)]
pub struct PriceActionHandle {
    update_tx: mpsc::Sender<CandleMsg>,
    caught_up_tx: mpsc::Sender<CaughtUpMsg>,
    level_tx: mpsc::Sender<Arc<Level>>,
    metadata_tx: mpsc::Sender<CandleMetadataRequest>,
}

impl PriceActionHandle {
    /// Register this manager on the candle bus.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber {
            name: "priceaction",
            update_tx: self.update_tx.clone(),
            caught_up_tx: self.caught_up_tx.clone(),
        }
    }

    /// Track a freshly created level. Non-blocking; logged and dropped when
    /// the channel is full.
    pub fn send_level_signal(&self, level: Arc<Level>) {
        if let Err(err) = self.level_tx.try_send(level) {
            warn!(error = %err, "level channel at capacity, dropping level");
        }
    }

    /// The derived metadata for `market`'s trailing candles.
    pub async fn request_candle_metadata(&self, market: &str) -> Result<Vec<CandleMetadata>> {
        let (respond_to, response) = oneshot::channel();
        self.metadata_tx
            .try_send(CandleMetadataRequest {
                market: market.to_string(),
                respond_to,
            })
            .map_err(|err| {
                warn!(error = %err, "metadata request channel at capacity, dropping request");
                EngineError::Internal("metadata request channel full".to_string())
            })?;

        match timeout(METADATA_REQUEST_TIMEOUT, response).await {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(_)) => Err(EngineError::Internal(
                "metadata responder dropped".to_string(),
            )),
            Err(_) => Err(EngineError::Timeout("candle metadata response".to_string())),
        }
    }
}

/// Receiver side of the price-action channels.
pub struct PriceActionChannels {
    pub(crate) update_rx: mpsc::Receiver<CandleMsg>,
    pub(crate) caught_up_rx: mpsc::Receiver<CaughtUpMsg>,
    pub(crate) level_rx: mpsc::Receiver<Arc<Level>>,
    pub(crate) metadata_rx: mpsc::Receiver<CandleMetadataRequest>,
}

/// Build the price-action handle/channel pair.
pub fn channels(capacity: usize) -> (PriceActionHandle, PriceActionChannels) {
    let (update_tx, update_rx) = mpsc::channel(capacity);
    let (caught_up_tx, caught_up_rx) = mpsc::channel(capacity);
    let (level_tx, level_rx) = mpsc::channel(capacity);
    let (metadata_tx, metadata_rx) = mpsc::channel(capacity);
    (
        PriceActionHandle {
            update_tx,
            caught_up_tx,
            level_tx,
            metadata_tx,
        },
        PriceActionChannels {
            update_rx,
            caught_up_rx,
            level_rx,
            metadata_rx,
        },
    )
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

/// Price-action manager settings.
#[derive(Debug, Clone)]
pub struct PriceActionManagerConfig {
    pub markets: Vec<String>,
    pub timeframe: Timeframe,
}

/// Owns the per-market POI engines and the reaction pipeline into the
/// engine.
pub struct PriceActionManager {
    cfg: PriceActionManagerConfig,
    workers: HashMap<String, mpsc::Sender<PriceActionJob>>,
    request_workers: Arc<Semaphore>,
    market: MarketHandle,
    channels: PriceActionChannels,
    shutdown: watch::Receiver<bool>,
}

impl PriceActionManager {
    pub fn new(
        cfg: PriceActionManagerConfig,
        market: MarketHandle,
        engine: EngineHandle,
        channels: PriceActionChannels,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let mut workers = HashMap::new();

        for name in &cfg.markets {
            let pa_market = Arc::new(PriceActionMarket::new(name.clone(), cfg.timeframe)?);
            let (job_tx, job_rx) = mpsc::channel(MARKET_WORKER_CAPACITY);
            tokio::spawn(market_worker(
                pa_market,
                job_rx,
                market.clone(),
                engine.clone(),
            ));
            workers.insert(name.clone(), job_tx);
        }

        Ok(Self {
            cfg,
            workers,
            request_workers: Arc::new(Semaphore::new(REQUEST_WORKERS)),
            market,
            channels,
            shutdown,
        })
    }

    /// Supervisor loop. Level signals win ties against candle updates so a
    /// level published from the candle currently on the bus is tracked
    /// before that candle is evaluated here.
    pub async fn run(mut self) {
        info!(markets = ?self.cfg.markets, "price action manager started");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("price action manager stopping");
                        return;
                    }
                }
                Some(level) = self.channels.level_rx.recv() => {
                    let market = level.market.clone();
                    self.dispatch(market, PriceActionJob::Level(level)).await;
                }
                Some(msg) = self.channels.caught_up_rx.recv() => {
                    self.dispatch(msg.market.clone(), PriceActionJob::CaughtUp(msg)).await;
                }
                Some(msg) = self.channels.update_rx.recv() => {
                    self.dispatch(msg.candle.market.clone(), PriceActionJob::Update(msg)).await;
                }
                Some(request) = self.channels.metadata_rx.recv() => {
                    self.dispatch_metadata(request).await;
                }
            }
        }
    }

    /// Route a job to its market's worker, preserving per-market FIFO.
    async fn dispatch(&self, market: String, job: PriceActionJob) {
        let Some(worker) = self.workers.get(&market) else {
            let err = EngineError::NotFound(format!("market {market}"));
            error!(error = %err, "price action job dropped");
            match job {
                PriceActionJob::Update(msg) => ack_processed(msg.ack),
                PriceActionJob::CaughtUp(msg) => ack_processed(msg.ack),
                PriceActionJob::Level(_) => {}
            }
            return;
        };

        if worker.send(job).await.is_err() {
            error!(market = %market, "price action worker is gone");
        }
    }

    /// Serve a metadata request on the shared pool.
    async fn dispatch_metadata(&self, request: CandleMetadataRequest) {
        let permit = self
            .request_workers
            .clone()
            .acquire_owned()
            .await
            .expect("request worker semaphore closed");
        let market = self.market.clone();

        tokio::spawn(async move {
            let _permit = permit;
            handle_metadata_request(&market, request).await;
        });
    }
}

/// Pull the trailing candles and answer with their derived metadata. A
/// failed pull answers empty, which the engine treats as missing data.
async fn handle_metadata_request(market: &MarketHandle, request: CandleMetadataRequest) {
    let candles = match market
        .request_price_data(&request.market, METADATA_WINDOW)
        .await
    {
        Ok(candles) => candles,
        Err(err) => {
            warn!(market = %request.market, error = %err, "metadata candle pull failed");
            Vec::new()
        }
    };

    let metadata = CandleMetadata::derive_series(&candles);
    let _ = request.respond_to.send(metadata);
}

// -----------------------------------------------------------------------------
// Per-market worker
// -----------------------------------------------------------------------------

/// Dedicated consumer loop for one market's price-action work.
async fn market_worker(
    pa_market: Arc<PriceActionMarket>,
    mut jobs: mpsc::Receiver<PriceActionJob>,
    market: MarketHandle,
    engine: EngineHandle,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            PriceActionJob::Update(msg) => {
                handle_update(&pa_market, &market, &engine, &msg.candle).await;
                ack_processed(msg.ack);
            }
            PriceActionJob::CaughtUp(msg) => {
                pa_market.set_caught_up(true);
                info!(market = %pa_market.name(), "price action caught up");
                ack_processed(msg.ack);
            }
            PriceActionJob::Level(level) => {
                pa_market.add_level(level);
            }
        }
    }
}

/// One candle through the POI engine: snapshots first, then the tag state
/// machines, then any pending data requests and reaction synthesis.
async fn handle_update(
    pa_market: &Arc<PriceActionMarket>,
    market: &MarketHandle,
    engine: &EngineHandle,
    candle: &Candle,
) {
    pa_market.apply_candle(candle);

    if !pa_market.caught_up() {
        return;
    }

    // Progress armed machines before evaluating new tags, so the tagging
    // candle itself never counts toward the debounce.
    pa_market.level_state.advance();
    pa_market.imbalance_state.advance();
    pa_market.vwap_state.advance();

    pa_market.level_state.observe(pa_market.tagged_levels(candle));
    pa_market
        .imbalance_state
        .observe(pa_market.tagged_imbalances(candle));
    observe_vwap_tag(pa_market, market, candle).await;

    if pa_market.level_state.requesting() {
        synthesize_level_reactions(pa_market, market, engine).await;
        pa_market.level_state.reset();
    }
    if pa_market.imbalance_state.requesting() {
        synthesize_imbalance_reactions(pa_market, market, engine).await;
        pa_market.imbalance_state.reset();
    }
    if pa_market.vwap_state.requesting() {
        synthesize_vwap_reactions(pa_market, market, engine).await;
        pa_market.vwap_state.reset();
    }
}

/// Fetch the current VWAP and arm the VWAP machine when the candle's wick
/// reaches it.
async fn observe_vwap_tag(
    pa_market: &Arc<PriceActionMarket>,
    market: &MarketHandle,
    candle: &Candle,
) {
    let entry = match market.request_vwap(pa_market.name()).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(err) => {
            warn!(market = %pa_market.name(), error = %err, "vwap fetch failed");
            return;
        }
    };

    if entry.value <= 0.0 || candle.low > entry.value || candle.high < entry.value {
        return;
    }

    let role = if candle.close >= entry.value {
        LevelKind::Support
    } else {
        LevelKind::Resistance
    };
    pa_market
        .vwap_state
        .observe(vec![VwapPoi { entry, role }]);
}

/// Pull the reaction window once and synthesize a reaction per pending
/// level.
async fn synthesize_level_reactions(
    pa_market: &Arc<PriceActionMarket>,
    market: &MarketHandle,
    engine: &EngineHandle,
) {
    let Some(window) = fetch_reaction_window(pa_market, market).await else {
        return;
    };

    for level in pa_market.level_state.take_pending() {
        if let Some(reaction) = Reaction::at_level(level, &window, pa_market.timeframe()) {
            publish(engine, reaction).await;
        }
    }
}

async fn synthesize_imbalance_reactions(
    pa_market: &Arc<PriceActionMarket>,
    market: &MarketHandle,
    engine: &EngineHandle,
) {
    let Some(window) = fetch_reaction_window(pa_market, market).await else {
        return;
    };

    for imbalance in pa_market.imbalance_state.take_pending() {
        if let Some(reaction) = Reaction::at_imbalance(imbalance, &window, pa_market.timeframe()) {
            publish(engine, reaction).await;
        }
    }
}

async fn synthesize_vwap_reactions(
    pa_market: &Arc<PriceActionMarket>,
    market: &MarketHandle,
    engine: &EngineHandle,
) {
    let Some(window) = fetch_reaction_window(pa_market, market).await else {
        return;
    };

    for poi in pa_market.vwap_state.take_pending() {
        if let Some(reaction) =
            Reaction::at_vwap(poi.entry, poi.role, &window, pa_market.timeframe())
        {
            publish(engine, reaction).await;
        }
    }
}

/// The candle window reactions are classified over. `None` (with a warning)
/// when the pull fails or the window is too short to classify.
async fn fetch_reaction_window(
    pa_market: &Arc<PriceActionMarket>,
    market: &MarketHandle,
) -> Option<Vec<Candle>> {
    match market
        .request_price_data(pa_market.name(), REACTION_WINDOW)
        .await
    {
        Ok(window) if window.len() >= 2 => Some(window),
        Ok(window) => {
            warn!(
                market = %pa_market.name(),
                len = window.len(),
                "reaction window too short, dropping reactions"
            );
            None
        }
        Err(err) => {
            warn!(
                market = %pa_market.name(),
                error = %err,
                "price data request failed, dropping reactions"
            );
            None
        }
    }
}

/// Publish one reaction and surface (but tolerate) ack problems.
async fn publish(engine: &EngineHandle, reaction: Reaction) {
    let market = reaction.market.clone();
    let poi = reaction.poi.to_string();
    if let Err(err) = engine.publish_reaction(reaction).await {
        warn!(market = %market, poi = %poi, error = %err, "reaction publication failed");
    }
}
