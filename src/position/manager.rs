// =============================================================================
// Position Manager — entry/exit application behind the skew gate
// =============================================================================
//
// The supervisor multiplexes entry signals, exit signals and market-skew
// requests into a worker pool (8 slots), acking every signal when its worker
// finishes. A periodic job purges closed positions older than 48 hours.
// During backtests, shutdown flushes one CSV report per market before the
// loop returns.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{interval, timeout, Duration};
use tracing::{error, info, warn};

use crate::engine::{EntrySignal, ExitSignal};
use crate::error::{EngineError, Result};
use crate::notify::Notifier;
use crate::position::{report, Position, PositionMarket};
use crate::sink::PositionSink;
use crate::types::{ack_processed, format_reasons, MarketSkew, StatusAck, WorkStatus};

/// Concurrent signal/skew handlers.
const POSITION_WORKERS: usize = 8;
/// Bound on a signal's downstream ack.
const SIGNAL_ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on a skew request/response round trip.
const SKEW_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the purge job runs.
const PURGE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Age beyond which a closed position is purged.
const PURGE_AGE_HOURS: i64 = 48;

// -----------------------------------------------------------------------------
// Messages
// -----------------------------------------------------------------------------

/// An entry signal in flight, with its status-ack.
#[derive(Debug)]
pub struct EntryMsg {
    pub signal: EntrySignal,
    pub ack: StatusAck,
}

/// An exit signal in flight, with its status-ack.
#[derive(Debug)]
pub struct ExitMsg {
    pub signal: ExitSignal,
    pub ack: StatusAck,
}

/// Request for a market's current skew.
#[derive(Debug)]
pub struct SkewRequest {
    pub market: String,
    pub respond_to: oneshot::Sender<MarketSkew>,
}

// -----------------------------------------------------------------------------
// Handle + channels
// -----------------------------------------------------------------------------

/// Cloneable sender-side handle to the position manager.
#[derive(Clone)]
pub struct PositionHandle {
    entry_tx: mpsc::Sender<EntryMsg>,
    exit_tx: mpsc::Sender<ExitMsg>,
    skew_tx: mpsc::Sender<SkewRequest>,
}

impl PositionHandle {
    /// Deliver an entry signal and await its `Processed` ack (bounded).
    pub async fn send_entry_signal(&self, signal: EntrySignal) -> Result<WorkStatus> {
        let (ack, ack_rx) = oneshot::channel();
        self.entry_tx
            .try_send(EntryMsg { signal, ack })
            .map_err(|err| {
                warn!(error = %err, "entry signal channel at capacity, dropping signal");
                EngineError::Internal("entry signal channel full".to_string())
            })?;
        await_ack(ack_rx, "entry signal").await
    }

    /// Deliver an exit signal and await its `Processed` ack (bounded).
    pub async fn send_exit_signal(&self, signal: ExitSignal) -> Result<WorkStatus> {
        let (ack, ack_rx) = oneshot::channel();
        self.exit_tx
            .try_send(ExitMsg { signal, ack })
            .map_err(|err| {
                warn!(error = %err, "exit signal channel at capacity, dropping signal");
                EngineError::Internal("exit signal channel full".to_string())
            })?;
        await_ack(ack_rx, "exit signal").await
    }

    /// The current skew for `market`.
    pub async fn request_market_skew(&self, market: &str) -> Result<MarketSkew> {
        let (respond_to, response) = oneshot::channel();
        self.skew_tx
            .try_send(SkewRequest {
                market: market.to_string(),
                respond_to,
            })
            .map_err(|err| {
                warn!(error = %err, "skew request channel at capacity, dropping request");
                EngineError::Internal("skew request channel full".to_string())
            })?;

        match timeout(SKEW_REQUEST_TIMEOUT, response).await {
            Ok(Ok(skew)) => Ok(skew),
            Ok(Err(_)) => Err(EngineError::Internal("skew responder dropped".to_string())),
            Err(_) => Err(EngineError::Timeout("market skew response".to_string())),
        }
    }
}

async fn await_ack(ack_rx: oneshot::Receiver<WorkStatus>, what: &str) -> Result<WorkStatus> {
    match timeout(SIGNAL_ACK_TIMEOUT, ack_rx).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(_)) => Err(EngineError::Internal(format!("{what} ack dropped"))),
        Err(_) => Err(EngineError::Timeout(format!("{what} ack"))),
    }
}

/// Receiver side of the position manager channels.
pub struct PositionChannels {
    pub(crate) entry_rx: mpsc::Receiver<EntryMsg>,
    pub(crate) exit_rx: mpsc::Receiver<ExitMsg>,
    pub(crate) skew_rx: mpsc::Receiver<SkewRequest>,
}

/// Build the position handle/channel pair.
pub fn channels(capacity: usize) -> (PositionHandle, PositionChannels) {
    let (entry_tx, entry_rx) = mpsc::channel(capacity);
    let (exit_tx, exit_rx) = mpsc::channel(capacity);
    let (skew_tx, skew_rx) = mpsc::channel(capacity);
    (
        PositionHandle {
            entry_tx,
            exit_tx,
            skew_tx,
        },
        PositionChannels {
            entry_rx,
            exit_rx,
            skew_rx,
        },
    )
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

/// Position manager settings.
pub struct PositionManagerConfig {
    pub markets: Vec<String>,
    pub backtest: bool,
    /// Directory backtest CSV reports land in.
    pub report_dir: PathBuf,
}

/// Owns every per-market position book.
pub struct PositionManager {
    cfg: PositionManagerConfig,
    markets: HashMap<String, Arc<PositionMarket>>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn PositionSink>,
    workers: Arc<Semaphore>,
    channels: PositionChannels,
    shutdown: watch::Receiver<bool>,
}

impl PositionManager {
    pub fn new(
        cfg: PositionManagerConfig,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn PositionSink>,
        channels: PositionChannels,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let markets = cfg
            .markets
            .iter()
            .map(|name| (name.clone(), Arc::new(PositionMarket::new(name.clone()))))
            .collect();

        Self {
            cfg,
            markets,
            notifier,
            sink,
            workers: Arc::new(Semaphore::new(POSITION_WORKERS)),
            channels,
            shutdown,
        }
    }

    /// Supervisor loop. Flushes backtest reports on shutdown.
    pub async fn run(mut self) {
        info!(markets = ?self.cfg.markets, "position manager started");

        let mut purge = interval(PURGE_INTERVAL);
        // Skip the immediate first tick.
        purge.tick().await;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        if self.cfg.backtest {
                            self.drain_signals().await;
                            self.flush_reports();
                        }
                        info!("position manager stopping");
                        return;
                    }
                }
                Some(msg) = self.channels.entry_rx.recv() => {
                    self.spawn_entry(msg).await;
                }
                Some(msg) = self.channels.exit_rx.recv() => {
                    self.spawn_exit(msg).await;
                }
                Some(request) = self.channels.skew_rx.recv() => {
                    self.spawn_skew(request).await;
                }
                _ = purge.tick() => {
                    self.purge_closed();
                }
            }
        }
    }

    async fn acquire_worker(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .expect("position worker semaphore closed")
    }

    /// Look up a market book; a miss is a programming error.
    fn market(&self, name: &str) -> Result<Arc<PositionMarket>> {
        self.markets
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("market {name}")))
    }

    async fn spawn_entry(&self, msg: EntryMsg) {
        let EntryMsg { signal, ack } = msg;
        let market = match self.market(&signal.market) {
            Ok(market) => market,
            Err(err) => {
                error!(error = %err, "entry signal dropped");
                ack_processed(ack);
                return;
            }
        };

        let permit = self.acquire_worker().await;
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_entry(&market, &signal, notifier.as_ref()).await;
            ack_processed(ack);
        });
    }

    async fn spawn_exit(&self, msg: ExitMsg) {
        let ExitMsg { signal, ack } = msg;
        let market = match self.market(&signal.market) {
            Ok(market) => market,
            Err(err) => {
                error!(error = %err, "exit signal dropped");
                ack_processed(ack);
                return;
            }
        };

        let permit = self.acquire_worker().await;
        let notifier = self.notifier.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_exit(&market, &signal, notifier.as_ref(), sink.as_ref()).await;
            ack_processed(ack);
        });
    }

    async fn spawn_skew(&self, request: SkewRequest) {
        let market = match self.market(&request.market) {
            Ok(market) => market,
            Err(err) => {
                error!(error = %err, "skew request answered neutral");
                let _ = request.respond_to.send(MarketSkew::Neutral);
                return;
            }
        };

        let permit = self.acquire_worker().await;
        tokio::spawn(async move {
            let _permit = permit;
            let _ = request.respond_to.send(market.skew());
        });
    }

    /// Apply whatever signals are still queued so the backtest report sees
    /// every trade.
    async fn drain_signals(&mut self) {
        while let Ok(EntryMsg { signal, ack }) = self.channels.entry_rx.try_recv() {
            if let Some(market) = self.markets.get(&signal.market) {
                handle_entry(market, &signal, self.notifier.as_ref()).await;
            }
            ack_processed(ack);
        }
        while let Ok(ExitMsg { signal, ack }) = self.channels.exit_rx.try_recv() {
            if let Some(market) = self.markets.get(&signal.market) {
                handle_exit(market, &signal, self.notifier.as_ref(), self.sink.as_ref()).await;
            }
            ack_processed(ack);
        }
    }

    /// Run the purge across every market.
    fn purge_closed(&self) {
        let cutoff = Utc::now() - ChronoDuration::hours(PURGE_AGE_HOURS);
        for market in self.markets.values() {
            let purged = market.purge_closed(cutoff);
            if purged > 0 {
                info!(market = %market.name(), purged, "purged closed positions");
            }
        }
    }

    /// Write one CSV report per market (backtest shutdown).
    fn flush_reports(&self) {
        let now = Utc::now();
        for market in self.markets.values() {
            let positions = market.snapshot();
            if positions.is_empty() {
                continue;
            }
            match report::write_market_report(&self.cfg.report_dir, market.name(), &positions, now)
            {
                Ok(path) => info!(market = %market.name(), path = %path.display(), "report written"),
                Err(err) => error!(market = %market.name(), error = %err, "report failed"),
            }
        }
    }
}

/// Apply one entry signal to its market book.
async fn handle_entry(market: &PositionMarket, signal: &EntrySignal, notifier: &dyn Notifier) {
    let position = Position::open(signal);
    let id = position.id.clone();

    match market.add_position(position) {
        Ok(skew) => {
            info!(
                id = %id,
                market = %signal.market,
                direction = %signal.direction,
                price = signal.price,
                stop_loss = signal.stop_loss,
                skew = %skew,
                "position opened"
            );
            notifier
                .notify(&format!(
                    "Opened {} {} @ {:.3} (stop {:.3}, confluence {}: {})",
                    signal.direction,
                    signal.market,
                    signal.price,
                    signal.stop_loss,
                    signal.confluence,
                    format_reasons(&signal.reasons),
                ))
                .await;
        }
        Err(err @ EngineError::StateViolation(_)) => {
            // Dropped whole: no retry, no partial application.
            warn!(market = %signal.market, error = %err, "entry signal dropped");
        }
        Err(err) => {
            error!(market = %signal.market, error = %err, "entry signal failed");
        }
    }
}

/// Apply one exit signal: close matching positions, persist and notify each.
async fn handle_exit(
    market: &PositionMarket,
    signal: &ExitSignal,
    notifier: &dyn Notifier,
    sink: &dyn PositionSink,
) {
    let closed = market.close_positions(signal);
    if closed.is_empty() {
        warn!(
            market = %signal.market,
            direction = %signal.direction,
            "exit signal matched no open positions"
        );
        return;
    }

    for position in &closed {
        info!(
            id = %position.id,
            market = %position.market,
            status = %position.status,
            pnl_percent = position.pnl_percent,
            "position closed"
        );
        if let Err(err) = sink.persist_closed_position(position).await {
            error!(id = %position.id, error = %err, "failed to persist closed position");
        }
        notifier
            .notify(&format!(
                "Closed {} {} @ {:.3} ({}, P&L {:.3}%)",
                position.direction,
                position.market,
                signal.price,
                position.status,
                position.pnl_percent,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::sink::LogSink;
    use crate::types::{Direction, SignalReason, Timeframe};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn entry(direction: Direction, price: f64, stop: f64) -> EntrySignal {
        EntrySignal {
            market: "^GSPC".to_string(),
            timeframe: Timeframe::FiveMinute,
            direction,
            price,
            reasons: vec![SignalReason::ReversalAtSupport],
            confluence: 8,
            created_on: Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap(),
            stop_loss: stop,
            stop_loss_points: (price - stop).abs(),
        }
    }

    fn exit(direction: Direction, price: f64) -> ExitSignal {
        ExitSignal {
            market: "^GSPC".to_string(),
            timeframe: Timeframe::FiveMinute,
            direction,
            price,
            reasons: vec![SignalReason::ReversalAtResistance],
            confluence: 8,
            created_on: Utc.with_ymd_and_hms(2024, 3, 4, 16, 0, 0).unwrap(),
        }
    }

    /// A sink that records what it was asked to persist.
    struct RecordingSink(Mutex<Vec<Position>>);

    #[async_trait::async_trait]
    impl PositionSink for RecordingSink {
        async fn persist_closed_position(&self, position: &Position) -> anyhow::Result<()> {
            self.0.lock().push(position.clone());
            Ok(())
        }
    }

    fn spawn_manager(sink: Arc<dyn PositionSink>) -> (PositionHandle, watch::Sender<bool>) {
        let (handle, channels_rx) = channels(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = PositionManager::new(
            PositionManagerConfig {
                markets: vec!["^GSPC".to_string()],
                backtest: false,
                report_dir: std::env::temp_dir(),
            },
            Arc::new(LogNotifier),
            sink,
            channels_rx,
            shutdown_rx,
        );
        tokio::spawn(manager.run());
        (handle, shutdown_tx)
    }

    #[tokio::test]
    async fn entry_then_skew_then_exit() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let (handle, _shutdown) = spawn_manager(sink.clone());

        assert_eq!(
            handle.request_market_skew("^GSPC").await.unwrap(),
            MarketSkew::Neutral
        );

        handle
            .send_entry_signal(entry(Direction::Long, 10.0, 1.0))
            .await
            .unwrap();
        assert_eq!(
            handle.request_market_skew("^GSPC").await.unwrap(),
            MarketSkew::LongSkewed
        );

        handle
            .send_exit_signal(exit(Direction::Long, 12.0))
            .await
            .unwrap();
        assert_eq!(
            handle.request_market_skew("^GSPC").await.unwrap(),
            MarketSkew::Neutral
        );

        let persisted = sink.0.lock();
        assert_eq!(persisted.len(), 1);
        assert!((persisted[0].pnl_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn contrary_entry_leaves_book_untouched() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let (handle, _shutdown) = spawn_manager(sink);

        handle
            .send_entry_signal(entry(Direction::Long, 10.0, 1.0))
            .await
            .unwrap();
        // The contrary signal is acked (processed) but dropped.
        handle
            .send_entry_signal(entry(Direction::Short, 12.0, 15.0))
            .await
            .unwrap();

        assert_eq!(
            handle.request_market_skew("^GSPC").await.unwrap(),
            MarketSkew::LongSkewed
        );
    }

    #[tokio::test]
    async fn backtest_shutdown_flushes_reports() {
        let dir = tempfile::tempdir().unwrap();

        let (handle, channels_rx) = channels(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = PositionManager::new(
            PositionManagerConfig {
                markets: vec!["^GSPC".to_string()],
                backtest: true,
                report_dir: dir.path().to_path_buf(),
            },
            Arc::new(LogNotifier),
            Arc::new(LogSink),
            channels_rx,
            shutdown_rx,
        );
        let supervisor = tokio::spawn(manager.run());

        handle
            .send_entry_signal(entry(Direction::Long, 10.0, 1.0))
            .await
            .unwrap();
        handle
            .send_exit_signal(exit(Direction::Long, 12.0))
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        supervisor.await.unwrap();

        let reports: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("^GSPC-positions@"));

        let contents = std::fs::read_to_string(dir.path().join(&reports[0])).unwrap();
        assert!(contents.contains("Closed"));
        assert!(contents.contains("20.000"));
    }

    #[tokio::test]
    async fn unknown_market_skew_answers_neutral() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let (handle, _shutdown) = spawn_manager(sink);

        assert_eq!(
            handle.request_market_skew("^XXX").await.unwrap(),
            MarketSkew::Neutral
        );
    }
}
