// =============================================================================
// Engine — confluence scoring and skew-gated signal emission
// =============================================================================
//
// For each reaction the engine pulls candle metadata (PriceAction) and
// average volume (Market), scores the confluences, and — when the score
// clears the per-reaction-kind threshold — consults the position manager's
// market skew to decide between an entry and an exit:
//
//   Reversal at Support     defends longs   -> Long entry / Short exit
//   Reversal at Resistance  defends shorts  -> Short entry / Long exit
//   Break over Resistance   continues longs -> Long entry / Short exit
//   Break under Support     continues shorts-> Short entry / Long exit
//
// Chop reactions are logged and dropped. Missing metadata is terminal for a
// reaction; a timeout on any fetch drops the reaction without retry.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::market::MarketHandle;
use crate::market_data::CandleMetadata;
use crate::poi::LevelKind;
use crate::position::PositionHandle;
use crate::priceaction::{PriceActionHandle, Reaction};
use crate::session;
use crate::types::{
    ack_processed, CandleKind, Direction, MarketSkew, ReactionKind, Sentiment, SignalReason,
    StatusAck, Timeframe, WorkStatus,
};

/// Confluence a reversal reaction must reach to fire.
const MIN_REVERSAL_CONFLUENCE: u32 = 7;
/// Confluence a break reaction must reach to fire.
const MIN_BREAK_CONFLUENCE: u32 = 7;
/// Volume above average (as a fraction of average) that counts as
/// substantial.
const MIN_AVERAGE_VOLUME_PERCENT: f64 = 0.3;
/// Price points added beyond the window extreme when placing the stop.
const STOP_LOSS_BUFFER: f64 = 2.0;
/// Candles averaged for the volume baseline.
const AVERAGE_VOLUME_WINDOW: usize = 4;
/// Bound on the downstream ack for a published reaction.
const REACTION_ACK_TIMEOUT: Duration = Duration::from_secs(1);

// -----------------------------------------------------------------------------
// Signals
// -----------------------------------------------------------------------------

/// Instruction to open a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub market: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub price: f64,
    pub reasons: Vec<SignalReason>,
    pub confluence: u32,
    pub created_on: DateTime<Utc>,
    pub stop_loss: f64,
    pub stop_loss_points: f64,
}

/// Instruction to close every open position on one side of a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSignal {
    pub market: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub price: f64,
    pub reasons: Vec<SignalReason>,
    pub confluence: u32,
    pub created_on: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// Handle + channels
// -----------------------------------------------------------------------------

/// A reaction in flight to the engine, with its status-ack.
#[derive(Debug)]
pub struct ReactionMsg {
    pub reaction: Reaction,
    pub ack: StatusAck,
}

/// Cloneable sender-side handle to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    reaction_tx: mpsc::Sender<ReactionMsg>,
}

impl EngineHandle {
    /// Publish one reaction and await the engine's `Processed` ack (bounded).
    pub async fn publish_reaction(&self, reaction: Reaction) -> Result<WorkStatus> {
        let (ack, ack_rx) = oneshot::channel();
        self.reaction_tx
            .try_send(ReactionMsg { reaction, ack })
            .map_err(|err| {
                warn!(error = %err, "reaction channel at capacity, dropping reaction");
                EngineError::Internal("reaction channel full".to_string())
            })?;

        match timeout(REACTION_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(EngineError::Internal(
                "reaction ack dropped before completion".to_string(),
            )),
            Err(_) => Err(EngineError::Timeout("reaction ack".to_string())),
        }
    }
}

/// Receiver side of the engine channels.
pub struct EngineChannels {
    pub(crate) reaction_rx: mpsc::Receiver<ReactionMsg>,
}

/// Build the engine handle/channel pair.
pub fn channels(capacity: usize) -> (EngineHandle, EngineChannels) {
    let (reaction_tx, reaction_rx) = mpsc::channel(capacity);
    (EngineHandle { reaction_tx }, EngineChannels { reaction_rx })
}

// -----------------------------------------------------------------------------
// Engine
// -----------------------------------------------------------------------------

/// The confluence-scoring decision stage.
pub struct Engine {
    market: MarketHandle,
    priceaction: PriceActionHandle,
    positions: PositionHandle,
    channels: EngineChannels,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        market: MarketHandle,
        priceaction: PriceActionHandle,
        positions: PositionHandle,
        channels: EngineChannels,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            market,
            priceaction,
            positions,
            channels,
            shutdown,
        }
    }

    /// Supervisor loop. Every reaction is acked, whatever its outcome.
    pub async fn run(mut self) {
        info!("engine started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("engine stopping");
                        return;
                    }
                }
                Some(msg) = self.channels.reaction_rx.recv() => {
                    let ReactionMsg { reaction, ack } = msg;
                    if let Err(err) = self.handle_reaction(&reaction).await {
                        match err {
                            EngineError::Timeout(_) | EngineError::DataMissing(_) => {
                                warn!(
                                    market = %reaction.market,
                                    poi = %reaction.poi,
                                    error = %err,
                                    "reaction dropped"
                                );
                            }
                            _ => {
                                error!(
                                    market = %reaction.market,
                                    poi = %reaction.poi,
                                    error = %err,
                                    "reaction evaluation failed"
                                );
                            }
                        }
                    }
                    ack_processed(ack);
                }
            }
        }
    }

    /// Score one reaction and emit the resulting signal, if any.
    async fn handle_reaction(&self, reaction: &Reaction) -> Result<()> {
        if reaction.kind == ReactionKind::Chop {
            debug!(market = %reaction.market, poi = %reaction.poi, "chop reaction, no action");
            return Ok(());
        }

        let metadata = self
            .priceaction
            .request_candle_metadata(&reaction.market)
            .await?;
        if metadata.is_empty() {
            return Err(EngineError::DataMissing(format!(
                "no candle metadata for {}",
                reaction.market
            )));
        }

        let average_volume = self
            .market
            .request_average_volume(&reaction.market, AVERAGE_VOLUME_WINDOW)
            .await?
            .unwrap_or(0.0);

        let evaluation = evaluate_confluence(reaction, &metadata, average_volume);
        let threshold = match reaction.kind {
            ReactionKind::Reversal => MIN_REVERSAL_CONFLUENCE,
            ReactionKind::Break => MIN_BREAK_CONFLUENCE,
            ReactionKind::Chop => unreachable!("chop handled above"),
        };

        if evaluation.confluence < threshold {
            debug!(
                market = %reaction.market,
                poi = %reaction.poi,
                confluence = evaluation.confluence,
                threshold,
                "confluence below threshold"
            );
            return Ok(());
        }

        let skew = self.positions.request_market_skew(&reaction.market).await?;

        match decide_action(reaction.kind, reaction.role, skew) {
            SignalAction::Enter(direction) => {
                let (stop_loss, stop_loss_points) =
                    estimate_stop_loss(direction, &metadata, reaction.current_price)?;
                let signal = EntrySignal {
                    market: reaction.market.clone(),
                    timeframe: reaction.timeframe,
                    direction,
                    price: reaction.current_price,
                    reasons: evaluation.reasons,
                    confluence: evaluation.confluence,
                    created_on: reaction.created_on,
                    stop_loss,
                    stop_loss_points,
                };
                info!(
                    market = %signal.market,
                    direction = %signal.direction,
                    price = signal.price,
                    confluence = signal.confluence,
                    stop_loss = signal.stop_loss,
                    "entry signal"
                );
                self.positions.send_entry_signal(signal).await?;
            }
            SignalAction::Exit(direction) => {
                let signal = ExitSignal {
                    market: reaction.market.clone(),
                    timeframe: reaction.timeframe,
                    direction,
                    price: reaction.current_price,
                    reasons: evaluation.reasons,
                    confluence: evaluation.confluence,
                    created_on: reaction.created_on,
                };
                info!(
                    market = %signal.market,
                    direction = %signal.direction,
                    price = signal.price,
                    confluence = signal.confluence,
                    "exit signal"
                );
                self.positions.send_exit_signal(signal).await?;
            }
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Scoring
// -----------------------------------------------------------------------------

/// Outcome of the confluence evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub confluence: u32,
    pub reasons: Vec<SignalReason>,
    pub sentiment: Sentiment,
}

/// Score a reaction against its metadata window and volume baseline.
pub fn evaluate_confluence(
    reaction: &Reaction,
    metadata: &[CandleMetadata],
    average_volume: f64,
) -> Evaluation {
    let mut confluence = 0;
    let mut reasons: Vec<SignalReason> = Vec::new();
    let push = |reasons: &mut Vec<SignalReason>, reason: SignalReason| {
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    };

    // Reversal/break confirmation sets the sentiment the rest of the
    // evaluation filters on.
    let sentiment = match (reaction.kind, reaction.role) {
        (ReactionKind::Reversal, LevelKind::Resistance) => {
            confluence += 1;
            push(&mut reasons, SignalReason::ReversalAtResistance);
            Sentiment::Bearish
        }
        (ReactionKind::Reversal, LevelKind::Support) => {
            confluence += 1;
            push(&mut reasons, SignalReason::ReversalAtSupport);
            Sentiment::Bullish
        }
        (ReactionKind::Break, LevelKind::Resistance) => {
            confluence += 1;
            push(&mut reasons, SignalReason::BreakAboveResistance);
            Sentiment::Bullish
        }
        (ReactionKind::Break, LevelKind::Support) => {
            confluence += 1;
            push(&mut reasons, SignalReason::BreakBelowSupport);
            Sentiment::Bearish
        }
        (ReactionKind::Chop, _) => Sentiment::Neutral,
    };

    if session::is_high_volume_time(reaction.created_on) {
        confluence += 1;
        push(&mut reasons, SignalReason::HighVolumeSession);
    }

    for entry in metadata.iter().filter(|m| m.sentiment == sentiment) {
        if matches!(entry.kind, CandleKind::Marubozu | CandleKind::Pinbar)
            && entry.momentum.is_substantial()
        {
            confluence += 1;
            push(&mut reasons, SignalReason::StrongMove);
        }

        if entry.engulfing && entry.momentum.is_substantial() {
            confluence += 1;
            let reason = match entry.sentiment {
                Sentiment::Bearish => SignalReason::BearishEngulfing,
                _ => SignalReason::BullishEngulfing,
            };
            push(&mut reasons, reason);
        }

        if average_volume > 0.0 {
            let delta = entry.volume - average_volume;
            if delta / average_volume >= MIN_AVERAGE_VOLUME_PERCENT {
                confluence += 2;
                push(&mut reasons, SignalReason::StrongVolume);
            } else if delta > 0.0 {
                confluence += 1;
                push(&mut reasons, SignalReason::StrongVolume);
            }
        }
    }

    Evaluation {
        confluence,
        reasons,
        sentiment,
    }
}

/// What a firing reaction should do, given the market's current skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Enter(Direction),
    Exit(Direction),
}

/// The action table: the reaction's natural direction becomes an entry when
/// the skew permits it, otherwise an exit of the opposing exposure.
pub fn decide_action(kind: ReactionKind, role: LevelKind, skew: MarketSkew) -> SignalAction {
    let preferred = match (kind, role) {
        (ReactionKind::Reversal, LevelKind::Support) => Direction::Long,
        (ReactionKind::Reversal, LevelKind::Resistance) => Direction::Short,
        (ReactionKind::Break, LevelKind::Resistance) => Direction::Long,
        (ReactionKind::Break, LevelKind::Support) => Direction::Short,
        (ReactionKind::Chop, _) => unreachable!("chop never reaches the action table"),
    };

    if skew.allows(preferred) {
        SignalAction::Enter(preferred)
    } else {
        SignalAction::Exit(preferred.opposite())
    }
}

/// Place the protective stop beyond the metadata window's extreme.
///
/// Sanity checks: the window must have a coherent range, the entry must sit
/// inside it, and the resulting stop must be a positive price.
pub fn estimate_stop_loss(
    direction: Direction,
    metadata: &[CandleMetadata],
    entry: f64,
) -> Result<(f64, f64)> {
    let low = metadata.iter().map(|m| m.low).fold(f64::INFINITY, f64::min);
    let high = metadata
        .iter()
        .map(|m| m.high)
        .fold(f64::NEG_INFINITY, f64::max);

    if !low.is_finite() || !high.is_finite() || low > high {
        return Err(EngineError::InvalidArgument(format!(
            "incoherent stop-loss window: low {low}, high {high}"
        )));
    }
    if entry < low || entry > high {
        return Err(EngineError::InvalidArgument(format!(
            "entry {entry} outside window {low}..{high}"
        )));
    }

    let stop_loss = match direction {
        Direction::Long => low - STOP_LOSS_BUFFER,
        Direction::Short => high + STOP_LOSS_BUFFER,
    };
    if stop_loss <= 0.0 {
        return Err(EngineError::InvalidArgument(format!(
            "stop loss {stop_loss} is not a positive price"
        )));
    }

    Ok((stop_loss, (entry - stop_loss).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poi::Level;
    use crate::priceaction::PoiRef;
    use crate::types::Momentum;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use std::sync::Arc;

    /// 05:00 New York on 2024-03-04: the London session.
    fn london_time() -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2024, 3, 4, 5, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    /// 01:00 New York: the Asia session.
    fn asia_time() -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2024, 3, 4, 1, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn reaction(kind: ReactionKind, role: LevelKind, price: f64, at: DateTime<Utc>) -> Reaction {
        let level_price = if role == LevelKind::Support { 3.0 } else { 5.0 };
        Reaction {
            market: "^GSPC".to_string(),
            timeframe: Timeframe::FiveMinute,
            poi: PoiRef::Level(Arc::new(Level::new("^GSPC", level_price, price))),
            role,
            movement: Vec::new(),
            kind,
            current_price: price,
            created_on: at,
        }
    }

    fn meta(
        kind: CandleKind,
        momentum: Momentum,
        volume: f64,
        engulfing: bool,
        high: f64,
        low: f64,
    ) -> CandleMetadata {
        CandleMetadata {
            kind,
            sentiment: Sentiment::Bullish,
            momentum,
            volume,
            engulfing,
            high,
            low,
            date: london_time(),
        }
    }

    /// A support-reversal window: kinds Doji, Pinbar, Marubozu, Marubozu;
    /// momenta Low, Medium, Medium, High; volumes 1, 4, 5, 8.
    fn support_reversal_window() -> Vec<CandleMetadata> {
        vec![
            meta(CandleKind::Doji, Momentum::Low, 1.0, false, 5.0, 3.0),
            meta(CandleKind::Pinbar, Momentum::Medium, 4.0, false, 7.0, 5.0),
            meta(CandleKind::Marubozu, Momentum::Medium, 5.0, false, 9.0, 7.0),
            meta(CandleKind::Marubozu, Momentum::High, 8.0, false, 11.0, 9.0),
        ]
    }

    #[test]
    fn support_reversal_scoring() {
        let r = reaction(ReactionKind::Reversal, LevelKind::Support, 10.0, london_time());
        let eval = evaluate_confluence(&r, &support_reversal_window(), 4.0);

        // ReversalAtSupport 1 + HighVolumeSession 1 + StrongMove 3 +
        // StrongVolume 1 (vol 5 vs avg 4) + 2 (vol 8 vs avg 4).
        assert_eq!(eval.confluence, 8);
        assert_eq!(eval.sentiment, Sentiment::Bullish);
        for reason in [
            SignalReason::ReversalAtSupport,
            SignalReason::HighVolumeSession,
            SignalReason::StrongMove,
            SignalReason::StrongVolume,
        ] {
            assert!(eval.reasons.contains(&reason), "missing {reason}");
        }
    }

    #[test]
    fn asia_session_earns_no_volume_point() {
        let r = reaction(ReactionKind::Reversal, LevelKind::Support, 10.0, asia_time());
        let eval = evaluate_confluence(&r, &support_reversal_window(), 4.0);
        assert_eq!(eval.confluence, 7);
        assert!(!eval.reasons.contains(&SignalReason::HighVolumeSession));
    }

    #[test]
    fn mismatched_sentiment_candles_score_nothing() {
        let r = reaction(ReactionKind::Reversal, LevelKind::Resistance, 10.0, london_time());
        // Reaction sentiment is Bearish; the all-bullish window contributes
        // nothing beyond the confirmation and session points.
        let eval = evaluate_confluence(&r, &support_reversal_window(), 4.0);
        assert_eq!(eval.confluence, 2);
        assert_eq!(eval.sentiment, Sentiment::Bearish);
    }

    #[test]
    fn engulfing_candles_score_one_each() {
        let window: Vec<CandleMetadata> = (0..4)
            .map(|i| {
                meta(
                    CandleKind::SpinningTop,
                    Momentum::Medium,
                    5.0,
                    true,
                    7.0 + i as f64,
                    3.0 + i as f64,
                )
            })
            .collect();

        let r = reaction(ReactionKind::Break, LevelKind::Resistance, 10.0, london_time());
        // Break 1 + session 1 + engulfing 4x1 + volume (5 vs 4: +1 each) 4.
        let eval = evaluate_confluence(&r, &window, 4.0);
        assert_eq!(eval.confluence, 10);
        assert!(eval.reasons.contains(&SignalReason::BullishEngulfing));
    }

    #[test]
    fn zero_average_volume_skips_volume_scoring() {
        let r = reaction(ReactionKind::Reversal, LevelKind::Support, 10.0, london_time());
        let eval = evaluate_confluence(&r, &support_reversal_window(), 0.0);
        // StrongVolume contributions vanish: 1 + 1 + 3.
        assert_eq!(eval.confluence, 5);
        assert!(!eval.reasons.contains(&SignalReason::StrongVolume));
    }

    #[test]
    fn action_table() {
        use MarketSkew::*;
        use SignalAction::*;

        let rows = [
            (ReactionKind::Reversal, LevelKind::Support, Neutral, Enter(Direction::Long)),
            (ReactionKind::Reversal, LevelKind::Support, LongSkewed, Enter(Direction::Long)),
            (ReactionKind::Reversal, LevelKind::Support, ShortSkewed, Exit(Direction::Short)),
            (ReactionKind::Reversal, LevelKind::Resistance, Neutral, Enter(Direction::Short)),
            (ReactionKind::Reversal, LevelKind::Resistance, ShortSkewed, Enter(Direction::Short)),
            (ReactionKind::Reversal, LevelKind::Resistance, LongSkewed, Exit(Direction::Long)),
            (ReactionKind::Break, LevelKind::Resistance, Neutral, Enter(Direction::Long)),
            (ReactionKind::Break, LevelKind::Resistance, LongSkewed, Enter(Direction::Long)),
            (ReactionKind::Break, LevelKind::Resistance, ShortSkewed, Exit(Direction::Short)),
            (ReactionKind::Break, LevelKind::Support, Neutral, Enter(Direction::Short)),
            (ReactionKind::Break, LevelKind::Support, ShortSkewed, Enter(Direction::Short)),
            (ReactionKind::Break, LevelKind::Support, LongSkewed, Exit(Direction::Long)),
        ];

        for (kind, role, skew, expected) in rows {
            assert_eq!(decide_action(kind, role, skew), expected, "{kind:?} {role:?} {skew:?}");
        }
    }

    #[test]
    fn stop_loss_placement() {
        let window = support_reversal_window();

        // Long: window low 3 minus the 2-point buffer.
        let (stop, points) = estimate_stop_loss(Direction::Long, &window, 10.0).unwrap();
        assert_eq!(stop, 1.0);
        assert_eq!(points, 9.0);

        // Short: window high 11 plus the buffer.
        let (stop, points) = estimate_stop_loss(Direction::Short, &window, 10.0).unwrap();
        assert_eq!(stop, 13.0);
        assert_eq!(points, 3.0);
    }

    /// Full-pipeline scenario: a support level is tagged, debounced, and the
    /// resulting reversal reaction clears the threshold into a Long entry.
    mod pipeline {
        use super::london_time;
        use crate::engine::{channels, Engine, EngineHandle};
        use crate::feed::{CandleMsg, CaughtUpMsg};
        use crate::market::{self, MarketManager, MarketManagerConfig};
        use crate::market_data::Candle;
        use crate::notify::Notifier;
        use crate::poi::{Level, LevelKind};
        use crate::position::{self, PositionHandle, PositionManager, PositionManagerConfig};
        use crate::priceaction::{
            self, PoiRef, PriceActionHandle, PriceActionManager, PriceActionManagerConfig,
            Reaction,
        };
        use crate::position::Position;
        use crate::sink::PositionSink;
        use crate::types::{MarketSkew, ReactionKind, Timeframe, WorkStatus};
        use chrono::{DateTime, TimeZone, Utc};
        use chrono_tz::America::New_York;
        use parking_lot::Mutex;
        use std::sync::Arc;
        use tokio::sync::watch;

        struct RecordingNotifier(Mutex<Vec<String>>);

        #[async_trait::async_trait]
        impl Notifier for RecordingNotifier {
            async fn notify(&self, message: &str) {
                self.0.lock().push(message.to_string());
            }
        }

        struct RecordingSink(Mutex<Vec<Position>>);

        #[async_trait::async_trait]
        impl PositionSink for RecordingSink {
            async fn persist_closed_position(&self, position: &Position) -> anyhow::Result<()> {
                self.0.lock().push(position.clone());
                Ok(())
            }
        }

        struct Stack {
            market: crate::market::MarketHandle,
            priceaction: PriceActionHandle,
            engine: EngineHandle,
            positions: PositionHandle,
            notifications: Arc<RecordingNotifier>,
            persisted: Arc<RecordingSink>,
            _shutdown: watch::Sender<bool>,
        }

        fn spawn_stack() -> Stack {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let (market_handle, market_channels) = market::channels(64);
            let (pa_handle, pa_channels) = priceaction::channels(64);
            let (engine_handle, engine_channels) = channels(64);
            let (position_handle, position_channels) = position::channels(64);

            let market_cfg = MarketManagerConfig {
                markets: vec!["^GSPC".to_string()],
                timeframe: Timeframe::FiveMinute,
                backtest: true,
                catch_up: Arc::new(|_| {}),
                signal_level: {
                    let pa = pa_handle.clone();
                    Arc::new(move |level| pa.send_level_signal(level))
                },
            };
            tokio::spawn(
                MarketManager::new(market_cfg, market_channels, shutdown_rx.clone())
                    .unwrap()
                    .run(),
            );

            tokio::spawn(
                PriceActionManager::new(
                    PriceActionManagerConfig {
                        markets: vec!["^GSPC".to_string()],
                        timeframe: Timeframe::FiveMinute,
                    },
                    market_handle.clone(),
                    engine_handle.clone(),
                    pa_channels,
                    shutdown_rx.clone(),
                )
                .unwrap()
                .run(),
            );

            tokio::spawn(
                Engine::new(
                    market_handle.clone(),
                    pa_handle.clone(),
                    position_handle.clone(),
                    engine_channels,
                    shutdown_rx.clone(),
                )
                .run(),
            );

            let notifications = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
            let persisted = Arc::new(RecordingSink(Mutex::new(Vec::new())));
            tokio::spawn(
                PositionManager::new(
                    PositionManagerConfig {
                        markets: vec!["^GSPC".to_string()],
                        backtest: false,
                        report_dir: std::env::temp_dir(),
                    },
                    notifications.clone(),
                    persisted.clone(),
                    position_channels,
                    shutdown_rx,
                )
                .run(),
            );

            Stack {
                market: market_handle,
                priceaction: pa_handle,
                engine: engine_handle,
                positions: position_handle,
                notifications,
                persisted,
                _shutdown: shutdown_tx,
            }
        }

        fn ny(h: u32, m: u32) -> DateTime<Utc> {
            New_York
                .with_ymd_and_hms(2024, 3, 4, h, m, 0)
                .unwrap()
                .with_timezone(&Utc)
        }

        fn candle(
            minute: u32,
            open: f64,
            high: f64,
            low: f64,
            close: f64,
            volume: f64,
        ) -> Candle {
            Candle {
                market: "^GSPC".to_string(),
                timeframe: Timeframe::FiveMinute,
                open,
                high,
                low,
                close,
                volume,
                vwap: 0.0,
                date: ny(5, minute),
            }
        }

        /// Deliver one candle in bus order: market first, then price action.
        async fn push(stack: &Stack, candle: Candle) {
            for subscriber in [stack.market.subscriber(), stack.priceaction.subscriber()] {
                let (ack, ack_rx) = tokio::sync::oneshot::channel();
                subscriber
                    .update_tx
                    .send(CandleMsg {
                        candle: candle.clone(),
                        ack,
                    })
                    .await
                    .unwrap();
                assert_eq!(ack_rx.await.unwrap(), WorkStatus::Processed);
            }
        }

        async fn mark_caught_up(stack: &Stack) {
            for subscriber in [stack.market.subscriber(), stack.priceaction.subscriber()] {
                let (ack, ack_rx) = tokio::sync::oneshot::channel();
                subscriber
                    .caught_up_tx
                    .send(CaughtUpMsg {
                        market: "^GSPC".to_string(),
                        ack,
                    })
                    .await
                    .unwrap();
                ack_rx.await.unwrap();
            }
        }

        #[tokio::test]
        async fn support_reversal_becomes_long_entry() {
            let stack = spawn_stack();
            mark_caught_up(&stack).await;

            // Support at 3, classified against a close of 4.
            stack
                .priceaction
                .send_level_signal(Arc::new(Level::new("^GSPC", 3.0, 4.0)));

            // Quiet baseline candles around 4 establish VWAP and the volume
            // average without touching the level.
            push(&stack, candle(0, 4.0, 4.2, 3.9, 4.0, 4.0)).await;
            push(&stack, candle(5, 4.0, 4.3, 4.0, 4.1, 4.0)).await;
            push(&stack, candle(10, 4.1, 4.2, 3.95, 4.0, 4.0)).await;
            push(&stack, candle(15, 4.0, 4.25, 4.0, 4.1, 6.0)).await;

            // The tagging candle wicks to 2.9, then three strong bullish
            // candles march away from the level.
            push(&stack, candle(20, 4.05, 4.5, 2.9, 4.0, 1.0)).await;
            push(&stack, candle(25, 4.0, 6.05, 3.95, 6.0, 4.0)).await;
            push(&stack, candle(30, 6.0, 8.05, 5.95, 8.0, 5.0)).await;
            assert_eq!(
                stack.positions.request_market_skew("^GSPC").await.unwrap(),
                MarketSkew::Neutral
            );

            push(&stack, candle(35, 8.0, 10.05, 7.95, 10.0, 8.0)).await;

            // The level reaction (and the VWAP reaction armed on the same
            // tagging candle) both fired Long entries.
            assert_eq!(
                stack.positions.request_market_skew("^GSPC").await.unwrap(),
                MarketSkew::LongSkewed
            );

            let messages = stack.notifications.0.lock().clone();
            let opened: Vec<&String> =
                messages.iter().filter(|m| m.starts_with("Opened")).collect();
            assert_eq!(opened.len(), 2);
            for message in opened {
                assert!(message.contains("Long ^GSPC @ 10.000"), "{message}");
                assert!(message.contains("stop 0.900"), "{message}");
            }
        }

        #[tokio::test]
        async fn resistance_reversal_exits_long_exposure() {
            let stack = spawn_stack();
            mark_caught_up(&stack).await;

            // An existing long: entered at 10 with a deep stop.
            stack
                .positions
                .send_entry_signal(crate::engine::EntrySignal {
                    market: "^GSPC".to_string(),
                    timeframe: Timeframe::FiveMinute,
                    direction: crate::types::Direction::Long,
                    price: 10.0,
                    reasons: vec![crate::types::SignalReason::ReversalAtSupport],
                    confluence: 8,
                    created_on: ny(4, 0),
                    stop_loss: 1.0,
                    stop_loss_points: 9.0,
                })
                .await
                .unwrap();
            assert_eq!(
                stack.positions.request_market_skew("^GSPC").await.unwrap(),
                MarketSkew::LongSkewed
            );

            // Resistance at 20, classified against a close of 10.
            stack
                .priceaction
                .send_level_signal(Arc::new(Level::new("^GSPC", 20.0, 10.0)));

            // Quiet baseline around 16.
            push(&stack, candle(0, 16.0, 16.2, 15.9, 16.0, 4.0)).await;
            push(&stack, candle(5, 16.0, 16.3, 16.0, 16.1, 4.0)).await;
            push(&stack, candle(10, 16.1, 16.2, 15.95, 16.0, 4.0)).await;
            push(&stack, candle(15, 16.0, 16.25, 16.0, 16.1, 6.0)).await;

            // The tagging candle spikes into 20 and fails; three strong
            // bearish candles follow.
            push(&stack, candle(20, 16.05, 20.1, 15.95, 16.0, 1.0)).await;
            push(&stack, candle(25, 16.0, 16.05, 13.95, 14.0, 4.0)).await;
            push(&stack, candle(30, 14.0, 14.05, 11.95, 12.0, 5.0)).await;
            push(&stack, candle(35, 12.0, 12.05, 9.95, 10.0, 8.0)).await;

            // The long was closed flat by the reversal at resistance; the
            // VWAP reaction that fired right after found a neutral book and
            // opened the short side.
            assert_eq!(
                stack.positions.request_market_skew("^GSPC").await.unwrap(),
                MarketSkew::ShortSkewed
            );

            let persisted = stack.persisted.0.lock().clone();
            assert_eq!(persisted.len(), 1);
            assert_eq!(persisted[0].status, crate::types::PositionStatus::Closed);
            assert!(persisted[0].pnl_percent.abs() < 1e-9);
            assert_eq!(persisted[0].exit_price, Some(10.0));

            let messages = stack.notifications.0.lock().clone();
            assert!(messages
                .iter()
                .any(|m| m.contains("Closed Long ^GSPC @ 10.000")));
            assert!(messages
                .iter()
                .any(|m| m.contains("Opened Short ^GSPC @ 10.000")));
        }

        #[tokio::test]
        async fn reaction_for_unknown_market_is_acked_not_fatal() {
            let stack = spawn_stack();

            // No candles exist for this market: metadata comes back empty
            // and the reaction is dropped, but the ack still arrives.
            let level = Arc::new(Level::new("^XXX", 3.0, 10.0));
            let r = Reaction {
                market: "^XXX".to_string(),
                timeframe: Timeframe::FiveMinute,
                poi: PoiRef::Level(level),
                role: LevelKind::Support,
                movement: Vec::new(),
                kind: ReactionKind::Reversal,
                current_price: 10.0,
                created_on: london_time(),
            };
            let status = stack.engine.publish_reaction(r).await.unwrap();
            assert_eq!(status, WorkStatus::Processed);
        }
    }

    #[test]
    fn stop_loss_sanity_violations() {
        let window = support_reversal_window();

        // Entry outside the window.
        assert!(matches!(
            estimate_stop_loss(Direction::Long, &window, 50.0),
            Err(EngineError::InvalidArgument(_))
        ));

        // Empty window has no coherent range.
        assert!(matches!(
            estimate_stop_loss(Direction::Long, &[], 10.0),
            Err(EngineError::InvalidArgument(_))
        ));

        // A long stop that lands at or below zero is rejected.
        let cheap = vec![meta(CandleKind::Marubozu, Momentum::High, 1.0, false, 2.5, 1.0)];
        assert!(matches!(
            estimate_stop_loss(Direction::Long, &cheap, 2.0),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
