// =============================================================================
// Market — per-market context
// =============================================================================
//
// One `Market` tracks everything the pipeline knows about a single
// instrument: the rolling candle history, the sessions currently in flight,
// the session-cumulative VWAP, and whether historical catch-up has
// completed. Candle updates for one market are serialized by the manager's
// per-market worker, so `update` never races with itself.
// =============================================================================

pub mod manager;

pub use manager::{channels, MarketHandle, MarketManager, MarketManagerConfig, MarketRequest};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::indicators::{VwapEntry, VwapGenerator};
use crate::market_data::{Candle, CandleSnapshot, SessionSnapshot, VwapSnapshot};
use crate::poi::Level;
use crate::session::{self, Session, SessionName};
use crate::types::Timeframe;

/// One trading day of five-minute candles.
const CANDLE_SNAPSHOT_SIZE: usize = 288;
/// Two days of sessions (three per day).
const SESSION_SNAPSHOT_SIZE: usize = 6;
/// VWAP observations mirror the candle history.
const VWAP_SNAPSHOT_SIZE: usize = 288;

/// Per-market context: candles, sessions, VWAP, catch-up state.
pub struct Market {
    name: String,
    timeframe: Timeframe,
    candles: CandleSnapshot,
    sessions: SessionSnapshot,
    vwap: Mutex<VwapGenerator>,
    vwap_entries: VwapSnapshot,
    /// Identity of the latest-opened session seen by the last update.
    current_session: RwLock<Option<(SessionName, DateTime<Utc>)>>,
    caught_up: AtomicBool,
}

impl Market {
    pub fn new(name: impl Into<String>, timeframe: Timeframe) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            candles: CandleSnapshot::new(CANDLE_SNAPSHOT_SIZE)?,
            sessions: SessionSnapshot::new(SESSION_SNAPSHOT_SIZE)?,
            vwap: Mutex::new(VwapGenerator::new(name.clone(), timeframe)),
            vwap_entries: VwapSnapshot::new(VWAP_SNAPSHOT_SIZE)?,
            current_session: RwLock::new(None),
            caught_up: AtomicBool::new(false),
            name,
            timeframe,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fold one candle into the context. Returns the levels born from any
    /// session that closed with this update, ready for the price-action
    /// manager.
    ///
    /// Candles on a different timeframe than the market's aggregation
    /// timeframe are ignored.
    pub fn update(&self, mut candle: Candle) -> Vec<Arc<Level>> {
        if candle.timeframe != self.timeframe {
            debug!(
                market = %self.name,
                timeframe = %candle.timeframe,
                "ignoring candle on non-aggregation timeframe"
            );
            return Vec::new();
        }

        // Track every session window containing this candle, then roll
        // highs/lows and maturity.
        for window in session::windows_containing(candle.date) {
            if self.sessions.find(window.name, window.open).is_none() {
                self.sessions.add(Arc::new(Session::new(window)));
            }
        }
        self.sessions.update(&candle);

        // Harvest levels from sessions that have closed. Each session
        // publishes at most once, and only when it matured.
        let mut levels = Vec::new();
        for closed in self.sessions.closed_by(candle.date) {
            if closed.claim_level_publication() && closed.matured() {
                if let (Some(high), Some(low)) = (closed.high(), closed.low()) {
                    levels.push(Arc::new(Level::new(self.name.clone(), high, candle.close)));
                    levels.push(Arc::new(Level::new(self.name.clone(), low, candle.close)));
                    debug!(
                        market = %self.name,
                        session = %closed.name,
                        high,
                        low,
                        "session closed, levels published"
                    );
                }
            }
        }

        // VWAP: reset on session change, then fold the candle in and stamp
        // its vwap field before it enters the snapshot.
        let current = session::current_window(candle.date).map(|w| (w.name, w.open));
        {
            let mut vwap = self.vwap.lock();
            let mut held = self.current_session.write();
            if *held != current {
                if held.is_some() {
                    vwap.reset();
                }
                *held = current;
            }

            match vwap.update(&candle) {
                Ok(value) => {
                    candle.vwap = value;
                    self.vwap_entries.add(vwap.entry_at(candle.date));
                }
                Err(err) => {
                    warn!(market = %self.name, error = %err, "vwap update rejected");
                }
            }
        }

        self.candles.add(candle);
        levels
    }

    pub fn set_caught_up(&self, caught_up: bool) {
        self.caught_up.store(caught_up, Ordering::Release);
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Up to `k` most recent candles, oldest first.
    pub fn last_candles(&self, k: usize) -> Vec<Candle> {
        self.candles.last_n(k)
    }

    /// Mean volume of the `n` candles before the most recent.
    pub fn average_volume(&self, n: usize) -> Option<f64> {
        self.candles.average_volume(n)
    }

    /// Up to `k` most recent VWAP observations, oldest first.
    pub fn vwap_data(&self, k: usize) -> Vec<VwapEntry> {
        self.vwap_entries.last_n(k)
    }

    /// The VWAP observation recorded exactly at `at`.
    pub fn vwap_at(&self, at: DateTime<Utc>) -> Option<VwapEntry> {
        self.vwap_entries.at(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn ny(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2024, 3, day, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn candle_at(date: DateTime<Utc>, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            market: "^GSPC".to_string(),
            timeframe: Timeframe::FiveMinute,
            open: close,
            high,
            low,
            close,
            volume,
            vwap: 0.0,
            date,
        }
    }

    #[test]
    fn ignores_foreign_timeframe() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();
        let mut candle = candle_at(ny(4, 9, 0), 11.0, 9.0, 10.0, 1.0);
        candle.timeframe = Timeframe::OneHour;
        market.update(candle);
        assert!(market.last_candles(1).is_empty());
    }

    #[test]
    fn stamps_vwap_into_stored_candle() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();
        // TP = (12 + 6 + 9) / 3 = 9.
        market.update(candle_at(ny(4, 9, 0), 12.0, 6.0, 9.0, 2.0));
        let stored = market.last_candles(1).pop().unwrap();
        assert!((stored.vwap - 9.0).abs() < 1e-9);
        assert!(market.vwap_at(ny(4, 9, 0)).is_some());
    }

    #[test]
    fn session_close_publishes_classified_levels() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();

        // Ride the London session from 03:00, building a 20/10 range.
        let mut levels = Vec::new();
        levels.extend(market.update(candle_at(ny(4, 3, 0), 20.0, 10.0, 15.0, 1.0)));
        levels.extend(market.update(candle_at(ny(4, 5, 0), 18.0, 12.0, 15.0, 1.0)));
        assert!(levels.is_empty());

        // First candle past the London close (11:30) harvests its range.
        let harvested = market.update(candle_at(ny(4, 11, 35), 16.0, 14.0, 15.0, 1.0));
        assert_eq!(harvested.len(), 2);

        let high_level = harvested.iter().find(|l| l.price == 20.0).unwrap();
        let low_level = harvested.iter().find(|l| l.price == 10.0).unwrap();
        assert_eq!(high_level.kind, crate::poi::LevelKind::Resistance);
        assert_eq!(low_level.kind, crate::poi::LevelKind::Support);

        // The session publishes exactly once.
        let again = market.update(candle_at(ny(4, 11, 40), 16.0, 14.0, 15.0, 1.0));
        assert!(again.is_empty());
    }

    #[test]
    fn immature_session_publishes_nothing() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();
        // The only London candle lands inside the session's first hour; the
        // feed then goes quiet until after the close, so the session never
        // matures and its range is discarded.
        market.update(candle_at(ny(4, 3, 30), 20.0, 10.0, 15.0, 1.0));
        let harvested = market.update(candle_at(ny(4, 11, 35), 16.0, 14.0, 15.0, 1.0));
        assert!(harvested.is_empty());
    }

    #[test]
    fn vwap_resets_on_session_change() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();

        // London: TP = 9, volume 2.
        market.update(candle_at(ny(4, 5, 0), 12.0, 6.0, 9.0, 2.0));
        // New York open at 08:00 changes the current session; the
        // accumulators restart with this candle alone: TP = (30+24+27)/3 = 27.
        market.update(candle_at(ny(4, 8, 0), 30.0, 24.0, 27.0, 2.0));

        let stored = market.last_candles(1).pop().unwrap();
        assert!((stored.vwap - 27.0).abs() < 1e-9);
    }

    #[test]
    fn caught_up_flag_round_trips() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();
        assert!(!market.caught_up());
        market.set_caught_up(true);
        assert!(market.caught_up());
    }

    #[test]
    fn average_volume_matches_snapshot_semantics() {
        let market = Market::new("^GSPC", Timeframe::FiveMinute).unwrap();
        for (i, volume) in [2.0, 4.0, 6.0, 8.0, 100.0].iter().enumerate() {
            market.update(candle_at(
                ny(4, 9, i as u32 * 5),
                11.0,
                9.0,
                10.0,
                *volume,
            ));
        }
        assert_eq!(market.average_volume(4), Some(5.0));
    }
}
