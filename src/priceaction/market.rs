// =============================================================================
// Per-market POI engine — snapshots + tag-to-request state machines
// =============================================================================
//
// One `PriceActionMarket` keeps the level and imbalance snapshots for its
// market plus one tag state machine per POI class (levels, imbalances,
// VWAP):
//
//   Idle        -- tag observed -->  Armed (counter = 0)
//   Armed       -- update       -->  Armed (counter++)          while < K
//   Armed       -- counter == K -->  Requesting
//   Requesting  -- reset        -->  Idle
//
// While Armed or Requesting, new tags do not re-arm; the machine is only
// re-entered after the reset that follows reaction synthesis. K = 3.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::indicators::VwapEntry;
use crate::market_data::{Candle, ImbalanceSnapshot, LevelSnapshot};
use crate::poi::{Imbalance, Level, LevelKind};
use crate::types::Timeframe;

/// Updates between a tag observation and the data request.
pub const TAG_DEBOUNCE_UPDATES: u32 = 3;

/// Tracked levels per market.
const LEVEL_SNAPSHOT_SIZE: usize = 32;
/// Tracked imbalances per market.
const IMBALANCE_SNAPSHOT_SIZE: usize = 32;
/// Candles kept for fair-value-gap detection.
const FVG_WINDOW: usize = 3;

// -----------------------------------------------------------------------------
// Tag state machine
// -----------------------------------------------------------------------------

/// One tag-to-request state machine, generic over the POI snapshot captured
/// at tag time.
pub struct PoiTracker<T> {
    tagged: AtomicBool,
    update_counter: AtomicU32,
    requesting: AtomicBool,
    pending: Mutex<Vec<T>>,
}

impl<T> PoiTracker<T> {
    pub fn new() -> Self {
        Self {
            tagged: AtomicBool::new(false),
            update_counter: AtomicU32::new(0),
            requesting: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Count one update while Armed; flips to Requesting on the K-th.
    pub fn advance(&self) {
        if !self.tagged.load(Ordering::Acquire) || self.requesting.load(Ordering::Acquire) {
            return;
        }
        let counter = self.update_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if counter >= TAG_DEBOUNCE_UPDATES {
            self.requesting.store(true, Ordering::Release);
        }
    }

    /// Arm on a tag observation when Idle. Armed/Requesting machines ignore
    /// new tags. Returns whether the machine armed.
    pub fn observe(&self, pois: Vec<T>) -> bool {
        if pois.is_empty()
            || self.tagged.load(Ordering::Acquire)
            || self.requesting.load(Ordering::Acquire)
        {
            return false;
        }
        *self.pending.lock() = pois;
        self.update_counter.store(0, Ordering::Release);
        self.tagged.store(true, Ordering::Release);
        true
    }

    pub fn tagged(&self) -> bool {
        self.tagged.load(Ordering::Acquire)
    }

    pub fn requesting(&self) -> bool {
        self.requesting.load(Ordering::Acquire)
    }

    pub fn update_counter(&self) -> u32 {
        self.update_counter.load(Ordering::Acquire)
    }

    /// Drain the POIs captured when the machine armed.
    pub fn take_pending(&self) -> Vec<T> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Back to Idle: all flags cleared, pending dropped.
    pub fn reset(&self) {
        self.tagged.store(false, Ordering::Release);
        self.requesting.store(false, Ordering::Release);
        self.update_counter.store(0, Ordering::Release);
        self.pending.lock().clear();
    }
}

impl<T> Default for PoiTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A VWAP observation captured at tag time, with the side it defended.
#[derive(Debug, Clone)]
pub struct VwapPoi {
    pub entry: VwapEntry,
    pub role: LevelKind,
}

// -----------------------------------------------------------------------------
// Per-market state
// -----------------------------------------------------------------------------

/// POI bookkeeping for one market.
pub struct PriceActionMarket {
    name: String,
    timeframe: Timeframe,
    levels: LevelSnapshot,
    imbalances: ImbalanceSnapshot,
    recent: Mutex<VecDeque<Candle>>,
    pub level_state: PoiTracker<Arc<Level>>,
    pub imbalance_state: PoiTracker<Arc<Imbalance>>,
    pub vwap_state: PoiTracker<VwapPoi>,
    caught_up: AtomicBool,
}

impl PriceActionMarket {
    pub fn new(name: impl Into<String>, timeframe: Timeframe) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            timeframe,
            levels: LevelSnapshot::new(LEVEL_SNAPSHOT_SIZE)?,
            imbalances: ImbalanceSnapshot::new(IMBALANCE_SNAPSHOT_SIZE)?,
            recent: Mutex::new(VecDeque::with_capacity(FVG_WINDOW)),
            level_state: PoiTracker::new(),
            imbalance_state: PoiTracker::new(),
            vwap_state: PoiTracker::new(),
            caught_up: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Track a level published by the market context.
    pub fn add_level(&self, level: Arc<Level>) {
        self.levels.add(level);
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn imbalance_count(&self) -> usize {
        self.imbalances.len()
    }

    /// Fold one candle into every POI and detect a fresh fair-value gap from
    /// the trailing three candles.
    pub fn apply_candle(&self, candle: &Candle) {
        self.levels.update(candle);
        self.imbalances.update(candle);

        let mut recent = self.recent.lock();
        recent.push_back(candle.clone());
        while recent.len() > FVG_WINDOW {
            recent.pop_front();
        }
        if recent.len() == FVG_WINDOW {
            if let Some(imbalance) = Imbalance::detect(&recent[0], &recent[1], &recent[2]) {
                self.imbalances.add(Arc::new(imbalance));
            }
        }
    }

    /// Levels tagged by `candle`.
    pub fn tagged_levels(&self, candle: &Candle) -> Vec<Arc<Level>> {
        self.levels.tagged_by(candle)
    }

    /// Imbalances tagged by `candle`.
    pub fn tagged_imbalances(&self, candle: &Candle) -> Vec<Arc<Imbalance>> {
        self.imbalances.tagged_by(candle)
    }

    pub fn set_caught_up(&self, caught_up: bool) {
        self.caught_up.store(caught_up, Ordering::Release);
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }
}
