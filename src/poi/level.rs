// =============================================================================
// Support / resistance levels
// =============================================================================
//
// A level is born when a session closes: the session high and session low,
// each classified relative to the close of the candle observed at creation
// time. A candle *tags* a level by reaching it with a wick; a tagging candle
// that closes beyond the level records a break, otherwise a reversal. A
// level invalidates after its second break and is never tagged again.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// Breaks after which a level stops being a point of interest.
const MAX_BREAKS: u32 = 2;

/// Which side of price the level defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelKind {
    Support,
    Resistance,
}

impl LevelKind {
    /// Classify a level price relative to the current close: at or above the
    /// close it acts as resistance, below as support.
    pub fn classify(price: f64, close: f64) -> Self {
        if price < close {
            Self::Support
        } else {
            Self::Resistance
        }
    }
}

impl std::fmt::Display for LevelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Support => write!(f, "Support"),
            Self::Resistance => write!(f, "Resistance"),
        }
    }
}

/// A horizontal price level tracked per market.
#[derive(Debug)]
pub struct Level {
    pub market: String,
    pub price: f64,
    pub kind: LevelKind,
    reversals: AtomicU32,
    breaks: AtomicU32,
    invalidated: AtomicBool,
}

impl Level {
    /// Create a level at `price`, classified against `close`.
    pub fn new(market: impl Into<String>, price: f64, close: f64) -> Self {
        Self {
            market: market.into(),
            price,
            kind: LevelKind::classify(price, close),
            reversals: AtomicU32::new(0),
            breaks: AtomicU32::new(0),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Whether `candle`'s wick reaches the level. Invalidated levels never
    /// tag.
    pub fn tagged_by(&self, candle: &Candle) -> bool {
        if self.invalidated() {
            return false;
        }
        match self.kind {
            LevelKind::Support => candle.low <= self.price,
            LevelKind::Resistance => candle.high >= self.price,
        }
    }

    /// Fold one candle into the level's reversal/break accounting. Only a
    /// tagging candle counts; a close beyond the level is a break, anything
    /// else a reversal.
    pub fn apply(&self, candle: &Candle) {
        if !self.tagged_by(candle) {
            return;
        }

        let closed_beyond = match self.kind {
            LevelKind::Support => candle.close < self.price,
            LevelKind::Resistance => candle.close > self.price,
        };

        if closed_beyond {
            let breaks = self.breaks.fetch_add(1, Ordering::AcqRel) + 1;
            if breaks >= MAX_BREAKS {
                self.invalidated.store(true, Ordering::Release);
            }
        } else {
            self.reversals.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn reversals(&self) -> u32 {
        self.reversals.load(Ordering::Acquire)
    }

    pub fn breaks(&self) -> u32 {
        self.breaks.load(Ordering::Acquire)
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}
