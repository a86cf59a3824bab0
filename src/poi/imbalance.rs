// =============================================================================
// Fair-value imbalances (three-candle gaps)
// =============================================================================
//
// A bullish imbalance is the untraded band between the first candle's high
// and the third candle's low when price gaps up; a bearish imbalance mirrors
// it on the way down. Price trading back *into* the band tags the imbalance;
// price trading through the far side of the band fills it, which
// invalidates the imbalance for good.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use crate::market_data::Candle;
use crate::types::Sentiment;

/// An untraded price band left behind by a three-candle displacement.
#[derive(Debug)]
pub struct Imbalance {
    pub market: String,
    /// Upper bound of the band.
    pub high: f64,
    /// Lower bound of the band.
    pub low: f64,
    pub sentiment: Sentiment,
    invalidated: AtomicBool,
}

impl Imbalance {
    pub fn new(market: impl Into<String>, high: f64, low: f64, sentiment: Sentiment) -> Self {
        Self {
            market: market.into(),
            high,
            low,
            sentiment,
            invalidated: AtomicBool::new(false),
        }
    }

    /// Detect a fair-value gap across three consecutive candles: bullish
    /// when the first high never meets the third low, bearish when the first
    /// low never meets the third high.
    pub fn detect(first: &Candle, _middle: &Candle, third: &Candle) -> Option<Self> {
        if first.high < third.low {
            return Some(Self::new(
                first.market.clone(),
                third.low,
                first.high,
                Sentiment::Bullish,
            ));
        }
        if first.low > third.high {
            return Some(Self::new(
                first.market.clone(),
                first.low,
                third.high,
                Sentiment::Bearish,
            ));
        }
        None
    }

    /// Midpoint of the band; the reference price for movement sequences.
    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Whether `candle`'s wick reaches back into the band. Invalidated
    /// imbalances never tag.
    pub fn tagged_by(&self, candle: &Candle) -> bool {
        if self.invalidated() {
            return false;
        }
        match self.sentiment {
            Sentiment::Bullish => candle.low <= self.high,
            Sentiment::Bearish => candle.high >= self.low,
            Sentiment::Neutral => false,
        }
    }

    /// Fold one candle into the fill accounting: trading through the far
    /// side of the band invalidates.
    pub fn apply(&self, candle: &Candle) {
        if self.invalidated() {
            return;
        }
        let filled = match self.sentiment {
            Sentiment::Bullish => candle.low <= self.low,
            Sentiment::Bearish => candle.high >= self.high,
            Sentiment::Neutral => false,
        };
        if filled {
            self.invalidated.store(true, Ordering::Release);
        }
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}
