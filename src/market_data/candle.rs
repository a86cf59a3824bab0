// =============================================================================
// OHLCV candle and per-candle metadata
// =============================================================================
//
// Metadata is derived from a candle *and its predecessor*:
//
//   kind      — body/range classification (Marubozu, Pinbar, Doji, Spinning top)
//   sentiment — close vs open
//   momentum  — close-to-close % change combined with body/range ratio
//   engulfing — body strictly contains the previous body, opposite sentiment
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CandleKind, Momentum, Sentiment, Timeframe};

/// Body ratio at or above which a candle counts as a Marubozu.
const MARUBOZU_BODY_RATIO: f64 = 0.8;
/// Body ratio at or below which a candle counts as a Doji.
const DOJI_BODY_RATIO: f64 = 0.1;
/// Wick ratio at or above which a candle counts as a Pinbar.
const PINBAR_WICK_RATIO: f64 = 0.66;

/// Close-to-close % change at or above which momentum is High (with a
/// substantial body), and at or above which it is at least Medium.
const MOMENTUM_HIGH_PCT: f64 = 0.5;
const MOMENTUM_MEDIUM_PCT: f64 = 0.2;
/// Body ratio required alongside the % change for High momentum.
const MOMENTUM_HIGH_BODY_RATIO: f64 = 0.6;

/// A single fixed-interval OHLCV candle.
///
/// Immutable once published; `vwap` is stamped by the market context just
/// before the candle enters the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub market: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub vwap: f64,
    pub date: DateTime<Utc>,
}

impl Candle {
    /// Absolute body size.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Total high-to-low range.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Typical price used by the VWAP accumulator.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Close vs open.
    pub fn sentiment(&self) -> Sentiment {
        if self.close > self.open {
            Sentiment::Bullish
        } else if self.close < self.open {
            Sentiment::Bearish
        } else {
            Sentiment::Neutral
        }
    }

    /// Body/wick classification.
    pub fn kind(&self) -> CandleKind {
        let range = self.range();
        if range <= f64::EPSILON {
            return CandleKind::Doji;
        }

        let body_ratio = self.body() / range;
        if body_ratio >= MARUBOZU_BODY_RATIO {
            return CandleKind::Marubozu;
        }
        if body_ratio <= DOJI_BODY_RATIO {
            return CandleKind::Doji;
        }

        let upper_wick = self.high - self.open.max(self.close);
        let lower_wick = self.open.min(self.close) - self.low;
        if upper_wick.max(lower_wick) / range >= PINBAR_WICK_RATIO {
            return CandleKind::Pinbar;
        }

        CandleKind::SpinningTop
    }

    /// Momentum bucket relative to the previous candle's close.
    pub fn momentum(&self, previous: &Candle) -> Momentum {
        if previous.close.abs() <= f64::EPSILON {
            return Momentum::Low;
        }

        let change_pct = ((self.close - previous.close) / previous.close).abs() * 100.0;
        let range = self.range();
        let body_ratio = if range > f64::EPSILON {
            self.body() / range
        } else {
            0.0
        };

        if change_pct >= MOMENTUM_HIGH_PCT && body_ratio >= MOMENTUM_HIGH_BODY_RATIO {
            Momentum::High
        } else if change_pct >= MOMENTUM_MEDIUM_PCT {
            Momentum::Medium
        } else {
            Momentum::Low
        }
    }

    /// Whether this candle's body strictly contains the previous candle's
    /// body with opposite sentiment.
    pub fn engulfs(&self, previous: &Candle) -> bool {
        let sentiment = self.sentiment();
        let prev_sentiment = previous.sentiment();
        if sentiment == Sentiment::Neutral || prev_sentiment == Sentiment::Neutral {
            return false;
        }
        if sentiment == prev_sentiment {
            return false;
        }

        let body_high = self.open.max(self.close);
        let body_low = self.open.min(self.close);
        let prev_high = previous.open.max(previous.close);
        let prev_low = previous.open.min(previous.close);

        body_high > prev_high && body_low < prev_low
    }
}

/// Derived description of a candle, computed against its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleMetadata {
    pub kind: CandleKind,
    pub sentiment: Sentiment,
    pub momentum: Momentum,
    pub volume: f64,
    pub engulfing: bool,
    pub high: f64,
    pub low: f64,
    pub date: DateTime<Utc>,
}

impl CandleMetadata {
    /// Derive metadata for `candle` using `previous` as the baseline.
    pub fn derive(candle: &Candle, previous: &Candle) -> Self {
        Self {
            kind: candle.kind(),
            sentiment: candle.sentiment(),
            momentum: candle.momentum(previous),
            volume: candle.volume,
            engulfing: candle.engulfs(previous),
            high: candle.high,
            low: candle.low,
            date: candle.date,
        }
    }

    /// Derive metadata for every candle after the first in `candles`. The
    /// first candle serves as predecessor baseline only.
    pub fn derive_series(candles: &[Candle]) -> Vec<Self> {
        candles
            .windows(2)
            .map(|pair| Self::derive(&pair[1], &pair[0]))
            .collect()
    }
}
