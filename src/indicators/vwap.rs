// =============================================================================
// Volume-Weighted Average Price — session-cumulative
// =============================================================================
//
// VWAP = Σ (typical price × volume) / Σ volume
//
// Typical price for each candle:
//   TP = (H + L + C) / 3
//
// The accumulators run over the current session's observations and are reset
// on every session change. Zero cumulative volume yields zero, not a
// division error.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::market_data::Candle;
use crate::types::Timeframe;

/// One VWAP observation, stored per candle in the VWAP snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VwapEntry {
    pub market: String,
    pub timeframe: Timeframe,
    pub value: f64,
    pub date: DateTime<Utc>,
}

/// Session-cumulative VWAP generator for one market and timeframe.
#[derive(Debug)]
pub struct VwapGenerator {
    market: String,
    timeframe: Timeframe,
    typical_price_volume: f64,
    cumulative_volume: f64,
}

impl VwapGenerator {
    pub fn new(market: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            market: market.into(),
            timeframe,
            typical_price_volume: 0.0,
            cumulative_volume: 0.0,
        }
    }

    /// Fold one candle into the accumulators and return the updated VWAP.
    ///
    /// Fails with `InvalidArgument` when the candle's timeframe does not
    /// match the generator's.
    pub fn update(&mut self, candle: &Candle) -> Result<f64> {
        if candle.timeframe != self.timeframe {
            return Err(EngineError::InvalidArgument(format!(
                "vwap generator for {} {} received a {} candle",
                self.market, self.timeframe, candle.timeframe
            )));
        }

        self.typical_price_volume += candle.typical_price() * candle.volume;
        self.cumulative_volume += candle.volume;

        Ok(self.value())
    }

    /// Current VWAP; zero while no volume has been observed.
    pub fn value(&self) -> f64 {
        if self.cumulative_volume <= 0.0 {
            return 0.0;
        }
        self.typical_price_volume / self.cumulative_volume
    }

    /// Zero both accumulators. Called on session change.
    pub fn reset(&mut self) {
        self.typical_price_volume = 0.0;
        self.cumulative_volume = 0.0;
    }

    /// Build the snapshot entry for the VWAP observed at `date`.
    pub fn entry_at(&self, date: DateTime<Utc>) -> VwapEntry {
        VwapEntry {
            market: self.market.clone(),
            timeframe: self.timeframe,
            value: self.value(),
            date,
        }
    }
}
