// =============================================================================
// Candle sources
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::market_data::Candle;
use crate::types::Timeframe;

/// Anything that can serve historical candles for a `[start, end]` window.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch(
        &self,
        market: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>>;
}

/// In-memory source serving pre-recorded candles. Used by backtests and
/// tests; fetches are idempotent and filtered to the requested window.
pub struct ReplaySource {
    candles: Mutex<Vec<Candle>>,
}

impl ReplaySource {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.date);
        Self {
            candles: Mutex::new(candles),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl CandleSource for ReplaySource {
    async fn fetch(
        &self,
        market: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>> {
        Ok(self
            .candles
            .lock()
            .iter()
            .filter(|c| {
                c.market == market
                    && c.timeframe == timeframe
                    && c.date >= start
                    && c.date <= end
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(market: &str, minute: u32) -> Candle {
        Candle {
            market: market.to_string(),
            timeframe: Timeframe::FiveMinute,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 1.0,
            vwap: 0.0,
            date: Utc.with_ymd_and_hms(2024, 3, 4, 14, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn replay_filters_market_and_window() {
        let source = ReplaySource::new(vec![
            candle("^GSPC", 10),
            candle("^GSPC", 0),
            candle("^NDX", 5),
            candle("^GSPC", 20),
        ]);

        let fetched = source
            .fetch(
                "^GSPC",
                Timeframe::FiveMinute,
                Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 4, 14, 15, 0).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(fetched.len(), 2);
        // Sorted ascending regardless of insertion order.
        assert!(fetched[0].date < fetched[1].date);
    }
}
