// =============================================================================
// Backtest driver — replay recorded candles through the live pipeline
// =============================================================================
//
// A backtest is the production pipeline fed from disk: the driver marks
// every market caught-up, replays the recorded candles in date order
// through the feed handle (same bus, same ordering, same acks), then flips
// the shutdown switch so the position manager drains its signal channels
// and writes one CSV report per market.
//
// Recorded candles live in one CSV per market, `{replay_dir}/{market}.csv`,
// with columns `date,open,high,low,close,volume` and RFC 3339 dates.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::feed::{CaughtUpMsg, FeedHandle, Subscriber};
use crate::market_data::Candle;
use crate::types::Timeframe;

/// One recorded candle row.
#[derive(Debug, Deserialize)]
struct CandleRecord {
    date: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Load the recorded candles for one market.
pub fn load_candles(path: &Path, market: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open recording {}", path.display()))?;

    let mut candles = Vec::new();
    for row in reader.deserialize() {
        let record: CandleRecord =
            row.with_context(|| format!("bad candle row in {}", path.display()))?;
        candles.push(Candle {
            market: market.to_string(),
            timeframe,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
            vwap: 0.0,
            date: record.date,
        });
    }
    candles.sort_by_key(|c| c.date);
    Ok(candles)
}

/// Replay every market's recording through the pipeline, then return so the
/// caller can flip shutdown. Markets whose recording is missing are skipped
/// with a warning.
pub async fn run(
    replay_dir: &Path,
    markets: &[String],
    timeframe: Timeframe,
    feed: FeedHandle,
    subscribers: Vec<Subscriber>,
) {
    // Tag evaluation only happens on caught-up markets; a backtest is
    // caught-up by definition.
    for market in markets {
        for subscriber in &subscribers {
            let (ack, ack_rx) = oneshot::channel();
            let msg = CaughtUpMsg {
                market: market.clone(),
                ack,
            };
            if subscriber.caught_up_tx.send(msg).await.is_err() {
                error!(
                    subscriber = subscriber.name,
                    market = %market,
                    "subscriber gone before backtest start"
                );
                return;
            }
            let _ = ack_rx.await;
        }
    }

    // Merge every market's recording into one date-ordered stream.
    let mut candles: Vec<Candle> = Vec::new();
    for market in markets {
        let path = replay_dir.join(format!("{market}.csv"));
        match load_candles(&path, market, timeframe) {
            Ok(mut recorded) => {
                info!(market = %market, candles = recorded.len(), "recording loaded");
                candles.append(&mut recorded);
            }
            Err(err) => {
                warn!(market = %market, error = %err, "skipping market without recording");
            }
        }
    }
    candles.sort_by_key(|c| c.date);

    let total = candles.len();
    for candle in candles {
        if let Err(err) = feed.send_market_update(candle).await {
            warn!(error = %err, "replay candle was not fully processed");
        }
    }

    info!(candles = total, "backtest replay complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_sorts_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("^GSPC.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "date,open,high,low,close,volume").unwrap();
        writeln!(
            file,
            "2024-03-04T14:35:00Z,11.0,12.0,10.5,11.5,3.0"
        )
        .unwrap();
        writeln!(
            file,
            "2024-03-04T14:30:00Z,10.0,11.5,9.5,11.0,2.0"
        )
        .unwrap();

        let candles = load_candles(&path, "^GSPC", Timeframe::FiveMinute).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].date < candles[1].date);
        assert_eq!(candles[0].close, 11.0);
        assert_eq!(candles[1].market, "^GSPC");
        assert_eq!(candles[1].timeframe, Timeframe::FiveMinute);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("^NDX.csv");
        assert!(load_candles(&path, "^NDX", Timeframe::FiveMinute).is_err());
    }
}
