// =============================================================================
// HTTP candle source — JSON REST endpoint
// =============================================================================
//
// Expects the provider to answer
//
//   GET {base}/candles?market=..&timeframe=..&start=..&end=..
//
// with a JSON array of `{open, high, low, close, volume, date}` rows, dates
// in RFC 3339. Rows come back stamped with the requested market and
// timeframe and sorted ascending by date.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::feed::source::CandleSource;
use crate::market_data::Candle;
use crate::types::Timeframe;

/// One candle row as served by the provider.
#[derive(Debug, Deserialize)]
struct CandleRow {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    date: DateTime<Utc>,
}

/// REST client for the external candle-data provider.
#[derive(Clone)]
pub struct HttpCandleSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCandleSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl CandleSource for HttpCandleSource {
    async fn fetch(
        &self,
        market: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/candles", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("market", market),
                ("timeframe", &timeframe.to_string()),
                ("start", &start.to_rfc3339()),
                ("end", &end.to_rfc3339()),
            ])
            .send()
            .await
            .context("GET /candles request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("candle provider returned {status}: {body}");
        }

        let rows: Vec<CandleRow> = resp
            .json()
            .await
            .context("failed to decode candle rows")?;

        debug!(market, %timeframe, rows = rows.len(), "fetched candles");

        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(|row| Candle {
                market: market.to_string(),
                timeframe,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                vwap: 0.0,
                date: row.date,
            })
            .collect();
        candles.sort_by_key(|c| c.date);

        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_rows_decode() {
        let body = r#"[
            {"open": 10.0, "high": 11.5, "low": 9.5, "close": 11.0,
             "volume": 1200.0, "date": "2024-03-04T14:30:00Z"},
            {"open": 11.0, "high": 12.0, "low": 10.5, "close": 11.5,
             "volume": 900.0, "date": "2024-03-04T14:35:00Z"}
        ]"#;

        let rows: Vec<CandleRow> = serde_json::from_str(body).expect("rows should decode");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].close, 11.0);
        assert!(rows[0].date < rows[1].date);
    }
}
