// =============================================================================
// Engine settings — JSON file with environment overrides
// =============================================================================
//
// Every field carries a serde default so loading an older settings file
// never breaks. Environment variables override whatever the file provided:
//
//   VANTAGE_MARKETS          comma-separated market list
//   VANTAGE_TIMEFRAME        candle aggregation timeframe (5m, 1h, 1d)
//   VANTAGE_BACKTEST         "true"/"1" replays recorded candles
//   VANTAGE_REPLAY_DIR       directory of per-market candle recordings
//   VANTAGE_DATA_URL         base URL of the candle provider
//   VANTAGE_DISCORD_WEBHOOK  optional notification webhook
//   VANTAGE_REPORT_DIR       directory backtest CSV reports land in
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Timeframe;

fn default_markets() -> Vec<String> {
    vec![
        "^GSPC".to_string(),
        "^NDX".to_string(),
        "^DJI".to_string(),
    ]
}

fn default_timeframe() -> Timeframe {
    Timeframe::FiveMinute
}

fn default_data_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_report_dir() -> String {
    ".".to_string()
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Markets the pipeline tracks.
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,

    /// The aggregation timeframe every manager operates on.
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,

    /// Backtests replay recorded candles through the same pipeline and dump
    /// CSV reports on shutdown.
    #[serde(default)]
    pub backtest: bool,

    /// Directory of per-market candle recordings (`{market}.csv`) replayed
    /// during backtests.
    #[serde(default)]
    pub replay_dir: Option<String>,

    /// Base URL of the external candle-data provider.
    #[serde(default = "default_data_url")]
    pub data_url: String,

    /// Discord webhook for position notifications; log-only when unset.
    #[serde(default)]
    pub discord_webhook: Option<String>,

    /// Directory backtest CSV reports land in.
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            markets: default_markets(),
            timeframe: default_timeframe(),
            backtest: false,
            replay_dir: None,
            data_url: default_data_url(),
            discord_webhook: None,
            report_dir: default_report_dir(),
        }
    }
}

impl Settings {
    /// Load from `path` when it exists, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Fold `VANTAGE_*` environment variables over the loaded values.
    fn apply_env(&mut self) {
        if let Ok(markets) = std::env::var("VANTAGE_MARKETS") {
            let parsed: Vec<String> = markets
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.markets = parsed;
            }
        }
        if let Ok(timeframe) = std::env::var("VANTAGE_TIMEFRAME") {
            match timeframe.parse() {
                Ok(tf) => self.timeframe = tf,
                Err(err) => warn!(error = %err, "ignoring VANTAGE_TIMEFRAME"),
            }
        }
        if let Ok(backtest) = std::env::var("VANTAGE_BACKTEST") {
            self.backtest = matches!(backtest.as_str(), "true" | "1" | "yes");
        }
        if let Ok(dir) = std::env::var("VANTAGE_REPLAY_DIR") {
            if !dir.is_empty() {
                self.replay_dir = Some(dir);
            }
        }
        if let Ok(url) = std::env::var("VANTAGE_DATA_URL") {
            self.data_url = url;
        }
        if let Ok(webhook) = std::env::var("VANTAGE_DISCORD_WEBHOOK") {
            if !webhook.is_empty() {
                self.discord_webhook = Some(webhook);
            }
        }
        if let Ok(dir) = std::env::var("VANTAGE_REPORT_DIR") {
            self.report_dir = dir;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            anyhow::bail!("at least one market must be configured");
        }
        Ok(())
    }
}
