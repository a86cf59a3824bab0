// =============================================================================
// Vantage Entry Engine — Main Entry Point
// =============================================================================
//
// Wires the five pipeline stages together:
//
//   Feed -> Market -> PriceAction -> Engine -> Position
//
// Candles fan out from the feed bus to the market and price-action managers
// (in that order); everything downstream is request/response over bounded
// channels. A watch channel flipped by ctrl-c stops every supervisor loop.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod backtest;
mod config;
mod engine;
mod error;
mod feed;
mod indicators;
mod market;
mod market_data;
mod notify;
mod poi;
mod position;
mod priceaction;
mod session;
mod sink;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::engine::Engine;
use crate::feed::{CandleSource, FeedConfig, FeedManager, HttpCandleSource, ReplaySource};
use crate::market::{MarketManager, MarketManagerConfig};
use crate::notify::{DiscordNotifier, LogNotifier, Notifier};
use crate::position::{PositionManager, PositionManagerConfig};
use crate::priceaction::{PriceActionManager, PriceActionManagerConfig};
use crate::sink::{LogSink, PositionSink};

/// Default settings file next to the binary.
const SETTINGS_PATH: &str = "vantage.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load(SETTINGS_PATH).unwrap_or_else(|err| {
        warn!(error = %err, "failed to load settings, using defaults");
        Settings::default()
    });

    info!(
        markets = ?settings.markets,
        timeframe = %settings.timeframe,
        backtest = settings.backtest,
        "Vantage entry engine starting"
    );

    // ── 2. Channels & shutdown ───────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (feed_handle, feed_channels) = feed::channels(64);
    let (market_handle, market_channels) = market::channels(64);
    let (priceaction_handle, priceaction_channels) = priceaction::channels(64);
    let (engine_handle, engine_channels) = engine::channels(64);
    let (position_handle, position_channels) = position::channels(64);

    // ── 3. Market manager ────────────────────────────────────────────────
    let market_manager = MarketManager::new(
        MarketManagerConfig {
            markets: settings.markets.clone(),
            timeframe: settings.timeframe,
            backtest: settings.backtest,
            catch_up: {
                let feed = feed_handle.clone();
                Arc::new(move |signal| feed.send_catch_up_signal(signal))
            },
            signal_level: {
                let priceaction = priceaction_handle.clone();
                Arc::new(move |level| priceaction.send_level_signal(level))
            },
        },
        market_channels,
        shutdown_rx.clone(),
    )?;

    // ── 4. Price action manager ──────────────────────────────────────────
    let priceaction_manager = PriceActionManager::new(
        PriceActionManagerConfig {
            markets: settings.markets.clone(),
            timeframe: settings.timeframe,
        },
        market_handle.clone(),
        engine_handle.clone(),
        priceaction_channels,
        shutdown_rx.clone(),
    )?;

    // ── 5. Engine ────────────────────────────────────────────────────────
    let engine = Engine::new(
        market_handle.clone(),
        priceaction_handle.clone(),
        position_handle.clone(),
        engine_channels,
        shutdown_rx.clone(),
    );

    // ── 6. Position manager ──────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match &settings.discord_webhook {
        Some(webhook) => Arc::new(DiscordNotifier::new(webhook.clone())),
        None => Arc::new(LogNotifier),
    };
    let sink: Arc<dyn PositionSink> = Arc::new(LogSink);

    let position_manager = PositionManager::new(
        PositionManagerConfig {
            markets: settings.markets.clone(),
            backtest: settings.backtest,
            report_dir: PathBuf::from(&settings.report_dir),
        },
        notifier,
        sink,
        position_channels,
        shutdown_rx.clone(),
    );

    // ── 7. Feed manager ──────────────────────────────────────────────────
    let source: Arc<dyn CandleSource> = if settings.backtest {
        // Backtests replay candles pushed through the feed handle.
        Arc::new(ReplaySource::empty())
    } else {
        Arc::new(HttpCandleSource::new(settings.data_url.clone()))
    };

    let feed_manager = FeedManager::new(
        FeedConfig {
            markets: settings.markets.clone(),
            timeframe: settings.timeframe,
            backtest: settings.backtest,
        },
        source,
        vec![market_handle.subscriber(), priceaction_handle.subscriber()],
        feed_channels,
        shutdown_rx,
    );

    // ── 8. Spawn supervisors ─────────────────────────────────────────────
    let supervisors = vec![
        tokio::spawn(feed_manager.run()),
        tokio::spawn(market_manager.run()),
        tokio::spawn(priceaction_manager.run()),
        tokio::spawn(engine.run()),
        tokio::spawn(position_manager.run()),
    ];

    info!("all subsystems running, press ctrl-c to stop");

    // ── 9. Backtest replay, or wait for ctrl-c ───────────────────────────
    let replay = match (settings.backtest, settings.replay_dir.clone()) {
        (true, Some(dir)) => {
            let markets = settings.markets.clone();
            let timeframe = settings.timeframe;
            let feed = feed_handle.clone();
            let subscribers = vec![market_handle.subscriber(), priceaction_handle.subscriber()];
            Some(tokio::spawn(async move {
                backtest::run(Path::new(&dir), &markets, timeframe, feed, subscribers).await;
            }))
        }
        (true, None) => {
            warn!("backtest mode without a replay directory, waiting for pushed candles");
            None
        }
        _ => None,
    };

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    match replay {
        Some(driver) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => warn!("shutdown signal received mid-replay"),
                result = driver => {
                    if let Err(err) = result {
                        warn!(error = %err, "backtest driver panicked");
                    }
                    info!("backtest finished, flushing reports");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            warn!("shutdown signal received, stopping supervisors");
        }
    }
    let _ = shutdown_tx.send(true);

    for supervisor in supervisors {
        let _ = supervisor.await;
    }

    info!("Vantage entry engine shut down complete");
    Ok(())
}
