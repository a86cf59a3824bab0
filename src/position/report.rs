// =============================================================================
// Backtest position reports — one CSV per market
// =============================================================================
//
// File name: "{market}-positions@{RFC3339 now}.csv". Numeric fields render
// to three decimals; a missing exit price / exit reasons / closed-on cell
// renders as "–".
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::position::Position;
use crate::types::format_reasons;

/// Placeholder for cells a still-open position cannot fill.
const EMPTY_CELL: &str = "–";

const HEADER: [&str; 14] = [
    "id",
    "market",
    "timeframe",
    "direction",
    "stoploss",
    "stoplosspointsrange",
    "pnlpercent",
    "entryprice",
    "entryreasons",
    "exitprice",
    "exitreasons",
    "status",
    "createdon",
    "closedon",
];

fn fmt3(value: f64) -> String {
    format!("{value:.3}")
}

/// Write `positions` for `market` into `dir`. Returns the report path.
pub fn write_market_report(
    dir: &Path,
    market: &str,
    positions: &[Position],
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let path = dir.join(format!("{market}-positions@{}.csv", now.to_rfc3339()));
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("failed to create report {}", path.display()))?;

    writer.write_record(HEADER)?;

    for position in positions {
        let exit_price = position
            .exit_price
            .map(fmt3)
            .unwrap_or_else(|| EMPTY_CELL.to_string());
        let exit_reasons = if position.exit_reasons.is_empty() {
            EMPTY_CELL.to_string()
        } else {
            format_reasons(&position.exit_reasons)
        };
        let closed_on = position
            .closed_on
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| EMPTY_CELL.to_string());

        writer.write_record([
            position.id.clone(),
            position.market.clone(),
            position.timeframe.to_string(),
            position.direction.to_string(),
            fmt3(position.stop_loss),
            fmt3(position.stop_loss_points),
            fmt3(position.pnl_percent),
            fmt3(position.entry_price),
            format_reasons(&position.entry_reasons),
            exit_price,
            exit_reasons,
            position.status.to_string(),
            position.created_on.to_rfc3339(),
            closed_on,
        ])?;
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush report {}", path.display()))?;
    Ok(path)
}
