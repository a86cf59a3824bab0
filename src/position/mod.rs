// =============================================================================
// Position domain — lifecycle, P&L, and the per-market skew invariant
// =============================================================================
//
// Life-cycle:
//   Active -> Closed      (exit on the profitable side of the stop)
//   Active -> StoppedOut  (exit at or through the stop)
//
// Skew invariant: a market's skew moves Neutral -> Long/Short when the
// first position opens, stays put while same-side positions accumulate, and
// returns to Neutral only when the last open position closes. A
// contrary-direction position is a `StateViolation` and is never stored.
// =============================================================================

pub mod manager;
pub mod report;

pub use manager::{channels, PositionHandle, PositionManager, PositionManagerConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{EntrySignal, ExitSignal};
use crate::error::{EngineError, Result};
use crate::types::{Direction, MarketSkew, PositionStatus, SignalReason, Timeframe};

/// A single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub market: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub stop_loss: f64,
    pub stop_loss_points: f64,
    pub entry_price: f64,
    pub entry_reasons: Vec<SignalReason>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reasons: Vec<SignalReason>,
    #[serde(default)]
    pub pnl_percent: f64,
    pub status: PositionStatus,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub closed_on: Option<DateTime<Utc>>,
}

impl Position {
    /// Open a position from an entry signal.
    pub fn open(signal: &EntrySignal) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            market: signal.market.clone(),
            timeframe: signal.timeframe,
            direction: signal.direction,
            stop_loss: signal.stop_loss,
            stop_loss_points: signal.stop_loss_points,
            entry_price: signal.price,
            entry_reasons: signal.reasons.clone(),
            exit_price: None,
            exit_reasons: Vec::new(),
            pnl_percent: 0.0,
            status: PositionStatus::Active,
            created_on: signal.created_on,
            closed_on: None,
        }
    }

    /// Whether the position still counts toward the market skew.
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Close at the exit signal's price: compute the signed P&L percentage
    /// and decide between `Closed` and `StoppedOut` by whether the exit
    /// crossed the stop.
    pub fn close(&mut self, signal: &ExitSignal) {
        let entry = self.entry_price;
        self.pnl_percent = if entry.abs() <= f64::EPSILON {
            0.0
        } else {
            match self.direction {
                Direction::Long => (signal.price - entry) / entry * 100.0,
                Direction::Short => (entry - signal.price) / entry * 100.0,
            }
        };

        let stopped_out = match self.direction {
            Direction::Long => signal.price <= self.stop_loss,
            Direction::Short => signal.price >= self.stop_loss,
        };
        self.status = if stopped_out {
            PositionStatus::StoppedOut
        } else {
            PositionStatus::Closed
        };

        self.exit_price = Some(signal.price);
        self.exit_reasons = signal.reasons.clone();
        self.closed_on = Some(signal.created_on);
    }
}

/// Positions and skew for one market.
pub struct PositionMarket {
    name: String,
    positions: RwLock<HashMap<String, Position>>,
    skew: AtomicU32,
}

impl PositionMarket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            positions: RwLock::new(HashMap::new()),
            skew: AtomicU32::new(MarketSkew::Neutral as u32),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn skew(&self) -> MarketSkew {
        MarketSkew::from_u32(self.skew.load(Ordering::Acquire))
    }

    fn set_skew(&self, skew: MarketSkew) {
        self.skew.store(skew as u32, Ordering::Release);
    }

    /// Track a new position and publish the updated skew.
    ///
    /// A neutral market adopts the position's direction; a same-side market
    /// keeps its skew; a contrary-direction position is a `StateViolation`
    /// and nothing is stored. Re-adding a tracked id is a no-op.
    pub fn add_position(&self, position: Position) -> Result<MarketSkew> {
        if position.market != self.name {
            return Err(EngineError::InvalidArgument(format!(
                "position for {} added to market {}",
                position.market, self.name
            )));
        }

        let current = self.skew();
        let updated = if current == MarketSkew::Neutral {
            MarketSkew::for_direction(position.direction)
        } else if current.allows(position.direction) {
            current
        } else {
            return Err(EngineError::StateViolation(format!(
                "{} entry against {} skew on {}",
                position.direction, current, self.name
            )));
        };

        {
            let mut positions = self.positions.write();
            if positions.contains_key(&position.id) {
                return Ok(current);
            }
            positions.insert(position.id.clone(), position);
        }

        self.set_skew(updated);
        Ok(updated)
    }

    /// Close every open position matching the signal's direction and return
    /// the closed set. The skew is recomputed from whatever remains open.
    pub fn close_positions(&self, signal: &ExitSignal) -> Vec<Position> {
        let mut closed = Vec::new();

        {
            let mut positions = self.positions.write();
            for position in positions
                .values_mut()
                .filter(|p| p.is_open() && p.direction == signal.direction)
            {
                position.close(signal);
                closed.push(position.clone());
            }

            // Re-read the open set under the same lock to settle the
            // post-close skew.
            let remaining = positions.values().find(|p| p.is_open()).map(|p| p.direction);
            self.set_skew(match remaining {
                Some(direction) => MarketSkew::for_direction(direction),
                None => MarketSkew::Neutral,
            });
        }

        closed
    }

    /// Delete closed positions whose closure is older than `cutoff`.
    /// Returns how many were removed.
    pub fn purge_closed(&self, cutoff: DateTime<Utc>) -> usize {
        let mut positions = self.positions.write();
        let before = positions.len();
        positions.retain(|_, p| {
            p.is_open() || p.closed_on.map_or(true, |closed_on| closed_on >= cutoff)
        });
        before - positions.len()
    }

    /// Number of open positions.
    pub fn open_count(&self) -> usize {
        self.positions.read().values().filter(|p| p.is_open()).count()
    }

    /// Every tracked position, sorted by creation time.
    pub fn snapshot(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.read().values().cloned().collect();
        all.sort_by_key(|p| p.created_on);
        all
    }
}
