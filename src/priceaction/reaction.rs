// =============================================================================
// Reaction synthesis — movement sequences and their classification
// =============================================================================
//
// A reaction captures how price behaved over the candle window that followed
// a POI tag. The window's closes are reduced to a sequence of
// Above/Below/Equal relative to the POI (the band itself for imbalances,
// with Equal meaning "inside the band"), then classified:
//
//   Reversal — price never crossed, or round-tripped back to the defended
//              side
//   Break    — price worked through the POI and held the far side
//   Chop     — anything indecisive
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::indicators::VwapEntry;
use crate::market_data::Candle;
use crate::poi::{Imbalance, Level, LevelKind};
use crate::types::{PriceMovement, ReactionKind, Sentiment, Timeframe};

/// The point of interest a reaction refers to.
#[derive(Debug, Clone)]
pub enum PoiRef {
    Level(Arc<Level>),
    Imbalance(Arc<Imbalance>),
    Vwap(VwapEntry),
}

impl std::fmt::Display for PoiRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Level(level) => write!(f, "{} level at {}", level.kind, level.price),
            Self::Imbalance(imbalance) => write!(
                f,
                "{} imbalance {}..{}",
                imbalance.sentiment, imbalance.low, imbalance.high
            ),
            Self::Vwap(entry) => write!(f, "vwap at {}", entry.value),
        }
    }
}

/// A classified price interaction with a POI, ready for the engine.
#[derive(Debug, Clone)]
pub struct Reaction {
    pub market: String,
    pub timeframe: Timeframe,
    pub poi: PoiRef,
    /// The side the POI defends in classification and the action table: a
    /// bullish imbalance and a VWAP tagged from above play Support, their
    /// mirrors Resistance.
    pub role: LevelKind,
    pub movement: Vec<PriceMovement>,
    pub kind: ReactionKind,
    pub current_price: f64,
    pub created_on: DateTime<Utc>,
}

impl Reaction {
    /// Synthesize the reaction to a tagged level over `window`.
    pub fn at_level(level: Arc<Level>, window: &[Candle], timeframe: Timeframe) -> Option<Self> {
        let last = window.last()?;
        let movement = movement_vs_price(window, level.price);
        let kind = classify(level.kind, &movement);
        Some(Self {
            market: level.market.clone(),
            timeframe,
            role: level.kind,
            kind,
            movement,
            current_price: last.close,
            created_on: last.date,
            poi: PoiRef::Level(level),
        })
    }

    /// Synthesize the reaction to a tagged imbalance over `window`.
    pub fn at_imbalance(
        imbalance: Arc<Imbalance>,
        window: &[Candle],
        timeframe: Timeframe,
    ) -> Option<Self> {
        let last = window.last()?;
        let role = match imbalance.sentiment {
            Sentiment::Bullish => LevelKind::Support,
            _ => LevelKind::Resistance,
        };
        let movement = movement_vs_band(window, imbalance.low, imbalance.high);
        let kind = classify(role, &movement);
        Some(Self {
            market: imbalance.market.clone(),
            timeframe,
            role,
            kind,
            movement,
            current_price: last.close,
            created_on: last.date,
            poi: PoiRef::Imbalance(imbalance),
        })
    }

    /// Synthesize the reaction to a tagged VWAP value over `window`.
    pub fn at_vwap(
        entry: VwapEntry,
        role: LevelKind,
        window: &[Candle],
        timeframe: Timeframe,
    ) -> Option<Self> {
        let last = window.last()?;
        let movement = movement_vs_price(window, entry.value);
        let kind = classify(role, &movement);
        Some(Self {
            market: entry.market.clone(),
            timeframe,
            role,
            kind,
            movement,
            current_price: last.close,
            created_on: last.date,
            poi: PoiRef::Vwap(entry),
        })
    }
}

/// Reduce each close to its position relative to `price`.
pub fn movement_vs_price(window: &[Candle], price: f64) -> Vec<PriceMovement> {
    window
        .iter()
        .map(|candle| {
            if candle.close > price {
                PriceMovement::Above
            } else if candle.close < price {
                PriceMovement::Below
            } else {
                PriceMovement::Equal
            }
        })
        .collect()
}

/// Reduce each close to its position relative to a band; Equal means the
/// close landed inside it.
pub fn movement_vs_band(window: &[Candle], low: f64, high: f64) -> Vec<PriceMovement> {
    window
        .iter()
        .map(|candle| {
            if candle.close > high {
                PriceMovement::Above
            } else if candle.close < low {
                PriceMovement::Below
            } else {
                PriceMovement::Equal
            }
        })
        .collect()
}

/// Classify a movement sequence against the side the POI defends.
pub fn classify(role: LevelKind, movement: &[PriceMovement]) -> ReactionKind {
    if movement.len() < 2 {
        return ReactionKind::Chop;
    }

    let above = movement
        .iter()
        .filter(|m| **m == PriceMovement::Above)
        .count();
    let below = movement
        .iter()
        .filter(|m| **m == PriceMovement::Below)
        .count();

    let first = movement[0];
    let last_but_one = movement[movement.len() - 2];
    let last = movement[movement.len() - 1];
    let body = &movement[..movement.len() - 1];

    match role {
        LevelKind::Resistance => {
            // Price never took the far side.
            if above == 0 {
                return ReactionKind::Reversal;
            }
            // Worked through and held above.
            if first == PriceMovement::Below
                && last_but_one == PriceMovement::Above
                && last == PriceMovement::Above
            {
                return ReactionKind::Break;
            }
            // Pinned below the whole window, then snapped through.
            if body.iter().all(|m| *m == PriceMovement::Below) && last == PriceMovement::Above {
                return ReactionKind::Break;
            }
            // Poked above but ended back on the defended side.
            if first == PriceMovement::Below && above > 0 && last == PriceMovement::Below {
                return ReactionKind::Reversal;
            }
            ReactionKind::Chop
        }
        LevelKind::Support => {
            if below == 0 {
                return ReactionKind::Reversal;
            }
            if first == PriceMovement::Above
                && last_but_one == PriceMovement::Below
                && last == PriceMovement::Below
            {
                return ReactionKind::Break;
            }
            if body.iter().all(|m| *m == PriceMovement::Above) && last == PriceMovement::Below {
                return ReactionKind::Break;
            }
            if first == PriceMovement::Above && below > 0 && last == PriceMovement::Above {
                return ReactionKind::Reversal;
            }
            ReactionKind::Chop
        }
    }
}
