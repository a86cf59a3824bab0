// =============================================================================
// Shared types used across the Vantage entry engine
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Candle aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    FiveMinute,
    OneHour,
    OneDay,
}

impl Timeframe {
    /// Wall-clock span covered by one candle of this timeframe.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Self::FiveMinute => chrono::Duration::minutes(5),
            Self::OneHour => chrono::Duration::hours(1),
            Self::OneDay => chrono::Duration::days(1),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FiveMinute => write!(f, "5m"),
            Self::OneHour => write!(f, "1h"),
            Self::OneDay => write!(f, "1d"),
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "5m" => Ok(Self::FiveMinute),
            "1h" => Ok(Self::OneHour),
            "1d" => Ok(Self::OneDay),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// The opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
        }
    }
}

/// Candle (or reaction) sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "Bullish"),
            Self::Bearish => write!(f, "Bearish"),
            Self::Neutral => write!(f, "Neutral"),
        }
    }
}

/// Close-to-close momentum bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Momentum {
    High,
    Medium,
    Low,
}

impl Momentum {
    /// Whether this bucket counts toward structure/engulfing confluence.
    pub fn is_substantial(&self) -> bool {
        matches!(self, Self::High | Self::Medium)
    }
}

/// Candlestick body/wick classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleKind {
    Marubozu,
    Pinbar,
    Doji,
    SpinningTop,
}

/// Directional commitment of a market's open positions.
///
/// Transitions are monotone: `Neutral -> LongSkewed/ShortSkewed` on the first
/// entry, back to `Neutral` only when the last open position closes. The enum
/// value is stored in an `AtomicU32`, hence the explicit discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MarketSkew {
    Neutral = 0,
    LongSkewed = 1,
    ShortSkewed = 2,
}

impl MarketSkew {
    /// Decode from the atomic representation.
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::LongSkewed,
            2 => Self::ShortSkewed,
            _ => Self::Neutral,
        }
    }

    /// The skew adopted when a position in `direction` opens from neutral.
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::LongSkewed,
            Direction::Short => Self::ShortSkewed,
        }
    }

    /// Whether a new entry in `direction` is compatible with this skew.
    pub fn allows(&self, direction: Direction) -> bool {
        match self {
            Self::Neutral => true,
            Self::LongSkewed => direction == Direction::Long,
            Self::ShortSkewed => direction == Direction::Short,
        }
    }
}

impl std::fmt::Display for MarketSkew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Neutral => write!(f, "Neutral"),
            Self::LongSkewed => write!(f, "LongSkewed"),
            Self::ShortSkewed => write!(f, "ShortSkewed"),
        }
    }
}

/// Position of a close relative to a point of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceMovement {
    Above,
    Below,
    Equal,
}

/// Outcome of a price interaction with a point of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionKind {
    Reversal,
    Break,
    Chop,
}

impl std::fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reversal => write!(f, "Reversal"),
            Self::Break => write!(f, "Break"),
            Self::Chop => write!(f, "Chop"),
        }
    }
}

/// Lifecycle state of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    StoppedOut,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::StoppedOut => write!(f, "StoppedOut"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Independent pieces of evidence an entry/exit signal can cite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalReason {
    ReversalAtSupport,
    ReversalAtResistance,
    BreakAboveResistance,
    BreakBelowSupport,
    HighVolumeSession,
    StrongMove,
    StrongVolume,
    BullishEngulfing,
    BearishEngulfing,
}

impl std::fmt::Display for SignalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReversalAtSupport => "ReversalAtSupport",
            Self::ReversalAtResistance => "ReversalAtResistance",
            Self::BreakAboveResistance => "BreakAboveResistance",
            Self::BreakBelowSupport => "BreakBelowSupport",
            Self::HighVolumeSession => "HighVolumeSession",
            Self::StrongMove => "StrongMove",
            Self::StrongVolume => "StrongVolume",
            Self::BullishEngulfing => "BullishEngulfing",
            Self::BearishEngulfing => "BearishEngulfing",
        };
        write!(f, "{name}")
    }
}

/// Render a reason list for notifications and CSV reports.
pub fn format_reasons(reasons: &[SignalReason]) -> String {
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Terminal status a worker writes to a message's status-ack once the unit of
/// work has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Processed,
}

/// Single-shot acknowledgement channel carried beside every candle, reaction
/// and signal message.
pub type StatusAck = oneshot::Sender<WorkStatus>;

/// Fire a status-ack, tolerating a sender that stopped waiting.
pub fn ack_processed(ack: StatusAck) {
    let _ = ack.send(WorkStatus::Processed);
}
