pub mod candle;
pub mod ring;
pub mod snapshots;

// Re-export the core data types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, CandleMetadata};
pub use ring::Ring;
pub use snapshots::{
    CandleSnapshot, ImbalanceSnapshot, LevelSnapshot, SessionSnapshot, VwapSnapshot,
};
