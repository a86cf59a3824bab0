// =============================================================================
// Indicators
// =============================================================================
//
// Pure computations layered on the candle stream. The engine's single
// first-class indicator is the session-cumulative VWAP.

pub mod vwap;

pub use vwap::{VwapEntry, VwapGenerator};
