// =============================================================================
// Engine error kinds
// =============================================================================
//
// Worker functions return typed errors; supervisor loops log them with
// context and continue. A `Timeout` drops the unit of work (no retry), a
// `StateViolation` drops the offending signal, a `NotFound` is a programming
// error logged at error level.
// =============================================================================

use thiserror::Error;

/// Typed error for every fallible operation inside the pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A caller supplied an argument that can never be valid (bad snapshot
    /// size, timeframe mismatch, entry/stop sanity violation).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A manager lookup referenced a market that was never configured.
    #[error("not found: {0}")]
    NotFound(String),

    /// A request/response exceeded its bound.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A mutation would break a tracked invariant (e.g. a contrary-direction
    /// position against the current market skew).
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Required data was empty at evaluation time.
    #[error("missing data: {0}")]
    DataMissing(String),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True when the error is a request/response timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_detail() {
        let err = EngineError::InvalidArgument("snapshot size must be positive".into());
        assert_eq!(
            err.to_string(),
            "invalid argument: snapshot size must be positive"
        );

        let err = EngineError::Timeout("average volume response".into());
        assert!(err.is_timeout());
        assert!(err.to_string().contains("average volume response"));
    }
}
