// =============================================================================
// Position persistence sink
// =============================================================================
//
// Invoked once per closed position. The default sink logs the closure; a
// database-backed sink plugs in behind the same trait.
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use crate::position::Position;
use crate::types::format_reasons;

/// Durable store for closed positions.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn persist_closed_position(&self, position: &Position) -> anyhow::Result<()>;
}

/// Default sink: structured log output only.
pub struct LogSink;

#[async_trait]
impl PositionSink for LogSink {
    async fn persist_closed_position(&self, position: &Position) -> anyhow::Result<()> {
        info!(
            target: "persist",
            id = %position.id,
            market = %position.market,
            direction = %position.direction,
            status = %position.status,
            pnl_percent = position.pnl_percent,
            exit_reasons = %format_reasons(&position.exit_reasons),
            "closed position persisted"
        );
        Ok(())
    }
}
