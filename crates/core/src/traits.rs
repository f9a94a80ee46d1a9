use crate::events::{FillEvent, MarketEvent, PositionUpdateEvent, SignalEvent};
use anyhow::Result;
use async_trait::async_trait;

/// Source of market ticks, e.g. a live poller or a historical replay.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// `Ok(None)` once the source is exhausted.
    async fn next_event(&mut self) -> Result<Option<MarketEvent>>;
}

/// Signal-generation contract implemented by every strategy.
///
/// A tick that produces nothing returns an empty vector; errors are reserved
/// for genuine failures and are isolated by the dispatcher.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn generate_signals(&mut self, event: &MarketEvent) -> Result<Vec<SignalEvent>>;

    async fn on_fill(&mut self, _fill: &FillEvent) -> Result<()> {
        Ok(())
    }

    async fn on_position_update(&mut self, _update: &PositionUpdateEvent) -> Result<()> {
        Ok(())
    }
}
