//! Stop-loss / take-profit watcher for open positions.

use chrono::{DateTime, Utc};
use cryptobot_core::{
    EventMeta, Position, PositionUpdateEvent, PositionUpdateType, Side, TradingState,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const SOURCE: &str = "PositionMonitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    #[serde(rename = "Stop Loss")]
    StopLoss,
    #[serde(rename = "Take Profit")]
    TakeProfit,
}

impl ExitReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "Stop Loss",
            Self::TakeProfit => "Take Profit",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed position and how it ended.
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub exit_reason: ExitReason,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub update: PositionUpdateEvent,
}

pub struct PositionMonitor {
    state: Arc<TradingState>,
    taker_fee: Decimal,
}

impl PositionMonitor {
    #[must_use]
    pub const fn new(state: Arc<TradingState>, taker_fee: Decimal) -> Self {
        Self { state, taker_fee }
    }

    /// Marks every open position to `prices`, closing those whose stop or
    /// target was crossed. The stop is checked first, so a tick that hits
    /// both always exits as a stop.
    ///
    /// A gap through the stop that loses more than the free cash still
    /// closes; the ledger floors cash at zero.
    pub fn check_positions(&self, prices: &HashMap<String, Decimal>) -> Vec<ExitReport> {
        let mut exits = Vec::new();
        for position in self.state.positions() {
            let Some(&price) = prices.get(&position.symbol) else {
                continue;
            };
            if price <= Decimal::ZERO {
                debug!(symbol = %position.symbol, %price, "Ignoring non-positive price");
                continue;
            }

            let reason = if position.stop_loss_hit(price) {
                Some(ExitReason::StopLoss)
            } else if position.take_profit_hit(price) {
                Some(ExitReason::TakeProfit)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    if let Some(report) = self.close(&position, price, reason) {
                        exits.push(report);
                    }
                }
                None => {
                    if let Err(err) = self.state.update_position_pnl(&position.symbol, price) {
                        debug!(symbol = %position.symbol, error = %err, "Position gone before mark");
                    }
                }
            }
        }
        exits
    }

    /// `(gross, fees)` for exiting `position` at `exit_price`.
    #[must_use]
    pub fn realized_pnl(&self, position: &Position, exit_price: Decimal) -> (Decimal, Decimal) {
        let gross = position.gross_pnl_at(exit_price);
        let fees = (position.entry_price + exit_price) * position.quantity * self.taker_fee;
        (gross, fees)
    }

    fn close(&self, position: &Position, price: Decimal, reason: ExitReason) -> Option<ExitReport> {
        let (gross, fees) = self.realized_pnl(position, price);
        let realized = gross - fees;

        if let Err(err) = self.state.close_position(&position.symbol, realized) {
            error!(
                symbol = %position.symbol,
                %reason,
                error = %err,
                "Position vanished before close"
            );
            return None;
        }

        info!(
            symbol = %position.symbol,
            side = %position.side,
            entry = %position.entry_price,
            exit = %price,
            pnl = %realized,
            %fees,
            %reason,
            "Position closed"
        );

        let meta = EventMeta::stamp(self.state.clock().as_ref(), SOURCE);
        let timestamp = meta.timestamp;
        Some(ExitReport {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price: price,
            quantity: position.quantity,
            realized_pnl: realized,
            fees,
            exit_reason: reason,
            timestamp,
            update: PositionUpdateEvent {
                meta,
                symbol: position.symbol.clone(),
                side: position.side,
                quantity: position.quantity,
                entry_price: position.entry_price,
                current_price: price,
                unrealized_pnl: Decimal::ZERO,
                realized_pnl: Some(realized),
                update_type: PositionUpdateType::Closed,
            },
        })
    }
}
