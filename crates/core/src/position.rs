use crate::events::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An open position. At most one exists per symbol in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Collateral locked for this position; returned to cash on close.
    pub margin: Decimal,
    /// Taker fee already paid in cash when the position opened.
    #[serde(default)]
    pub entry_fee: Decimal,
    pub unrealized_pnl: Decimal,
    /// Client order id of the entry order.
    pub position_id: Option<String>,
}

impl Position {
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Directional price delta times quantity, before fees.
    #[must_use]
    pub fn gross_pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            Side::Buy => (price - self.entry_price) * self.quantity,
            Side::Sell => (self.entry_price - price) * self.quantity,
        }
    }

    pub fn update_pnl(&mut self, price: Decimal) {
        self.unrealized_pnl = self.gross_pnl_at(price);
    }

    /// Unset (non-positive) stops never trigger.
    #[must_use]
    pub fn stop_loss_hit(&self, price: Decimal) -> bool {
        if self.stop_loss <= Decimal::ZERO {
            return false;
        }
        match self.side {
            Side::Buy => price <= self.stop_loss,
            Side::Sell => price >= self.stop_loss,
        }
    }

    #[must_use]
    pub fn take_profit_hit(&self, price: Decimal) -> bool {
        if self.take_profit <= Decimal::ZERO {
            return false;
        }
        match self.side {
            Side::Buy => price >= self.take_profit,
            Side::Sell => price <= self.take_profit,
        }
    }
}
