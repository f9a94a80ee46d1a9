use crate::events::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Cancelled,
    Rejected,
    Error,
}

impl OrderStatus {
    /// Terminal orders never go back to an in-flight state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Error
        )
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !(self.is_terminal() && matches!(next, Self::Pending | Self::Submitted))
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// An order tracked by the ledger, keyed by its client order id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    /// Protective levels for the position this order opens. Zero is unset.
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Order {
    #[must_use]
    pub fn new(
        client_order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            symbol: symbol.into(),
            side,
            quantity,
            price,
            status: OrderStatus::Pending,
            created_at,
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            rejection_reason: None,
        }
    }

    #[must_use]
    pub fn with_protection(mut self, stop_loss: Decimal, take_profit: Decimal) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    /// Still waiting on the exchange.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Submitted)
    }
}
