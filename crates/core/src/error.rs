//! Error types for the ledger and the persistence contract.

use rust_decimal::Decimal;
use thiserror::Error;

/// Rejections raised by [`crate::TradingState`] when a mutation would break
/// one of its invariants. A failed call leaves the state untouched.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("position already open for {0}")]
    DuplicatePosition(String),

    #[error("order {0} already exists")]
    DuplicateOrder(String),

    #[error("insufficient cash: required {required}, available {available}")]
    InsufficientCash { required: Decimal, available: Decimal },

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("no open position for {0}")]
    UnknownPosition(String),

    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),

    #[error("order {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: crate::order::OrderStatus,
        to: crate::order::OrderStatus,
    },
}

/// Failures of a [`crate::Store`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("timed out waiting for queued writes to flush")]
    FlushTimeout,

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
