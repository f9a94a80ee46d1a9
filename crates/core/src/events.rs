//! Typed events carried by the pipeline bus.
//!
//! Every event carries an [`EventMeta`] (identity, creation time, provenance).
//! Events are plain values: once published they are moved into the queue and
//! handlers only ever see `&Event`, so nothing downstream can mutate them.

use crate::clock::Clock;
use crate::order::OrderStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Trade direction. `Buy` opens a long, `Sell` opens a short.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    #[must_use]
    pub const fn is_long(self) -> bool {
        matches!(self, Self::Buy)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity, timestamp and provenance shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl EventMeta {
    /// Builds metadata from caller-supplied identity, for deterministic events.
    #[must_use]
    pub fn new(event_id: Uuid, timestamp: DateTime<Utc>, source: impl Into<String>) -> Self {
        Self {
            event_id,
            timestamp,
            source: source.into(),
        }
    }

    /// Stamps a fresh random id and the clock's current time.
    #[must_use]
    pub fn stamp(clock: &dyn Clock, source: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), clock.now(), source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub change_24h_pct: Option<Decimal>,
    /// Raw kline payloads keyed by interval, passed through untouched for strategies.
    #[serde(default)]
    pub klines: Map<String, Value>,
}

impl MarketEvent {
    /// A bare price tick with no book or 24h statistics.
    #[must_use]
    pub fn tick(meta: EventMeta, symbol: impl Into<String>, price: Decimal, volume: Decimal) -> Self {
        Self {
            meta,
            symbol: symbol.into(),
            price,
            volume,
            bid: None,
            ask: None,
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            change_24h_pct: None,
            klines: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub symbol: String,
    pub side: Side,
    pub strategy_name: String,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Strategy confidence in `[0, 1]`.
    pub confidence: f64,
    /// Explicit size; when absent the allocator sizes the trade from risk.
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntentEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub strategy_name: String,
    pub signal_event_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskApprovalEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_intent_id: Uuid,
    pub approved: bool,
    pub reason: String,
    pub adjusted_quantity: Option<Decimal>,
    pub adjusted_stop_loss: Option<Decimal>,
    pub adjusted_take_profit: Option<Decimal>,
    pub original_intent: Option<OrderIntentEvent>,
}

impl RiskApprovalEvent {
    /// Quantity to execute: the risk-adjusted one when present.
    #[must_use]
    pub fn effective_quantity(&self) -> Option<Decimal> {
        self.adjusted_quantity
            .or_else(|| self.original_intent.as_ref().map(|i| i.quantity))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSubmissionEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Client-assigned idempotency key.
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub filled_quantity: Decimal,
    pub filled_price: Decimal,
    pub is_partial: bool,
    pub remaining_quantity: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionUpdateType {
    Opened,
    Closed,
    Modified,
    PartialFill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdateEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub symbol: String,
    pub side: Side,
    /// Remaining size, zero once closed.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub update_type: PositionUpdateType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub reason: String,
    pub triggered_by: String,
    pub severity: Severity,
    pub auto_recovery: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

/// Discriminator used by the dispatcher's handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Market,
    Signal,
    OrderIntent,
    RiskApproval,
    OrderSubmission,
    Fill,
    PositionUpdate,
    KillSwitch,
    SystemHealth,
}

impl EventKind {
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Market => "MarketEvent",
            Self::Signal => "SignalEvent",
            Self::OrderIntent => "OrderIntentEvent",
            Self::RiskApproval => "RiskApprovalEvent",
            Self::OrderSubmission => "OrderSubmissionEvent",
            Self::Fill => "FillEvent",
            Self::PositionUpdate => "PositionUpdateEvent",
            Self::KillSwitch => "KillSwitchEvent",
            Self::SystemHealth => "SystemHealthEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Any event that can travel on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    #[serde(rename = "MarketEvent")]
    Market(MarketEvent),
    #[serde(rename = "SignalEvent")]
    Signal(SignalEvent),
    #[serde(rename = "OrderIntentEvent")]
    OrderIntent(OrderIntentEvent),
    #[serde(rename = "RiskApprovalEvent")]
    RiskApproval(RiskApprovalEvent),
    #[serde(rename = "OrderSubmissionEvent")]
    OrderSubmission(OrderSubmissionEvent),
    #[serde(rename = "FillEvent")]
    Fill(FillEvent),
    #[serde(rename = "PositionUpdateEvent")]
    PositionUpdate(PositionUpdateEvent),
    #[serde(rename = "KillSwitchEvent")]
    KillSwitch(KillSwitchEvent),
    #[serde(rename = "SystemHealthEvent")]
    SystemHealth(SystemHealthEvent),
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Market(_) => EventKind::Market,
            Self::Signal(_) => EventKind::Signal,
            Self::OrderIntent(_) => EventKind::OrderIntent,
            Self::RiskApproval(_) => EventKind::RiskApproval,
            Self::OrderSubmission(_) => EventKind::OrderSubmission,
            Self::Fill(_) => EventKind::Fill,
            Self::PositionUpdate(_) => EventKind::PositionUpdate,
            Self::KillSwitch(_) => EventKind::KillSwitch,
            Self::SystemHealth(_) => EventKind::SystemHealth,
        }
    }

    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::Market(e) => &e.meta,
            Self::Signal(e) => &e.meta,
            Self::OrderIntent(e) => &e.meta,
            Self::RiskApproval(e) => &e.meta,
            Self::OrderSubmission(e) => &e.meta,
            Self::Fill(e) => &e.meta,
            Self::PositionUpdate(e) => &e.meta,
            Self::KillSwitch(e) => &e.meta,
            Self::SystemHealth(e) => &e.meta,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.meta().event_id
    }

    /// Stable dictionary form for logging, persistence and UI push.
    ///
    /// Always contains `event_id`, `timestamp`, `source` and `event_type`
    /// alongside the variant's own fields.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            let mut fallback = Map::new();
            fallback.insert("event_id".into(), Value::String(self.id().to_string()));
            fallback.insert(
                "timestamp".into(),
                Value::String(self.meta().timestamp.to_rfc3339()),
            );
            fallback.insert("source".into(), Value::String(self.meta().source.clone()));
            fallback.insert("event_type".into(), Value::String(self.kind().to_string()));
            fallback.insert("serialization_error".into(), Value::String(e.to_string()));
            Value::Object(fallback)
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id().simple().to_string();
        write!(
            f,
            "{}(id={}, source={}, time={})",
            self.kind(),
            &id[..8],
            self.meta().source,
            self.meta().timestamp.to_rfc3339()
        )
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Event {
                fn from(event: $ty) -> Self {
                    Self::$variant(event)
                }
            }
        )+
    };
}

impl_from_variant! {
    Market => MarketEvent,
    Signal => SignalEvent,
    OrderIntent => OrderIntentEvent,
    RiskApproval => RiskApprovalEvent,
    OrderSubmission => OrderSubmissionEvent,
    Fill => FillEvent,
    PositionUpdate => PositionUpdateEvent,
    KillSwitch => KillSwitchEvent,
    SystemHealth => SystemHealthEvent,
}
