//! Turns approved risk decisions into orders.
//!
//! The client order id is derived from the originating signal, so an
//! approval executed twice maps onto the same [`Order`] and never reaches
//! the exchange a second time.
//!
//! Paper orders fill on the spot. Live orders become positions once the
//! exchange reports an execution, either right after the order is accepted
//! or later through [`OrderExecutor::reconcile_open_orders`] and
//! [`OrderExecutor::apply_fill`].

use cryptobot_core::{
    calculate_required_margin, Event, EventMeta, FillEvent, Order, OrderIntentEvent,
    OrderStatus, OrderSubmissionEvent, Position, PositionUpdateEvent, PositionUpdateType,
    RiskApprovalEvent, Side, StateError, TradingConfig, TradingState,
};
use cryptobot_exchange::{
    retry, ExchangeClient, ExchangeError, InstrumentRules, OrderInfo, OrderRequest, RetryPolicy,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const SOURCE: &str = "OrderExecutor";

/// Where approved orders go.
///
/// Live mode carries its client, so a live executor without an exchange
/// connection cannot be built.
#[derive(Clone)]
pub enum ExecutionMode {
    /// Simulated fills at the intent's entry price. Makes no exchange calls.
    Paper,
    /// Real orders through the exchange client.
    Live(Arc<dyn ExchangeClient>),
}

impl ExecutionMode {
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

/// Events produced by executing one approval.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub submission: OrderSubmissionEvent,
    pub fill: Option<FillEvent>,
    pub position_update: Option<PositionUpdateEvent>,
}

impl ExecutionReport {
    fn submission_only(submission: OrderSubmissionEvent) -> Self {
        Self {
            submission,
            fill: None,
            position_update: None,
        }
    }

    /// Submission first, then fill and position update when present.
    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        let mut events = vec![Event::from(self.submission)];
        events.extend(self.fill.map(Event::from));
        events.extend(self.position_update.map(Event::from));
        events
    }
}

/// Idempotency key for the order placed from `signal_event_id`.
///
/// 36 characters, the longest link id the exchange accepts.
#[must_use]
pub fn client_order_id(signal_event_id: Uuid) -> String {
    format!("ORD-{}", signal_event_id.simple())
}

pub struct OrderExecutor {
    state: Arc<TradingState>,
    mode: ExecutionMode,
    taker_fee: Decimal,
    leverage: u32,
    retry: RetryPolicy,
    instruments: Mutex<HashMap<String, InstrumentRules>>,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(
        state: Arc<TradingState>,
        mode: ExecutionMode,
        trading: &TradingConfig,
        retry: RetryPolicy,
    ) -> Self {
        info!(live = mode.is_live(), "Order executor ready");
        Self {
            state,
            mode,
            taker_fee: trading.taker_fee,
            leverage: trading.leverage,
            retry,
            instruments: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    /// Executes an approved intent.
    ///
    /// Returns `None` for rejected approvals or approvals without their
    /// intent. Re-executing an approval returns the existing order's state
    /// without placing anything.
    pub async fn execute_approved_order(
        &self,
        approval: &RiskApprovalEvent,
    ) -> Option<ExecutionReport> {
        if !approval.approved {
            debug!(intent = %approval.order_intent_id, "Skipping rejected approval");
            return None;
        }
        let Some(intent) = approval.original_intent.as_ref() else {
            warn!(intent = %approval.order_intent_id, "Approval carries no order intent");
            return None;
        };

        let id = client_order_id(intent.signal_event_id);
        if let Some(existing) = self.state.order(&id) {
            info!(
                client_order_id = %id,
                status = %existing.status,
                "Order already exists, not resubmitting"
            );
            return Some(ExecutionReport::submission_only(self.from_order(&existing)));
        }

        let quantity = approval.adjusted_quantity.unwrap_or(intent.quantity);
        let stop_loss = approval.adjusted_stop_loss.unwrap_or(intent.stop_loss);
        let take_profit = approval.adjusted_take_profit.unwrap_or(intent.take_profit);

        // one position or in-flight entry per symbol, checked before any cash
        // or exchange call
        let conflict = if self.state.has_position(&intent.symbol) {
            Some(StateError::DuplicatePosition(intent.symbol.clone()).to_string())
        } else if self.state.has_open_order(&intent.symbol) {
            Some(format!("Order already in flight for {}", intent.symbol))
        } else {
            None
        };

        let order = Order::new(
            id.clone(),
            intent.symbol.clone(),
            intent.side,
            quantity,
            intent.entry_price,
            self.state.clock().now(),
        )
        .with_protection(stop_loss, take_profit);
        if let Err(err) = self.state.add_order(order) {
            // lost a race with a concurrent execution of the same approval
            warn!(client_order_id = %id, error = %err, "Order registered concurrently");
            let existing = self.state.order(&id)?;
            return Some(ExecutionReport::submission_only(self.from_order(&existing)));
        }

        let plan = OrderPlan {
            client_order_id: id,
            intent,
            quantity,
            stop_loss,
            take_profit,
        };
        if let Some(reason) = conflict {
            return Some(self.reject(&plan, OrderStatus::Rejected, reason));
        }
        let report = match &self.mode {
            ExecutionMode::Paper => self.fill_paper(&plan),
            ExecutionMode::Live(client) => self.submit_live(client.as_ref(), &plan).await,
        };
        Some(report)
    }

    fn fill_paper(&self, plan: &OrderPlan<'_>) -> ExecutionReport {
        let intent = plan.intent;
        let price = intent.entry_price;
        let notional = plan.quantity * price;
        let fee = notional * self.taker_fee;
        let margin = calculate_required_margin(notional, self.leverage);

        let position = Position {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: plan.quantity,
            entry_price: price,
            entry_time: self.state.clock().now(),
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            margin,
            entry_fee: fee,
            unrealized_pnl: Decimal::ZERO,
            position_id: Some(plan.client_order_id.clone()),
        };
        if let Err(err) = self.state.open_position(position) {
            let reason = match err {
                StateError::InsufficientCash { required, available } => {
                    format!("Insufficient cash: required {required}, available {available}")
                }
                other => other.to_string(),
            };
            return self.reject(plan, OrderStatus::Rejected, reason);
        }

        let exchange_id = format!("PAPER_{}", plan.client_order_id);
        self.set_status(&plan.client_order_id, OrderStatus::Filled, Some(exchange_id.clone()));
        info!(
            client_order_id = %plan.client_order_id,
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %plan.quantity,
            %price,
            %margin,
            %fee,
            "Paper order filled"
        );

        let submission = self.submission(
            plan,
            plan.quantity,
            OrderStatus::Filled,
            Some(exchange_id.clone()),
            None,
        );
        let fill = FillEvent {
            meta: self.meta(),
            client_order_id: plan.client_order_id.clone(),
            exchange_order_id: Some(exchange_id),
            symbol: intent.symbol.clone(),
            side: intent.side,
            filled_quantity: plan.quantity,
            filled_price: price,
            is_partial: false,
            remaining_quantity: Decimal::ZERO,
            commission: fee,
        };
        let position_update = self.opened(&intent.symbol, intent.side, plan.quantity, price);
        ExecutionReport {
            submission,
            fill: Some(fill),
            position_update: Some(position_update),
        }
    }

    async fn submit_live(&self, client: &dyn ExchangeClient, plan: &OrderPlan<'_>) -> ExecutionReport {
        let intent = plan.intent;
        let rules = match self.instrument_rules(client, &intent.symbol).await {
            Ok(rules) => rules,
            Err(err) => {
                return self.reject(
                    plan,
                    OrderStatus::Error,
                    format!("Failed to load instrument rules: {err}"),
                );
            }
        };

        let quantity = rules.round_quantity(plan.quantity);
        let price = rules.round_price(intent.entry_price);
        if let Some(violation) = rules.quantity_violation(quantity, price) {
            return self.reject(plan, OrderStatus::Rejected, violation);
        }

        self.set_status(&plan.client_order_id, OrderStatus::Submitted, None);
        let request = OrderRequest::market(
            intent.symbol.clone(),
            intent.side,
            quantity,
            plan.client_order_id.clone(),
        )
        .with_protection(rules.round_price(plan.stop_loss), rules.round_price(plan.take_profit));

        let request = &request;
        let (exchange_order_id, known) =
            match retry(&self.retry, "create_order", move || client.create_order(request)).await {
                Ok(ack) => (ack.order_id, None),
                Err(ExchangeError::DuplicateOrder(message)) => {
                    // an attempt that timed out on our side reached the exchange
                    match self.query_order(client, &intent.symbol, &plan.client_order_id).await {
                        Some(info) => {
                            info!(
                                client_order_id = %plan.client_order_id,
                                exchange_order_id = %info.order_id,
                                status = %info.order_status,
                                "Order was already accepted by exchange"
                            );
                            (info.order_id.clone(), Some(info))
                        }
                        None => {
                            return self.reject(
                                plan,
                                OrderStatus::Error,
                                format!("Duplicate order id but order not found: {message}"),
                            );
                        }
                    }
                }
                Err(err) => {
                    let status = match err {
                        ExchangeError::InsufficientBalance(_) | ExchangeError::InvalidOrder(_) => {
                            OrderStatus::Rejected
                        }
                        _ => OrderStatus::Error,
                    };
                    return self.reject(plan, status, err.to_string());
                }
            };

        info!(
            client_order_id = %plan.client_order_id,
            exchange_order_id = %exchange_order_id,
            symbol = %intent.symbol,
            %quantity,
            "Order accepted by exchange"
        );
        self.set_status(
            &plan.client_order_id,
            OrderStatus::Submitted,
            Some(exchange_order_id.clone()),
        );
        let mut report: ExecutionReport = self
            .submission(plan, quantity, OrderStatus::Submitted, Some(exchange_order_id), None)
            .into();

        let info = match known {
            Some(info) => Some(info),
            None => self.query_order(client, &intent.symbol, &plan.client_order_id).await,
        };
        let fill = info.and_then(|info| {
            let order = self.state.order(&plan.client_order_id)?;
            self.fill_from(&order, &info)
        });
        match fill {
            Some(fill) => {
                report.position_update = self.apply_fill(&fill);
                report.fill = Some(fill);
            }
            None => debug!(
                client_order_id = %plan.client_order_id,
                "No execution reported yet, order stays open"
            ),
        }
        report
    }

    /// Books a reported execution as a position.
    ///
    /// Only orders still open in the ledger are booked; a fill for an order
    /// that is already filled (every paper fill) or unknown returns `None`.
    pub fn apply_fill(&self, fill: &FillEvent) -> Option<PositionUpdateEvent> {
        let Some(order) = self.state.order(&fill.client_order_id) else {
            warn!(client_order_id = %fill.client_order_id, "Fill for unknown order");
            return None;
        };
        if !order.is_open() {
            debug!(
                client_order_id = %fill.client_order_id,
                status = %order.status,
                "Fill already booked"
            );
            return None;
        }
        if fill.filled_quantity <= Decimal::ZERO || fill.filled_price <= Decimal::ZERO {
            warn!(client_order_id = %fill.client_order_id, "Ignoring empty fill");
            return None;
        }
        if fill.is_partial {
            warn!(
                client_order_id = %fill.client_order_id,
                filled = %fill.filled_quantity,
                remaining = %fill.remaining_quantity,
                "Booking partial fill as the whole position"
            );
        }

        let notional = fill.filled_quantity * fill.filled_price;
        let margin = calculate_required_margin(notional, self.leverage);
        let position = Position {
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.filled_quantity,
            entry_price: fill.filled_price,
            entry_time: fill.meta.timestamp,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            margin,
            entry_fee: fill.commission,
            unrealized_pnl: Decimal::ZERO,
            position_id: Some(order.client_order_id.clone()),
        };
        self.set_status(
            &fill.client_order_id,
            OrderStatus::Filled,
            fill.exchange_order_id.clone(),
        );

        match self.state.open_position(position.clone()) {
            Ok(()) => {}
            Err(StateError::InsufficientCash { required, available }) => {
                // the exchange holds the position regardless; track its exposure
                // without locking cash the ledger does not have
                error!(
                    client_order_id = %fill.client_order_id,
                    %required,
                    %available,
                    "Live fill exceeds free cash, booking without margin"
                );
                let unfunded = Position {
                    margin: Decimal::ZERO,
                    entry_fee: Decimal::ZERO,
                    ..position
                };
                if let Err(err) = self.state.add_position(unfunded) {
                    error!(client_order_id = %fill.client_order_id, error = %err, "Failed to book live fill");
                    return None;
                }
            }
            Err(err) => {
                error!(client_order_id = %fill.client_order_id, error = %err, "Failed to book live fill");
                return None;
            }
        }

        info!(
            client_order_id = %fill.client_order_id,
            symbol = %fill.symbol,
            side = %fill.side,
            quantity = %fill.filled_quantity,
            price = %fill.filled_price,
            %margin,
            fee = %fill.commission,
            "Live fill booked"
        );
        Some(self.opened(&fill.symbol, fill.side, fill.filled_quantity, fill.filled_price))
    }

    /// Polls the exchange for every open live order, booking executions and
    /// closing orders the exchange dropped. Returns the fill and position
    /// events to publish.
    pub async fn reconcile_open_orders(&self) -> Vec<Event> {
        let ExecutionMode::Live(client) = &self.mode else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for order in self.state.orders().into_iter().filter(Order::is_open) {
            let Some(info) = self
                .query_order(client.as_ref(), &order.symbol, &order.client_order_id)
                .await
            else {
                continue;
            };
            if let Some(fill) = self.fill_from(&order, &info) {
                let update = self.apply_fill(&fill);
                events.push(Event::from(fill));
                events.extend(update.map(Event::from));
            } else if info.is_closed() {
                let status = if info.order_status == "Rejected" {
                    OrderStatus::Rejected
                } else {
                    OrderStatus::Cancelled
                };
                warn!(
                    client_order_id = %order.client_order_id,
                    exchange_status = %info.order_status,
                    "Order closed by exchange without execution"
                );
                self.fail(
                    &order.client_order_id,
                    status,
                    format!("Exchange reported {}", info.order_status),
                );
            }
        }
        events
    }

    async fn query_order(
        &self,
        client: &dyn ExchangeClient,
        symbol: &str,
        client_order_id: &str,
    ) -> Option<OrderInfo> {
        match retry(&self.retry, "get_order", move || {
            client.get_order(symbol, client_order_id)
        })
        .await
        {
            Ok(info) => info,
            Err(err) => {
                warn!(%client_order_id, error = %err, "Order status query failed");
                None
            }
        }
    }

    fn fill_from(&self, order: &Order, info: &OrderInfo) -> Option<FillEvent> {
        let quantity = info.executed_quantity();
        if quantity <= Decimal::ZERO {
            return None;
        }
        let price = info
            .avg_price
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(order.price);
        let commission = info
            .cum_exec_fee
            .unwrap_or(quantity * price * self.taker_fee);
        Some(FillEvent {
            meta: self.meta(),
            client_order_id: order.client_order_id.clone(),
            exchange_order_id: Some(info.order_id.clone()),
            symbol: order.symbol.clone(),
            side: order.side,
            filled_quantity: quantity,
            filled_price: price,
            is_partial: !info.is_filled(),
            remaining_quantity: (order.quantity - quantity).max(Decimal::ZERO),
            commission,
        })
    }

    async fn instrument_rules(
        &self,
        client: &dyn ExchangeClient,
        symbol: &str,
    ) -> cryptobot_exchange::Result<InstrumentRules> {
        let cached = self.instruments.lock().get(symbol).cloned();
        if let Some(rules) = cached {
            return Ok(rules);
        }
        let rules = retry(&self.retry, "get_instrument", move || client.get_instrument(symbol)).await?;
        self.instruments
            .lock()
            .insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }

    fn reject(&self, plan: &OrderPlan<'_>, status: OrderStatus, reason: String) -> ExecutionReport {
        warn!(
            client_order_id = %plan.client_order_id,
            symbol = %plan.intent.symbol,
            %status,
            reason = %reason,
            "Order not placed"
        );
        self.fail(&plan.client_order_id, status, reason.clone());
        self.submission(plan, plan.quantity, status, None, Some(reason))
            .into()
    }

    fn fail(&self, client_order_id: &str, status: OrderStatus, reason: String) {
        if let Err(err) = self.state.reject_order(client_order_id, status, reason) {
            error!(%client_order_id, error = %err, "Failed to update order status");
        }
    }

    fn set_status(&self, client_order_id: &str, status: OrderStatus, exchange_order_id: Option<String>) {
        if let Err(err) = self
            .state
            .update_order_status(client_order_id, status, exchange_order_id)
        {
            error!(%client_order_id, error = %err, "Failed to update order status");
        }
    }

    fn submission(
        &self,
        plan: &OrderPlan<'_>,
        quantity: Decimal,
        status: OrderStatus,
        exchange_order_id: Option<String>,
        rejection_reason: Option<String>,
    ) -> OrderSubmissionEvent {
        OrderSubmissionEvent {
            meta: self.meta(),
            client_order_id: plan.client_order_id.clone(),
            exchange_order_id,
            symbol: plan.intent.symbol.clone(),
            side: plan.intent.side,
            quantity,
            price: plan.intent.entry_price,
            status,
            rejection_reason,
        }
    }

    fn from_order(&self, order: &Order) -> OrderSubmissionEvent {
        OrderSubmissionEvent {
            meta: self.meta(),
            client_order_id: order.client_order_id.clone(),
            exchange_order_id: order.exchange_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            status: order.status,
            rejection_reason: order.rejection_reason.clone(),
        }
    }

    fn opened(&self, symbol: &str, side: Side, quantity: Decimal, price: Decimal) -> PositionUpdateEvent {
        PositionUpdateEvent {
            meta: self.meta(),
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: price,
            current_price: price,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: None,
            update_type: PositionUpdateType::Opened,
        }
    }

    fn meta(&self) -> EventMeta {
        EventMeta::stamp(self.state.clock().as_ref(), SOURCE)
    }
}

impl From<OrderSubmissionEvent> for ExecutionReport {
    fn from(submission: OrderSubmissionEvent) -> Self {
        Self::submission_only(submission)
    }
}

struct OrderPlan<'a> {
    client_order_id: String,
    intent: &'a OrderIntentEvent,
    quantity: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
}
