//! The shared trading ledger.
//!
//! Every mutation of cash, positions and orders goes through [`TradingState`]
//! so the invariants hold at one choke point:
//!
//! * at most one open position per symbol,
//! * cash is never negative (debits fail closed),
//! * client order ids are unique,
//! * `drawdown == peak_equity - equity`, with `peak_equity` only moving up
//!   unless explicitly reset.
//!
//! The ledger is guarded by its own lock and never calls into another
//! component while holding it.

use crate::clock::Clock;
use crate::error::StateError;
use crate::order::{Order, OrderStatus};
use crate::position::Position;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Ledger {
    cash: Decimal,
    equity: Decimal,
    peak_equity: Decimal,
    daily_start_equity: Decimal,
    daily_pnl: Decimal,
    trades_today: u32,
    trading_date: NaiveDate,
    trading_enabled: bool,
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    exposure: HashMap<String, Decimal>,
}

impl Ledger {
    fn recompute_equity(&mut self) {
        let locked: Decimal = self
            .positions
            .values()
            .map(|p| p.margin + p.unrealized_pnl)
            .sum();
        self.equity = self.cash + locked;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.trading_date {
            info!(
                previous = %self.trading_date,
                today = %today,
                daily_pnl = %self.daily_pnl,
                trades = self.trades_today,
                "New trading day, resetting daily counters"
            );
            self.reset_daily(today);
        }
    }

    fn reset_daily(&mut self, today: NaiveDate) {
        self.trading_date = today;
        self.daily_pnl = Decimal::ZERO;
        self.trades_today = 0;
        self.daily_start_equity = self.equity;
    }

    fn drawdown(&self) -> Decimal {
        self.peak_equity - self.equity
    }
}

/// Serializable point-in-time copy of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub trading_date: NaiveDate,
    pub cash: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub daily_start_equity: Decimal,
    pub daily_pnl: Decimal,
    pub trades_today: u32,
    pub trading_enabled: bool,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
}

impl StateSnapshot {
    #[must_use]
    pub fn drawdown(&self) -> Decimal {
        self.peak_equity - self.equity
    }
}

pub struct TradingState {
    clock: Arc<dyn Clock>,
    ledger: Mutex<Ledger>,
}

impl TradingState {
    #[must_use]
    pub fn new(initial_cash: Decimal, clock: Arc<dyn Clock>) -> Self {
        let today = clock.today();
        let cash = initial_cash.max(Decimal::ZERO);
        Self {
            clock,
            ledger: Mutex::new(Ledger {
                cash,
                equity: cash,
                peak_equity: cash,
                daily_start_equity: cash,
                daily_pnl: Decimal::ZERO,
                trades_today: 0,
                trading_date: today,
                trading_enabled: true,
                positions: HashMap::new(),
                orders: HashMap::new(),
                exposure: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> T {
        let mut ledger = self.ledger.lock();
        ledger.roll_day(self.clock.today());
        f(&mut ledger)
    }

    // ----- cash ---------------------------------------------------------

    #[must_use]
    pub fn cash(&self) -> Decimal {
        self.ledger.lock().cash
    }

    /// Removes `amount` from cash, returning the new balance. Fails closed:
    /// when cash is insufficient nothing is changed.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for negative amounts, `InsufficientCash` when the
    /// debit would drive cash below zero.
    pub fn debit_cash(&self, amount: Decimal) -> Result<Decimal, StateError> {
        if amount < Decimal::ZERO {
            return Err(StateError::InvalidAmount(amount));
        }
        self.with_ledger(|l| {
            if amount > l.cash {
                warn!(required = %amount, available = %l.cash, "Cash debit refused");
                return Err(StateError::InsufficientCash {
                    required: amount,
                    available: l.cash,
                });
            }
            l.cash -= amount;
            l.recompute_equity();
            Ok(l.cash)
        })
    }

    /// # Errors
    ///
    /// `InvalidAmount` for negative amounts.
    pub fn credit_cash(&self, amount: Decimal) -> Result<Decimal, StateError> {
        if amount < Decimal::ZERO {
            return Err(StateError::InvalidAmount(amount));
        }
        self.with_ledger(|l| {
            l.cash += amount;
            l.recompute_equity();
            Ok(l.cash)
        })
    }

    // ----- equity & drawdown -------------------------------------------

    #[must_use]
    pub fn equity(&self) -> Decimal {
        self.ledger.lock().equity
    }

    #[must_use]
    pub fn peak_equity(&self) -> Decimal {
        self.ledger.lock().peak_equity
    }

    #[must_use]
    pub fn drawdown(&self) -> Decimal {
        self.ledger.lock().drawdown()
    }

    /// Drawdown as a percentage of peak equity (5.0 means 5%).
    #[must_use]
    pub fn drawdown_pct(&self) -> Decimal {
        let l = self.ledger.lock();
        if l.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        l.drawdown() / l.peak_equity * Decimal::ONE_HUNDRED
    }

    /// Moves the high-water mark down to current equity.
    pub fn reset_peak_equity(&self) {
        let mut l = self.ledger.lock();
        l.peak_equity = l.equity;
        info!(peak_equity = %l.peak_equity, "Peak equity reset");
    }

    // ----- daily counters ----------------------------------------------

    #[must_use]
    pub fn daily_pnl(&self) -> Decimal {
        self.with_ledger(|l| l.daily_pnl)
    }

    #[must_use]
    pub fn trades_today(&self) -> u32 {
        self.with_ledger(|l| l.trades_today)
    }

    #[must_use]
    pub fn daily_start_equity(&self) -> Decimal {
        self.with_ledger(|l| l.daily_start_equity)
    }

    pub fn reset_daily_stats(&self) {
        let today = self.clock.today();
        self.ledger.lock().reset_daily(today);
    }

    // ----- trading gate -------------------------------------------------

    #[must_use]
    pub fn is_trading_enabled(&self) -> bool {
        self.ledger.lock().trading_enabled
    }

    pub fn set_trading_enabled(&self, enabled: bool) {
        let mut l = self.ledger.lock();
        if l.trading_enabled != enabled {
            info!(enabled, "Trading gate changed");
        }
        l.trading_enabled = enabled;
    }

    // ----- positions ----------------------------------------------------

    /// # Errors
    ///
    /// `DuplicatePosition` if the symbol already has an open position.
    pub fn add_position(&self, position: Position) -> Result<(), StateError> {
        self.with_ledger(|l| {
            if l.positions.contains_key(&position.symbol) {
                return Err(StateError::DuplicatePosition(position.symbol.clone()));
            }
            debug!(
                symbol = %position.symbol,
                side = %position.side,
                quantity = %position.quantity,
                entry = %position.entry_price,
                "Position added"
            );
            l.exposure
                .insert(position.symbol.clone(), position.notional());
            l.positions.insert(position.symbol.clone(), position);
            l.recompute_equity();
            Ok(())
        })
    }

    /// Debits `margin + entry_fee` and books the position in one step.
    /// Nothing changes if either half would fail.
    ///
    /// # Errors
    ///
    /// `DuplicatePosition` or `InsufficientCash`.
    pub fn open_position(&self, position: Position) -> Result<(), StateError> {
        let cost = position.margin + position.entry_fee;
        if cost < Decimal::ZERO {
            return Err(StateError::InvalidAmount(cost));
        }
        self.with_ledger(|l| {
            if l.positions.contains_key(&position.symbol) {
                return Err(StateError::DuplicatePosition(position.symbol.clone()));
            }
            if cost > l.cash {
                warn!(symbol = %position.symbol, required = %cost, available = %l.cash, "Cash debit refused");
                return Err(StateError::InsufficientCash {
                    required: cost,
                    available: l.cash,
                });
            }
            l.cash -= cost;
            debug!(
                symbol = %position.symbol,
                side = %position.side,
                quantity = %position.quantity,
                entry = %position.entry_price,
                margin = %position.margin,
                "Position opened"
            );
            l.exposure
                .insert(position.symbol.clone(), position.notional());
            l.positions.insert(position.symbol.clone(), position);
            l.recompute_equity();
            Ok(())
        })
    }

    /// Removes a position without moving cash, folding `realized_pnl` into
    /// the daily counters.
    ///
    /// # Errors
    ///
    /// `UnknownPosition` if nothing is open for the symbol.
    pub fn remove_position(
        &self,
        symbol: &str,
        realized_pnl: Decimal,
    ) -> Result<Position, StateError> {
        self.with_ledger(|l| {
            let position = l
                .positions
                .remove(symbol)
                .ok_or_else(|| StateError::UnknownPosition(symbol.to_string()))?;
            l.exposure.remove(symbol);
            l.daily_pnl += realized_pnl;
            l.trades_today += 1;
            l.recompute_equity();
            Ok(position)
        })
    }

    /// Closes a position atomically and settles it in cash.
    ///
    /// `realized_pnl` is net of both entry and exit fees. The entry fee was
    /// already debited at open, so the settlement credited is
    /// `margin + entry_fee + realized_pnl`. The close always happens: a loss
    /// larger than the free cash floors cash at zero and the full loss still
    /// lands in `daily_pnl`.
    ///
    /// # Errors
    ///
    /// `UnknownPosition` if nothing is open for the symbol.
    pub fn close_position(
        &self,
        symbol: &str,
        realized_pnl: Decimal,
    ) -> Result<Position, StateError> {
        self.with_ledger(|l| {
            let position = l
                .positions
                .remove(symbol)
                .ok_or_else(|| StateError::UnknownPosition(symbol.to_string()))?;
            let settlement = position.margin + position.entry_fee + realized_pnl;
            let cash = l.cash + settlement;
            if cash < Decimal::ZERO {
                warn!(
                    symbol,
                    %realized_pnl,
                    shortfall = %(-cash),
                    "Loss exceeds free cash, flooring cash at zero"
                );
                l.cash = Decimal::ZERO;
            } else {
                l.cash = cash;
            }
            l.exposure.remove(symbol);
            l.daily_pnl += realized_pnl;
            l.trades_today += 1;
            l.recompute_equity();
            Ok(position)
        })
    }

    /// Marks a position to `price`, returning the new unrealized PnL.
    ///
    /// # Errors
    ///
    /// `UnknownPosition` if nothing is open for the symbol.
    pub fn update_position_pnl(&self, symbol: &str, price: Decimal) -> Result<Decimal, StateError> {
        self.with_ledger(|l| {
            let position = l
                .positions
                .get_mut(symbol)
                .ok_or_else(|| StateError::UnknownPosition(symbol.to_string()))?;
            position.update_pnl(price);
            let pnl = position.unrealized_pnl;
            l.recompute_equity();
            Ok(pnl)
        })
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.ledger.lock().positions.get(symbol).cloned()
    }

    #[must_use]
    pub fn has_position(&self, symbol: &str) -> bool {
        self.ledger.lock().positions.contains_key(symbol)
    }

    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.ledger.lock().positions.values().cloned().collect()
    }

    #[must_use]
    pub fn position_count(&self) -> usize {
        self.ledger.lock().positions.len()
    }

    /// Notional currently committed to `symbol`.
    #[must_use]
    pub fn exposure(&self, symbol: &str) -> Decimal {
        self.ledger
            .lock()
            .exposure
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    #[must_use]
    pub fn total_exposure(&self) -> Decimal {
        self.ledger.lock().exposure.values().copied().sum()
    }

    // ----- orders -------------------------------------------------------

    /// # Errors
    ///
    /// `DuplicateOrder` if the client order id is already known.
    pub fn add_order(&self, order: Order) -> Result<(), StateError> {
        self.with_ledger(|l| {
            if l.orders.contains_key(&order.client_order_id) {
                return Err(StateError::DuplicateOrder(order.client_order_id.clone()));
            }
            l.orders.insert(order.client_order_id.clone(), order);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// `UnknownOrder`, or `InvalidTransition` when a terminal order would
    /// be moved back in flight.
    pub fn update_order_status(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        exchange_order_id: Option<String>,
    ) -> Result<(), StateError> {
        self.with_ledger(|l| {
            let order = transition(l, client_order_id, status)?;
            if exchange_order_id.is_some() {
                order.exchange_order_id = exchange_order_id;
            }
            Ok(())
        })
    }

    /// Moves an order to `status` and records why it was not placed.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update_order_status`].
    pub fn reject_order(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        reason: impl Into<String>,
    ) -> Result<(), StateError> {
        self.with_ledger(|l| {
            let order = transition(l, client_order_id, status)?;
            order.rejection_reason = Some(reason.into());
            Ok(())
        })
    }

    /// Whether an order for `symbol` is still waiting on the exchange.
    #[must_use]
    pub fn has_open_order(&self, symbol: &str) -> bool {
        self.ledger
            .lock()
            .orders
            .values()
            .any(|o| o.symbol == symbol && o.is_open())
    }

    #[must_use]
    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.ledger.lock().orders.get(client_order_id).cloned()
    }

    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.ledger.lock().orders.values().cloned().collect()
    }

    // ----- snapshots ----------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let taken_at = self.clock.now();
        self.with_ledger(|l| {
            let mut positions: Vec<Position> = l.positions.values().cloned().collect();
            positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            let mut orders: Vec<Order> = l.orders.values().cloned().collect();
            orders.sort_by(|a, b| a.client_order_id.cmp(&b.client_order_id));
            StateSnapshot {
                taken_at,
                trading_date: l.trading_date,
                cash: l.cash,
                equity: l.equity,
                peak_equity: l.peak_equity,
                daily_start_equity: l.daily_start_equity,
                daily_pnl: l.daily_pnl,
                trades_today: l.trades_today,
                trading_enabled: l.trading_enabled,
                positions,
                orders,
            }
        })
    }

    /// Replaces the ledger with a snapshot. Duplicate symbols or order ids in
    /// the snapshot keep the last occurrence.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` if the snapshot carries negative cash.
    pub fn restore(&self, snapshot: StateSnapshot) -> Result<(), StateError> {
        if snapshot.cash < Decimal::ZERO {
            return Err(StateError::InvalidAmount(snapshot.cash));
        }
        let today = self.clock.today();
        let mut l = self.ledger.lock();
        l.cash = snapshot.cash;
        l.peak_equity = snapshot.peak_equity;
        l.daily_start_equity = snapshot.daily_start_equity;
        l.daily_pnl = snapshot.daily_pnl;
        l.trades_today = snapshot.trades_today;
        l.trading_date = snapshot.trading_date;
        l.trading_enabled = snapshot.trading_enabled;
        l.exposure = snapshot
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), p.notional()))
            .collect();
        l.positions = snapshot
            .positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        l.orders = snapshot
            .orders
            .into_iter()
            .map(|o| (o.client_order_id.clone(), o))
            .collect();
        l.recompute_equity();
        l.roll_day(today);
        info!(
            cash = %l.cash,
            equity = %l.equity,
            positions = l.positions.len(),
            "Trading state restored"
        );
        Ok(())
    }
}

fn transition<'a>(
    l: &'a mut Ledger,
    client_order_id: &str,
    status: OrderStatus,
) -> Result<&'a mut Order, StateError> {
    let order = l
        .orders
        .get_mut(client_order_id)
        .ok_or_else(|| StateError::UnknownOrder(client_order_id.to_string()))?;
    if !order.status.can_transition_to(status) {
        return Err(StateError::InvalidTransition {
            id: client_order_id.to_string(),
            from: order.status,
            to: status,
        });
    }
    order.status = status;
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::Side;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap(),
        ))
    }

    fn state_with(clock: Arc<ManualClock>) -> TradingState {
        TradingState::new(dec!(10000), clock)
    }

    fn btc_long(margin: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: dec!(0.1),
            entry_price: dec!(50000),
            entry_time: Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap(),
            stop_loss: dec!(49000),
            take_profit: dec!(52000),
            margin,
            entry_fee: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            position_id: Some("ORDER_1".to_string()),
        }
    }

    #[test]
    fn test_one_position_per_symbol() {
        let state = state_with(clock());
        state.add_position(btc_long(dec!(500))).unwrap();

        let err = state.add_position(btc_long(dec!(500))).unwrap_err();
        assert_eq!(err, StateError::DuplicatePosition("BTCUSDT".to_string()));
        assert_eq!(state.position_count(), 1);
        assert_eq!(state.exposure("BTCUSDT"), dec!(5000));
    }

    #[test]
    fn test_debit_fails_closed() {
        let state = state_with(clock());
        assert_eq!(state.debit_cash(dec!(4000)).unwrap(), dec!(6000));

        let err = state.debit_cash(dec!(6000.01)).unwrap_err();
        assert!(matches!(err, StateError::InsufficientCash { .. }));
        assert_eq!(state.cash(), dec!(6000));

        assert!(state.debit_cash(dec!(-1)).is_err());
        assert!(state.credit_cash(dec!(-1)).is_err());
        assert_eq!(state.cash(), dec!(6000));
    }

    #[test]
    fn test_cash_never_negative_over_mixed_sequence() {
        let state = state_with(clock());
        let ops = [
            dec!(-3000),
            dec!(-8000),
            dec!(500),
            dec!(-7500),
            dec!(-1),
            dec!(250.5),
            dec!(-250.5),
        ];
        for amount in ops {
            let _ = if amount < Decimal::ZERO {
                state.debit_cash(-amount)
            } else {
                state.credit_cash(amount)
            };
            assert!(state.cash() >= Decimal::ZERO);
        }
        assert_eq!(state.cash(), Decimal::ZERO);
    }

    #[test]
    fn test_order_ids_are_unique() {
        let state = state_with(clock());
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let order = Order::new("ORDER_1", "BTCUSDT", Side::Buy, dec!(0.1), dec!(50000), at);
        state.add_order(order.clone()).unwrap();
        assert_eq!(
            state.add_order(order).unwrap_err(),
            StateError::DuplicateOrder("ORDER_1".to_string())
        );

        state
            .update_order_status("ORDER_1", OrderStatus::Filled, Some("X1".to_string()))
            .unwrap();
        let stored = state.order("ORDER_1").unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert_eq!(stored.exchange_order_id.as_deref(), Some("X1"));

        assert!(state
            .update_order_status("ORDER_1", OrderStatus::Submitted, None)
            .is_err());
        assert!(matches!(
            state.update_order_status("missing", OrderStatus::Filled, None),
            Err(StateError::UnknownOrder(_))
        ));
    }

    #[test]
    fn test_open_position_debits_or_changes_nothing() {
        let state = state_with(clock());
        let position = Position {
            entry_fee: dec!(5),
            ..btc_long(dec!(500))
        };

        state.open_position(position.clone()).unwrap();
        assert_eq!(state.cash(), dec!(9495));
        assert_eq!(state.equity(), dec!(9995));

        assert_eq!(
            state.open_position(position).unwrap_err(),
            StateError::DuplicatePosition("BTCUSDT".to_string())
        );
        assert_eq!(state.cash(), dec!(9495));

        let too_big = Position {
            symbol: "ETHUSDT".to_string(),
            ..btc_long(dec!(9500))
        };
        assert!(matches!(
            state.open_position(too_big),
            Err(StateError::InsufficientCash { .. })
        ));
        assert!(!state.has_position("ETHUSDT"));
        assert_eq!(state.cash(), dec!(9495));
    }

    #[test]
    fn test_rejected_order_keeps_reason_and_closes() {
        let state = state_with(clock());
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let order = Order::new("ORDER_1", "BTCUSDT", Side::Buy, dec!(0.1), dec!(50000), at)
            .with_protection(dec!(49000), dec!(52000));
        state.add_order(order).unwrap();
        assert!(state.has_open_order("BTCUSDT"));

        state
            .reject_order("ORDER_1", OrderStatus::Rejected, "Quantity below minimum")
            .unwrap();

        let stored = state.order("ORDER_1").unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("Quantity below minimum"));
        assert_eq!(stored.stop_loss, dec!(49000));
        assert!(!state.has_open_order("BTCUSDT"));
    }

    #[test]
    fn test_equity_peak_and_drawdown() {
        let state = state_with(clock());
        state.debit_cash(dec!(500)).unwrap();
        state.add_position(btc_long(dec!(500))).unwrap();
        assert_eq!(state.equity(), dec!(10000));

        state.update_position_pnl("BTCUSDT", dec!(51000)).unwrap();
        assert_eq!(state.equity(), dec!(10100));
        assert_eq!(state.peak_equity(), dec!(10100));

        state.update_position_pnl("BTCUSDT", dec!(49990)).unwrap();
        assert_eq!(state.equity(), dec!(9999));
        assert_eq!(state.peak_equity(), dec!(10100));
        assert_eq!(state.drawdown(), state.peak_equity() - state.equity());
        assert_eq!(state.drawdown(), dec!(101));
        assert_eq!(state.drawdown_pct(), dec!(1));

        state.reset_peak_equity();
        assert_eq!(state.drawdown(), Decimal::ZERO);
    }

    #[test]
    fn test_close_position_settles_margin_and_pnl() {
        let state = state_with(clock());
        state.debit_cash(dec!(500)).unwrap();
        state.add_position(btc_long(dec!(500))).unwrap();

        let closed = state.close_position("BTCUSDT", dec!(89.9)).unwrap();
        assert_eq!(closed.symbol, "BTCUSDT");
        assert_eq!(state.cash(), dec!(10089.9));
        assert_eq!(state.equity(), dec!(10089.9));
        assert_eq!(state.daily_pnl(), dec!(89.9));
        assert_eq!(state.trades_today(), 1);
        assert_eq!(state.exposure("BTCUSDT"), Decimal::ZERO);
        assert!(matches!(
            state.close_position("BTCUSDT", Decimal::ZERO),
            Err(StateError::UnknownPosition(_))
        ));
    }

    #[test]
    fn test_close_adds_back_prepaid_entry_fee() {
        let state = state_with(clock());
        // margin 500 plus 5 entry fee paid at open
        state.debit_cash(dec!(505)).unwrap();
        state.add_position(Position {
            entry_fee: dec!(5),
            ..btc_long(dec!(500))
        })
        .unwrap();

        // gross 100, fees 5 + 5.1
        state.close_position("BTCUSDT", dec!(89.9)).unwrap();
        assert_eq!(state.cash(), dec!(10094.9));
        assert_eq!(state.daily_pnl(), dec!(89.9));
    }

    #[test]
    fn test_close_floors_cash_when_loss_exceeds_cash() {
        let state = state_with(clock());
        state.debit_cash(dec!(10000)).unwrap();
        state.add_position(btc_long(dec!(500))).unwrap();

        let closed = state.close_position("BTCUSDT", dec!(-600)).unwrap();
        assert_eq!(closed.symbol, "BTCUSDT");
        assert!(!state.has_position("BTCUSDT"));
        assert_eq!(state.cash(), Decimal::ZERO);
        assert_eq!(state.equity(), Decimal::ZERO);
        assert_eq!(state.daily_pnl(), dec!(-600));
        assert_eq!(state.trades_today(), 1);
        assert_eq!(state.total_exposure(), Decimal::ZERO);
        assert!(matches!(
            state.close_position("BTCUSDT", Decimal::ZERO),
            Err(StateError::UnknownPosition(_))
        ));
    }

    #[test]
    fn test_daily_counters_roll_at_utc_midnight() {
        let clock = clock();
        let state = state_with(clock.clone());
        state.add_position(btc_long(Decimal::ZERO)).unwrap();
        state.remove_position("BTCUSDT", dec!(-25)).unwrap();
        assert_eq!(state.trades_today(), 1);
        assert_eq!(state.daily_pnl(), dec!(-25));

        clock.advance(Duration::hours(2));
        assert_eq!(state.trades_today(), 0);
        assert_eq!(state.daily_pnl(), Decimal::ZERO);
        assert_eq!(state.daily_start_equity(), state.equity());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let state = state_with(clock());
        state.debit_cash(dec!(500)).unwrap();
        state.add_position(btc_long(dec!(500))).unwrap();
        state.set_trading_enabled(false);
        let snapshot = state.snapshot();

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: StateSnapshot = serde_json::from_str(&json).unwrap();

        let restored = state_with(clock());
        restored.restore(decoded).unwrap();
        assert_eq!(restored.cash(), dec!(9500));
        assert_eq!(restored.equity(), dec!(10000));
        assert!(restored.has_position("BTCUSDT"));
        assert!(!restored.is_trading_enabled());
        assert_eq!(restored.exposure("BTCUSDT"), dec!(5000));
    }
}
