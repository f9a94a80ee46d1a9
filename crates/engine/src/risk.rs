//! Pre-trade risk gate.
//!
//! Every order intent passes through [`RiskEngine::assess`] before reaching
//! the executor. Checks run in a fixed order and the first failure decides
//! the rejection reason:
//!
//! 1. trading enabled
//! 2. daily loss limit (kill switch)
//! 3. drawdown limit (kill switch)
//! 4. risk per trade, including stop sanity
//! 5. trades per day
//! 6. exposure per asset
//! 7. existing position in the symbol
//!
//! A breach of a kill-switch limit disables trading in [`TradingState`]
//! immediately and returns a [`KillSwitchEvent`] for the caller to publish.

use cryptobot_core::position_sizing::stop_on_protective_side;
use cryptobot_core::{
    AllocatorConfig, CircuitBreakerConfig, EventMeta, KillSwitchEvent, OrderIntentEvent,
    RiskApprovalEvent, RiskConfig, Severity, Side, TradingState,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const SOURCE: &str = "RiskEngine";

/// Result of evaluating one intent.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub approval: RiskApprovalEvent,
    /// Set when the evaluation tripped a kill-switch limit.
    pub kill_switch: Option<KillSwitchEvent>,
}

struct Rejection {
    reason: String,
    kill_switch: bool,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            kill_switch: false,
        }
    }

    fn kill(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            kill_switch: true,
        }
    }
}

pub struct RiskEngine {
    state: Arc<TradingState>,
    config: RiskConfig,
    max_drawdown: Decimal,
    min_quantity: Decimal,
    min_notional: Decimal,
}

impl RiskEngine {
    #[must_use]
    pub fn new(
        state: Arc<TradingState>,
        config: RiskConfig,
        breaker: &CircuitBreakerConfig,
        allocator: &AllocatorConfig,
    ) -> Self {
        Self {
            state,
            config,
            max_drawdown: breaker.max_drawdown,
            min_quantity: allocator.min_quantity,
            min_notional: allocator.min_notional,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Approves or rejects `intent`. Kill-switch side effects on
    /// [`TradingState`] still happen; use [`Self::assess`] to also get the
    /// event to publish.
    pub fn evaluate_order_intent(&self, intent: &OrderIntentEvent) -> RiskApprovalEvent {
        self.assess(intent).approval
    }

    pub fn assess(&self, intent: &OrderIntentEvent) -> RiskAssessment {
        let meta = EventMeta::stamp(self.state.clock().as_ref(), SOURCE);
        match self.check(intent) {
            Ok(quantity) => {
                info!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    quantity = %quantity,
                    "Order intent approved"
                );
                RiskAssessment {
                    approval: RiskApprovalEvent {
                        meta,
                        order_intent_id: intent.meta.event_id,
                        approved: true,
                        reason: "All risk checks passed".to_string(),
                        adjusted_quantity: Some(quantity),
                        adjusted_stop_loss: Some(intent.stop_loss),
                        adjusted_take_profit: Some(intent.take_profit),
                        original_intent: Some(intent.clone()),
                    },
                    kill_switch: None,
                }
            }
            Err(rejection) => {
                let kill_switch = rejection
                    .kill_switch
                    .then(|| self.trigger_kill_switch(&rejection.reason));
                info!(
                    symbol = %intent.symbol,
                    reason = %rejection.reason,
                    "Order intent rejected"
                );
                RiskAssessment {
                    approval: RiskApprovalEvent {
                        meta,
                        order_intent_id: intent.meta.event_id,
                        approved: false,
                        reason: rejection.reason,
                        adjusted_quantity: None,
                        adjusted_stop_loss: None,
                        adjusted_take_profit: None,
                        original_intent: Some(intent.clone()),
                    },
                    kill_switch,
                }
            }
        }
    }

    /// Runs the checks in order, returning the approved quantity.
    fn check(&self, intent: &OrderIntentEvent) -> Result<Decimal, Rejection> {
        if !self.state.is_trading_enabled() {
            return Err(Rejection::new("Trading is disabled"));
        }

        let equity = self.state.equity();
        if equity <= Decimal::ZERO {
            return Err(Rejection::new("Equity is zero or negative"));
        }
        if intent.quantity <= Decimal::ZERO || intent.entry_price <= Decimal::ZERO {
            return Err(Rejection::new(format!(
                "Invalid order intent: quantity {} at {}",
                intent.quantity, intent.entry_price
            )));
        }

        self.check_daily_loss(equity)?;
        self.check_drawdown()?;

        let mut quantity = intent.quantity;
        let risk_per_unit = self.check_stop(intent)?;
        let risk = risk_per_unit * quantity / equity;
        if risk > self.config.risk_pct {
            if !self.config.narrow_oversized {
                return Err(Rejection::new(format!(
                    "Risk per trade too high: {:.2}% > {:.2}%",
                    risk * dec!(100),
                    self.config.risk_pct * dec!(100)
                )));
            }
            quantity = self.config.risk_pct * equity / risk_per_unit;
            debug!(symbol = %intent.symbol, %quantity, "Narrowed quantity to risk cap");
        }

        let trades_today = self.state.trades_today();
        if trades_today >= self.config.max_trades_per_day {
            return Err(Rejection::new(format!(
                "Max trades per day reached: {trades_today} >= {}",
                self.config.max_trades_per_day
            )));
        }

        let existing = self.state.exposure(&intent.symbol);
        let cap = equity * self.config.max_exposure_per_asset;
        let total = existing + quantity * intent.entry_price;
        if total > cap {
            let room = cap - existing;
            if !self.config.narrow_oversized || room <= Decimal::ZERO {
                return Err(Rejection::new(format!(
                    "Max exposure per asset exceeded: {total} > {cap}"
                )));
            }
            quantity = quantity.min(room / intent.entry_price);
            debug!(symbol = %intent.symbol, %quantity, "Narrowed quantity to exposure cap");
        }

        if self.state.has_position(&intent.symbol) {
            return Err(Rejection::new(format!(
                "Position conflict: Already have position in {}",
                intent.symbol
            )));
        }

        if quantity != intent.quantity
            && (quantity < self.min_quantity || quantity * intent.entry_price < self.min_notional)
        {
            return Err(Rejection::new(format!(
                "Narrowed quantity {quantity} below tradable minimums"
            )));
        }

        Ok(quantity)
    }

    fn check_daily_loss(&self, equity: Decimal) -> Result<(), Rejection> {
        let daily_pnl = self.state.daily_pnl();
        if daily_pnl >= Decimal::ZERO {
            return Ok(());
        }
        let loss_pct = daily_pnl.abs() / equity;
        if loss_pct >= self.config.max_daily_loss {
            return Err(Rejection::kill(format!(
                "Kill switch triggered: Daily loss limit breached: {:.2}% >= {:.2}%",
                loss_pct * dec!(100),
                self.config.max_daily_loss * dec!(100)
            )));
        }
        Ok(())
    }

    fn check_drawdown(&self) -> Result<(), Rejection> {
        // drawdown_pct is a percentage, the limit a fraction
        let drawdown = self.state.drawdown_pct() / dec!(100);
        if drawdown >= self.max_drawdown {
            return Err(Rejection::kill(format!(
                "Kill switch triggered: Drawdown limit breached: {:.2}% >= {:.2}%",
                drawdown * dec!(100),
                self.max_drawdown * dec!(100)
            )));
        }
        Ok(())
    }

    /// Validates the stop and returns the loss per unit if it is hit.
    fn check_stop(&self, intent: &OrderIntentEvent) -> Result<Decimal, Rejection> {
        if intent.stop_loss <= Decimal::ZERO {
            return Err(Rejection::new("Stop loss must be positive"));
        }
        if !stop_on_protective_side(intent.side, intent.entry_price, intent.stop_loss) {
            return Err(Rejection::new(match intent.side {
                Side::Buy => "Stop loss must be below entry price for long position",
                Side::Sell => "Stop loss must be above entry price for short position",
            }));
        }
        let risk_per_unit = (intent.entry_price - intent.stop_loss).abs();
        let distance = risk_per_unit / intent.entry_price;
        if distance > self.config.max_stop_distance {
            return Err(Rejection::new(format!(
                "Stop loss too wide: {:.2}% of price (max {:.2}%)",
                distance * dec!(100),
                self.config.max_stop_distance * dec!(100)
            )));
        }
        Ok(risk_per_unit)
    }

    fn trigger_kill_switch(&self, reason: &str) -> KillSwitchEvent {
        self.state.set_trading_enabled(false);
        error!(reason, "Kill switch triggered, trading disabled");
        KillSwitchEvent {
            meta: EventMeta::stamp(self.state.clock().as_ref(), SOURCE),
            reason: reason.to_string(),
            triggered_by: SOURCE.to_string(),
            severity: Severity::Critical,
            auto_recovery: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cryptobot_core::{ManualClock, Position};
    use uuid::Uuid;

    fn state() -> Arc<TradingState> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        Arc::new(TradingState::new(dec!(10000), clock))
    }

    fn engine(state: Arc<TradingState>, config: RiskConfig) -> RiskEngine {
        RiskEngine::new(
            state,
            config,
            &CircuitBreakerConfig::default(),
            &AllocatorConfig::default(),
        )
    }

    fn intent(quantity: Decimal, stop_loss: Decimal) -> OrderIntentEvent {
        OrderIntentEvent {
            meta: EventMeta::new(Uuid::new_v4(), Utc::now(), "StrategyAllocator"),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity,
            entry_price: dec!(50000),
            stop_loss,
            take_profit: dec!(52000),
            strategy_name: "trend".to_string(),
            signal_event_id: Uuid::new_v4(),
        }
    }

    fn open_btc(state: &TradingState) {
        state
            .add_position(Position {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                quantity: dec!(0.001),
                entry_price: dec!(50000),
                entry_time: Utc::now(),
                stop_loss: dec!(49000),
                take_profit: dec!(52000),
                margin: dec!(5),
                entry_fee: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                position_id: None,
            })
            .unwrap();
    }

    #[test]
    fn test_approves_within_limits() {
        let engine = engine(state(), RiskConfig::default());
        let intent = intent(dec!(0.019), dec!(49000));

        let approval = engine.evaluate_order_intent(&intent);

        assert!(approval.approved, "{}", approval.reason);
        assert_eq!(approval.reason, "All risk checks passed");
        assert_eq!(approval.adjusted_quantity, Some(dec!(0.019)));
        assert_eq!(approval.order_intent_id, intent.meta.event_id);
        assert_eq!(
            approval.original_intent.map(|i| i.signal_event_id),
            Some(intent.signal_event_id)
        );
    }

    #[test]
    fn test_rejects_excess_risk_per_trade() {
        let engine = engine(state(), RiskConfig::default());

        // 1000 × 0.2 / 10000 = 2%
        let approval = engine.evaluate_order_intent(&intent(dec!(0.2), dec!(49000)));

        assert!(!approval.approved);
        assert!(approval.reason.contains("Risk per trade"), "{}", approval.reason);
        assert!(approval.adjusted_quantity.is_none());
    }

    #[test]
    fn test_narrowing_shrinks_oversized_intent() {
        let config = RiskConfig {
            narrow_oversized: true,
            ..RiskConfig::default()
        };
        let engine = engine(state(), config);

        let approval = engine.evaluate_order_intent(&intent(dec!(0.2), dec!(49000)));

        assert!(approval.approved, "{}", approval.reason);
        // 0.002 × 10000 / 1000
        assert_eq!(approval.adjusted_quantity, Some(dec!(0.02)));
    }

    #[test]
    fn test_rejects_wrong_side_and_too_wide_stops() {
        let engine = engine(state(), RiskConfig::default());

        let wrong_side = engine.evaluate_order_intent(&intent(dec!(0.01), dec!(51000)));
        assert!(wrong_side.reason.contains("below entry"));

        let too_wide = engine.evaluate_order_intent(&intent(dec!(0.0001), dec!(30000)));
        assert!(too_wide.reason.starts_with("Stop loss too wide"));
    }

    #[test]
    fn test_rejects_when_daily_trade_cap_reached() {
        let state = state();
        let engine = engine(
            Arc::clone(&state),
            RiskConfig {
                max_trades_per_day: 1,
                ..RiskConfig::default()
            },
        );
        open_btc(&state);
        state.remove_position("BTCUSDT", Decimal::ZERO).unwrap();

        let approval = engine.evaluate_order_intent(&intent(dec!(0.019), dec!(49000)));

        assert!(approval.reason.starts_with("Max trades per day reached"));
    }

    #[test]
    fn test_rejects_exposure_over_cap() {
        let engine = engine(
            state(),
            RiskConfig {
                risk_pct: dec!(0.5),
                ..RiskConfig::default()
            },
        );

        // 0.05 × 50000 = 2500 > 10% of 10000
        let approval = engine.evaluate_order_intent(&intent(dec!(0.05), dec!(49000)));

        assert!(approval.reason.starts_with("Max exposure per asset exceeded"));
    }

    #[test]
    fn test_rejects_position_conflict() {
        let state = state();
        open_btc(&state);
        let engine = engine(Arc::clone(&state), RiskConfig::default());

        let approval = engine.evaluate_order_intent(&intent(dec!(0.01), dec!(49000)));

        assert_eq!(
            approval.reason,
            "Position conflict: Already have position in BTCUSDT"
        );
    }

    #[test]
    fn test_daily_loss_breach_trips_kill_switch() {
        let state = state();
        open_btc(&state);
        // realized loss of 60 on equity near 10000 is above 0.5%
        state.close_position("BTCUSDT", dec!(-60)).unwrap();
        let engine = engine(Arc::clone(&state), RiskConfig::default());

        let assessment = engine.assess(&intent(dec!(0.01), dec!(49000)));

        assert!(!assessment.approval.approved);
        assert!(assessment.approval.reason.starts_with("Kill switch triggered"));
        let kill = assessment.kill_switch.expect("kill switch event");
        assert_eq!(kill.severity, Severity::Critical);
        assert_eq!(kill.triggered_by, SOURCE);
        assert!(!state.is_trading_enabled());

        let next = engine.evaluate_order_intent(&intent(dec!(0.01), dec!(49000)));
        assert_eq!(next.reason, "Trading is disabled");
    }

    #[test]
    fn test_drawdown_limit_compares_fractions() {
        let state = state();
        state.debit_cash(dec!(400)).unwrap();
        // 4% drawdown stays under the 5% limit
        let engine = engine(Arc::clone(&state), RiskConfig::default());
        assert!(engine.assess(&intent(dec!(0.001), dec!(49000))).kill_switch.is_none());

        state.debit_cash(dec!(200)).unwrap();
        let assessment = engine.assess(&intent(dec!(0.001), dec!(49000)));
        assert!(assessment.kill_switch.is_some());
        assert!(assessment.approval.reason.contains("Drawdown"));
    }
}
