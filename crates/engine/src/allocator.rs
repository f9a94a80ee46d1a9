//! Turns batches of strategy signals into order intents.
//!
//! One strategy per asset: symbols that already hold a position are skipped,
//! and when several strategies signal the same symbol only the best scored
//! signal survives.

use chrono::NaiveDate;
use cryptobot_core::{
    AllocatorConfig, EventMeta, OrderIntentEvent, PositionSizer, RiskConfig, SignalEvent,
    SizingConfig, StrategyConfig, TradingState,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub const SOURCE: &str = "StrategyAllocator";

/// Priority used for strategies without a configured weight.
const DEFAULT_PRIORITY: Decimal = dec!(50);
const PRIORITY_WEIGHT: Decimal = dec!(0.7);
const CONFIDENCE_WEIGHT: Decimal = dec!(0.3);

struct DailyCounters {
    date: NaiveDate,
    trades: HashMap<String, u32>,
}

pub struct StrategyAllocator {
    state: Arc<TradingState>,
    config: AllocatorConfig,
    risk_pct: Decimal,
    sizer: PositionSizer,
    strategies: BTreeMap<String, StrategyConfig>,
    counters: Mutex<DailyCounters>,
}

impl StrategyAllocator {
    #[must_use]
    pub fn new(
        state: Arc<TradingState>,
        config: AllocatorConfig,
        risk: &RiskConfig,
        taker_fee: Decimal,
        strategies: BTreeMap<String, StrategyConfig>,
    ) -> Self {
        let sizer = PositionSizer::new(SizingConfig {
            taker_fee,
            min_quantity: config.min_quantity,
            min_notional: config.min_notional,
        });
        let today = state.clock().today();
        Self {
            state,
            config,
            risk_pct: risk.risk_pct,
            sizer,
            strategies,
            counters: Mutex::new(DailyCounters {
                date: today,
                trades: HashMap::new(),
            }),
        }
    }

    /// Configured weight × 100, or the default priority when the strategy
    /// has no entry.
    #[must_use]
    pub fn priority(&self, strategy_name: &str) -> Decimal {
        self.strategies
            .get(strategy_name)
            .map_or(DEFAULT_PRIORITY, |s| s.weight * dec!(100))
    }

    /// `priority × 0.7 + confidence × 100 × 0.3`.
    #[must_use]
    pub fn score(&self, signal: &SignalEvent) -> Decimal {
        let confidence = Decimal::try_from(signal.confidence).unwrap_or(Decimal::ZERO);
        self.priority(&signal.strategy_name) * PRIORITY_WEIGHT
            + confidence * dec!(100) * CONFIDENCE_WEIGHT
    }

    #[must_use]
    pub fn trades_today(&self, strategy_name: &str) -> u32 {
        let mut counters = self.counters.lock();
        self.roll_day(&mut counters);
        counters.trades.get(strategy_name).copied().unwrap_or(0)
    }

    /// Converts a batch of signals into at most one intent per symbol.
    ///
    /// Intents are returned in the order their symbols first appear in the
    /// batch.
    pub fn process_signals(&self, signals: &[SignalEvent]) -> Vec<OrderIntentEvent> {
        if signals.is_empty() {
            return Vec::new();
        }

        let mut order: Vec<&str> = Vec::new();
        let mut by_symbol: HashMap<&str, Vec<&SignalEvent>> = HashMap::new();
        for signal in signals {
            let entry = by_symbol.entry(signal.symbol.as_str()).or_insert_with(|| {
                order.push(signal.symbol.as_str());
                Vec::new()
            });
            entry.push(signal);
        }

        let mut intents = Vec::new();
        for symbol in order {
            if self.state.has_position(symbol) {
                debug!(symbol, "Skipping signals, position already open");
                continue;
            }
            let Some(candidates) = by_symbol.get(symbol) else {
                continue;
            };
            let Some(best) = self.select_best(candidates) else {
                continue;
            };
            if let Some(intent) = self.allocate(best) {
                intents.push(intent);
            }
        }
        intents
    }

    fn select_best<'a>(&self, candidates: &[&'a SignalEvent]) -> Option<&'a SignalEvent> {
        let mut scored: Vec<(Decimal, &SignalEvent)> =
            candidates.iter().map(|s| (self.score(s), *s)).collect();
        // stable: the first signal seen wins a tie
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        if scored.len() > 1 {
            debug!(
                symbol = %scored[0].1.symbol,
                winner = %scored[0].1.strategy_name,
                score = %scored[0].0,
                competing = scored.len(),
                "Selected best signal"
            );
        }
        scored.first().map(|(_, s)| *s)
    }

    fn strategy_cap(&self, strategy_name: &str) -> u32 {
        self.strategies
            .get(strategy_name)
            .and_then(|s| s.max_trades_per_day)
            .unwrap_or(self.config.max_trades_per_strategy)
    }

    fn allocate(&self, signal: &SignalEvent) -> Option<OrderIntentEvent> {
        let cap = self.strategy_cap(&signal.strategy_name);
        {
            let mut counters = self.counters.lock();
            self.roll_day(&mut counters);
            let used = counters
                .trades
                .get(&signal.strategy_name)
                .copied()
                .unwrap_or(0);
            if used >= cap {
                info!(
                    strategy = %signal.strategy_name,
                    used,
                    cap,
                    "Strategy reached daily trade cap"
                );
                return None;
            }
        }

        let quantity = match signal.quantity {
            Some(q) if q > Decimal::ZERO => q,
            _ => {
                let q = self.sizer.calculate(
                    self.state.equity(),
                    signal.entry_price,
                    signal.stop_loss,
                    self.risk_pct,
                    signal.side,
                );
                if q <= Decimal::ZERO || !self.sizer.meets_minimums(q, signal.entry_price) {
                    debug!(symbol = %signal.symbol, "Sized quantity too small, dropping signal");
                    return None;
                }
                q
            }
        };

        *self
            .counters
            .lock()
            .trades
            .entry(signal.strategy_name.clone())
            .or_insert(0) += 1;

        let intent = OrderIntentEvent {
            meta: EventMeta::stamp(self.state.clock().as_ref(), SOURCE),
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            strategy_name: signal.strategy_name.clone(),
            signal_event_id: signal.meta.event_id,
        };
        info!(
            symbol = %intent.symbol,
            side = %intent.side,
            quantity = %intent.quantity,
            strategy = %intent.strategy_name,
            "Order intent created"
        );
        Some(intent)
    }

    fn roll_day(&self, counters: &mut DailyCounters) {
        let today = self.state.clock().today();
        if counters.date != today {
            debug!(previous = %counters.date, %today, "Resetting strategy trade counters");
            counters.date = today;
            counters.trades.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use cryptobot_core::{ManualClock, Position, Side};
    use serde_json::Map;
    use uuid::Uuid;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn strategies() -> BTreeMap<String, StrategyConfig> {
        let mut map = BTreeMap::new();
        map.insert(
            "trend".to_string(),
            StrategyConfig {
                weight: dec!(1.0),
                ..StrategyConfig::default()
            },
        );
        map.insert(
            "reversion".to_string(),
            StrategyConfig {
                weight: dec!(0.5),
                ..StrategyConfig::default()
            },
        );
        map
    }

    fn allocator(state: Arc<TradingState>, config: AllocatorConfig) -> StrategyAllocator {
        StrategyAllocator::new(state, config, &RiskConfig::default(), dec!(0.001), strategies())
    }

    fn signal(symbol: &str, strategy: &str, confidence: f64) -> SignalEvent {
        SignalEvent {
            meta: EventMeta::new(Uuid::new_v4(), Utc::now(), strategy),
            symbol: symbol.to_string(),
            side: Side::Buy,
            strategy_name: strategy.to_string(),
            entry_price: dec!(50000),
            stop_loss: dec!(49000),
            take_profit: dec!(52000),
            confidence,
            quantity: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_scores_weight_priority_over_confidence() {
        let state = Arc::new(TradingState::new(dec!(10000), clock()));
        let alloc = allocator(Arc::clone(&state), AllocatorConfig::default());

        let strong = signal("BTCUSDT", "trend", 0.5);
        let confident = signal("BTCUSDT", "reversion", 0.95);
        assert_eq!(alloc.score(&strong), dec!(85.0));
        assert_eq!(alloc.score(&confident), dec!(63.5));

        let intents = alloc.process_signals(&[confident, strong.clone()]);

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].strategy_name, "trend");
        assert_eq!(intents[0].signal_event_id, strong.meta.event_id);
        assert_eq!(intents[0].meta.source, SOURCE);
    }

    #[test]
    fn test_unconfigured_strategy_gets_default_priority() {
        let state = Arc::new(TradingState::new(dec!(10000), clock()));
        let alloc = allocator(state, AllocatorConfig::default());

        // 50 × 0.7 + 0.9 × 100 × 0.3
        assert_eq!(alloc.score(&signal("ETHUSDT", "unknown", 0.9)), dec!(62.0));
    }

    #[test]
    fn test_ties_keep_first_signal() {
        let state = Arc::new(TradingState::new(dec!(10000), clock()));
        let alloc = allocator(state, AllocatorConfig::default());
        let first = signal("BTCUSDT", "a", 0.6);
        let second = signal("BTCUSDT", "b", 0.6);

        let intents = alloc.process_signals(&[first, second]);

        assert_eq!(intents[0].strategy_name, "a");
    }

    #[test]
    fn test_sizes_from_risk_when_quantity_missing() {
        let state = Arc::new(TradingState::new(dec!(10000), clock()));
        let alloc = allocator(state, AllocatorConfig::default());

        let intents = alloc.process_signals(&[signal("BTCUSDT", "trend", 0.7)]);

        // 20 / 1050
        assert_eq!(intents[0].quantity.round_dp(6), dec!(0.019048));
    }

    #[test]
    fn test_explicit_quantity_is_used() {
        let state = Arc::new(TradingState::new(dec!(10000), clock()));
        let alloc = allocator(state, AllocatorConfig::default());
        let mut s = signal("BTCUSDT", "trend", 0.7);
        s.quantity = Some(dec!(0.05));

        let intents = alloc.process_signals(&[s]);

        assert_eq!(intents[0].quantity, dec!(0.05));
    }

    #[test]
    fn test_skips_symbol_with_open_position() {
        let state = Arc::new(TradingState::new(dec!(10000), clock()));
        state
            .add_position(Position {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                quantity: dec!(0.01),
                entry_price: dec!(50000),
                entry_time: Utc::now(),
                stop_loss: dec!(49000),
                take_profit: dec!(52000),
                margin: dec!(50),
                entry_fee: Decimal::ZERO,
                unrealized_pnl: Decimal::ZERO,
                position_id: None,
            })
            .unwrap();
        let alloc = allocator(state, AllocatorConfig::default());

        let intents = alloc.process_signals(&[
            signal("BTCUSDT", "trend", 0.9),
            signal("ETHUSDT", "trend", 0.9),
        ]);

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].symbol, "ETHUSDT");
    }

    #[test]
    fn test_undersized_signal_is_dropped() {
        let state = Arc::new(TradingState::new(dec!(100), clock()));
        let alloc = allocator(state, AllocatorConfig::default());

        // risk 0.2 / 1050 is far below the minimum quantity
        assert!(alloc.process_signals(&[signal("BTCUSDT", "trend", 0.9)]).is_empty());
        assert_eq!(alloc.trades_today("trend"), 0);
    }

    #[test]
    fn test_strategy_cap_resets_next_day() {
        let clock = clock();
        let state = Arc::new(TradingState::new(dec!(10000), clock.clone()));
        let alloc = allocator(
            state,
            AllocatorConfig {
                max_trades_per_strategy: 1,
                ..AllocatorConfig::default()
            },
        );

        assert_eq!(alloc.process_signals(&[signal("BTCUSDT", "trend", 0.9)]).len(), 1);
        assert!(alloc.process_signals(&[signal("ETHUSDT", "trend", 0.9)]).is_empty());

        clock.advance(Duration::days(1));
        assert_eq!(alloc.trades_today("trend"), 0);
        assert_eq!(alloc.process_signals(&[signal("ETHUSDT", "trend", 0.9)]).len(), 1);
    }
}
