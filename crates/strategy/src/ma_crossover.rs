use anyhow::{ensure, Result};
use async_trait::async_trait;
use cryptobot_core::{
    EventMeta, MarketEvent, PositionUpdateEvent, PositionUpdateType, Side, SignalEvent, Strategy,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MaCrossoverConfig {
    pub name: String,
    pub fast_period: usize,
    pub slow_period: usize,
    /// Stop distance as a fraction of entry.
    pub stop_pct: Decimal,
    /// Target distance as a fraction of entry.
    pub target_pct: Decimal,
    pub confidence: f64,
    pub enabled: bool,
}

impl Default for MaCrossoverConfig {
    fn default() -> Self {
        Self {
            name: "ma_crossover".to_string(),
            fast_period: 5,
            slow_period: 20,
            stop_pct: Decimal::new(25, 3),
            target_pct: Decimal::new(5, 2),
            confidence: 0.6,
            enabled: true,
        }
    }
}

/// Fast/slow simple moving average crossover on one symbol.
///
/// Emits a signal only when the fast average changes side relative to the
/// slow one, and stays quiet while the pipeline reports an open position.
pub struct MaCrossoverStrategy {
    symbol: String,
    config: MaCrossoverConfig,
    fast_prices: VecDeque<Decimal>,
    slow_prices: VecDeque<Decimal>,
    last_direction: Option<Side>,
    holding: bool,
}

impl MaCrossoverStrategy {
    /// # Errors
    ///
    /// Returns error if the periods are zero or not fast < slow, or the
    /// stop/target fractions are outside (0, 1).
    pub fn new(symbol: impl Into<String>, config: MaCrossoverConfig) -> Result<Self> {
        ensure!(config.fast_period > 0, "fast period must be positive");
        ensure!(
            config.fast_period < config.slow_period,
            "fast period {} must be shorter than slow period {}",
            config.fast_period,
            config.slow_period
        );
        ensure!(
            config.stop_pct > Decimal::ZERO && config.stop_pct < Decimal::ONE,
            "stop fraction must be in (0, 1)"
        );
        ensure!(
            config.target_pct > Decimal::ZERO && config.target_pct < Decimal::ONE,
            "target fraction must be in (0, 1)"
        );
        ensure!(
            (0.0..=1.0).contains(&config.confidence),
            "confidence must be in [0, 1]"
        );

        Ok(Self {
            symbol: symbol.into(),
            fast_prices: VecDeque::with_capacity(config.fast_period),
            slow_prices: VecDeque::with_capacity(config.slow_period),
            config,
            last_direction: None,
            holding: false,
        })
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn calculate_ma(prices: &VecDeque<Decimal>) -> Decimal {
        let sum: Decimal = prices.iter().sum();
        sum / Decimal::from(prices.len())
    }

    fn push(buffer: &mut VecDeque<Decimal>, period: usize, price: Decimal) {
        buffer.push_back(price);
        if buffer.len() > period {
            buffer.pop_front();
        }
    }

    fn signal(&self, market: &MarketEvent, side: Side, fast: Decimal, slow: Decimal) -> SignalEvent {
        let price = market.price;
        let (stop_loss, take_profit) = match side {
            Side::Buy => (
                price * (Decimal::ONE - self.config.stop_pct),
                price * (Decimal::ONE + self.config.target_pct),
            ),
            Side::Sell => (
                price * (Decimal::ONE + self.config.stop_pct),
                price * (Decimal::ONE - self.config.target_pct),
            ),
        };

        let mut metadata = Map::new();
        metadata.insert("fast_ma".to_string(), Value::String(fast.to_string()));
        metadata.insert("slow_ma".to_string(), Value::String(slow.to_string()));

        SignalEvent {
            meta: EventMeta::new(Uuid::new_v4(), market.meta.timestamp, self.config.name.clone()),
            symbol: self.symbol.clone(),
            side,
            strategy_name: self.config.name.clone(),
            entry_price: price,
            stop_loss,
            take_profit,
            confidence: self.config.confidence,
            quantity: None,
            metadata,
        }
    }
}

#[async_trait]
impl Strategy for MaCrossoverStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn generate_signals(&mut self, market: &MarketEvent) -> Result<Vec<SignalEvent>> {
        if market.symbol != self.symbol || market.price <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        Self::push(&mut self.fast_prices, self.config.fast_period, market.price);
        Self::push(&mut self.slow_prices, self.config.slow_period, market.price);

        if self.slow_prices.len() < self.config.slow_period {
            return Ok(Vec::new());
        }

        let fast_ma = Self::calculate_ma(&self.fast_prices);
        let slow_ma = Self::calculate_ma(&self.slow_prices);

        let direction = match fast_ma.cmp(&slow_ma) {
            Ordering::Greater => Side::Buy,
            Ordering::Less => Side::Sell,
            Ordering::Equal => return Ok(Vec::new()),
        };

        // first reading only establishes a side
        let Some(previous) = self.last_direction.replace(direction) else {
            return Ok(Vec::new());
        };
        if previous == direction {
            return Ok(Vec::new());
        }

        if self.holding {
            debug!(symbol = %self.symbol, side = %direction, "Crossover ignored while holding");
            return Ok(Vec::new());
        }

        Ok(vec![self.signal(market, direction, fast_ma, slow_ma)])
    }

    async fn on_position_update(&mut self, update: &PositionUpdateEvent) -> Result<()> {
        if update.symbol != self.symbol {
            return Ok(());
        }
        match update.update_type {
            PositionUpdateType::Opened => self.holding = true,
            PositionUpdateType::Closed => self.holding = false,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn strategy() -> MaCrossoverStrategy {
        MaCrossoverStrategy::new(
            "BTCUSDT",
            MaCrossoverConfig {
                fast_period: 2,
                slow_period: 3,
                ..MaCrossoverConfig::default()
            },
        )
        .unwrap()
    }

    fn tick(symbol: &str, price: Decimal) -> MarketEvent {
        MarketEvent::tick(
            EventMeta::new(Uuid::new_v4(), Utc::now(), "test"),
            symbol,
            price,
            dec!(1),
        )
    }

    async fn feed(s: &mut MaCrossoverStrategy, prices: &[Decimal]) -> Vec<SignalEvent> {
        let mut out = Vec::new();
        for price in prices {
            out.extend(s.generate_signals(&tick("BTCUSDT", *price)).await.unwrap());
        }
        out
    }

    fn update(kind: PositionUpdateType) -> PositionUpdateEvent {
        PositionUpdateEvent {
            meta: EventMeta::new(Uuid::new_v4(), Utc::now(), "test"),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: dec!(0.1),
            entry_price: dec!(100),
            current_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: None,
            update_type: kind,
        }
    }

    #[test]
    fn test_rejects_inverted_periods() {
        let err = MaCrossoverStrategy::new(
            "BTCUSDT",
            MaCrossoverConfig {
                fast_period: 20,
                slow_period: 5,
                ..MaCrossoverConfig::default()
            },
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_upward_cross_emits_long_with_protective_levels() {
        let mut s = strategy();
        // falling: fast below slow
        assert!(feed(&mut s, &[dec!(100), dec!(99), dec!(98)]).await.is_empty());
        // 98,99,104 -> slow 100.33, fast 101
        let signals = feed(&mut s, &[dec!(104)]).await;

        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.entry_price, dec!(104));
        assert_eq!(signal.stop_loss, dec!(101.4));
        assert_eq!(signal.take_profit, dec!(109.2));
        assert_eq!(signal.strategy_name, "ma_crossover");
        assert!(signal.quantity.is_none());
        assert!(signal.metadata.contains_key("fast_ma"));
    }

    #[tokio::test]
    async fn test_downward_cross_emits_short() {
        let mut s = strategy();
        feed(&mut s, &[dec!(100), dec!(101), dec!(102)]).await;
        let signals = feed(&mut s, &[dec!(95)]).await;

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
        assert!(signals[0].stop_loss > signals[0].entry_price);
        assert!(signals[0].take_profit < signals[0].entry_price);
    }

    #[tokio::test]
    async fn test_no_repeat_while_trend_continues() {
        let mut s = strategy();
        feed(&mut s, &[dec!(100), dec!(99), dec!(98)]).await;
        let signals = feed(&mut s, &[dec!(104), dec!(106), dec!(108)]).await;
        assert_eq!(signals.len(), 1);
    }

    #[tokio::test]
    async fn test_ignores_other_symbols() {
        let mut s = strategy();
        for price in [dec!(100), dec!(99), dec!(98), dec!(104)] {
            let out = s.generate_signals(&tick("ETHUSDT", price)).await.unwrap();
            assert!(out.is_empty());
        }
        assert!(s.slow_prices.is_empty());
    }

    #[tokio::test]
    async fn test_quiet_while_holding_until_closed() {
        let mut s = strategy();
        feed(&mut s, &[dec!(100), dec!(99), dec!(98)]).await;
        s.on_position_update(&update(PositionUpdateType::Opened))
            .await
            .unwrap();

        assert!(feed(&mut s, &[dec!(104)]).await.is_empty());

        s.on_position_update(&update(PositionUpdateType::Closed))
            .await
            .unwrap();
        // 99,104,90 -> fast 97 below slow 97.67
        let signals = feed(&mut s, &[dec!(90)]).await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
    }
}
