use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub allocator: AllocatorConfig,
    /// Strategy name to its allocation settings.
    pub strategies: BTreeMap<String, StrategyConfig>,
    pub event_loop: EventLoopConfig,
    pub retry: RetryConfig,
    pub rate_limits: RateLimitsConfig,
    pub collector: CollectorConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TradingConfig {
    pub mode: TradingMode,
    pub initial_cash: Decimal,
    pub taker_fee: Decimal,
    pub leverage: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            initial_cash: dec!(10000),
            taker_fee: dec!(0.001),
            leverage: 10,
        }
    }
}

/// Per-order gating limits. Fractions are of current equity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskConfig {
    pub risk_pct: Decimal,
    pub max_daily_loss: Decimal,
    pub max_trades_per_day: u32,
    pub max_exposure_per_asset: Decimal,
    /// Widest accepted stop, as a fraction of entry.
    pub max_stop_distance: Decimal,
    /// Shrink oversized intents to fit the caps instead of rejecting them.
    pub narrow_oversized: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_pct: dec!(0.002),
            max_daily_loss: dec!(0.005),
            max_trades_per_day: 10,
            max_exposure_per_asset: dec!(0.10),
            max_stop_distance: dec!(0.20),
            narrow_oversized: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Drawdown from peak equity, as a fraction, that trips the kill switch.
    pub max_drawdown: Decimal,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_drawdown: dec!(0.05),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatorConfig {
    pub max_trades_per_strategy: u32,
    pub min_quantity: Decimal,
    pub min_notional: Decimal,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_trades_per_strategy: 5,
            min_quantity: dec!(0.001),
            min_notional: dec!(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyConfig {
    pub enabled: bool,
    /// Allocation weight in `[0, 1]`; priority is `weight × 100`.
    pub weight: Decimal,
    /// Overrides the allocator-wide daily cap for this strategy.
    pub max_trades_per_day: Option<u32>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: dec!(0.5),
            max_trades_per_day: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventLoopConfig {
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub idle_sleep_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            poll_interval_ms: 100,
            idle_sleep_ms: 10,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl EventLoopConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Headroom above capacity the bucket may accumulate.
    pub burst_allowance: f64,
}

/// Slowest refill accepted from configuration: one token a day.
pub const MIN_REFILL_RATE: f64 = 1.0 / 86_400.0;

impl BucketConfig {
    /// # Errors
    ///
    /// Returns error if the bucket could never hand out a token in a
    /// representable time.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.capacity.is_finite() && self.capacity >= 1.0,
            "capacity must be at least 1, got {}",
            self.capacity
        );
        anyhow::ensure!(
            self.refill_rate.is_finite() && self.refill_rate >= MIN_REFILL_RATE,
            "refillRate must be at least {MIN_REFILL_RATE} tokens/s, got {}",
            self.refill_rate
        );
        anyhow::ensure!(
            self.burst_allowance.is_finite() && self.burst_allowance >= 0.0,
            "burstAllowance must be non-negative, got {}",
            self.burst_allowance
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitsConfig {
    pub public: BucketConfig,
    pub market_data: BucketConfig,
    pub orders: BucketConfig,
    pub account: BucketConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        let standard = BucketConfig {
            capacity: 120.0,
            refill_rate: 2.0,
            burst_allowance: 10.0,
        };
        Self {
            public: standard,
            market_data: standard,
            orders: BucketConfig {
                capacity: 50.0,
                refill_rate: 0.83,
                burst_allowance: 10.0,
            },
            account: standard,
        }
    }
}

impl RateLimitsConfig {
    /// # Errors
    ///
    /// Names the first bucket whose settings are invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, bucket) in [
            ("public", self.public),
            ("marketData", self.market_data),
            ("orders", self.orders),
            ("account", self.account),
        ] {
            bucket
                .validate()
                .map_err(|e| anyhow::anyhow!("rateLimits.{name}: {e}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectorConfig {
    pub max_concurrent: usize,
    pub requests_per_minute: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            requests_per_minute: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub url: String,
    pub max_connections: u32,
    pub write_queue_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            write_queue_capacity: 1024,
        }
    }
}
