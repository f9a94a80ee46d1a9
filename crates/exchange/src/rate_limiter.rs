//! Token-bucket rate limiting per endpoint class.
//!
//! Each class owns an independent bucket behind its own lock. Buckets refill
//! lazily on every query from the elapsed time since the last refill, so no
//! background task is needed.

use cryptobot_core::{BucketConfig, RateLimitsConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest single sleep in [`RateLimiter::wait_if_needed`] before the bucket
/// is checked again.
const MAX_SLEEP: Duration = Duration::from_secs(5);

/// Endpoint classes with separate quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Public,
    MarketData,
    Orders,
    Account,
}

impl EndpointClass {
    /// Classifies an API path by substring.
    #[must_use]
    pub fn classify(endpoint: &str) -> Self {
        let path = endpoint.to_ascii_lowercase();
        if path.contains("/order/") || path.contains("/position/") {
            Self::Orders
        } else if path.contains("/account/") || path.contains("/wallet/") {
            Self::Account
        } else if path.contains("/market/") {
            Self::MarketData
        } else {
            Self::Public
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::MarketData => "market_data",
            Self::Orders => "orders",
            Self::Account => "account",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
}

impl TokenBucket {
    /// Starts full at `capacity`; refills may accumulate up to
    /// `capacity + burst_allowance`.
    #[must_use]
    pub fn new(config: BucketConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    #[must_use]
    pub fn new_at(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: now,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now <= state.last_refill {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let ceiling = self.config.capacity + self.config.burst_allowance;
        state.tokens = (state.tokens + elapsed * self.config.refill_rate).min(ceiling);
        state.last_refill = now;
    }

    /// Takes `n` tokens if all of them are available; never partially.
    pub fn consume(&self, n: f64) -> bool {
        self.consume_at(n, Instant::now())
    }

    pub fn consume_at(&self, n: f64, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Time until `n` tokens will be available; zero if they already are.
    #[must_use]
    pub fn wait_time(&self, n: f64) -> Duration {
        self.wait_time_at(n, Instant::now())
    }

    #[must_use]
    pub fn wait_time_at(&self, n: f64, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= n {
            return Duration::ZERO;
        }
        // a zero, negative or vanishing rate has no representable wait
        Duration::try_from_secs_f64((n - state.tokens) / self.config.refill_rate)
            .unwrap_or(Duration::MAX)
    }

    #[must_use]
    pub fn stats(&self) -> BucketStats {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        BucketStats {
            tokens: state.tokens,
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
        }
    }
}

/// Per-class buckets keyed by [`EndpointClass`].
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<EndpointClass, TokenBucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitsConfig::default())
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitsConfig) -> Self {
        let buckets = [
            (EndpointClass::Public, config.public),
            (EndpointClass::MarketData, config.market_data),
            (EndpointClass::Orders, config.orders),
            (EndpointClass::Account, config.account),
        ]
        .into_iter()
        .map(|(class, cfg)| (class, TokenBucket::new(cfg)))
        .collect();
        Self { buckets }
    }

    #[must_use]
    pub fn bucket(&self, class: EndpointClass) -> Option<&TokenBucket> {
        self.buckets
            .get(&class)
            .or_else(|| self.buckets.get(&EndpointClass::Public))
    }

    /// Non-blocking: consumes a token for `endpoint` if one is available.
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        self.bucket(EndpointClass::classify(endpoint))
            .map_or(true, |bucket| bucket.consume(1.0))
    }

    /// Waits until a token for `endpoint` is available, then consumes it.
    pub async fn wait_if_needed(&self, endpoint: &str) {
        let class = EndpointClass::classify(endpoint);
        let Some(bucket) = self.bucket(class) else {
            return;
        };
        loop {
            if bucket.consume(1.0) {
                return;
            }
            let needed = bucket.wait_time(1.0);
            if needed > MAX_SLEEP {
                warn!(%class, wait_secs = needed.as_secs_f64(), "Rate limit refill is very slow");
            }
            let wait = needed.clamp(Duration::from_millis(1), MAX_SLEEP);
            debug!(%class, wait_ms = wait.as_millis() as u64, "Rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }

    #[must_use]
    pub fn stats(&self) -> HashMap<EndpointClass, BucketStats> {
        self.buckets
            .iter()
            .map(|(class, bucket)| (*class, bucket.stats()))
            .collect()
    }
}
