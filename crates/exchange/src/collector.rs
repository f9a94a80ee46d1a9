//! Parallel market-data collection for many symbols.
//!
//! Requests fan out across symbols but are bounded twice: a semaphore caps
//! in-flight requests and a per-minute `governor` quota caps throughput.
//! Both compose with the client's own token buckets. A failing symbol is
//! reported and skipped; it never aborts the batch.

use crate::client::ExchangeClient;
use crate::error::ExchangeError;
use crate::retry::{retry, RetryPolicy};
use crate::types::Ticker;
use cryptobot_core::{Clock, CollectorConfig, EventMeta, MarketEvent};
use futures_util::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rust_decimal::Decimal;
use serde_json::Map;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const SOURCE: &str = "MarketDataCollector";

/// Outcome of one collection pass.
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub events: Vec<MarketEvent>,
    /// Symbol and the error that made it skip.
    pub failures: Vec<(String, String)>,
}

pub struct MarketDataCollector {
    client: Arc<dyn ExchangeClient>,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    quota: Arc<DefaultDirectRateLimiter>,
    retry_policy: RetryPolicy,
    intervals: Vec<String>,
    kline_limit: u32,
}

impl MarketDataCollector {
    #[must_use]
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        clock: Arc<dyn Clock>,
        config: &CollectorConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(120u32));
        Self {
            client,
            clock,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            quota: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
            retry_policy,
            intervals: vec!["1".to_string(), "5".to_string(), "15".to_string()],
            kline_limit: 100,
        }
    }

    /// Kline intervals (exchange notation) fetched per symbol.
    #[must_use]
    pub fn with_intervals(mut self, intervals: Vec<String>, limit: u32) -> Self {
        self.intervals = intervals;
        self.kline_limit = limit;
        self
    }

    /// Fetches tickers once, then klines for every symbol concurrently.
    pub async fn collect(&self, symbols: &[String]) -> CollectionReport {
        let tickers = match self.throttled_tickers().await {
            Ok(tickers) => tickers,
            Err(err) => {
                warn!(error = %err, "Ticker fetch failed, skipping collection pass");
                return CollectionReport {
                    events: Vec::new(),
                    failures: symbols.iter().map(|s| (s.clone(), err.to_string())).collect(),
                };
            }
        };
        let by_symbol: HashMap<&str, &Ticker> =
            tickers.iter().map(|t| (t.symbol.as_str(), t)).collect();

        let tasks = symbols.iter().map(|symbol| {
            let ticker = by_symbol.get(symbol.as_str()).copied();
            async move {
                let result = match ticker {
                    Some(ticker) => self.collect_symbol(ticker).await,
                    None => Err(ExchangeError::InvalidOrder(format!("no ticker for {symbol}"))),
                };
                (symbol.clone(), result)
            }
        });

        let mut report = CollectionReport::default();
        for (symbol, result) in join_all(tasks).await {
            match result {
                Ok(Some(event)) => report.events.push(event),
                Ok(None) => {}
                Err(err) => {
                    warn!(%symbol, error = %err, "Market data collection failed");
                    report.failures.push((symbol, err.to_string()));
                }
            }
        }
        info!(
            collected = report.events.len(),
            failed = report.failures.len(),
            "Market data collection pass complete"
        );
        report
    }

    async fn throttled_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExchangeError::Configuration("collector closed".into()))?;
        self.quota.until_ready().await;
        retry(&self.retry_policy, "get_tickers", || self.client.get_tickers()).await
    }

    async fn collect_symbol(&self, ticker: &Ticker) -> Result<Option<MarketEvent>, ExchangeError> {
        if ticker.last_price <= Decimal::ZERO {
            return Ok(None);
        }
        let symbol = ticker.symbol.as_str();

        let mut klines = Map::new();
        for interval in &self.intervals {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| ExchangeError::Configuration("collector closed".into()))?;
            self.quota.until_ready().await;
            let candles = retry(&self.retry_policy, "get_klines", || {
                self.client.get_klines(symbol, interval, self.kline_limit)
            })
            .await?;
            klines.insert(interval.clone(), serde_json::to_value(candles)?);
        }

        let price = ticker.last_price;
        let mut event = MarketEvent::tick(
            EventMeta::stamp(self.clock.as_ref(), SOURCE),
            symbol,
            price,
            ticker.volume_24h.unwrap_or(Decimal::ZERO),
        );
        event.bid = ticker.bid1_price.or(Some(price));
        event.ask = ticker.ask1_price.or(Some(price));
        event.high_24h = ticker.high_price_24h;
        event.low_24h = ticker.low_price_24h;
        event.volume_24h = ticker.volume_24h;
        event.change_24h_pct = ticker.price_24h_pcnt.map(|p| p * Decimal::ONE_HUNDRED);
        event.klines = klines;
        Ok(Some(event))
    }
}
