//! Exchange access for the trading pipeline.
//!
//! * [`ExchangeClient`] is the contract the executor and collector consume.
//! * [`BybitClient`] implements it over the Bybit v5 REST API.
//! * [`RateLimiter`] holds one token bucket per endpoint class.
//! * [`retry()`] wraps any fallible call with classified backoff.
//! * [`MarketDataCollector`] gathers ticks for many symbols in parallel.

pub mod bybit;
pub mod client;
pub mod collector;
pub mod error;
pub mod rate_limiter;
pub mod retry;
pub mod types;

pub use bybit::{BybitClient, BybitCredentials, MAINNET_URL, TESTNET_URL};
pub use client::ExchangeClient;
pub use collector::{CollectionReport, MarketDataCollector};
pub use error::{Disposition, ExchangeError, Result};
pub use rate_limiter::{BucketStats, EndpointClass, RateLimiter, TokenBucket};
pub use retry::{retry, Classify, RetryPolicy};
pub use types::{
    FundingRate, InstrumentRules, Kline, OpenInterest, OrderAck, OrderInfo, OrderRequest, OrderType,
    Ticker,
};
