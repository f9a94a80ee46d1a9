use crate::error::Result;
use crate::types::{
    FundingRate, InstrumentRules, Kline, OpenInterest, OrderAck, OrderInfo, OrderRequest, Ticker,
};
use async_trait::async_trait;

/// Exchange operations consumed by the executor and the market-data
/// collector. Implementations report transport and business failures as
/// [`crate::ExchangeError`] so callers can classify them.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Looks an order up by its client order id. `None` if the exchange
    /// does not know it.
    async fn get_order(&self, symbol: &str, order_link_id: &str) -> Result<Option<OrderInfo>>;

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentRules>;

    async fn get_tickers(&self) -> Result<Vec<Ticker>>;

    /// Candles for `interval` (minutes, as Bybit names them), newest first.
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;

    async fn get_funding_rate(&self, symbol: &str, limit: u32) -> Result<Vec<FundingRate>>;

    async fn get_open_interest(&self, symbol: &str, interval_time: &str, limit: u32)
        -> Result<Vec<OpenInterest>>;
}
