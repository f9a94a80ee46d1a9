//! Bybit v5 REST client for linear perpetuals.
//!
//! Every request first passes the endpoint-class token bucket. Private
//! requests are signed with HMAC-SHA256 over
//! `timestamp + api_key + recv_window + payload`. The client never retries;
//! callers wrap it in [`crate::retry`].

use crate::client::ExchangeClient;
use crate::error::{ExchangeError, Result};
use crate::rate_limiter::RateLimiter;
use crate::types::{
    ApiResponse, FundingRate, InstrumentInfo, InstrumentRules, Kline, ListResult, OpenInterest,
    OrderAck, OrderInfo, OrderRequest, Ticker,
};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{header::HeaderMap, Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const MAINNET_URL: &str = "https://api.bybit.com";
pub const TESTNET_URL: &str = "https://api-testnet.bybit.com";

const RECV_WINDOW: &str = "5000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API key pair. The secret never appears in `Debug` output.
#[derive(Debug, Clone)]
pub struct BybitCredentials {
    pub api_key: String,
    pub api_secret: SecretString,
}

impl BybitCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
        }
    }

    /// Signs `timestamp + api_key + recv_window + payload` as lowercase hex.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the secret cannot key the MAC.
    pub fn sign(&self, timestamp: &str, recv_window: &str, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.expose_secret().as_bytes())
            .map_err(|e| ExchangeError::Configuration(format!("invalid API secret: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(recv_window.as_bytes());
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

pub struct BybitClient {
    http: Client,
    base_url: String,
    credentials: Option<BybitCredentials>,
    rate_limiter: Arc<RateLimiter>,
}

impl BybitClient {
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<BybitCredentials>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            rate_limiter,
        })
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        self.rate_limiter.wait_if_needed(endpoint).await;
        let url = format!("{}{endpoint}", self.base_url);
        debug!(endpoint, "GET");
        let response = self.http.get(&url).query(query).send().await?;
        Self::parse(response).await
    }

    fn credentials(&self) -> Result<&BybitCredentials> {
        self.credentials.as_ref().ok_or_else(|| {
            ExchangeError::Configuration("API key and secret required for private endpoints".into())
        })
    }

    /// Private GET. The signed payload is the encoded query string.
    async fn signed_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let credentials = self.credentials()?;
        let mut url = Url::parse(&format!("{}{endpoint}", self.base_url))
            .map_err(|e| ExchangeError::Configuration(format!("invalid URL: {e}")))?;
        url.query_pairs_mut().extend_pairs(query);
        let payload = url.query().unwrap_or_default().to_string();

        self.rate_limiter.wait_if_needed(endpoint).await;
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = credentials.sign(&timestamp, RECV_WINDOW, &payload)?;

        debug!(endpoint, "GET (signed)");
        let response = self
            .http
            .get(url)
            .header("X-BAPI-API-KEY", &credentials.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &impl serde::Serialize,
    ) -> Result<T> {
        let credentials = self.credentials()?;
        let payload = serde_json::to_string(body)?;

        self.rate_limiter.wait_if_needed(endpoint).await;
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = credentials.sign(&timestamp, RECV_WINDOW, &payload)?;

        let url = format!("{}{endpoint}", self.base_url);
        debug!(endpoint, "POST");
        let response = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &credentials.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_secs(response.headers());
            warn!(?retry_after, "Rate limited by exchange");
            return Err(ExchangeError::rate_limit(retry_after));
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::api(status.as_u16(), text));
        }

        // the result shape is only meaningful once retCode says success
        let envelope: ApiResponse<serde_json::Value> = serde_json::from_str(&text)?;
        if envelope.ret_code != 0 {
            return Err(map_ret_code(envelope.ret_code, envelope.ret_msg));
        }
        let result = envelope
            .result
            .ok_or_else(|| ExchangeError::Serialization("response missing result".into()))?;
        Ok(serde_json::from_value(result)?)
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Maps a non-zero `retCode` onto the error taxonomy.
fn map_ret_code(code: i64, message: String) -> ExchangeError {
    match code {
        10006 | 10018 => ExchangeError::rate_limit(None),
        10000 => ExchangeError::Timeout(message),
        10016 => ExchangeError::api(503, message),
        110004 | 110007 | 110012 | 110045 | 110052 => ExchangeError::InsufficientBalance(message),
        10001 | 110003 | 110017 | 110094 => ExchangeError::InvalidOrder(message),
        110072 => ExchangeError::DuplicateOrder(message),
        10003 | 10004 | 10005 | 10007 | 10010 => ExchangeError::Configuration(message),
        _ => ExchangeError::api(200, format!("retCode {code}: {message}")),
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.signed_post("/v5/order/create", request).await
    }

    async fn get_order(&self, symbol: &str, order_link_id: &str) -> Result<Option<OrderInfo>> {
        let result: ListResult<OrderInfo> = self
            .signed_get(
                "/v5/order/realtime",
                &[
                    ("category", "linear"),
                    ("symbol", symbol),
                    ("orderLinkId", order_link_id),
                ],
            )
            .await?;
        Ok(result.list.into_iter().next())
    }

    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentRules> {
        let result: ListResult<InstrumentInfo> = self
            .public_get(
                "/v5/market/instruments-info",
                &[("category", "linear".into()), ("symbol", symbol.into())],
            )
            .await?;
        result
            .list
            .into_iter()
            .next()
            .map(InstrumentRules::from)
            .ok_or_else(|| ExchangeError::InvalidOrder(format!("unknown instrument {symbol}")))
    }

    async fn get_tickers(&self) -> Result<Vec<Ticker>> {
        let result: ListResult<Ticker> = self
            .public_get("/v5/market/tickers", &[("category", "linear".into())])
            .await?;
        Ok(result.list)
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let result: ListResult<Kline> = self
            .public_get(
                "/v5/market/kline",
                &[
                    ("category", "linear".into()),
                    ("symbol", symbol.into()),
                    ("interval", interval.into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(result.list)
    }

    async fn get_funding_rate(&self, symbol: &str, limit: u32) -> Result<Vec<FundingRate>> {
        let result: ListResult<FundingRate> = self
            .public_get(
                "/v5/market/funding/history",
                &[
                    ("category", "linear".into()),
                    ("symbol", symbol.into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(result.list)
    }

    async fn get_open_interest(
        &self,
        symbol: &str,
        interval_time: &str,
        limit: u32,
    ) -> Result<Vec<OpenInterest>> {
        let result: ListResult<OpenInterest> = self
            .public_get(
                "/v5/market/open-interest",
                &[
                    ("category", "linear".into()),
                    ("symbol", symbol.into()),
                    ("intervalTime", interval_time.into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(result.list)
    }
}
