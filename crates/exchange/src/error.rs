//! Error taxonomy for exchange access.
//!
//! Every failure is classified as either transient (worth retrying after a
//! delay) or fatal (business rejection or programming error). The retry
//! handler only ever looks at that classification.

use std::time::Duration;
use thiserror::Error;

/// How a failed attempt should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try again; `retry_after` is the server's own hint, if it gave one.
    Retryable { retry_after: Option<Duration> },
    /// Propagate immediately.
    Fatal,
}

impl Disposition {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Errors that can occur when talking to the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Connection failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// Request timeout.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimit {
        /// Seconds to wait before retry, when the exchange says.
        retry_after_secs: Option<u64>,
    },

    /// API request failed.
    #[error("API error: {status_code} - {message}")]
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Error message from API.
        message: String,
    },

    /// Invalid order parameters.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Insufficient balance.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The client order id was already used; the earlier attempt reached
    /// the exchange.
    #[error("order already exists: {0}")]
    DuplicateOrder(String),

    /// Missing credentials or bad client setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExchangeError {
    /// Creates an API error from status code and message.
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status_code,
            message: message.into(),
        }
    }

    /// Creates a rate limit error.
    #[must_use]
    pub const fn rate_limit(retry_after_secs: Option<u64>) -> Self {
        Self::RateLimit { retry_after_secs }
    }

    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::RateLimit { retry_after_secs } => Disposition::Retryable {
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            Self::Network(_) | Self::Timeout(_) => Disposition::Retryable { retry_after: None },
            Self::Api { status_code, .. } if *status_code >= 500 => {
                Disposition::Retryable { retry_after: None }
            }
            _ => Disposition::Fatal,
        }
    }

    /// Returns true if the error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.disposition().is_retryable()
    }

    /// Returns the server-suggested retry delay, if any.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        match self.disposition() {
            Disposition::Retryable { retry_after } => retry_after,
            Disposition::Fatal => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            Self::api(status.as_u16(), err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;
