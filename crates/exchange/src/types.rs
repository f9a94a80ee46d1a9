//! Wire types for the Bybit v5 linear-futures API.

use cryptobot_core::Side;
use rust_decimal::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};

/// Response envelope shared by every endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

/// Bybit reports missing prices as empty strings.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => Decimal::from_str(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

/// Body of `POST /v5/order/create`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub category: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Client order id, echoed back by the exchange.
    pub order_link_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpsl_mode: Option<String>,
    pub reduce_only: bool,
}

impl OrderRequest {
    /// A linear market order with attached full-size stop and target.
    #[must_use]
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        qty: Decimal,
        order_link_id: impl Into<String>,
    ) -> Self {
        Self {
            category: "linear".to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            order_link_id: order_link_id.into(),
            stop_loss: None,
            take_profit: None,
            tpsl_mode: None,
            reduce_only: false,
        }
    }

    #[must_use]
    pub fn with_protection(mut self, stop_loss: Decimal, take_profit: Decimal) -> Self {
        if stop_loss > Decimal::ZERO {
            self.stop_loss = Some(stop_loss);
        }
        if take_profit > Decimal::ZERO {
            self.take_profit = Some(take_profit);
        }
        if self.stop_loss.is_some() || self.take_profit.is_some() {
            self.tpsl_mode = Some("Full".to_string());
        }
        self
    }
}

/// Result of `POST /v5/order/create`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

/// One row of `GET /v5/order/realtime`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    /// `New`, `PartiallyFilled`, `Filled`, `Cancelled`, `Rejected`, ...
    pub order_status: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub cum_exec_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub cum_exec_fee: Option<Decimal>,
}

impl OrderInfo {
    #[must_use]
    pub fn executed_quantity(&self) -> Decimal {
        self.cum_exec_qty.unwrap_or(Decimal::ZERO)
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.order_status == "Filled"
    }

    /// The exchange will not execute any more of this order.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self.order_status.as_str(),
            "Filled" | "Cancelled" | "Rejected" | "Deactivated"
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub bid1_price: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub ask1_price: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub high_price_24h: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub low_price_24h: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub volume_24h: Option<Decimal>,
    /// Fractional 24h change, e.g. `0.0123` for +1.23%.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub price_24h_pcnt: Option<Decimal>,
}

/// One candle. Bybit sends `[start, open, high, low, close, volume, turnover]`
/// as strings, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kline {
    pub start_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub turnover: Decimal,
}

impl<'de> Deserialize<'de> for Kline {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let raw: Vec<String> = Vec::deserialize(deserializer)?;
        if raw.len() < 7 {
            return Err(D::Error::invalid_length(raw.len(), &"7 kline fields"));
        }
        let dec = |i: usize| Decimal::from_str(&raw[i]).map_err(D::Error::custom);
        Ok(Self {
            start_time: raw[0].parse().map_err(D::Error::custom)?,
            open: dec(1)?,
            high: dec(2)?,
            low: dec(3)?,
            close: dec(4)?,
            volume: dec(5)?,
            turnover: dec(6)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FundingRate {
    pub symbol: String,
    pub funding_rate: Decimal,
    pub funding_rate_timestamp: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterest {
    pub open_interest: Decimal,
    pub timestamp: String,
}

/// Tick and lot constraints of a tradable contract.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_order_qty: Decimal,
    pub max_order_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
}

impl InstrumentRules {
    /// Floors to the lot step so rounding never increases exposure.
    #[must_use]
    pub fn round_quantity(&self, qty: Decimal) -> Decimal {
        if self.qty_step <= Decimal::ZERO {
            return qty;
        }
        ((qty / self.qty_step).floor() * self.qty_step).normalize()
    }

    #[must_use]
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        ((price / self.tick_size).round() * self.tick_size).normalize()
    }

    /// Reason the rounded quantity is not tradable, if any.
    #[must_use]
    pub fn quantity_violation(&self, qty: Decimal, price: Decimal) -> Option<String> {
        if qty < self.min_order_qty {
            return Some(format!(
                "Quantity {qty} below minimum {} for {}",
                self.min_order_qty, self.symbol
            ));
        }
        if let Some(max) = self.max_order_qty {
            if qty > max {
                return Some(format!("Quantity {qty} above maximum {max} for {}", self.symbol));
            }
        }
        if let Some(min_notional) = self.min_notional {
            if qty * price < min_notional {
                return Some(format!(
                    "Notional {} below minimum {min_notional} for {}",
                    qty * price,
                    self.symbol
                ));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstrumentInfo {
    pub symbol: String,
    pub price_filter: PriceFilter,
    pub lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PriceFilter {
    pub tick_size: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LotSizeFilter {
    pub qty_step: Decimal,
    pub min_order_qty: Decimal,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub max_order_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub min_notional_value: Option<Decimal>,
}

impl From<InstrumentInfo> for InstrumentRules {
    fn from(info: InstrumentInfo) -> Self {
        Self {
            symbol: info.symbol,
            tick_size: info.price_filter.tick_size,
            qty_step: info.lot_size_filter.qty_step,
            min_order_qty: info.lot_size_filter.min_order_qty,
            max_order_qty: info.lot_size_filter.max_order_qty,
            min_notional: info.lot_size_filter.min_notional_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_rules() -> InstrumentRules {
        InstrumentRules {
            symbol: "BTCUSDT".to_string(),
            tick_size: dec!(0.1),
            qty_step: dec!(0.001),
            min_order_qty: dec!(0.001),
            max_order_qty: Some(dec!(100)),
            min_notional: Some(dec!(5)),
        }
    }

    #[test]
    fn test_quantity_rounds_down_to_step() {
        let rules = btc_rules();
        assert_eq!(rules.round_quantity(dec!(0.0190476)), dec!(0.019));
        assert_eq!(rules.round_quantity(dec!(0.0009)), dec!(0));
        assert_eq!(rules.round_price(dec!(50000.04)), dec!(50000));
        assert_eq!(rules.round_price(dec!(50000.06)), dec!(50000.1));
    }

    #[test]
    fn test_quantity_violations() {
        let rules = btc_rules();
        assert!(rules.quantity_violation(dec!(0.019), dec!(50000)).is_none());
        assert!(rules.quantity_violation(dec!(0), dec!(50000)).is_some());
        assert!(rules.quantity_violation(dec!(101), dec!(50000)).is_some());
        assert!(rules.quantity_violation(dec!(0.001), dec!(1000)).is_some());
    }

    #[test]
    fn test_order_request_wire_format() {
        let req = OrderRequest::market("BTCUSDT", Side::Buy, dec!(0.019), "ORDER_abc")
            .with_protection(dec!(49000), dec!(52000));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["category"], "linear");
        assert_eq!(json["side"], "Buy");
        assert_eq!(json["orderType"], "Market");
        assert_eq!(json["qty"], "0.019");
        assert_eq!(json["orderLinkId"], "ORDER_abc");
        assert_eq!(json["stopLoss"], "49000");
        assert_eq!(json["tpslMode"], "Full");
        assert!(json.get("price").is_none());
    }

    #[test]
    fn test_ticker_tolerates_empty_prices() {
        let json = r#"{"symbol":"BTCUSDT","lastPrice":"50000.5","bid1Price":"","ask1Price":"50001","volume24h":"1234.5"}"#;
        let ticker: Ticker = serde_json::from_str(json).unwrap();
        assert_eq!(ticker.last_price, dec!(50000.5));
        assert_eq!(ticker.bid1_price, None);
        assert_eq!(ticker.ask1_price, Some(dec!(50001)));
        assert_eq!(ticker.high_price_24h, None);
    }

    #[test]
    fn test_order_info_from_realtime_row() {
        let json = r#"{"orderId":"1321003749386327552","orderLinkId":"ORD-1","symbol":"BTCUSDT","orderStatus":"Filled","avgPrice":"50010.5","cumExecQty":"0.019","cumExecFee":"0.5701"}"#;
        let info: OrderInfo = serde_json::from_str(json).unwrap();
        assert!(info.is_filled());
        assert!(info.is_closed());
        assert_eq!(info.avg_price, Some(dec!(50010.5)));
        assert_eq!(info.executed_quantity(), dec!(0.019));

        let json = r#"{"orderId":"1","symbol":"BTCUSDT","orderStatus":"New","avgPrice":"","cumExecQty":"0","cumExecFee":"0"}"#;
        let pending: OrderInfo = serde_json::from_str(json).unwrap();
        assert!(!pending.is_closed());
        assert_eq!(pending.avg_price, None);
        assert_eq!(pending.executed_quantity(), Decimal::ZERO);
    }

    #[test]
    fn test_kline_from_string_array() {
        let json = r#"["1700000000000","50000","50100","49900","50050","12.5","625000"]"#;
        let kline: Kline = serde_json::from_str(json).unwrap();
        assert_eq!(kline.start_time, 1_700_000_000_000);
        assert_eq!(kline.close, dec!(50050));
        assert!(serde_json::from_str::<Kline>(r#"["1","2"]"#).is_err());
    }
}
