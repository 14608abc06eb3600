use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

/// A JSON array field that the venue sometimes sends string-wrapped and
/// sometimes native. Deserializes either shape into `Vec<String>`;
/// callers that need numeric values parse the strings themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlexArray(pub Vec<String>);

impl<'de> serde::Deserialize<'de> for FlexArray {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(FlexArray(flex_array_from_value(&value).unwrap_or_default()))
    }
}

/// Accepts either a native JSON array or a string containing a JSON array,
/// returning `None` on malformed input so callers can skip-and-log rather
/// than raise.
pub fn flex_array_from_value(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            flex_array_from_value(&parsed)
        }
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

/// Parses a millisecond-since-epoch string into a UTC timestamp.
pub fn parse_millis_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let ms: i64 = s.parse().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

/// Raw market-discovery payload as returned by Gamma/CLOB-style endpoints.
/// camelCase on the wire; converted to snake_case `Market` rows by the
/// collectors, never by anything downstream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMarket {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "conditionId")]
    pub condition_id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default, rename = "outcomes")]
    pub outcomes: FlexArray,
    #[serde(default, rename = "outcomePrices")]
    pub outcome_prices: FlexArray,
    #[serde(default, rename = "clobTokenIds")]
    pub clob_token_ids: FlexArray,
    #[serde(default, rename = "negRisk")]
    pub neg_risk: Option<bool>,
    #[serde(default, rename = "tickSize")]
    pub tick_size: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default, rename = "acceptingOrders")]
    pub accepting_orders: Option<bool>,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub liquidity: Option<String>,
    #[serde(default, rename = "eventId")]
    pub event_id: Option<String>,
}

/// One price/size level pair as returned by an order-book endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBookLevel {
    pub price: String,
    pub size: String,
}

/// Raw order book for a single token, one side only; callers fetch both
/// sides and pair them by `token_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrderbook {
    #[serde(rename = "asset_id", alias = "tokenId")]
    pub token_id: String,
    #[serde(default)]
    pub bids: Vec<RawBookLevel>,
    #[serde(default)]
    pub asks: Vec<RawBookLevel>,
}

/// Raw trade event off the websocket feed. Numeric fields and the timestamp
/// arrive as strings; there is never a `trade_id` on this feed.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "asset_id", alias = "token_id")]
    pub token_id: String,
    pub side: String,
    pub price: String,
    pub size: String,
    pub timestamp: String,
}

impl RawMarket {
    /// Parses `outcome_prices` as floats, tolerating malformed individual
    /// entries by dropping them rather than failing the whole parse.
    pub fn outcome_prices_f64(&self) -> Vec<f64> {
        self.outcome_prices
            .0
            .iter()
            .filter_map(|s| s.parse::<f64>().ok())
            .collect()
    }

    pub fn tick_size_f64(&self) -> f64 {
        self.tick_size
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.01)
    }

    pub fn volume_f64(&self) -> Option<f64> {
        self.volume.as_deref().and_then(|s| s.parse::<f64>().ok())
    }

    pub fn liquidity_f64(&self) -> Option<f64> {
        self.liquidity.as_deref().and_then(|s| s.parse::<f64>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flex_array_parses_stringified_json() {
        let v = Value::String(r#"["Yes","No"]"#.to_string());
        assert_eq!(
            flex_array_from_value(&v),
            Some(vec!["Yes".to_string(), "No".to_string()])
        );
    }

    #[test]
    fn flex_array_parses_native_array() {
        let v = serde_json::json!(["tA", "tB"]);
        assert_eq!(
            flex_array_from_value(&v),
            Some(vec!["tA".to_string(), "tB".to_string()])
        );
    }

    #[test]
    fn flex_array_rejects_truncated_json() {
        let v = Value::String(r#"["1", "0""#.to_string());
        assert_eq!(flex_array_from_value(&v), None);
    }

    #[test]
    fn parses_millis_timestamp() {
        let dt = parse_millis_timestamp("1700000000000").unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }
}
