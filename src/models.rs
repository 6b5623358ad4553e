//! Domain and wire types shared across the feeds.
//!
//! Exchange payloads carry numbers as JSON strings; the raw structs here
//! decode them with a local helper and convert into the normalized
//! `CommonTicker` / `AggTrade` forms the trackers consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Normalized per-symbol market snapshot at a moment in time.
#[derive(Debug, Clone)]
pub struct CommonTicker {
    /// The coin and the pairing: ETHBTC, ETH-BTC...
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// The last, or closing price.
    pub last_price: f64,
    /// Volume in the quote pair, usually 24h.
    pub quote_volume: f64,
    /// The 24 hour price change as a percentage value.
    pub price_change_pct_24h: f64,
    pub bid: f64,
    pub ask: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

/// One aggregated trade: one or more fills of the same side against a
/// single order, reported as a single record.
#[derive(Debug, Clone)]
pub struct AggTrade {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub quantity: f64,
    /// price * quantity, in the quote currency.
    pub quote_quantity: f64,
    /// True when the buyer was the taker.
    pub is_buy: bool,
}

fn f64_from_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

fn f64_from_opt_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    // KuCoin reports freshly listed pairs with null fields; zero lets the
    // runner's zero-price filter drop them.
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.is_empty() => s.parse::<f64>().map_err(serde::de::Error::custom),
        _ => Ok(0.0),
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

// =============================================================================
// Binance stream payloads
// =============================================================================

/// Envelope of the Binance combined-stream endpoint. The payload stays a
/// raw value here; the owning stream knows which shape to expect.
#[derive(Debug, Deserialize)]
pub struct BinanceStreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// A single entry of the `!ticker@arr` 24h ticker stream.
#[derive(Debug, Deserialize)]
pub struct BinanceRawTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "c", deserialize_with = "f64_from_str")]
    pub last_price: f64,
    #[serde(rename = "q", deserialize_with = "f64_from_str")]
    pub quote_volume: f64,
    #[serde(rename = "P", deserialize_with = "f64_from_str")]
    pub price_change_pct: f64,
    #[serde(rename = "b", deserialize_with = "f64_from_str")]
    pub bid: f64,
    #[serde(rename = "a", deserialize_with = "f64_from_str")]
    pub ask: f64,
    #[serde(rename = "h", deserialize_with = "f64_from_str")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "f64_from_str")]
    pub low: f64,
}

/// A `<symbol>@aggTrade` stream event.
#[derive(Debug, Deserialize)]
pub struct BinanceRawAggTrade {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p", deserialize_with = "f64_from_str")]
    pub price: f64,
    #[serde(rename = "q", deserialize_with = "f64_from_str")]
    pub quantity: f64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Buyer is the market maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl CommonTicker {
    pub fn from_binance(raw: BinanceRawTicker) -> Self {
        Self {
            symbol: raw.symbol,
            timestamp: millis_to_utc(raw.event_time),
            last_price: raw.last_price,
            quote_volume: raw.quote_volume,
            price_change_pct_24h: raw.price_change_pct,
            bid: raw.bid,
            ask: raw.ask,
            high_24h: raw.high,
            low_24h: raw.low,
        }
    }

    pub fn from_kucoin(raw: KuCoinRawTicker, snapshot_time: i64) -> Self {
        Self {
            symbol: raw.symbol,
            timestamp: millis_to_utc(snapshot_time),
            last_price: raw.last,
            quote_volume: raw.vol_value,
            // KuCoin reports the 24h change as a fraction.
            price_change_pct_24h: raw.change_rate * 100.0,
            bid: raw.buy,
            ask: raw.sell,
            high_24h: raw.high,
            low_24h: raw.low,
        }
    }
}

impl AggTrade {
    pub fn from_binance(raw: BinanceRawAggTrade) -> Self {
        Self {
            quote_quantity: raw.price * raw.quantity,
            symbol: raw.symbol,
            timestamp: millis_to_utc(raw.trade_time),
            price: raw.price,
            quantity: raw.quantity,
            is_buy: !raw.buyer_is_maker,
        }
    }
}

// =============================================================================
// Binance REST payloads
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct BinanceExchangeInfo {
    pub symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct BinanceSymbolInfo {
    pub symbol: String,
    pub status: String,
}

// =============================================================================
// KuCoin REST payloads
// =============================================================================

/// Response of `GET /api/v1/market/allTickers`.
#[derive(Debug, Deserialize)]
pub struct KuCoinAllTickers {
    pub data: KuCoinTickerData,
}

#[derive(Debug, Deserialize)]
pub struct KuCoinTickerData {
    /// Snapshot time in milliseconds, shared by every entry.
    pub time: i64,
    pub ticker: Vec<KuCoinRawTicker>,
}

#[derive(Debug, Deserialize)]
pub struct KuCoinRawTicker {
    pub symbol: String,
    #[serde(default, deserialize_with = "f64_from_opt_str")]
    pub last: f64,
    #[serde(default, deserialize_with = "f64_from_opt_str")]
    pub buy: f64,
    #[serde(default, deserialize_with = "f64_from_opt_str")]
    pub sell: f64,
    #[serde(rename = "changeRate", default, deserialize_with = "f64_from_opt_str")]
    pub change_rate: f64,
    #[serde(default, deserialize_with = "f64_from_opt_str")]
    pub high: f64,
    #[serde(default, deserialize_with = "f64_from_opt_str")]
    pub low: f64,
    #[serde(rename = "volValue", default, deserialize_with = "f64_from_opt_str")]
    pub vol_value: f64,
}

// =============================================================================
// Configuration
// =============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub input_log_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "6035".to_string())
            .parse()
            .unwrap_or(6035);

        let input_log_path = std::env::var("INPUT_LOG_PATH")
            .unwrap_or_else(|_| "./tickscan-inputlog.db".to_string());

        Self {
            port,
            input_log_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_ticker_converts_string_fields() {
        let raw: BinanceRawTicker = serde_json::from_str(
            r#"{
                "e": "24hrTicker", "E": 1700000000000, "s": "BTCUSDT",
                "p": "100.0", "P": "2.5", "c": "42000.5", "q": "123456.78",
                "b": "41999.0", "a": "42001.0", "h": "43000.0", "l": "41000.0",
                "o": "41500.0", "v": "3.0"
            }"#,
        )
        .expect("decode raw ticker");

        let ticker = CommonTicker::from_binance(raw);
        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.last_price, 42000.5);
        assert_eq!(ticker.quote_volume, 123456.78);
        assert_eq!(ticker.price_change_pct_24h, 2.5);
        assert_eq!(ticker.timestamp.timestamp_millis(), 1700000000000);
    }

    #[test]
    fn agg_trade_computes_quote_quantity_and_side() {
        let raw: BinanceRawAggTrade = serde_json::from_str(
            r#"{
                "e": "aggTrade", "E": 1700000000001, "s": "ETHUSDT",
                "a": 12345, "p": "2000.0", "q": "0.5",
                "f": 1, "l": 2, "T": 1700000000000, "m": false, "M": true
            }"#,
        )
        .expect("decode raw trade");

        let trade = AggTrade::from_binance(raw);
        assert_eq!(trade.quote_quantity, 1000.0);
        assert!(trade.is_buy);
    }

    #[test]
    fn kucoin_ticker_scales_change_rate_and_tolerates_nulls() {
        let raw: KuCoinRawTicker = serde_json::from_str(
            r#"{
                "symbol": "BTC-USDT", "last": "42000.5", "buy": "41999.0",
                "sell": "42001.0", "changeRate": "0.0301", "high": "43000.0",
                "low": null, "volValue": "999.5"
            }"#,
        )
        .expect("decode kucoin ticker");

        let ticker = CommonTicker::from_kucoin(raw, 1700000000000);
        assert_eq!(ticker.symbol, "BTC-USDT");
        assert!((ticker.price_change_pct_24h - 3.01).abs() < 1e-9);
        assert_eq!(ticker.low_24h, 0.0);
        assert_eq!(ticker.timestamp.timestamp_millis(), 1700000000000);
    }
}
