//! KuCoin ticker source.
//!
//! KuCoin has no public all-market ticker websocket, so the runner polls
//! the REST allTickers snapshot. Every raw response body is appended to
//! the input log so a restart can replay the last hour.

use crate::input_log::InputLog;
use crate::models::{CommonTicker, KuCoinAllTickers};
use anyhow::{Context, Result};
use tracing::{error, info};

const KUCOIN_API_URL: &str = "https://api.kucoin.com";

pub struct KuCoinTickerStream {
    client: reqwest::Client,
    log: InputLog,
}

impl KuCoinTickerStream {
    pub fn new(client: reqwest::Client, log: InputLog) -> Self {
        Self { client, log }
    }

    /// One snapshot of every KuCoin market, logged and trimmed as a side
    /// effect.
    pub async fn get_tickers(&self) -> Result<Vec<CommonTicker>> {
        let body = self
            .client
            .get(format!("{KUCOIN_API_URL}/api/v1/market/allTickers"))
            .send()
            .await
            .context("allTickers request failed")?
            .error_for_status()
            .context("allTickers returned an error status")?
            .text()
            .await
            .context("allTickers body read failed")?;

        self.log.append(&body);
        self.log.prune();

        decode_tickers(&body)
    }

    /// Feed every logged snapshot to `apply`, oldest first.
    pub fn replay(&self, mut apply: impl FnMut(Vec<CommonTicker>)) {
        info!("kucoin ticker log replay start");
        let mut index = 0i64;
        loop {
            let entry = match self.log.at(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(index, error = %e, "failed to read kucoin log entry");
                    break;
                }
            };
            index += 1;
            match decode_tickers(&entry.message) {
                Ok(tickers) => apply(tickers),
                Err(e) => error!(error = %e, "failed to decode kucoin log entry"),
            }
        }
        info!(entries = index, "kucoin ticker log replay done");
    }
}

pub fn decode_tickers(body: &str) -> Result<Vec<CommonTicker>> {
    let response: KuCoinAllTickers =
        serde_json::from_str(body).context("bad allTickers payload")?;
    let time = response.data.time;
    Ok(response
        .data
        .ticker
        .into_iter()
        .map(|raw| CommonTicker::from_kucoin(raw, time))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_log::LogStore;

    const ALL_TICKERS: &str = r#"{
        "code": "200000",
        "data": {
            "time": 1700000000000,
            "ticker": [
                {
                    "symbol": "BTC-USDT", "last": "42000.5", "buy": "41999.0",
                    "sell": "42001.0", "changeRate": "0.02", "high": "43000.0",
                    "low": "41000.0", "volValue": "1000.0"
                },
                {
                    "symbol": "NEW-USDT", "last": "0", "buy": null,
                    "sell": null, "changeRate": null, "high": null,
                    "low": null, "volValue": "0"
                }
            ]
        }
    }"#;

    #[test]
    fn decodes_the_all_tickers_snapshot() {
        let tickers = decode_tickers(ALL_TICKERS).expect("decode");
        assert_eq!(tickers.len(), 2);
        assert_eq!(tickers[0].symbol, "BTC-USDT");
        assert_eq!(tickers[0].timestamp.timestamp_millis(), 1700000000000);
        assert!((tickers[0].price_change_pct_24h - 2.0).abs() < 1e-9);
        // Zero-priced listings survive decoding; the runner filters them.
        assert_eq!(tickers[1].last_price, 0.0);
    }

    #[test]
    fn replay_applies_logged_snapshots_in_order() {
        let store = LogStore::open(":memory:").expect("open store");
        let log = InputLog::new(store, "kucoin.tickers.list");
        log.append(ALL_TICKERS);
        log.append("corrupt entry");
        log.append(&ALL_TICKERS.replace("BTC-USDT", "ETH-USDT"));

        let stream = KuCoinTickerStream::new(reqwest::Client::new(), log);
        let mut seen = Vec::new();
        stream.replay(|batch| seen.push(batch[0].symbol.clone()));

        assert_eq!(seen, ["BTC-USDT", "ETH-USDT"]);
    }
}
