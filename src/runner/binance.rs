//! Binance feed runner.
//!
//! Startup order matters: the ticker log is replayed into the trackers
//! first, then the live loop starts draining the trade and ticker-batch
//! channels. The trade stream internally replays its own log before
//! forwarding live trades, so replayed history always lands ahead of the
//! live feed.

use crate::feeds::binance::{decode_tickers, TickerStream, TradeStream};
use crate::hub::SubscriberHub;
use crate::input_log::{InputLog, LogStore};
use crate::models::{AggTrade, CommonTicker};
use crate::snapshot::build_update;
use crate::tracker::TrackerRegistry;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct BinanceRunner {
    trackers: TrackerRegistry,
    hub: Arc<SubscriberHub>,
    ticker_log: InputLog,
    trade_log: InputLog,
    client: reqwest::Client,
}

impl BinanceRunner {
    pub fn new(hub: Arc<SubscriberHub>, store: Arc<LogStore>, client: reqwest::Client) -> Self {
        Self {
            trackers: TrackerRegistry::new(),
            hub,
            ticker_log: InputLog::new(store.clone(), "binance"),
            trade_log: InputLog::new(store, "binance.trades"),
            client,
        }
    }

    pub async fn run(mut self) {
        let (ticker_tx, mut ticker_rx) = mpsc::channel::<Vec<CommonTicker>>(32);
        tokio::spawn(TickerStream::new(self.ticker_log.clone()).run(ticker_tx));

        let (trade_tx, mut trade_rx) = mpsc::channel::<AggTrade>(1024);
        tokio::spawn(TradeStream::new(self.trade_log.clone(), self.client.clone()).run(trade_tx));

        self.replay_ticker_log();

        let mut last_snapshot = Utc::now();
        let mut trade_count: u64 = 0;
        let mut last_trade_time = DateTime::<Utc>::default();

        loop {
            let loop_start = Instant::now();
            tokio::select! {
                trade = trade_rx.recv() => {
                    let Some(trade) = trade else {
                        error!("binance trade channel closed");
                        break;
                    };
                    if trade.timestamp > last_trade_time {
                        last_trade_time = trade.timestamp;
                    }
                    trade_count += 1;
                    self.handle_trade(trade);
                }
                batch = ticker_rx.recv() => {
                    let Some(tickers) = batch else {
                        error!("binance ticker channel closed");
                        break;
                    };
                    let wait = loop_start.elapsed();
                    if tickers.is_empty() {
                        continue;
                    }

                    let mut last_server_time = DateTime::<Utc>::default();
                    for ticker in &tickers {
                        if ticker.timestamp > last_server_time {
                            last_server_time = ticker.timestamp;
                        }
                    }

                    self.apply_ticker_batch(tickers, true);
                    self.emit_snapshots(last_snapshot);
                    self.ticker_log.prune();

                    let now = Utc::now();
                    last_snapshot = now;
                    let processing = loop_start.elapsed().saturating_sub(wait);
                    info!(
                        wait_ms = wait.as_millis() as u64,
                        processing_ms = processing.as_millis() as u64,
                        lag_ms = (now - last_server_time).num_milliseconds(),
                        trades = trade_count,
                        trade_lag_ms = (now - last_trade_time).num_milliseconds(),
                        "binance batch processed"
                    );
                    trade_count = 0;
                }
            }
        }
    }

    fn handle_trade(&mut self, trade: AggTrade) {
        let symbol = trade.symbol.clone();
        if let Some(tracker) = self.trackers.get_tracker(&symbol) {
            tracker.add_trade(trade);
        }
    }

    fn apply_ticker_batch(&mut self, tickers: Vec<CommonTicker>, recalculate: bool) {
        let now = Utc::now();
        for ticker in tickers {
            let symbol = ticker.symbol.clone();
            let Some(tracker) = self.trackers.get_tracker(&symbol) else {
                continue;
            };
            tracker.update(ticker);
            if recalculate {
                tracker.recalculate(now);
            }
        }
    }

    /// Broadcast one batch snapshot covering every tracker touched since
    /// the previous one, plus a per-symbol update to each symbol's
    /// subscribers.
    fn emit_snapshots(&self, last_snapshot: DateTime<Utc>) {
        let mut message = Vec::new();
        for (symbol, tracker) in self.trackers.iter() {
            if tracker.last_update < last_snapshot {
                continue;
            }
            let Some(update) = build_update(tracker) else {
                continue;
            };
            self.hub.publish(symbol, &update);
            message.push(update);
        }

        match serde_json::to_string(&json!({ "tickers": message })) {
            Ok(encoded) => self.hub.broadcast(&encoded),
            Err(e) => error!(error = %e, "failed to serialize broadcast message"),
        }
    }

    /// Replay the ticker log into the trackers without recalculating.
    /// Entries older than an hour are skipped here; retention is handled
    /// by the live loop's prune.
    fn replay_ticker_log(&mut self) {
        info!("binance ticker log replay start");
        let start = Instant::now();
        let mut restored = 0u64;
        let mut skipped = 0u64;

        let mut index = 0i64;
        loop {
            let entry = match self.ticker_log.at(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(index, error = %e, "failed to load ticker log entry");
                    break;
                }
            };
            index += 1;

            if Utc::now().timestamp() - entry.timestamp > 3600 {
                skipped += 1;
                continue;
            }

            let tickers = match decode_tickers(&entry.message) {
                Ok(tickers) => tickers,
                Err(e) => {
                    error!(error = %e, "failed to decode logged tickers");
                    continue;
                }
            };
            if tickers.is_empty() {
                warn!("decoded zero tickers from log entry");
                continue;
            }

            self.apply_ticker_batch(tickers, false);
            restored += 1;
        }

        info!(
            restored,
            skipped,
            duration_ms = start.elapsed().as_millis() as u64,
            "binance ticker log replay done"
        );
    }
}
