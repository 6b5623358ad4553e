//! KuCoin feed runner: replay the logged snapshots, then poll REST once a
//! second and broadcast every tracker each cycle.

use crate::feeds::kucoin::KuCoinTickerStream;
use crate::hub::SubscriberHub;
use crate::input_log::{InputLog, LogStore};
use crate::snapshot::build_update;
use crate::tracker::TrackerRegistry;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

pub struct KuCoinRunner {
    trackers: TrackerRegistry,
    hub: Arc<SubscriberHub>,
    stream: KuCoinTickerStream,
}

impl KuCoinRunner {
    pub fn new(hub: Arc<SubscriberHub>, store: Arc<LogStore>, client: reqwest::Client) -> Self {
        Self {
            trackers: TrackerRegistry::new(),
            hub,
            stream: KuCoinTickerStream::new(client, InputLog::new(store, "kucoin.tickers.list")),
        }
    }

    pub async fn run(mut self) {
        let trackers = &mut self.trackers;
        self.stream.replay(|batch| {
            for ticker in batch {
                let symbol = ticker.symbol.clone();
                if let Some(tracker) = trackers.get_tracker(&symbol) {
                    tracker.update(ticker);
                }
            }
        });

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let tickers = match self.stream.get_tickers().await {
                Ok(tickers) => tickers,
                Err(e) => {
                    error!(error = %e, "failed to get kucoin tickers");
                    continue;
                }
            };

            let now = Utc::now();
            for ticker in tickers {
                // Freshly listed or halted pairs come through with zero
                // price or volume; they carry no signal.
                if ticker.quote_volume == 0.0 || ticker.last_price == 0.0 {
                    continue;
                }
                let symbol = ticker.symbol.clone();
                let Some(tracker) = self.trackers.get_tracker(&symbol) else {
                    continue;
                };
                tracker.update(ticker);
                tracker.recalculate(now);
            }

            let mut out = Vec::new();
            for (_, tracker) in self.trackers.iter() {
                if let Some(update) = build_update(tracker) {
                    out.push(update);
                }
            }

            match serde_json::to_string(&json!({ "tickers": out })) {
                Ok(encoded) => self.hub.broadcast(&encoded),
                Err(e) => error!(error = %e, "failed to serialize kucoin broadcast"),
            }
        }
    }
}
