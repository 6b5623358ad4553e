//! Per-symbol sliding-window analytics.
//!
//! A `TickerTracker` keeps roughly one hour of ticks and trades for one
//! symbol and computes bucketed metrics on demand: price/volume change,
//! high/low/range per minute bucket, and VWAP / volume aggregates from the
//! trade window. All trackers are owned by a single runner task; there is
//! no internal locking.

use crate::models::{AggTrade, CommonTicker};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::error;

/// Minute buckets metrics are computed for.
pub const BUCKETS: [i64; 8] = [1, 2, 3, 4, 5, 10, 15, 60];

/// Ticks older than this fall off the front of the window.
fn tick_window() -> Duration {
    Duration::seconds(60 * 60 + 1)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickerMetrics {
    // Computed from ticks alone.
    pub price_change_pct: f64,
    pub volume_change_pct: f64,
    pub high: f64,
    pub low: f64,
    pub range: f64,
    pub range_pct: f64,

    // Require trades.
    pub vwap: f64,
    pub total_volume: f64,
    pub net_volume: f64,
    pub buy_volume: f64,
}

#[derive(Debug)]
pub struct TickerTracker {
    pub symbol: String,
    pub ticks: VecDeque<CommonTicker>,
    pub trades: VecDeque<AggTrade>,
    pub metrics: HashMap<i64, TickerMetrics>,
    pub h24_metrics: TickerMetrics,
    pub last_update: DateTime<Utc>,

    pub have_vwap: bool,
    pub have_total_volume: bool,
    pub have_net_volume: bool,
}

impl TickerTracker {
    pub fn new(symbol: &str) -> Self {
        let mut metrics = HashMap::with_capacity(BUCKETS.len());
        for bucket in BUCKETS {
            metrics.insert(bucket, TickerMetrics::default());
        }
        Self {
            symbol: symbol.to_string(),
            ticks: VecDeque::new(),
            trades: VecDeque::new(),
            metrics,
            h24_metrics: TickerMetrics::default(),
            last_update: DateTime::<Utc>::default(),
            have_vwap: false,
            have_total_volume: false,
            have_net_volume: false,
        }
    }

    pub fn last_tick(&self) -> Option<&CommonTicker> {
        self.ticks.back()
    }

    /// Append a tick and trim the head of the window relative to the new
    /// tick's own timestamp. Does not recompute metrics.
    pub fn update(&mut self, ticker: CommonTicker) {
        self.last_update = Utc::now();
        let now = ticker.timestamp;
        self.ticks.push_back(ticker);
        while let Some(first) = self.ticks.front() {
            if now - first.timestamp > tick_window() {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn add_trade(&mut self, trade: AggTrade) {
        if trade.symbol.is_empty() {
            error!("not adding trade with empty symbol");
            return;
        }

        if let Some(last) = self.trades.back() {
            if trade.timestamp < last.timestamp {
                error!(
                    symbol = %self.symbol,
                    "received trade older than previous trade"
                );
            }
        }

        self.trades.push_back(trade);
    }

    /// Recompute every bucketed metric from the current windows. Needs at
    /// least two ticks. Idempotent for the same windows and `now`.
    pub fn recalculate(&mut self, now: DateTime<Utc>) {
        if self.ticks.len() < 2 {
            return;
        }
        let Some(last_tick) = self.ticks.back().cloned() else {
            return;
        };

        for bucket in BUCKETS {
            if let Some(metrics) = self.metrics.get_mut(&bucket) {
                metrics.high = 0.0;
                metrics.low = 0.0;
            }
        }

        // Rolling high/low, newest to oldest. Each visited bucket gets the
        // extrema over every tick at least as new as its own.
        let count = self.ticks.len();
        let mut high = 0.0;
        let mut low = 0.0;
        for i in (0..count).rev() {
            let tick = &self.ticks[i];
            let bucket = bucket_for(now, tick.timestamp);

            if i == count - 1 {
                high = tick.last_price;
                low = tick.last_price;
            } else {
                if tick.last_price < low {
                    low = tick.last_price;
                }
                if tick.last_price > high {
                    high = tick.last_price;
                }
            }

            let Some(metrics) = self.metrics.get_mut(&bucket) else {
                continue;
            };
            metrics.high = high;
            metrics.low = low;
            metrics.range = round8(high - low);
            metrics.range_pct = round3(metrics.range / low * 100.0);
        }

        self.h24_metrics.high = last_tick.high_24h;
        self.h24_metrics.low = last_tick.low_24h;
        self.h24_metrics.range = round8(last_tick.high_24h - last_tick.low_24h);
        self.h24_metrics.range_pct =
            round3(self.h24_metrics.range / last_tick.low_24h * 100.0);

        // Change percentages, oldest to newest. Only the oldest tick of
        // each bucket contributes; once a bucket is filled, everything
        // newer than the next smaller bucket is skipped.
        let mut next_bucket = 0;
        let mut max_bucket = 0;
        for i in 0..count {
            let tick = &self.ticks[i];
            let bucket = bucket_for(now, tick.timestamp);

            if i == 0 {
                next_bucket = bucket;
                max_bucket = bucket;
            } else if bucket > next_bucket {
                continue;
            }

            let price = tick.last_price;
            let volume = tick.quote_volume;
            let Some(metrics) = self.metrics.get_mut(&bucket) else {
                continue;
            };
            metrics.price_change_pct =
                round3((last_tick.last_price - price) / price * 100.0);
            metrics.volume_change_pct =
                round3((last_tick.quote_volume - volume) / volume * 100.0);

            next_bucket = bucket - 1;
        }

        // Carry change percentages forward into buckets beyond the oldest
        // tick. Note: the volume carry seeds from the price change percent.
        let mut previous_price = self
            .metrics
            .get(&BUCKETS[0])
            .map(|m| m.price_change_pct)
            .unwrap_or_default();
        let mut previous_volume = previous_price;
        for &bucket in &BUCKETS[1..] {
            if max_bucket < bucket {
                if let Some(metrics) = self.metrics.get_mut(&bucket) {
                    metrics.price_change_pct = previous_price;
                    metrics.volume_change_pct = previous_volume;
                }
            }
            if let Some(metrics) = self.metrics.get(&bucket) {
                previous_price = metrics.price_change_pct;
                previous_volume = metrics.volume_change_pct;
            }
        }

        // Trade-dependent metrics: walk newest to oldest keeping running
        // accumulators, so smaller buckets converge to the recent
        // aggregate first.
        if !self.trades.is_empty() {
            self.have_net_volume = true;
            self.have_total_volume = true;
            self.have_vwap = true;

            let mut vwap_price = 0.0;
            let mut vwap_volume = 0.0;
            let mut buy_volume = 0.0;
            let mut sell_volume = 0.0;

            for i in (0..self.trades.len()).rev() {
                let trade = &self.trades[i];
                let age = now - trade.timestamp;

                if trade.is_buy {
                    buy_volume += trade.quote_quantity;
                } else {
                    sell_volume += trade.quote_quantity;
                }

                vwap_volume += trade.quantity;
                vwap_price += trade.quantity * trade.price;
                let vwap = vwap_price / vwap_volume;

                let total_volume = buy_volume + sell_volume;
                let net_volume = buy_volume - sell_volume;

                for &bucket in &BUCKETS {
                    if age <= Duration::seconds(bucket * 60) {
                        if let Some(metrics) = self.metrics.get_mut(&bucket) {
                            metrics.net_volume = net_volume;
                            metrics.total_volume = total_volume;
                            metrics.buy_volume = buy_volume;
                            metrics.vwap = vwap;
                        }
                    }
                }
            }
        }

        self.prune_trades(now);
    }

    /// Drop the leading run of trades aged one hour or more.
    pub fn prune_trades(&mut self, now: DateTime<Utc>) {
        let mut chop = 0;
        for (i, trade) in self.trades.iter().enumerate() {
            if now - trade.timestamp < Duration::hours(1) {
                break;
            }
            chop = i + 1;
        }
        if chop > 0 {
            self.trades.drain(..chop);
        }
    }
}

/// Minute bucket for a tick of the given age: the newest minute is bucket
/// 1. Ticks from the future clamp into bucket 1 as well.
fn bucket_for(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> i64 {
    let age_secs = (now - timestamp).num_seconds().max(0);
    ((age_secs - 1) / 60) + 1
}

pub fn round8(val: f64) -> f64 {
    let out = (val * 100_000_000.0).round() / 100_000_000.0;
    if !out.is_finite() {
        error!("round8 output value is not finite");
        return 0.0;
    }
    out
}

pub fn round3(val: f64) -> f64 {
    let out = (val * 1000.0).round() / 1000.0;
    if !out.is_finite() {
        error!("round3 output value is not finite");
        return 0.0;
    }
    out
}

/// Lazily-created map from symbol to its tracker. Owned and mutated by a
/// single feed runner task.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: HashMap<String, TickerTracker>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing tracker, or a zeroed one with metrics pre-initialized for
    /// every bucket. The empty symbol is rejected.
    pub fn get_tracker(&mut self, symbol: &str) -> Option<&mut TickerTracker> {
        if symbol.is_empty() {
            error!("get_tracker called with empty symbol");
            return None;
        }
        Some(
            self.trackers
                .entry(symbol.to_string())
                .or_insert_with(|| TickerTracker::new(symbol)),
        )
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TickerTracker)> {
        self.trackers.iter()
    }
}
