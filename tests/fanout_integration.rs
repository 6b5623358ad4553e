//! Integration tests for the tracker -> snapshot -> hub pipeline using
//! only the public API, the way the feed runners drive it.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tickscan::hub::SubscriberHub;
use tickscan::models::{AggTrade, CommonTicker};
use tickscan::snapshot::build_update;
use tickscan::tracker::TrackerRegistry;

fn tick(symbol: &str, age_secs: i64, price: f64, volume: f64) -> CommonTicker {
    CommonTicker {
        symbol: symbol.to_string(),
        timestamp: Utc::now() - Duration::seconds(age_secs),
        last_price: price,
        quote_volume: volume,
        price_change_pct_24h: 0.5,
        bid: price - 1.0,
        ask: price + 1.0,
        high_24h: price * 1.1,
        low_24h: price * 0.9,
    }
}

#[tokio::test]
async fn snapshots_flow_from_trackers_to_all_clients_in_order() {
    let mut registry = TrackerRegistry::new();
    let hub = Arc::new(SubscriberHub::new("test"));

    let (_id_a, mut rx_a) = hub.add_client();
    let (_id_b, mut rx_b) = hub.add_client();

    // Two snapshot rounds, the way a runner emits them.
    for (round, price) in [(1u64, 100.0), (2, 101.0)] {
        let now = Utc::now();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            let tracker = registry.get_tracker(symbol).expect("valid symbol");
            tracker.update(tick(symbol, 60, price - 1.0, 900.0));
            tracker.update(tick(symbol, 0, price, 1000.0));
            tracker.recalculate(now);
        }

        let mut updates = Vec::new();
        for (_, tracker) in registry.iter() {
            updates.push(build_update(tracker).expect("tracker has ticks"));
        }
        let message =
            serde_json::to_string(&json!({ "round": round, "tickers": updates })).unwrap();
        hub.broadcast(&message);
    }

    for rx in [&mut rx_a, &mut rx_b] {
        let mut rounds = Vec::new();
        for _ in 0..2 {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            rounds.push(frame["round"].as_u64().unwrap());
            let tickers = frame["tickers"].as_array().unwrap();
            assert_eq!(tickers.len(), 2);
            for update in tickers {
                let obj = update.as_object().unwrap();
                assert!(obj.contains_key("symbol"));
                assert!(obj.contains_key("close"));
                assert!(obj.contains_key("price_change_pct"));
                assert!(obj.contains_key("l_1"));
                assert!(obj.contains_key("rp_60"));
            }
        }
        // Same frames, same order, for every client.
        assert_eq!(rounds, [1, 2]);
    }
}

#[tokio::test]
async fn symbol_subscribers_see_only_their_symbol() {
    let mut registry = TrackerRegistry::new();
    let hub = Arc::new(SubscriberHub::new("test"));

    let (id, mut rx) = hub.subscribe("ETHUSDT");

    let now = Utc::now();
    for symbol in ["BTCUSDT", "ETHUSDT"] {
        let tracker = registry.get_tracker(symbol).expect("valid symbol");
        tracker.update(tick(symbol, 30, 99.0, 900.0));
        tracker.update(tick(symbol, 0, 100.0, 1000.0));
        tracker.recalculate(now);
        tracker.add_trade(AggTrade {
            symbol: symbol.to_string(),
            timestamp: now,
            price: 100.0,
            quantity: 1.0,
            quote_quantity: 100.0,
            is_buy: true,
        });
        tracker.recalculate(now);
    }

    for (symbol, tracker) in registry.iter() {
        let update = build_update(tracker).expect("tracker has ticks");
        hub.publish(symbol, &update);
    }

    let update = rx.recv().await.unwrap();
    assert_eq!(update["symbol"], "ETHUSDT");
    // Trades have been seen, so the vwap family is present.
    assert!(update.as_object().unwrap().contains_key("vwap_1m"));
    assert!(rx.try_recv().is_err());

    hub.unsubscribe("ETHUSDT", id);
}
