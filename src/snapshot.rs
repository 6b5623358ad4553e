//! Builds the flat per-symbol update map pushed to websocket clients.

use crate::tracker::{round8, TickerMetrics, TickerTracker, BUCKETS};
use serde_json::{json, Map, Value};

fn metrics_at(tracker: &TickerTracker, bucket: i64) -> TickerMetrics {
    tracker.metrics.get(&bucket).copied().unwrap_or_default()
}

/// Flat update map for one tracker, or `None` before the first tick.
///
/// Fixed keys carry the newest tick; the bucketed keys (`l_B`, `h_B`,
/// `r_B`, `rp_B`, and the trade-dependent `vwap_Bm` / `total_volume_B` /
/// `nv_B` families) mirror the tracker's bucket set.
pub fn build_update(tracker: &TickerTracker) -> Option<Value> {
    let last = tracker.last_tick()?;

    let mut update = Map::new();
    update.insert("symbol".into(), json!(last.symbol));
    update.insert("close".into(), json!(last.last_price));
    update.insert("bid".into(), json!(last.bid));
    update.insert("ask".into(), json!(last.ask));
    update.insert("high".into(), json!(last.high_24h));
    update.insert("low".into(), json!(last.low_24h));
    update.insert("volume".into(), json!(last.quote_volume));
    update.insert("timestamp".into(), json!(last.timestamp));

    update.insert(
        "price_change_pct".into(),
        json!({
            "1m": metrics_at(tracker, 1).price_change_pct,
            "5m": metrics_at(tracker, 5).price_change_pct,
            "10m": metrics_at(tracker, 10).price_change_pct,
            "15m": metrics_at(tracker, 15).price_change_pct,
            "1h": metrics_at(tracker, 60).price_change_pct,
            "24h": last.price_change_pct_24h,
        }),
    );

    update.insert(
        "volume_change_pct".into(),
        json!({
            "1m": metrics_at(tracker, 1).volume_change_pct,
            "2m": metrics_at(tracker, 2).volume_change_pct,
            "3m": metrics_at(tracker, 3).volume_change_pct,
            "4m": metrics_at(tracker, 4).volume_change_pct,
            "5m": metrics_at(tracker, 5).volume_change_pct,
            "10m": metrics_at(tracker, 10).volume_change_pct,
            "15m": metrics_at(tracker, 15).volume_change_pct,
            "1h": metrics_at(tracker, 60).volume_change_pct,
        }),
    );

    for bucket in BUCKETS {
        let metrics = metrics_at(tracker, bucket);
        update.insert(format!("l_{bucket}"), json!(metrics.low));
        update.insert(format!("h_{bucket}"), json!(metrics.high));
        update.insert(format!("r_{bucket}"), json!(metrics.range));
        update.insert(format!("rp_{bucket}"), json!(metrics.range_pct));
    }

    update.insert("r_24".into(), json!(tracker.h24_metrics.range));
    update.insert("rp_24".into(), json!(tracker.h24_metrics.range_pct));

    if tracker.have_vwap {
        for (bucket, metrics) in &tracker.metrics {
            update.insert(format!("vwap_{bucket}m"), json!(round8(metrics.vwap)));
        }
    }

    if tracker.have_total_volume {
        for (bucket, metrics) in &tracker.metrics {
            update.insert(
                format!("total_volume_{bucket}"),
                json!(round8(metrics.total_volume)),
            );
        }
    }

    if tracker.have_net_volume {
        for (bucket, metrics) in &tracker.metrics {
            update.insert(format!("nv_{bucket}"), json!(round8(metrics.net_volume)));
        }
    }

    Some(Value::Object(update))
}
