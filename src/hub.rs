//! Websocket fan-out.
//!
//! Two delivery levels per feed: a broadcast set that receives every batch
//! snapshot, and per-symbol subscriber sets that receive only their
//! symbol's update. All sends are try-sends; the live loop never blocks on
//! a subscriber. A broadcast client that cannot keep up is dropped; a
//! symbol subscriber is warned and kept.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// Per-client queue depth. Small so a stalled client falls behind quickly
/// instead of buffering stale snapshots.
const CLIENT_QUEUE: usize = 8;

#[derive(Default)]
struct HubInner {
    broadcast_clients: HashMap<u64, mpsc::Sender<String>>,
    symbol_subscribers: HashMap<String, HashMap<u64, mpsc::Sender<Value>>>,
}

pub struct SubscriberHub {
    name: &'static str,
    inner: RwLock<HubInner>,
    next_id: AtomicU64,
}

impl SubscriberHub {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(HubInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a broadcast client. Dropping out of the hub closes the
    /// returned receiver; the client's writer task exits on `None`.
    pub fn add_client(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        self.inner.write().broadcast_clients.insert(id, tx);
        (id, rx)
    }

    pub fn remove_client(&self, id: u64) {
        self.inner.write().broadcast_clients.remove(&id);
    }

    /// Register a per-symbol subscriber.
    pub fn subscribe(&self, symbol: &str) -> (u64, mpsc::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        self.inner
            .write()
            .symbol_subscribers
            .entry(symbol.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    /// Remove one subscriber. An emptied symbol set is left in place.
    pub fn unsubscribe(&self, symbol: &str, id: u64) {
        let mut inner = self.inner.write();
        if let Some(subscribers) = inner.symbol_subscribers.get_mut(symbol) {
            subscribers.remove(&id);
        }
    }

    /// Send the serialized batch snapshot to every broadcast client.
    /// A client whose queue is full is dropped on the spot.
    pub fn broadcast(&self, message: &str) {
        let mut dropped: Vec<u64> = Vec::new();
        {
            let inner = self.inner.read();
            for (id, tx) in &inner.broadcast_clients {
                if tx.try_send(message.to_string()).is_err() {
                    warn!(
                        feed = self.name,
                        client = id,
                        "websocket client appears to be blocked, dropping"
                    );
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            let mut inner = self.inner.write();
            for id in dropped {
                inner.broadcast_clients.remove(&id);
            }
        }
    }

    /// Send one symbol's update to its subscribers. Blocked subscribers
    /// are warned but stay registered.
    pub fn publish(&self, symbol: &str, update: &Value) {
        let inner = self.inner.read();
        let Some(subscribers) = inner.symbol_subscribers.get(symbol) else {
            return;
        };
        for tx in subscribers.values() {
            if tx.try_send(update.clone()).is_err() {
                warn!(feed = self.name, symbol, "feed subscriber is blocked");
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.read().broadcast_clients.len()
    }
}

// =============================================================================
// Connection tracking for the status endpoint
// =============================================================================

lazy_static! {
    pub static ref WS_CONNECTIONS: WsConnectionTracker = WsConnectionTracker::new();
}

#[derive(Default)]
struct ConnectionsInner {
    /// path -> connection ids
    paths: HashMap<String, HashSet<u64>>,
    /// connection id -> (remote host, paths)
    clients: HashMap<u64, (String, HashSet<String>)>,
}

/// Process-wide registry of open websocket connections, keyed by route
/// path. Remote hosts are only ever exposed as salted hashes.
pub struct WsConnectionTracker {
    inner: RwLock<ConnectionsInner>,
    salt: Vec<u8>,
}

impl WsConnectionTracker {
    fn new() -> Self {
        let mut salt = vec![0u8; 256];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            inner: RwLock::new(ConnectionsInner::default()),
            salt,
        }
    }

    pub fn add(&self, path: &str, id: u64, remote_host: &str) {
        let mut inner = self.inner.write();
        inner.paths.entry(path.to_string()).or_default().insert(id);
        let (_, paths) = inner
            .clients
            .entry(id)
            .or_insert_with(|| (remote_host.to_string(), HashSet::new()));
        paths.insert(path.to_string());
    }

    pub fn del(&self, path: &str, id: u64) {
        let mut inner = self.inner.write();
        if let Some(ids) = inner.paths.get_mut(path) {
            ids.remove(&id);
        }
        let remove_client = match inner.clients.get_mut(&id) {
            Some((_, paths)) => {
                paths.remove(path);
                paths.is_empty()
            }
            None => false,
        };
        if remove_client {
            inner.clients.remove(&id);
        }
    }

    /// Status document: per-path connection counts plus per-client path
    /// lists keyed by a salted hash of the remote host.
    pub fn status(&self) -> Value {
        let inner = self.inner.read();

        let mut paths: HashMap<&str, usize> = HashMap::new();
        for (path, ids) in &inner.paths {
            if !ids.is_empty() {
                *paths.entry(path.as_str()).or_default() += ids.len();
            }
        }

        let mut clients: HashMap<String, Vec<&str>> = HashMap::new();
        for (host, client_paths) in inner.clients.values() {
            let mut hasher = Sha256::new();
            hasher.update(&self.salt);
            hasher.update(host.as_bytes());
            let digest = hasher.finalize();
            let hash8: String = digest
                .iter()
                .take(4)
                .map(|b| format!("{b:02x}"))
                .collect();
            let entry = clients.entry(hash8).or_default();
            for path in client_paths {
                entry.push(path.as_str());
            }
        }

        json!({ "paths": paths, "clients": clients })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_clients_in_order() {
        let hub = SubscriberHub::new("test");
        let (_id_a, mut rx_a) = hub.add_client();
        let (_id_b, mut rx_b) = hub.add_client();

        hub.broadcast("first");
        hub.broadcast("second");

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.recv().await.unwrap(), "first");
            assert_eq!(rx.recv().await.unwrap(), "second");
        }
    }

    #[tokio::test]
    async fn blocked_broadcast_client_is_evicted() {
        let hub = SubscriberHub::new("test");
        let (_id, mut rx) = hub.add_client();

        for i in 0..CLIENT_QUEUE + 1 {
            hub.broadcast(&format!("msg-{i}"));
        }
        assert_eq!(hub.client_count(), 0);

        // The queued frames drain, then the closed channel ends the stream.
        for i in 0..CLIENT_QUEUE {
            assert_eq!(rx.recv().await.unwrap(), format!("msg-{i}"));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocked_symbol_subscriber_is_kept() {
        let hub = SubscriberHub::new("test");
        let (id, mut rx) = hub.subscribe("BTCUSDT");

        let update = json!({"symbol": "BTCUSDT"});
        for _ in 0..CLIENT_QUEUE + 3 {
            hub.publish("BTCUSDT", &update);
        }

        // Still registered: draining one slot lets the next publish through.
        assert!(rx.recv().await.is_some());
        hub.publish("BTCUSDT", &update);
        let mut received = 1;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received > 1);

        hub.unsubscribe("BTCUSDT", id);
        hub.publish("BTCUSDT", &update);
    }

    #[tokio::test]
    async fn publish_only_reaches_the_matching_symbol() {
        let hub = SubscriberHub::new("test");
        let (_id, mut rx) = hub.subscribe("ETHUSDT");

        hub.publish("BTCUSDT", &json!({"symbol": "BTCUSDT"}));
        assert!(rx.try_recv().is_err());

        hub.publish("ETHUSDT", &json!({"symbol": "ETHUSDT"}));
        assert_eq!(rx.recv().await.unwrap()["symbol"], "ETHUSDT");
    }

    #[test]
    fn connection_tracker_counts_paths_and_hashes_hosts() {
        let tracker = WsConnectionTracker::new();
        tracker.add("/ws/test/live", 1, "10.0.0.1");
        tracker.add("/ws/test/live", 2, "10.0.0.2");
        tracker.add("/ws/test/monitor", 1, "10.0.0.1");

        let status = tracker.status();
        assert_eq!(status["paths"]["/ws/test/live"], 2);
        assert_eq!(status["paths"]["/ws/test/monitor"], 1);

        let clients = status["clients"].as_object().unwrap();
        assert_eq!(clients.len(), 2);
        for (hash, paths) in clients {
            assert_eq!(hash.len(), 8);
            assert!(!paths.as_array().unwrap().is_empty());
            // Raw addresses never appear.
            assert!(!hash.contains("10.0.0"));
        }

        tracker.del("/ws/test/live", 1);
        tracker.del("/ws/test/monitor", 1);
        let status = tracker.status();
        assert!(status["paths"].get("/ws/test/monitor").is_none() || status["paths"]["/ws/test/monitor"] == 0);
    }
}
