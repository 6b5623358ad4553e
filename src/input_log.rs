//! Durable input log: one ordered list of raw inbound frames per feed name.
//!
//! Backed by a single SQLite database so a restart can replay the last hour
//! of raw exchange frames into the trackers before live consumption starts.
//! Log I/O is best-effort: a store error is logged and the in-memory
//! pipeline keeps going.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS input_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed TEXT NOT NULL,
    entry TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_input_log_feed ON input_log(feed, id);
"#;

/// One record of the log: the receipt time and the raw frame, stored as a
/// single opaque JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputLogEntry {
    pub timestamp: i64,
    pub message: String,
}

/// Process-wide handle to the backing database. Connections are serialized
/// behind a mutex; the appender and the pruner run on different tasks.
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    pub fn open(path: &str) -> Result<Arc<Self>> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open input log store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply input log schema")?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }
}

/// Append-and-trim ordered log for a single feed name.
#[derive(Clone)]
pub struct InputLog {
    store: Arc<LogStore>,
    feed: &'static str,
}

impl InputLog {
    pub fn new(store: Arc<LogStore>, feed: &'static str) -> Self {
        Self { store, feed }
    }

    /// Store `(now_seconds, message)` at the tail. Failures are logged and
    /// swallowed so ingestion never blocks on log I/O.
    pub fn append(&self, message: &str) {
        let entry = InputLogEntry {
            timestamp: Utc::now().timestamp(),
            message: message.to_string(),
        };
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(feed = self.feed, error = %e, "failed to encode input log entry");
                return;
            }
        };
        let conn = self.store.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT INTO input_log (feed, entry) VALUES (?1, ?2)",
            params![self.feed, encoded],
        ) {
            error!(feed = self.feed, error = %e, "failed to append input log entry");
        }
    }

    /// Append with an explicit receipt time, for tests that need aged
    /// entries.
    #[cfg(test)]
    pub(crate) fn append_at(&self, timestamp: i64, message: &str) {
        let entry = InputLogEntry {
            timestamp,
            message: message.to_string(),
        };
        let encoded = serde_json::to_string(&entry).expect("encode log entry");
        let conn = self.store.conn.lock();
        conn.execute(
            "INSERT INTO input_log (feed, entry) VALUES (?1, ?2)",
            params![self.feed, encoded],
        )
        .expect("insert log entry");
    }

    /// Peek the oldest entry.
    pub fn head(&self) -> Result<Option<InputLogEntry>> {
        self.at(0)
    }

    /// Read by zero-based index; `None` past the end.
    pub fn at(&self, index: i64) -> Result<Option<InputLogEntry>> {
        let conn = self.store.conn.lock();
        let row: Option<String> = conn
            .query_row(
                "SELECT entry FROM input_log WHERE feed = ?1 ORDER BY id LIMIT 1 OFFSET ?2",
                params![self.feed, index],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read input log entry")?;
        match row {
            None => Ok(None),
            Some(encoded) => {
                let entry = serde_json::from_str(&encoded)
                    .context("failed to decode input log entry")?;
                Ok(Some(entry))
            }
        }
    }

    pub fn len(&self) -> Result<i64> {
        let conn = self.store.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM input_log WHERE feed = ?1",
            params![self.feed],
            |row| row.get(0),
        )
        .context("failed to read input log length")
    }

    pub fn is_empty(&self) -> bool {
        self.len().map(|n| n == 0).unwrap_or(true)
    }

    /// Remove the oldest entry. Best-effort.
    pub fn pop_head(&self) {
        let conn = self.store.conn.lock();
        if let Err(e) = conn.execute(
            "DELETE FROM input_log WHERE id = \
             (SELECT id FROM input_log WHERE feed = ?1 ORDER BY id LIMIT 1)",
            params![self.feed],
        ) {
            error!(feed = self.feed, error = %e, "failed to pop input log head");
        }
    }

    /// Drop head entries older than one hour. Called by the owning runner,
    /// not on a timer.
    pub fn prune(&self) {
        loop {
            let head = match self.head() {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    warn!(feed = self.feed, error = %e, "failed to read input log head");
                    break;
                }
            };
            if Utc::now().timestamp() - head.timestamp > 3600 {
                self.pop_head();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log(feed: &'static str) -> InputLog {
        let store = LogStore::open(":memory:").expect("open in-memory store");
        InputLog::new(store, feed)
    }

    #[test]
    fn append_preserves_fifo_order() {
        let log = test_log("test");
        log.append("one");
        log.append("two");
        log.append("three");

        assert_eq!(log.len().unwrap(), 3);
        assert_eq!(log.at(0).unwrap().unwrap().message, "one");
        assert_eq!(log.at(1).unwrap().unwrap().message, "two");
        assert_eq!(log.at(2).unwrap().unwrap().message, "three");
        assert!(log.at(3).unwrap().is_none());
    }

    #[test]
    fn pop_head_removes_oldest_first() {
        let log = test_log("test");
        log.append("one");
        log.append("two");

        log.pop_head();
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.head().unwrap().unwrap().message, "two");

        log.pop_head();
        assert!(log.head().unwrap().is_none());
        // Popping an empty list is a no-op.
        log.pop_head();
    }

    #[test]
    fn feeds_are_isolated() {
        let store = LogStore::open(":memory:").expect("open in-memory store");
        let a = InputLog::new(store.clone(), "feed.a");
        let b = InputLog::new(store, "feed.b");

        a.append("for-a");
        assert_eq!(a.len().unwrap(), 1);
        assert_eq!(b.len().unwrap(), 0);
        assert!(b.head().unwrap().is_none());
    }

    #[test]
    fn entries_round_trip_as_timestamped_records() {
        let log = test_log("test");
        let before = Utc::now().timestamp();
        log.append(r#"{"stream":"x","data":[]}"#);
        let entry = log.head().unwrap().unwrap();
        assert!(entry.timestamp >= before);
        assert_eq!(entry.message, r#"{"stream":"x","data":[]}"#);
    }
}
