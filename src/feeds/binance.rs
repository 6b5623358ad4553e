//! Binance stream ingestion.
//!
//! `StreamSession` owns one combined-stream websocket and reconnects
//! forever; the ticker and trade streams sit on top of it, appending every
//! raw frame to the input log before decoding. The trade stream replays
//! its log through the same channel as live trades, with live arrivals
//! queued until the replay sentinel so causal order is preserved.

use crate::input_log::InputLog;
use crate::models::{
    AggTrade, BinanceExchangeInfo, BinanceRawAggTrade, BinanceRawTicker, BinanceStreamEnvelope,
    CommonTicker,
};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443";
const BINANCE_API_URL: &str = "https://api.binance.com";

/// Flat one-second pause with a little jitter so a fleet of sessions does
/// not reconnect in lockstep after an outage.
async fn reconnect_pause() {
    let jitter = rand::thread_rng().gen_range(0..250);
    tokio::time::sleep(Duration::from_millis(1000 + jitter)).await;
}

/// One websocket subscription to the combined-stream endpoint.
///
/// Every text frame that arrives is forwarded exactly once, in receipt
/// order. Read errors close the socket and trigger a reconnect with the
/// same stream list; connect errors retry on the same cadence, unbounded.
pub struct StreamSession {
    name: &'static str,
    streams: Vec<String>,
}

impl StreamSession {
    pub fn new(name: &'static str, streams: Vec<String>) -> Self {
        Self { name, streams }
    }

    fn url(&self) -> String {
        format!("{BINANCE_WS_URL}/stream?streams={}", self.streams.join("/"))
    }

    /// Runs until the receiving side goes away.
    pub async fn run(self, out: mpsc::Sender<String>) {
        loop {
            info!(stream = self.name, "connecting");
            let ws = self.connect().await;
            info!(stream = self.name, "connected");

            let (mut write, mut read) = ws.split();
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(frame)) => {
                        if out.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(_)) => {
                        warn!(stream = self.name, "server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(stream = self.name, error = %e, "read error");
                        break;
                    }
                }
            }

            reconnect_pause().await;
        }
    }

    async fn connect(
        &self,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        loop {
            match connect_async(self.url()).await {
                Ok((ws, _)) => return ws,
                Err(e) => {
                    error!(stream = self.name, error = %e, "failed to connect");
                    reconnect_pause().await;
                }
            }
        }
    }
}

/// Decode a `!ticker@arr` combined-stream frame into a ticker batch.
pub fn decode_tickers(frame: &str) -> Result<Vec<CommonTicker>> {
    let envelope: BinanceStreamEnvelope =
        serde_json::from_str(frame).context("bad stream envelope")?;
    let raw: Vec<BinanceRawTicker> =
        serde_json::from_value(envelope.data).context("bad ticker array payload")?;
    Ok(raw.into_iter().map(CommonTicker::from_binance).collect())
}

/// Decode an `@aggTrade` combined-stream frame.
pub fn decode_trade(frame: &str) -> Result<AggTrade> {
    let envelope: BinanceStreamEnvelope =
        serde_json::from_str(frame).context("bad stream envelope")?;
    let raw: BinanceRawAggTrade =
        serde_json::from_value(envelope.data).context("bad agg trade payload")?;
    Ok(AggTrade::from_binance(raw))
}

/// The `!ticker@arr` feed: log every raw frame, then forward the decoded
/// batch. Decode failures are logged and skipped.
pub struct TickerStream {
    log: InputLog,
}

impl TickerStream {
    pub fn new(log: InputLog) -> Self {
        Self { log }
    }

    pub async fn run(self, out: mpsc::Sender<Vec<CommonTicker>>) {
        let (raw_tx, mut raw_rx) = mpsc::channel::<String>(64);
        let session = StreamSession::new("binance.ticker", vec!["!ticker@arr".to_string()]);
        tokio::spawn(session.run(raw_tx));

        while let Some(frame) = raw_rx.recv().await {
            self.log.append(&frame);
            match decode_tickers(&frame) {
                Ok(tickers) => {
                    if out.send(tickers).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "failed to decode ticker frame"),
            }
        }
    }
}

enum TradeEvent {
    Replayed(AggTrade),
    ReplayDone,
    Live(AggTrade),
}

/// The per-symbol aggTrade feed across every spot symbol.
pub struct TradeStream {
    log: InputLog,
    client: reqwest::Client,
}

impl TradeStream {
    pub fn new(log: InputLog, client: reqwest::Client) -> Self {
        Self { log, client }
    }

    pub async fn run(self, out: mpsc::Sender<AggTrade>) {
        let (event_tx, event_rx) = mpsc::channel::<TradeEvent>(1024);

        // Replay covers only the entries present at startup; frames the
        // live reader appends during replay are not replayed again.
        let replay_log = self.log.clone();
        let replay_tx = event_tx.clone();
        tokio::spawn(async move {
            replay_trades(replay_log, replay_tx).await;
        });

        let live_log = self.log.clone();
        let live_client = self.client.clone();
        tokio::spawn(async move {
            stream_live_trades(live_client, live_log, event_tx).await;
        });

        bridge_events(self.log, event_rx, out).await;
    }
}

/// Merge the replay and live channels: replayed trades pass straight
/// through, live trades queue until the sentinel and then drain in order.
async fn bridge_events(
    log: InputLog,
    mut event_rx: mpsc::Receiver<TradeEvent>,
    out: mpsc::Sender<AggTrade>,
) {
    let mut replay_done = false;
    let mut queued: Vec<AggTrade> = Vec::new();

    while let Some(event) = event_rx.recv().await {
        match event {
            TradeEvent::Replayed(trade) => {
                if replay_done {
                    warn!("got replayed trade after replay completed");
                }
                if out.send(trade).await.is_err() {
                    return;
                }
            }
            TradeEvent::ReplayDone => {
                replay_done = true;
                if !queued.is_empty() {
                    info!(count = queued.len(), "submitting queued trades");
                    for trade in queued.drain(..) {
                        if out.send(trade).await.is_err() {
                            return;
                        }
                    }
                }
            }
            TradeEvent::Live(trade) => {
                if !replay_done {
                    queued.push(trade);
                    continue;
                }
                if out.send(trade).await.is_err() {
                    return;
                }
                log.prune();
            }
        }
    }
}

async fn replay_trades(log: InputLog, tx: mpsc::Sender<TradeEvent>) {
    let start = Instant::now();
    let count = match log.len() {
        Ok(count) => count,
        Err(e) => {
            error!(error = %e, "failed to get trade log length");
            0
        }
    };
    info!(count, "trade log replay start");

    let mut restored = 0i64;
    let mut first: Option<chrono::DateTime<chrono::Utc>> = None;
    let mut last = None;
    for i in 0..count {
        let entry = match log.at(i) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                error!(index = i, error = %e, "failed to read trade log entry");
                break;
            }
        };
        if entry.timestamp == 0 {
            error!("trade log entry with zero timestamp");
            continue;
        }
        let trade = match decode_trade(&entry.message) {
            Ok(trade) => trade,
            Err(e) => {
                error!(error = %e, "failed to decode logged trade");
                continue;
            }
        };
        if first.is_none() {
            first = Some(trade.timestamp);
        }
        last = Some(trade.timestamp);
        restored += 1;
        if tx.send(TradeEvent::Replayed(trade)).await.is_err() {
            return;
        }
    }

    let range_secs = match (first, last) {
        (Some(first), Some(last)) => (last - first).num_seconds(),
        _ => 0,
    };
    info!(
        restored,
        duration_ms = start.elapsed().as_millis() as u64,
        range_secs,
        "trade log replay done"
    );
    let _ = tx.send(TradeEvent::ReplayDone).await;
}

async fn stream_live_trades(
    client: reqwest::Client,
    log: InputLog,
    tx: mpsc::Sender<TradeEvent>,
) {
    // The subscription list is fixed for the life of the session; the
    // session resubscribes to the same list on every reconnect.
    let streams = loop {
        match spot_trade_streams(&client).await {
            Ok(streams) if !streams.is_empty() => {
                info!(count = streams.len(), "got trade streams");
                break streams;
            }
            Ok(_) => warn!("got 0 trade streams, trying again"),
            Err(e) => warn!(error = %e, "failed to get trade streams"),
        }
        reconnect_pause().await;
    };

    let (raw_tx, mut raw_rx) = mpsc::channel::<String>(1024);
    tokio::spawn(StreamSession::new("binance.trades", streams).run(raw_tx));

    while let Some(frame) = raw_rx.recv().await {
        log.append(&frame);
        match decode_trade(&frame) {
            Ok(trade) => {
                if tx.send(TradeEvent::Live(trade)).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "failed to decode trade frame"),
        }
    }
}

/// All spot symbols currently trading, as aggTrade stream names.
async fn spot_trade_streams(client: &reqwest::Client) -> Result<Vec<String>> {
    let info: BinanceExchangeInfo = client
        .get(format!("{BINANCE_API_URL}/api/v3/exchangeInfo"))
        .send()
        .await
        .context("exchangeInfo request failed")?
        .error_for_status()
        .context("exchangeInfo returned an error status")?
        .json()
        .await
        .context("exchangeInfo decode failed")?;

    Ok(info
        .symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .map(|s| format!("{}@aggTrade", s.symbol.to_lowercase()))
        .collect())
}
