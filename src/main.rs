//! tickscan server binary: two exchange feed runners, a websocket fan-out,
//! and a small JSON API in front of them.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, MatchedPath, Path, Query, RawQuery, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickscan::{
    hub::{SubscriberHub, WS_CONNECTIONS},
    input_log::LogStore,
    models::Config,
    proxy::ApiProxy,
    runner::{BinanceRunner, KuCoinRunner},
};

const PROTO_VERSION: u32 = 1;

#[derive(Clone)]
struct AppState {
    binance_hub: Arc<SubscriberHub>,
    kucoin_hub: Arc<SubscriberHub>,
    proxy: Arc<ApiProxy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing();
    info!(port = config.port, "starting tickscan");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let store = LogStore::open(&config.input_log_path)?;
    info!(path = %config.input_log_path, "input log store ready");

    let kucoin_hub = Arc::new(SubscriberHub::new("kucoin"));
    tokio::spawn(
        KuCoinRunner::new(kucoin_hub.clone(), store.clone(), http_client.clone()).run(),
    );

    let binance_hub = Arc::new(SubscriberHub::new("binance"));
    tokio::spawn(
        BinanceRunner::new(binance_hub.clone(), store.clone(), http_client.clone()).run(),
    );

    let state = AppState {
        binance_hub,
        kucoin_hub,
        proxy: Arc::new(ApiProxy::new(http_client)),
    };

    let app = Router::new()
        .route("/ws/kucoin/live", get(broadcast_ws_handler))
        .route("/ws/kucoin/monitor", get(broadcast_ws_handler))
        .route("/ws/binance/live", get(broadcast_ws_handler))
        .route("/ws/binance/monitor", get(broadcast_ws_handler))
        .route("/ws/binance/symbol", get(symbol_ws_handler))
        .route("/api/1/binance/proxy/*path", get(proxy_handler))
        .route("/api/1/ping", get(ping_handler))
        .route("/api/1/status/websockets", get(websockets_status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Remote host for connection tracking: forwarded headers first, then the
/// socket address.
fn remote_host(headers: &HeaderMap, addr: SocketAddr) -> String {
    for name in ["x-forwarded-for", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let host = value
                .split(',')
                .next()
                .unwrap_or(value)
                .trim()
                .split(':')
                .next()
                .unwrap_or(value);
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }
    addr.ip().to_string()
}

// =============================================================================
// Websocket handlers
// =============================================================================

async fn broadcast_ws_handler(
    ws: WebSocketUpgrade,
    path: MatchedPath,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let path = path.as_str().to_string();
    let hub = if path.starts_with("/ws/kucoin") {
        state.kucoin_hub.clone()
    } else {
        state.binance_hub.clone()
    };
    let host = remote_host(&headers, addr);
    info!(path = %path, host = %host, "websocket connected");
    ws.on_upgrade(move |socket| handle_broadcast_socket(socket, hub, path, host))
}

#[derive(Deserialize)]
struct SymbolParams {
    symbol: Option<String>,
}

async fn symbol_ws_handler(
    ws: WebSocketUpgrade,
    path: MatchedPath,
    Query(params): Query<SymbolParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let path = path.as_str().to_string();
    let hub = state.binance_hub.clone();
    let host = remote_host(&headers, addr);
    let symbol = params.symbol.unwrap_or_default();
    info!(path = %path, host = %host, symbol = %symbol, "websocket connected");
    ws.on_upgrade(move |socket| async move {
        if symbol.is_empty() {
            // Without a symbol this behaves like the broadcast routes.
            handle_broadcast_socket(socket, hub, path, host).await;
        } else {
            handle_symbol_socket(socket, hub, symbol, path, host).await;
        }
    })
}

/// Writer loop for a broadcast client. The read half is drained and
/// discarded; either side ending tears the connection down.
async fn handle_broadcast_socket(
    socket: WebSocket,
    hub: Arc<SubscriberHub>,
    path: String,
    host: String,
) {
    let (id, mut rx) = hub.add_client();
    WS_CONNECTIONS.add(&path, id, &host);

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Evicted by the hub.
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    hub.remove_client(id);
    WS_CONNECTIONS.del(&path, id);
    info!(path = %path, host = %host, "websocket connection closed");
}

/// Writer loop for a single-symbol subscriber.
async fn handle_symbol_socket(
    socket: WebSocket,
    hub: Arc<SubscriberHub>,
    symbol: String,
    path: String,
    host: String,
) {
    let (id, mut rx) = hub.subscribe(&symbol);
    WS_CONNECTIONS.add(&path, id, &host);

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => {
                    let text = match serde_json::to_string(&update) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "failed to serialize symbol update");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    hub.unsubscribe(&symbol, id);
    WS_CONNECTIONS.del(&path, id);
    info!(path = %path, host = %host, symbol = %symbol, "websocket connection closed");
}

// =============================================================================
// JSON API handlers
// =============================================================================

async fn proxy_handler(
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
) -> Response {
    match state.proxy.get(&path, query.as_deref()).await {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (
                status,
                [(header::CONTENT_TYPE, response.content_type)],
                response.body,
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "proxy request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn ping_handler() -> Json<Value> {
    Json(json!({ "version": PROTO_VERSION }))
}

async fn websockets_status_handler() -> Json<Value> {
    Json(WS_CONNECTIONS.status())
}
