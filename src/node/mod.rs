//! Node (server) HTTP surface (C4), grounded in `server/app.go`'s `httpSvr`
//! route table and `hub/mod.rs`'s `AppState`-plus-`Router` idiom.

mod session;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::TrafficTable;
use crate::config::Config;
use crate::controlplane;
use crate::subscription;
use crate::{Result, BUILD_HASH, BUILD_TIME, VERSION};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub table: Arc<TrafficTable>,
    pub active_sessions: Arc<AtomicI64>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/wsv/:uid", get(wsv_handler))
        .route("/ws-vless", get(ws_vless_legacy_handler))
        .route("/sub/:uid", get(sub_handler))
        .route("/", get(diagnostics_handler))
        .route("/stat", get(stat_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn wsv_handler(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => {
            let early = early_data_from_headers(&headers);
            ws.on_upgrade(move |socket| session::run(socket, state, early, Some(uid)))
        }
        None => Json(json!({"msg": "pong", "uid": uid})).into_response(),
    }
}

/// Legacy alias: no `{uid}` path segment, the UUID comes from the decoded
/// VLESS header instead (§6).
async fn ws_vless_legacy_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => {
            let early = early_data_from_headers(&headers);
            ws.on_upgrade(move |socket| session::run(socket, state, early, None))
        }
        None => Json(json!({"msg": "pong"})).into_response(),
    }
}

/// Base64url (no padding) decode of `sec-websocket-protocol`. A missing
/// header or a decode error both yield `None` — treated as empty early data
/// (§4.4 step 2).
fn early_data_from_headers(headers: &HeaderMap) -> Option<Vec<u8>> {
    use base64::Engine;
    let raw = headers.get("sec-websocket-protocol")?.to_str().ok()?;
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(error = %e, "early-data header decode failed, treating as empty");
            None
        }
    }
}

async fn sub_handler(State(state): State<AppState>, Path(uid): Path<String>) -> Response {
    if !state.table.allow(&uid) {
        return (axum::http::StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let urls = subscription::vless_urls(&uid, &state.config.sub_host_with_port());
    urls.join("\n").into_response()
}

/// Plain-text diagnostics, matching `app_ping.go`'s `BUILT HASH:`/`BUILT
/// TIME:` lines plus active-session (goroutine-equivalent) count and
/// resident memory.
async fn diagnostics_handler(State(state): State<AppState>) -> Response {
    let uptime = state.started_at.elapsed();
    let sessions = state.active_sessions.load(Ordering::Relaxed);
    let memory = resident_memory_kb()
        .map(|kb| format!("{kb} kB"))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "BUILT HASH:  {BUILD_HASH}\n\nBUILT TIME:  {BUILD_TIME}\n\nwsvless node {VERSION}\nuptime: {uptime:?}\nactive sessions: {sessions}\nmemory: {memory}\n",
    )
    .into_response()
}

#[cfg(target_os = "linux")]
fn resident_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_kb() -> Option<u64> {
    None
}

/// Matches the same stat struct the control-plane push body uses
/// (`internal/node/app_ping.go::Stat`/`AppStat`).
async fn stat_handler(State(state): State<AppState>) -> Response {
    Json(controlplane::build_stat(&state.config, &state.table, &state.active_sessions)).into_response()
}

/// Build the traffic table, push once synchronously, print subscription
/// URLs, then serve the HTTP surface until `shutdown` fires (mirrors
/// `main.go`'s `app.PushNode(); app.PrintVLESSConnectionURLS(); go app.Run()`
/// sequence — §10.6).
pub async fn run(config: Arc<Config>, shutdown: CancellationToken) -> Result<()> {
    let table = Arc::new(TrafficTable::seed(config.user_ids()));
    let active_sessions = Arc::new(AtomicI64::new(0));

    let client = reqwest::Client::new();
    controlplane::push_once(&client, &config, &table, &active_sessions).await;

    for uid in config.user_ids() {
        println!("vist to get VLESS connection info for user {uid}:");
        for url in subscription::vless_urls(&uid, &config.sub_host_with_port()) {
            println!("  {url}");
        }
    }

    let push_task = tokio::spawn(controlplane::run(
        config.clone(),
        table.clone(),
        active_sessions.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        table,
        active_sessions,
        started_at: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), "node listening");

    let app = router(state);
    let shutdown_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal.cancelled().await;
        })
        .await?;

    // Graceful shutdown budget before the final control-plane push catches up.
    let _ = tokio::time::timeout(Duration::from_secs(5), push_task).await;
    Ok(())
}
