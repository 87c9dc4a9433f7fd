//! Control-plane push loop (C7).
//!
//! Grounded in `server/app.go`'s `PushNode`/`loopPush`: a periodic POST of
//! traffic stats, with the authoritative allow-set pulled from the
//! response and installed into [`TrafficTable`] via `reset_with`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::TrafficTable;
use crate::config::Config;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stat snapshot shared verbatim between the control-plane push body and the
/// node's `/stat` route (`internal/node/app_ping.go::AppStat`).
#[derive(Debug, Serialize)]
pub(crate) struct PushBody {
    pub(crate) traffic: std::collections::HashMap<String, i64>,
    pub(crate) hostname: String,
    pub(crate) sub_addresses: Vec<String>,
    pub(crate) goroutine: i64,
    pub(crate) version_info: String,
}

/// Build the current stat snapshot, shared by [`push_once`] and the node's
/// `/stat` route so both surfaces report the same struct.
pub(crate) fn build_stat(config: &Config, table: &TrafficTable, active_sessions: &AtomicI64) -> PushBody {
    PushBody {
        traffic: table.snapshot(),
        hostname: hostname_or_unknown(),
        sub_addresses: config.sub_host_with_port(),
        goroutine: active_sessions.load(Ordering::Relaxed),
        version_info: VERSION.to_string(),
    }
}

/// One push: snapshot stats, POST as JSON, decode the authoritative
/// allow-set from the response, and install it. Errors are logged at warn
/// and swallowed — a control-plane failure must never disturb the data
/// plane (§7 ControlPlaneError).
pub async fn push_once(
    client: &reqwest::Client,
    config: &Config,
    table: &TrafficTable,
    active_sessions: &AtomicI64,
) {
    let url = &config.register_url;
    if url.is_empty() {
        return;
    }

    let body = build_stat(config, table, active_sessions);

    let result = client
        .post(url)
        .header("Authorization", config.register_token.clone())
        .timeout(Duration::from_secs(10))
        .json(&body)
        .send()
        .await;

    let response = match result {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "control-plane push failed");
            return;
        }
    };

    let users: std::collections::HashMap<String, i64> = match response.json().await {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "control-plane response decode failed");
            return;
        }
    };

    debug!(count = users.len(), "control-plane push acknowledged");
    table.reset_with(users.into_keys());
}

fn hostname_or_unknown() -> String {
    hostname().unwrap_or_else(|| "unknown".to_string())
}

/// OS-reported hostname via `gethostname(2)`, matching the original's
/// `os.Hostname()` (a real syscall, unlike `$HOSTNAME` which a
/// systemd-launched process never has set).
fn hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok().filter(|h| !h.is_empty())
}

/// Run the periodic push loop until `shutdown` fires. If `register_url` is
/// empty the loop exits immediately (standalone mode, matching the
/// original's early return in `loopPush`). Performs one final push right
/// before returning on shutdown.
pub async fn run(
    config: Arc<Config>,
    table: Arc<TrafficTable>,
    active_sessions: Arc<AtomicI64>,
    shutdown: CancellationToken,
) {
    if config.register_url.is_empty() {
        info!("register url is empty, running in standalone mode");
        return;
    }

    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(config.push_interval());
    ticker.tick().await; // first tick fires immediately; already pushed synchronously at startup

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                push_once(&client, &config, &table, &active_sessions).await;
                return;
            }
            _ = ticker.tick() => {
                push_once(&client, &config, &table, &active_sessions).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_reports_nonempty() {
        assert!(hostname().map(|h| !h.is_empty()).unwrap_or(false));
    }
}
