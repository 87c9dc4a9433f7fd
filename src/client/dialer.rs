//! Outbound WebSocket dial for the client's tunneled path: TCP (or TLS)
//! connect, WS handshake, then the VLESS header as the first binary
//! message — grounded in `server/socks5.go`'s dial-and-handshake path and
//! `outbound/vless.rs`'s TLS connector setup.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::protocol::vless::VlessRequest;
use crate::transport::client_ws::ClientWsStream;
use crate::transport::websocket::{handshake, WebSocketStream};
use crate::{Error, Result};

use super::upstream::{AsyncStream, Upstream};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `node_url` (`ws://` or `wss://`), perform the WebSocket handshake,
/// then write `request`'s encoded header (plus any early payload it
/// carries) as the first outbound binary message.
pub async fn dial(node_url: &str, request: &VlessRequest) -> Result<Upstream> {
    let url = Url::parse(node_url).map_err(|e| Error::config(format!("invalid node url: {e}")))?;
    let use_tls = match url.scheme() {
        "wss" => true,
        "ws" => false,
        other => return Err(Error::config(format!("unsupported node url scheme: {other}"))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::config("node url missing host"))?
        .to_string();
    let port = url.port().unwrap_or(if use_tls { 443 } else { 80 });
    let path = if url.query().is_some() {
        format!("{}?{}", url.path(), url.query().unwrap())
    } else {
        url.path().to_string()
    };

    let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| Error::timeout("node dial timed out"))??;
    let _ = tcp.set_nodelay(true);

    let mut upstream: Box<dyn AsyncStream> = if use_tls {
        let connector = tls_connector();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Error::tls(format!("invalid server name: {host}")))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::tls(e.to_string()))?;
        Box::new(tls_stream)
    } else {
        Box::new(tcp)
    };

    handshake(&mut upstream, &host, &path, &[]).await?;
    debug!(node_url, "websocket handshake completed");

    let mut ws = ClientWsStream::new(WebSocketStream::new(upstream));
    use tokio::io::AsyncWriteExt;
    ws.write_all(&request.encode()).await?;
    ws.flush().await?;

    Ok(Upstream::Tunnel(Box::new(ws)))
}

fn tls_connector() -> TlsConnector {
    static ROOT_STORE: OnceLock<rustls::RootCertStore> = OnceLock::new();
    let root_store = ROOT_STORE
        .get_or_init(|| {
            let mut store = rustls::RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        })
        .clone();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
