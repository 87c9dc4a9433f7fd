//! Per-connection node session: early-data extraction, VLESS decode,
//! authorization, dial, and relay. Grounded in `server/app.go::WsVLESS` and
//! its `vlessTCP`/`vlessUDP` helpers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AppState;
use crate::common::net::configure_tcp_stream;
use crate::protocol::vless::{decode_udp_chunks, encode_response_header, encode_udp_chunk, VlessCommand, VlessRequest};
use crate::relay;
use crate::transport::AxumWsStream;

/// Per-direction read timeout used by the node relay (§4.3: "3 minutes read
/// timeout per direction for the node relay").
const NODE_READ_TIMEOUT: Duration = Duration::from_secs(180);
/// Connect timeout for dialing the destination (§4.4 step 7).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn run(mut socket: WebSocket, state: AppState, early_from_header: Option<Vec<u8>>, _path_uid: Option<String>) {
    let early = match early_from_header {
        Some(data) if !data.is_empty() => data,
        _ => match read_one_binary_message(&mut socket).await {
            Some(data) => data,
            None => {
                debug!("node session: no early-data message received, closing");
                return;
            }
        },
    };

    let request = match VlessRequest::decode(&early) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "node session: VLESS decode failed, closing");
            return;
        }
    };

    let uuid = request.uuid.to_string();
    if !state.table.allow(&uuid) {
        debug!(uuid, "node session: unauthorized UUID, closing silently");
        return;
    }

    state.active_sessions.fetch_add(1, Ordering::Relaxed);
    let bytes = match request.command {
        VlessCommand::Tcp => run_tcp_session(socket, &request).await,
        VlessCommand::Udp => run_udp_session(socket, &request).await,
    };
    state.active_sessions.fetch_sub(1, Ordering::Relaxed);

    if !state.config.disable_user_traffic() {
        state.table.add(&uuid, bytes);
    }
}

async fn read_one_binary_message(socket: &mut WebSocket) -> Option<Vec<u8>> {
    loop {
        match socket.recv().await? {
            Ok(Message::Binary(data)) => return Some(data.to_vec()),
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Close(_)) => return None,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(_) => return None,
        }
    }
}

async fn run_tcp_session(socket: WebSocket, request: &VlessRequest) -> u64 {
    let host = request.address.to_host_string();
    let dest = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), request.port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(host, port = request.port, error = %e, "node session: dial failed");
            return 0;
        }
        Err(_) => {
            debug!(host, port = request.port, "node session: dial timed out");
            return 0;
        }
    };
    configure_tcp_stream(&dest);

    let mut dest = dest;
    if !request.payload.is_empty() {
        use tokio::io::AsyncWriteExt;
        if let Err(e) = dest.write_all(&request.payload).await {
            debug!(error = %e, "node session: early payload write failed");
            return 0;
        }
    }

    let ws_stream = AxumWsStream::new(socket);
    let response_prefix = encode_response_header(request.version).to_vec();
    let stats = relay::relay(
        ws_stream,
        dest,
        Some(response_prefix),
        NODE_READ_TIMEOUT,
        CancellationToken::new(),
    )
    .await;
    stats.total_bytes
}

/// §4.4 step 9, generalized into a loop per the design note in §9(a): every
/// datagram in the early payload is forwarded, and both directions keep
/// pumping datagrams (not just a single request/response) until either side
/// closes.
async fn run_udp_session(mut socket: WebSocket, request: &VlessRequest) -> u64 {
    let host = request.address.to_host_string();
    let target: SocketAddr = match tokio::net::lookup_host((host.as_str(), request.port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(a) => a,
            None => {
                debug!(host, "node session: udp dial resolved no addresses");
                return 0;
            }
        },
        Err(e) => {
            debug!(host, error = %e, "node session: udp dial lookup failed");
            return 0;
        }
    };

    let udp = match tokio::time::timeout(CONNECT_TIMEOUT, UdpSocket::bind("0.0.0.0:0")).await {
        Ok(Ok(socket)) => socket,
        _ => return 0,
    };
    if let Err(e) = udp.connect(target).await {
        debug!(error = %e, "node session: udp connect failed");
        return 0;
    }

    let mut total: u64 = 0;
    for datagram in decode_udp_chunks(&request.payload) {
        if let Err(e) = udp.send(&datagram).await {
            debug!(error = %e, "node session: udp send failed");
            return total;
        }
        total += datagram.len() as u64;
    }

    let mut response_header_sent = false;
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let payload = match message {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.into_bytes(),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                for datagram in decode_udp_chunks(&payload) {
                    total += datagram.len() as u64;
                    if udp.send(&datagram).await.is_err() {
                        return total;
                    }
                }
            }
            result = tokio::time::timeout(NODE_READ_TIMEOUT, udp.recv(&mut buf)) => {
                let n = match result {
                    Ok(Ok(n)) => n,
                    _ => break,
                };
                total += n as u64;
                let mut out = Vec::new();
                if !response_header_sent {
                    out.extend_from_slice(&encode_response_header(request.version));
                    response_header_sent = true;
                }
                out.extend_from_slice(&encode_udp_chunk(&buf[..n]));
                if socket.send(Message::Binary(out.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    total
}
