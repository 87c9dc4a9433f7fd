//! Client SOCKS5 listener (C5), grounded in `server/socks5.go`'s accept loop
//! and per-command handlers, restructured onto the capability-set
//! [`upstream::Upstream`] abstraction so both the direct and tunneled paths
//! drive the same relay engine (C3).

mod dialer;
mod upstream;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::net::{configure_tcp_stream, Address};
use crate::geo::{self, GeoIpReader};
use crate::protocol::socks5::{Command, Greeting, Request, Response, UdpHeader};
use crate::protocol::vless::{decode_udp_chunks, encode_udp_chunk, VlessCommand, VlessRequest};
use crate::relay;
use crate::{Error, Result};

/// Per-connection deadline (§4.5 step 1).
const CONNECTION_DEADLINE: Duration = Duration::from_secs(300);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ClientConfig {
    pub listen: String,
    pub node_url: String,
    pub uuid: Uuid,
    pub geoip_db: String,
}

pub async fn run(config: ClientConfig, shutdown: CancellationToken) -> Result<()> {
    let config = Arc::new(config);
    let geo_reader = Arc::new(GeoIpReader::new(&config.geoip_db));
    let resolver = Arc::new(build_resolver());

    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "socks5 server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("socks5 server exit");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let config = config.clone();
                let geo_reader = geo_reader.clone();
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokio::time::timeout(
                        CONNECTION_DEADLINE,
                        handle_connection(stream, config, geo_reader, resolver),
                    )
                    .await
                    {
                        debug!(%peer, ?e, "connection deadline reached");
                    }
                });
            }
        }
    }
}

fn build_resolver() -> hickory_resolver::TokioAsyncResolver {
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    hickory_resolver::TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
}

async fn resolve_ip(resolver: &hickory_resolver::TokioAsyncResolver, address: &Address) -> Option<IpAddr> {
    if let Some(ip) = address.to_ip() {
        return Some(ip);
    }
    resolver
        .lookup_ip(address.to_host())
        .await
        .ok()
        .and_then(|lookup| lookup.iter().next())
}

async fn handle_connection(
    mut client: TcpStream,
    config: Arc<ClientConfig>,
    geo_reader: Arc<GeoIpReader>,
    resolver: Arc<hickory_resolver::TokioAsyncResolver>,
) -> Result<()> {
    configure_tcp_stream(&client);

    let greeting = Greeting::read_from(&mut client).await?;
    debug!(methods = ?greeting.methods, "socks5 greeting");
    Greeting::accept_no_auth(&mut client).await?;

    let request = match Request::read_from(&mut client).await {
        Ok(r) => r,
        Err(e) => {
            Response::version_mismatch().write_to(&mut client).await.ok();
            return Err(e);
        }
    };

    match request.command {
        Command::Connect => handle_connect(client, request, &config, &geo_reader, &resolver).await,
        Command::UdpAssociate => handle_udp_associate(client, request, &config).await,
        Command::Bind => {
            Response::failure(crate::protocol::socks5::REP_GENERAL_FAILURE)
                .write_to(&mut client)
                .await?;
            Ok(())
        }
    }
}

async fn handle_connect(
    mut client: TcpStream,
    request: Request,
    config: &ClientConfig,
    geo_reader: &GeoIpReader,
    resolver: &hickory_resolver::TokioAsyncResolver,
) -> Result<()> {
    let ip = resolve_ip(resolver, &request.address).await;
    let direct = geo::should_go_direct(geo_reader, ip);

    let upstream = if direct {
        let host = request.address.to_host();
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), request.port))).await {
            Ok(Ok(stream)) => {
                configure_tcp_stream(&stream);
                upstream::Upstream::Direct(stream)
            }
            _ => {
                Response::failure(crate::protocol::socks5::REP_HOST_UNREACHABLE)
                    .write_to(&mut client)
                    .await
                    .ok();
                return Err(Error::dial(format!("direct dial failed: {host}:{}", request.port)));
            }
        }
    } else {
        let vless_request = VlessRequest::new_for_dial(
            config.uuid,
            VlessCommand::Tcp,
            &request.address.to_host(),
            request.port,
            Vec::new(),
        );
        match tokio::time::timeout(DIAL_TIMEOUT, dialer::dial(&config.node_url, &vless_request)).await {
            Ok(Ok(u)) => u,
            _ => {
                Response::failure(crate::protocol::socks5::REP_HOST_UNREACHABLE)
                    .write_to(&mut client)
                    .await
                    .ok();
                return Err(Error::dial("tunnel dial failed"));
            }
        }
    };

    Response::success(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
        .write_to(&mut client)
        .await?;

    let stats = relay::relay(client, upstream, None, Duration::from_secs(180), CancellationToken::new()).await;
    debug!(bytes = stats.total_bytes, direct, "connect session closed");
    Ok(())
}

/// §4.5 step 4 UDP ASSOCIATE: bind a local UDP socket, reply with its
/// address, and pump datagrams through one persistent VLESS UDP tunnel for
/// the life of the association — a deliberate departure from the source's
/// one-tunnel-per-datagram scheme (§9(b); see DESIGN.md).
async fn handle_udp_associate(mut client: TcpStream, _request: Request, config: &ClientConfig) -> Result<()> {
    let udp = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(s) => s,
        Err(e) => {
            Response::failure(crate::protocol::socks5::REP_GENERAL_FAILURE)
                .write_to(&mut client)
                .await
                .ok();
            return Err(Error::Io(e));
        }
    };
    let bound: SocketAddr = udp.local_addr()?;
    let bound_ip = match bound.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => std::net::Ipv4Addr::UNSPECIFIED,
    };
    Response::success(bound_ip.into(), bound.port())
        .write_to(&mut client)
        .await?;
    info!(%bound, "udp association established");

    let mut tunnel: Option<upstream::Upstream> = None;
    let mut client_addr: Option<SocketAddr> = None;
    let mut target: Option<Address> = None;
    let mut target_port: u16 = 0;
    let mut recv_buf = vec![0u8; 65536];
    let mut resp_buf = vec![0u8; 65536];
    let mut first_response = true;

    loop {
        tokio::select! {
            // Control connection closing tears down the association.
            result = client.read(&mut [0u8; 1]) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            incoming = udp.recv_from(&mut recv_buf) => {
                let (n, from) = incoming?;
                let (header, consumed) = match UdpHeader::from_bytes(&recv_buf[..n]) {
                    Ok(v) => v,
                    Err(e) => { debug!(error = %e, "udp header parse failed"); continue; }
                };
                if header.frag != 0 {
                    continue;
                }
                client_addr = Some(from);
                target = Some(header.address.clone());
                target_port = header.port;
                let payload = &recv_buf[consumed..n];

                if tunnel.is_none() {
                    let vless_request = VlessRequest::new_for_dial(
                        config.uuid,
                        VlessCommand::Udp,
                        &header.address.to_host(),
                        header.port,
                        encode_udp_chunk(payload),
                    );
                    match dialer::dial(&config.node_url, &vless_request).await {
                        Ok(u) => tunnel = Some(u),
                        Err(e) => { warn!(error = %e, "udp tunnel dial failed"); continue; }
                    }
                } else if let Some(t) = tunnel.as_mut() {
                    let framed = encode_udp_chunk(payload);
                    if t.write_all(&framed).await.is_err() {
                        tunnel = None;
                    }
                }
            }
            result = async {
                match tunnel.as_mut() {
                    Some(t) => t.read(&mut resp_buf).await,
                    None => std::future::pending().await,
                }
            } => {
                let n = match result {
                    Ok(0) | Err(_) => { tunnel = None; continue; }
                    Ok(n) => n,
                };
                let mut data = &resp_buf[..n];
                if first_response {
                    if data.len() < 2 { continue; }
                    data = &data[2..];
                    first_response = false;
                }
                let (Some(from), Some(addr)) = (client_addr, target.clone()) else { continue };
                for datagram in decode_udp_chunks(data) {
                    let header = UdpHeader { frag: 0, address: addr.clone(), port: target_port };
                    let mut out = header.to_bytes();
                    out.extend_from_slice(&datagram);
                    let _ = udp.send_to(&out, from).await;
                }
            }
        }
    }

    info!(%bound, "udp association torn down");
    Ok(())
}
