//! End-to-end SOCKS5 CONNECT over the client's direct path: no node involved,
//! since a loopback destination always resolves to an unknown country and
//! takes the direct branch of `client::handle_connect`.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wsvless::client::{self, ClientConfig};

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socks5 listener at {addr} never came up");
}

#[tokio::test]
async fn connect_relays_bytes_over_direct_path() {
    let echo_addr = spawn_echo_server().await;

    let socks_addr = "127.0.0.1:38121";
    let shutdown = CancellationToken::new();
    let config = ClientConfig {
        listen: socks_addr.to_string(),
        node_url: "ws://127.0.0.1:1/wsv/unused".to_string(),
        uuid: Uuid::new_v4(),
        geoip_db: "nonexistent-test.mmdb".to_string(),
    };
    let shutdown_for_client = shutdown.clone();
    tokio::spawn(async move {
        let _ = client::run(config, shutdown_for_client).await;
    });

    let mut conn = connect_with_retry(socks_addr).await;

    // Greeting: version 5, one method, no-auth.
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    conn.read_exact(&mut greeting_reply).await.unwrap();
    assert_eq!(greeting_reply, [0x05, 0x00]);

    // CONNECT to the echo server by IPv4 literal.
    let octets = match echo_addr.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => panic!("expected an IPv4 echo address"),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&octets);
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    conn.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "expected REP_SUCCEEDED");

    conn.write_all(b"hello through socks5").await.unwrap();
    let mut echoed = [0u8; 21];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through socks5");

    shutdown.cancel();
}

#[tokio::test]
async fn connect_to_unreachable_host_replies_failure() {
    let socks_addr = "127.0.0.1:38122";
    let shutdown = CancellationToken::new();
    let config = ClientConfig {
        listen: socks_addr.to_string(),
        node_url: "ws://127.0.0.1:1/wsv/unused".to_string(),
        uuid: Uuid::new_v4(),
        geoip_db: "nonexistent-test.mmdb".to_string(),
    };
    let shutdown_for_client = shutdown.clone();
    tokio::spawn(async move {
        let _ = client::run(config, shutdown_for_client).await;
    });

    let mut conn = connect_with_retry(socks_addr).await;
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    conn.read_exact(&mut greeting_reply).await.unwrap();

    // Port 1 on loopback: nothing listens there, connect fails fast.
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&1u16.to_be_bytes());
    conn.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_ne!(reply[1], 0x00, "expected a failure reply code");

    shutdown.cancel();
}
