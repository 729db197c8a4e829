//! End-to-end scenarios driving the gateway through real sockets (§8).

use proxy_gateway::common::Address;
use proxy_gateway::crypto::shadowsocks::{decrypt, derive_key, encode_request, encrypt, CipherKind};
use proxy_gateway::inbound::{HttpCredentials, HttpListener, InboundListener, ShadowsocksListener, Socks5Credentials, Socks5Listener};
use proxy_gateway::stats::StatsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn spawn_http_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let received = String::from_utf8_lossy(&buf[..n]).to_string();
        let body = format!("received:{received}");
        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
        stream.write_all(response.as_bytes()).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_socks5_no_auth_ipv4_echo() {
    let echo_addr = spawn_echo_server().await;
    let stats = Arc::new(StatsCollector::new());
    let listener = Socks5Listener::new("127.0.0.1:0".parse().unwrap(), None, 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_socks5_unknown_address_type_replies_08() {
    let stats = Arc::new(StatsCollector::new());
    let listener = Socks5Listener::new("127.0.0.1:0".parse().unwrap(), None, 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);

    // CMD=CONNECT, ATYP=0x02 (unassigned) — must get REP=08, not a silent close.
    let request = vec![0x05, 0x01, 0x00, 0x02, 0x00, 0x00];
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x08, 0x00, 0x01]);
}

#[tokio::test]
async fn test_socks5_unknown_command_replies_07() {
    let stats = Arc::new(StatsCollector::new());
    let listener = Socks5Listener::new("127.0.0.1:0".parse().unwrap(), None, 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x00]);

    // CMD=0x09 (unassigned), ATYP=IPv4 — must get REP=07.
    let mut request = vec![0x05, 0x09, 0x00, 0x01];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&[0x00, 0x00]);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0..2], [0x05, 0x07]);
}

#[tokio::test]
async fn test_socks5_username_password_success() {
    let echo_addr = spawn_echo_server().await;
    let stats = Arc::new(StatsCollector::new());
    let credentials = Socks5Credentials { username: "u".to_string(), password: "p".to_string() };
    let listener = Socks5Listener::new("127.0.0.1:0".parse().unwrap(), Some(credentials), 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x02]);

    client.write_all(&[0x01, 0x01, b'u', 0x01, b'p']).await.unwrap();
    let mut auth_resp = [0u8; 2];
    client.read_exact(&mut auth_resp).await.unwrap();
    assert_eq!(auth_resp, [0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0..2], [0x05, 0x00]);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_socks5_username_password_failure() {
    let stats = Arc::new(StatsCollector::new());
    let credentials = Socks5Credentials { username: "u".to_string(), password: "p".to_string() };
    let listener = Socks5Listener::new("127.0.0.1:0".parse().unwrap(), Some(credentials), 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [0x05, 0x02]);

    client.write_all(&[0x01, 0x01, b'u', 0x01, b'q']).await.unwrap();
    let mut auth_resp = [0u8; 2];
    client.read_exact(&mut auth_resp).await.unwrap();
    assert_eq!(auth_resp, [0x01, 0x01]);

    let mut buf = [0u8; 1];
    let result = client.read(&mut buf).await.unwrap();
    assert_eq!(result, 0);
}

#[tokio::test]
async fn test_http_connect_tunnels_bytes() {
    let echo_addr = spawn_echo_server().await;
    let stats = Arc::new(StatsCollector::new());
    let listener = HttpListener::new("127.0.0.1:0".parse().unwrap(), None, 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", echo_addr.port(), echo_addr.port());
    client.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 512];
    let n = client.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_http_forward_with_absolute_uri_strips_proxy_authorization() {
    let upstream_addr = spawn_http_echo_server().await;
    let stats = Arc::new(StatsCollector::new());
    let credentials = HttpCredentials { username: "u".to_string(), password: "p".to_string() };
    let listener = HttpListener::new("127.0.0.1:0".parse().unwrap(), Some(credentials), 30, stats).await.unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(bind).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ping HTTP/1.1\r\nProxy-Authorization: Basic dTpw\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream_addr.port(),
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 512];
    let n = client.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.contains("received:"));
    assert!(!response.contains("Proxy-Authorization"));
    assert!(response.contains(&format!("Host: 127.0.0.1:{}", upstream_addr.port())));
}

#[tokio::test]
async fn test_shadowsocks_aes_256_gcm_round_trip() {
    let echo_addr = spawn_echo_server().await;
    let stats = Arc::new(StatsCollector::new());
    let listener = ShadowsocksListener::new("127.0.0.1:0".parse().unwrap(), "aes-256-gcm", "test-password", 30, stats)
        .await
        .unwrap();
    let bind = listener.bind_addr();
    let listener = Arc::new(listener);
    let running = listener.clone();
    tokio::spawn(async move { running.start().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let kind = CipherKind::try_from("aes-256-gcm").unwrap();
    let key = derive_key(b"test-password", kind.key_size());
    let iv = vec![0x42u8; kind.iv_size()];

    let mut client = TcpStream::connect(bind).await.unwrap();
    client.write_all(&iv).await.unwrap();

    let target = Address::Ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1));
    let request = encode_request(&target, echo_addr.port(), b"hello");
    let sealed = encrypt(kind, &key, &iv, &request).unwrap();
    client.write_all(&sealed).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    let plain = decrypt(kind, &key, &iv, &buf[..n]).unwrap();
    assert_eq!(plain, b"hello");
}
