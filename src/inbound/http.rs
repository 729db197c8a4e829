//! HTTP forward-proxy inbound listener (§4.5).

use super::InboundListener;
use crate::relay::relay;
use crate::stats::StatsCollector;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const TAG: &str = "http";
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 4 * 1024;

#[derive(Clone)]
pub struct HttpCredentials {
    pub username: String,
    pub password: String,
}

pub struct HttpListener {
    listener: TcpListener,
    bind: SocketAddr,
    credentials: Option<HttpCredentials>,
    timeout: Duration,
    stats: Arc<StatsCollector>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

struct ParsedRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
}

impl HttpListener {
    pub async fn new(
        bind: SocketAddr,
        credentials: Option<HttpCredentials>,
        timeout_secs: u64,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let bind = listener.local_addr()?;
        Ok(HttpListener {
            listener,
            bind,
            credentials,
            timeout: Duration::from_secs(timeout_secs),
            stats,
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        })
    }

    async fn handle(stream: TcpStream, peer: SocketAddr, credentials: Option<HttpCredentials>, timeout: Duration, stats: Arc<StatsCollector>) {
        crate::common::addr::configure_tcp_stream(&stream);
        let mut reader = BufReader::new(stream);

        let parsed = match tokio::time::timeout(HEADER_TIMEOUT, read_request(&mut reader)).await {
            Ok(Ok(p)) => p,
            _ => return,
        };

        if let Some(creds) = &credentials {
            if !authorized(&parsed.headers, creds) {
                let mut stream = reader.into_inner();
                let _ = stream
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n")
                    .await;
                debug!("http proxy auth failed from {peer}");
                return;
            }
        }

        let stream = reader.into_inner();

        if parsed.method.eq_ignore_ascii_case("CONNECT") {
            Self::handle_connect(stream, peer, &parsed.uri, timeout, stats).await;
        } else {
            Self::handle_forward(stream, peer, &parsed, timeout, stats).await;
        }
    }

    async fn handle_connect(mut stream: TcpStream, peer: SocketAddr, uri: &str, timeout: Duration, stats: Arc<StatsCollector>) {
        let (host, port) = parse_connect_target(uri);
        let target = format!("{host}:{port}");
        let client_tag = peer.to_string();

        let upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                debug!("http CONNECT dial {target} failed: {e}");
                return;
            }
        };
        crate::common::addr::configure_tcp_stream(&upstream);

        if stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.is_err() {
            return;
        }

        let record = stats.add_connection(TAG, &client_tag, &target);
        let (client_read, client_write) = tokio::io::split(stream);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let up_record = record.clone();
        let up_stats = stats.clone();
        let down_record = record.clone();
        let down_stats = stats.clone();

        relay(
            client_read,
            client_write,
            upstream_read,
            upstream_write,
            timeout,
            move |n| {
                up_record.add_upload(n);
                up_stats.add_traffic(TAG, n, 0);
            },
            move |n| {
                down_record.add_download(n);
                down_stats.add_traffic(TAG, 0, n);
            },
        )
        .await;

        stats.remove_connection(TAG, &client_tag);
    }

    async fn handle_forward(mut stream: TcpStream, peer: SocketAddr, parsed: &ParsedRequest, timeout: Duration, stats: Arc<StatsCollector>) {
        let (host, port, path) = match resolve_forward_target(&parsed.uri, &parsed.headers) {
            Some(v) => v,
            None => {
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
                return;
            }
        };
        let target = format!("{host}:{port}");
        let client_tag = peer.to_string();

        let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                debug!("http forward dial {target} failed: {e}");
                return;
            }
        };
        crate::common::addr::configure_tcp_stream(&upstream);

        let mut request = format!("{} {} HTTP/1.1\r\n", parsed.method, path);
        for (key, value) in &parsed.headers {
            if is_excluded_header(key) {
                continue;
            }
            request.push_str(&format!("{key}: {value}\r\n"));
        }
        request.push_str("Connection: close\r\n\r\n");

        if upstream.write_all(request.as_bytes()).await.is_err() {
            return;
        }

        let record = stats.add_connection(TAG, &client_tag, &target);
        let (client_read, client_write) = tokio::io::split(stream);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let up_record = record.clone();
        let up_stats = stats.clone();
        let down_record = record.clone();
        let down_stats = stats.clone();

        relay(
            client_read,
            client_write,
            upstream_read,
            upstream_write,
            timeout,
            move |n| {
                up_record.add_upload(n);
                up_stats.add_traffic(TAG, n, 0);
            },
            move |n| {
                down_record.add_download(n);
                down_stats.add_traffic(TAG, 0, n);
            },
        )
        .await;

        stats.remove_connection(TAG, &client_tag);
    }
}

async fn read_request<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<ParsedRequest> {
    let mut first_line = String::new();
    let mut total = 0usize;
    loop {
        let n = reader.read_line(&mut first_line).await?;
        total += n;
        if n == 0 || !first_line.trim().is_empty() || total > MAX_HEADER_BYTES {
            break;
        }
        first_line.clear();
    }
    let first_line = first_line.trim();
    if first_line.is_empty() {
        return Err(Error::protocol("empty request"));
    }

    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::protocol("invalid request line"));
    }
    let method = parts[0].to_string();
    let uri = parts[1].to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        total += reader.read_line(&mut line).await?;
        if total > MAX_HEADER_BYTES {
            return Err(Error::protocol("headers too large"));
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(idx) = line.find(':') {
            headers.push((line[..idx].trim().to_string(), line[idx + 1..].trim().to_string()));
        }
    }

    Ok(ParsedRequest { method, uri, headers })
}

fn authorized(headers: &[(String, String)], creds: &HttpCredentials) -> bool {
    let Some((_, value)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("proxy-authorization")) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    match text.split_once(':') {
        Some((user, pass)) => user == creds.username && pass == creds.password,
        None => false,
    }
}

/// CONNECT target, defaulting to port 443 when omitted (§4.5 — the teacher's
/// shared helper defaulted every scheme to port 80, which is wrong for CONNECT).
fn parse_connect_target(uri: &str) -> (String, u16) {
    match uri.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
        None => (uri.to_string(), 443),
    }
}

fn resolve_forward_target(uri: &str, headers: &[(String, String)]) -> Option<(String, u16, String)> {
    if let Some(rest) = uri.strip_prefix("http://") {
        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
            None => (host_port.to_string(), 80),
        };
        return Some((host, port, path.to_string()));
    }

    let host_header = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("host")).map(|(_, v)| v.clone())?;
    let (host, port) = match host_header.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
        None => (host_header, 80),
    };
    Some((host, port, uri.to_string()))
}

/// Narrowed hop-by-hop exclusion per §4.5: just these, not the teacher's
/// broader RFC 2616 hop-by-hop list. `connection` is dropped too, since the
/// forwarded request always appends its own `Connection: close`.
fn is_excluded_header(key: &str) -> bool {
    key.eq_ignore_ascii_case("proxy-authorization") || key.eq_ignore_ascii_case("proxy-connection") || key.eq_ignore_ascii_case("connection")
}

impl HttpListener {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }
}

#[async_trait]
impl InboundListener for HttpListener {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("http proxy listening on {}", self.bind);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let credentials = self.credentials.clone();
                            let timeout = self.timeout;
                            let stats = self.stats.clone();
                            tokio::spawn(Self::handle(stream, peer, credentials, timeout, stats));
                        }
                        Err(e) => {
                            if self.running.load(Ordering::SeqCst) {
                                warn!("http accept error: {e}");
                            }
                        }
                    }
                }
                _ = self.notify.notified() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_target_defaults_to_443() {
        assert_eq!(parse_connect_target("example.test:8443"), ("example.test".to_string(), 8443));
        assert_eq!(parse_connect_target("example.test"), ("example.test".to_string(), 443));
    }

    #[test]
    fn test_resolve_forward_target_absolute_uri() {
        let (host, port, path) = resolve_forward_target("http://127.0.0.1:55556/ping", &[]).unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 55556);
        assert_eq!(path, "/ping");
    }

    #[test]
    fn test_resolve_forward_target_uses_host_header() {
        let headers = vec![("host".to_string(), "example.test:8080".to_string())];
        let (host, port, path) = resolve_forward_target("/ping", &headers).unwrap();
        assert_eq!(host, "example.test");
        assert_eq!(port, 8080);
        assert_eq!(path, "/ping");
    }

    #[test]
    fn test_narrowed_hop_by_hop_exclusion() {
        assert!(is_excluded_header("proxy-authorization"));
        assert!(is_excluded_header("Proxy-Authorization"));
        assert!(is_excluded_header("proxy-connection"));
        assert!(is_excluded_header("connection"));
        assert!(is_excluded_header("Connection"));
        assert!(!is_excluded_header("keep-alive"));
    }

    #[test]
    fn test_resolve_forward_target_uses_host_header_case_insensitively() {
        let headers = vec![("Host".to_string(), "example.test:8080".to_string())];
        let (host, port, path) = resolve_forward_target("/ping", &headers).unwrap();
        assert_eq!(host, "example.test");
        assert_eq!(port, 8080);
        assert_eq!(path, "/ping");
    }
}
