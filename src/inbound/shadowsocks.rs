//! Shadowsocks inbound listener (§4.3).

use super::InboundListener;
use crate::crypto::shadowsocks::{derive_key, CipherKind, ShadowsocksConnection};
use crate::stats::StatsCollector;
use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const TAG: &str = "shadowsocks";

pub struct ShadowsocksListener {
    listener: TcpListener,
    bind: SocketAddr,
    kind: CipherKind,
    key: Vec<u8>,
    timeout: Duration,
    stats: Arc<StatsCollector>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShadowsocksListener {
    pub async fn new(
        bind: SocketAddr,
        method: &str,
        password: &str,
        timeout_secs: u64,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let bind = listener.local_addr()?;
        let kind = CipherKind::try_from(method)?;
        let key = derive_key(password.as_bytes(), kind.key_size());

        Ok(ShadowsocksListener {
            listener,
            bind,
            kind,
            key,
            timeout: Duration::from_secs(timeout_secs),
            stats,
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        })
    }

    async fn handle(stream: TcpStream, peer: SocketAddr, kind: CipherKind, key: Vec<u8>, timeout: Duration, stats: Arc<StatsCollector>) {
        crate::common::addr::configure_tcp_stream(&stream);
        let client_tag = peer.to_string();

        let (ss, address, port, payload) = match ShadowsocksConnection::accept(stream, kind, key).await {
            Ok(v) => v,
            Err(e) => {
                debug!("shadowsocks handshake from {peer} failed: {e}");
                return;
            }
        };

        let target = address.to_string_with_port(port);
        let record = stats.add_connection(TAG, &client_tag, &target);

        let upstream = match TcpStream::connect((address.to_host(), port)).await {
            Ok(s) => s,
            Err(e) => {
                debug!("shadowsocks dial {target} failed: {e}");
                stats.remove_connection(TAG, &client_tag);
                return;
            }
        };
        crate::common::addr::configure_tcp_stream(&upstream);

        let (mut upstream_read, mut upstream_write) = upstream.into_split();
        if !payload.is_empty() && upstream_write.write_all(&payload).await.is_err() {
            stats.remove_connection(TAG, &client_tag);
            return;
        }

        let (mut ss_read, mut ss_write) = ss.into_split();

        let up_record = record.clone();
        let up_stats = stats.clone();
        let upload = async move {
            loop {
                let (plain, ciphertext_len) = match tokio::time::timeout(timeout, ss_read.read_chunk()).await {
                    Ok(Ok(Some(v))) => v,
                    _ => break,
                };
                if upstream_write.write_all(&plain).await.is_err() {
                    break;
                }
                up_record.add_upload(ciphertext_len as u64);
                up_stats.add_traffic(TAG, ciphertext_len as u64, 0);
            }
            let _ = upstream_write.shutdown().await;
        };

        let down_record = record.clone();
        let down_stats = stats.clone();
        let download = async move {
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                let n = match tokio::time::timeout(timeout, upstream_read.read(&mut buf)).await {
                    Ok(Ok(0)) | Err(_) | Ok(Err(_)) => break,
                    Ok(Ok(n)) => n,
                };
                let ciphertext_len = match ss_write.write_chunk(&buf[..n]).await {
                    Ok(len) => len,
                    Err(_) => break,
                };
                down_record.add_download(ciphertext_len as u64);
                down_stats.add_traffic(TAG, 0, ciphertext_len as u64);
            }
            let _ = ss_write.shutdown().await;
        };

        tokio::join!(upload, download);
        stats.remove_connection(TAG, &client_tag);
    }
}

impl ShadowsocksListener {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }
}

#[async_trait]
impl InboundListener for ShadowsocksListener {
    fn name(&self) -> &str {
        "shadowsocks"
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("shadowsocks listening on {}", self.bind);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let kind = self.kind;
                            let key = self.key.clone();
                            let timeout = self.timeout;
                            let stats = self.stats.clone();
                            tokio::spawn(Self::handle(stream, peer, kind, key, timeout, stats));
                        }
                        Err(e) => {
                            if self.running.load(Ordering::SeqCst) {
                                warn!("shadowsocks accept error: {e}");
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
