//! SOCKS5 inbound listener (§4.4).

use super::InboundListener;
use crate::common::socks::{
    AuthRequest, AuthResponse, Command, Request, Response, UsernamePasswordAuth, AUTH_NO_ACCEPTABLE,
    AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD, REP_ADDRESS_TYPE_NOT_SUPPORTED, REP_COMMAND_NOT_SUPPORTED, REP_CONNECTION_REFUSED,
    REP_GENERAL_FAILURE,
};
use crate::common::Address;
use crate::relay::relay;
use crate::stats::StatsCollector;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const TAG: &str = "socks5";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Socks5Credentials {
    pub username: String,
    pub password: String,
}

pub struct Socks5Listener {
    listener: TcpListener,
    bind: SocketAddr,
    credentials: Option<Socks5Credentials>,
    timeout: Duration,
    stats: Arc<StatsCollector>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Socks5Listener {
    pub async fn new(
        bind: SocketAddr,
        credentials: Option<Socks5Credentials>,
        timeout_secs: u64,
        stats: Arc<StatsCollector>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let bind = listener.local_addr()?;
        Ok(Socks5Listener {
            listener,
            bind,
            credentials,
            timeout: Duration::from_secs(timeout_secs),
            stats,
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        })
    }

    async fn handle(mut stream: TcpStream, peer: SocketAddr, credentials: Option<Socks5Credentials>, timeout: Duration, stats: Arc<StatsCollector>) {
        crate::common::addr::configure_tcp_stream(&stream);
        if let Err(e) = Self::negotiate(&mut stream, &credentials).await {
            debug!("socks5 negotiation with {peer} failed: {e}");
            return;
        }

        let request = match tokio::time::timeout(HANDSHAKE_TIMEOUT, Request::read_from(&mut stream)).await {
            Ok(Ok(req)) => req,
            Ok(Err(Error::BadAddressType(tag))) => {
                debug!("socks5 request from {peer} used unsupported address type {tag}");
                let _ = Response::failure(REP_ADDRESS_TYPE_NOT_SUPPORTED).write_to(&mut stream).await;
                return;
            }
            Ok(Err(e)) => {
                debug!("socks5 request from {peer} failed to parse: {e}");
                let _ = Response::failure(REP_COMMAND_NOT_SUPPORTED).write_to(&mut stream).await;
                return;
            }
            Err(_) => return,
        };

        if request.command != Command::Connect {
            let _ = Response::failure(REP_COMMAND_NOT_SUPPORTED).write_to(&mut stream).await;
            return;
        }

        let target = request.address.to_string_with_port(request.port);
        let client_tag = peer.to_string();

        let upstream = match TcpStream::connect((request.address.to_host(), request.port)).await {
            Ok(s) => s,
            Err(e) => {
                let reply = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    REP_CONNECTION_REFUSED
                } else {
                    REP_GENERAL_FAILURE
                };
                let _ = Response::failure(reply).write_to(&mut stream).await;
                debug!("socks5 dial {target} failed: {e}");
                return;
            }
        };
        crate::common::addr::configure_tcp_stream(&upstream);

        // BND address is always 0.0.0.0:0 (§4.4); clients do not validate it.
        if Response::success(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0).write_to(&mut stream).await.is_err() {
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

    async fn negotiate(stream: &mut TcpStream, credentials: &Option<Socks5Credentials>) -> Result<()> {
        let greet = tokio::time::timeout(HANDSHAKE_TIMEOUT, AuthRequest::read_from(stream))
            .await
            .map_err(|_| Error::timeout("socks5 greeting"))??;

        match credentials {
            Some(creds) => {
                if !greet.supports(AUTH_USERNAME_PASSWORD) {
                    AuthResponse::new(AUTH_NO_ACCEPTABLE).write_to(stream).await?;
                    return Err(Error::auth("client does not support username/password auth"));
                }
                AuthResponse::new(AUTH_USERNAME_PASSWORD).write_to(stream).await?;

                let auth = tokio::time::timeout(HANDSHAKE_TIMEOUT, UsernamePasswordAuth::read_from(stream))
                    .await
                    .map_err(|_| Error::timeout("socks5 auth"))??;

                let ok = auth.username == creds.username && auth.password == creds.password;
                UsernamePasswordAuth::write_response(stream, ok).await?;
                if !ok {
                    return Err(Error::auth("invalid username/password"));
                }
            }
            None => {
                if !greet.supports(AUTH_NO_AUTH) {
                    AuthResponse::new(AUTH_NO_ACCEPTABLE).write_to(stream).await?;
                    return Err(Error::auth("client requires auth but none configured"));
                }
                AuthResponse::new(AUTH_NO_AUTH).write_to(stream).await?;
            }
        }
        Ok(())
    }
}

impl Socks5Listener {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }
}

#[async_trait]
impl InboundListener for Socks5Listener {
    fn name(&self) -> &str {
        "socks5"
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("socks5 listening on {}", self.bind);

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
                                warn!("socks5 accept error: {e}");
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
