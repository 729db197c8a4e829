//! VMess stub listener (§9 resolution #3): TLS-terminating accept loop only,
//! no protocol parsing beyond that. Acknowledged as a stub in the source.

use super::InboundListener;
use crate::{Error, Result};
use async_trait::async_trait;
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub struct VmessListener {
    listener: TcpListener,
    bind: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl VmessListener {
    pub async fn new(bind: SocketAddr, tls: bool, cert_file: Option<&str>, key_file: Option<&str>) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let bind = listener.local_addr()?;
        let acceptor = if tls {
            Some(build_acceptor(cert_file, key_file)?)
        } else {
            None
        };
        Ok(VmessListener {
            listener,
            bind,
            acceptor,
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        })
    }
}

fn build_acceptor(cert_file: Option<&str>, key_file: Option<&str>) -> Result<TlsAcceptor> {
    let cert_path = cert_file.ok_or_else(|| Error::config("vmess.cert_file required when tls is enabled"))?;
    let key_path = key_file.ok_or_else(|| Error::config("vmess.key_file required when tls is enabled"))?;

    let cert_file = std::fs::File::open(cert_path).map_err(Error::from)?;
    let certs = certs(&mut BufReader::new(cert_file)).collect::<std::result::Result<Vec<_>, _>>()?;

    let key_file = std::fs::File::open(key_path).map_err(Error::from)?;
    let key = private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| Error::config("no private key found in vmess.key_file"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::from)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[async_trait]
impl InboundListener for VmessListener {
    fn name(&self) -> &str {
        "vmess"
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("vmess (stub) listening on {}", self.bind);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("vmess stub accepted connection from {peer}, terminating TLS only");
                            if let Some(acceptor) = self.acceptor.clone() {
                                tokio::spawn(async move {
                                    let _ = acceptor.accept(stream).await;
                                });
                            }
                        }
                        Err(e) => {
                            if self.running.load(Ordering::SeqCst) {
                                warn!("vmess accept error: {e}");
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
