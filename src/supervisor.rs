//! Listener Supervisor (§4.8): reads configuration, constructs enabled
//! listeners, registers a `ListenerHandle` per protocol, launches them, and
//! dispatches shutdown.

use crate::config::Config;
use crate::inbound::{
    HttpCredentials, HttpListener, InboundListener, ShadowsocksListener, Socks5Credentials, Socks5Listener,
    TrojanListener, VmessListener,
};
use crate::stats::StatsCollector;
use crate::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// (protocol_tag, bind_endpoint, running_flag, live_connection_count) (§3).
pub struct ListenerHandle {
    pub tag: String,
    pub bind: SocketAddr,
    running: Arc<AtomicBool>,
}

impl ListenerHandle {
    pub fn get_status(&self, stats: &StatsCollector) -> serde_json::Value {
        let live = stats
            .snapshot()
            .protocols
            .get(&self.tag)
            .map(|p| p.live_connections)
            .unwrap_or(0);
        serde_json::json!({
            "tag": self.tag,
            "bind": self.bind.to_string(),
            "running": self.running.load(Ordering::Relaxed),
            "live_connections": live,
        })
    }
}

/// Holds every enabled listener plus the shared Stats Collector and the
/// registry the Stats HTTP API (§6/§13) reads from.
pub struct Supervisor {
    pub stats: Arc<StatsCollector>,
    pub servers: Arc<DashMap<String, ListenerHandle>>,
    listeners: Vec<Arc<dyn InboundListener>>,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Supervisor {
    pub async fn from_config(config: &Config, stats: Arc<StatsCollector>) -> Result<Self> {
        let servers = Arc::new(DashMap::new());
        let mut listeners: Vec<Arc<dyn InboundListener>> = Vec::new();
        let host = config.server.host.clone();

        if let Some(ss) = &config.shadowsocks {
            if ss.enabled {
                let bind: SocketAddr = format!("{host}:{}", ss.port).parse()?;
                let listener: Arc<dyn InboundListener> =
                    Arc::new(ShadowsocksListener::new(bind, &ss.method, &ss.password, ss.timeout, stats.clone()).await?);
                register(&servers, "shadowsocks", bind, listener, &mut listeners);
            }
        }
        if let Some(s5) = &config.socks5 {
            if s5.enabled {
                let bind: SocketAddr = format!("{host}:{}", s5.port).parse()?;
                let credentials = match (&s5.username, &s5.password) {
                    (Some(u), Some(p)) => Some(Socks5Credentials { username: u.clone(), password: p.clone() }),
                    _ => None,
                };
                let listener: Arc<dyn InboundListener> =
                    Arc::new(Socks5Listener::new(bind, credentials, s5.timeout, stats.clone()).await?);
                register(&servers, "socks5", bind, listener, &mut listeners);
            }
        }
        if let Some(http) = &config.http {
            if http.enabled {
                let bind: SocketAddr = format!("{host}:{}", http.port).parse()?;
                let credentials = match (&http.username, &http.password) {
                    (Some(u), Some(p)) => Some(HttpCredentials { username: u.clone(), password: p.clone() }),
                    _ => None,
                };
                let listener: Arc<dyn InboundListener> =
                    Arc::new(HttpListener::new(bind, credentials, http.timeout, stats.clone()).await?);
                register(&servers, "http", bind, listener, &mut listeners);
            }
        }
        if let Some(vmess) = &config.vmess {
            if vmess.enabled {
                let bind: SocketAddr = format!("{host}:{}", vmess.port).parse()?;
                let listener: Arc<dyn InboundListener> =
                    Arc::new(VmessListener::new(bind, vmess.tls, vmess.cert_file.as_deref(), vmess.key_file.as_deref()).await?);
                register(&servers, "vmess", bind, listener, &mut listeners);
            }
        }
        if let Some(trojan) = &config.trojan {
            if trojan.enabled {
                let bind: SocketAddr = format!("{host}:{}", trojan.port).parse()?;
                let listener: Arc<dyn InboundListener> =
                    Arc::new(TrojanListener::new(bind, &trojan.cert_file, &trojan.key_file).await?);
                register(&servers, "trojan", bind, listener, &mut listeners);
            }
        }

        let dashboard_addr = if config.dashboard.enabled {
            Some(format!("{host}:{}", config.dashboard.port).parse()?)
        } else {
            None
        };

        Ok(Supervisor { stats, servers, listeners, dashboard_addr })
    }

    /// Launch every registered listener, wait for a shutdown signal, then stop
    /// all listeners (order undefined, each `stop()` is idempotent, §4.8).
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let mut handles = Vec::new();
        for listener in &self.listeners {
            let listener = listener.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = listener.start().await {
                    warn!("listener {} stopped with error: {e}", listener.name());
                }
            }));
        }

        shutdown.await;
        info!("shutdown signal received, stopping listeners");

        for listener in &self.listeners {
            let _ = listener.stop().await;
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn register(
    servers: &Arc<DashMap<String, ListenerHandle>>,
    tag: &str,
    bind: SocketAddr,
    listener: Arc<dyn InboundListener>,
    listeners: &mut Vec<Arc<dyn InboundListener>>,
) {
    servers.insert(
        tag.to_string(),
        ListenerHandle { tag: tag.to_string(), bind, running: Arc::new(AtomicBool::new(true)) },
    );
    listeners.push(listener);
}
