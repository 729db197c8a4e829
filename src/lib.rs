//! Multi-protocol proxy gateway: Shadowsocks, SOCKS5, and HTTP/HTTPS
//! forward-proxy inbounds sharing one connection lifecycle, with stub
//! TLS-terminating VMess/Trojan listeners, a live Stats Collector, and a
//! Stats HTTP API.
//!
//! # Architecture
//!
//! ```text
//!                     +------------------+
//!                     |   hub/ (Stats    |
//!                     |   HTTP API)      |
//!                     +--------+---------+
//!                              |
//!                     +--------v---------+
//!                     |  stats/ (Stats   |
//!                     |  Collector)      |
//!                     +--------+---------+
//!                              |
//!        +---------------------+---------------------+
//!        |                     |                      |
//! +------v------+      +-------v-------+      +------v------+
//! | inbound/    |      |  relay.rs     |      | supervisor.rs|
//! | (listeners) +----->|  (duplex      |<-----+ (lifecycle)  |
//! +------+------+      |   pump)       |      +--------------+
//!        |              +---------------+
//! +------v------+
//! |  crypto/    |
//! | (shadowsocks|
//! |   ciphers)  |
//! +-------------+
//! ```

pub mod common;
pub mod config;
pub mod crypto;
pub mod hub;
pub mod inbound;
pub mod relay;
pub mod stats;
pub mod supervisor;

pub use common::error::{Error, Result};
pub use config::Config;

use chrono::Utc;
use hub::AppState;
use stats::StatsCollector;
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::info;

pub const VERSION: &str = "0.1.0";

/// Owns the Stats Collector and the Listener Supervisor; `run()` drives both
/// until a shutdown signal arrives.
pub struct Gateway {
    stats: Arc<StatsCollector>,
    supervisor: Supervisor,
}

impl Gateway {
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing proxy gateway v{VERSION}");
        let stats = Arc::new(StatsCollector::new());
        let supervisor = Supervisor::from_config(&config, stats.clone()).await?;
        Ok(Gateway { stats, supervisor })
    }

    /// Launch every enabled listener and the Stats HTTP API (if configured),
    /// then block until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let dashboard_addr = self.supervisor.dashboard_addr;
        let app_state = AppState {
            stats: self.stats.clone(),
            servers: self.supervisor.servers.clone(),
            started_at: Utc::now(),
        };

        let dashboard_handle = dashboard_addr.map(|addr| {
            tokio::spawn(async move {
                if let Err(e) = hub::start_server(app_state, addr).await {
                    tracing::warn!("stats HTTP API error: {e}");
                }
            })
        });

        self.supervisor.run(shutdown_signal()).await?;

        if let Some(handle) = dashboard_handle {
            handle.abort();
        }

        info!("gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
