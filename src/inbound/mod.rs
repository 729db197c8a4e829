//! Inbound listeners (§4.3–§4.5, §9 stubs for vmess/trojan).

mod http;
mod shadowsocks;
mod socks5;
mod trojan;
mod vmess;

pub use http::{HttpCredentials, HttpListener};
pub use shadowsocks::ShadowsocksListener;
pub use socks5::{Socks5Credentials, Socks5Listener};
pub use trojan::TrojanListener;
pub use vmess::VmessListener;

use crate::Result;
use async_trait::async_trait;

/// Common lifecycle every protocol listener implements; the Listener
/// Supervisor (§4.8) drives all of them through this trait uniformly.
#[async_trait]
pub trait InboundListener: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}
