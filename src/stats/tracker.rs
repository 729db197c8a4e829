//! A single live connection's stats record (§3 ConnectionRecord).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Owned by the connection task that created it; the collector's registry holds
/// only a shared reference, used for enumeration and removal.
pub struct ConnectionRecord {
    pub id: String,
    pub protocol: String,
    pub client_addr: String,
    pub target_addr: String,
    pub started_at: DateTime<Utc>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ConnectionRecord {
    pub fn new(id: String, protocol: String, client_addr: String, target_addr: String) -> Self {
        ConnectionRecord {
            id,
            protocol,
            client_addr,
            target_addr,
            started_at: Utc::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    pub fn add_upload(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn to_info(&self) -> ConnectionInfo {
        let duration_s = (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        ConnectionInfo {
            id: self.id.clone(),
            protocol: self.protocol.clone(),
            client_addr: self.client_addr.clone(),
            target_addr: self.target_addr.clone(),
            duration_s,
            bytes_up: self.upload(),
            bytes_down: self.download(),
        }
    }
}

/// API-facing view of a live connection (§4.7 `list_connections`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub protocol: String,
    pub client_addr: String,
    pub target_addr: String,
    pub duration_s: f64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_connection() {
        let conn = ConnectionRecord::new(
            "shadowsocks:127.0.0.1:1".to_string(),
            "shadowsocks".to_string(),
            "127.0.0.1:1".to_string(),
            "example.com:443".to_string(),
        );

        assert_eq!(conn.upload(), 0);
        assert_eq!(conn.download(), 0);

        conn.add_upload(100);
        conn.add_download(200);

        assert_eq!(conn.upload(), 100);
        assert_eq!(conn.download(), 200);
    }

    #[test]
    fn test_to_info() {
        let conn = ConnectionRecord::new(
            "id".to_string(),
            "socks5".to_string(),
            "127.0.0.1:1".to_string(),
            "example.com:443".to_string(),
        );
        conn.add_upload(10);
        let info = conn.to_info();
        assert_eq!(info.protocol, "socks5");
        assert_eq!(info.bytes_up, 10);
    }
}
