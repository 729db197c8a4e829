//! Stats Collector (§4.7): thread-safe counters and live-connection registry.
//!
//! Grounded on the teacher's `statistic/` module for the DashMap + AtomicU64 +
//! Uuid idiom, restructured to the simpler (protocol_tag, client, target) shape
//! from `examples/original_source/utils/stats.py`, which is also the source of
//! the hourly-bucket ring and JSON export/save/load behavior (§4.7 ambient).

pub mod tracker;

pub use tracker::{ConnectionInfo, ConnectionRecord};

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const HOURLY_RING_CAPACITY: usize = 24;

/// Per-protocol traffic/connection counters (§3 ProtocolCounters).
#[derive(Default)]
pub struct ProtocolCounters {
    upload: AtomicU64,
    download: AtomicU64,
    live_connections: AtomicU64,
    cumulative_connections: AtomicU64,
}

impl ProtocolCounters {
    fn snapshot(&self) -> ProtocolCountersSnapshot {
        ProtocolCountersSnapshot {
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
            live_connections: self.live_connections.load(Ordering::Relaxed),
            cumulative_connections: self.cumulative_connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProtocolCountersSnapshot {
    pub upload: u64,
    pub download: u64,
    pub live_connections: u64,
    pub cumulative_connections: u64,
}

/// One entry in the 24-capacity hourly ring (§3 HourlyBucket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_index: i64,
    pub timestamp: i64,
    pub cumulative_upload: u64,
    pub cumulative_download: u64,
    pub cumulative_connections: u64,
    pub protocols: std::collections::HashMap<String, ProtocolCountersSnapshot>,
}

/// Point-in-time view returned by `snapshot()` (§4.7), matching `GET /api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime: i64,
    pub start_time: DateTime<Utc>,
    pub current_time: DateTime<Utc>,
    pub total_upload: u64,
    pub total_download: u64,
    pub total_connections: u64,
    pub active_connections: usize,
    pub protocols: std::collections::HashMap<String, ProtocolCountersSnapshot>,
}

/// JSON export shape (§4.7 ambient: `save_to_file`/`load_from_file`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsExport {
    pub current_stats: StatsExportCurrent,
    pub active_connections: Vec<ConnectionInfo>,
    pub hourly_stats: Vec<HourlyBucket>,
    pub export_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsExportCurrent {
    pub uptime: i64,
    pub start_time: DateTime<Utc>,
    pub current_time: DateTime<Utc>,
    pub total_upload: u64,
    pub total_download: u64,
    pub total_connections: u64,
    pub active_connections: usize,
    pub protocols: std::collections::HashMap<String, ProtocolCountersSnapshot>,
}

/// Guarded by DashMap's internal sharded locking plus per-field atomics, which
/// together give the O(1)-critical-section guarantee §5 asks of the Stats
/// Collector without a single coarse mutex around every operation.
pub struct StatsCollector {
    start_time: Mutex<DateTime<Utc>>,
    connections: DashMap<String, Arc<ConnectionRecord>>,
    protocols: DashMap<String, Arc<ProtocolCounters>>,
    total_upload: AtomicU64,
    total_download: AtomicU64,
    total_connections: AtomicU64,
    hourly: Mutex<VecDeque<HourlyBucket>>,
    last_hour_update: AtomicI64,
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector {
            start_time: Mutex::new(Utc::now()),
            connections: DashMap::new(),
            protocols: DashMap::new(),
            total_upload: AtomicU64::new(0),
            total_download: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            hourly: Mutex::new(VecDeque::with_capacity(HOURLY_RING_CAPACITY)),
            last_hour_update: AtomicI64::new(current_hour_index()),
        }
    }

    fn protocol_counters(&self, protocol: &str) -> Arc<ProtocolCounters> {
        self.protocols
            .entry(protocol.to_string())
            .or_insert_with(|| Arc::new(ProtocolCounters::default()))
            .clone()
    }

    /// Insert a ConnectionRecord and bump cumulative/live counts for its protocol.
    pub fn add_connection(&self, protocol: &str, client_addr: &str, target_addr: &str) -> Arc<ConnectionRecord> {
        let id = format!("{}:{}", protocol, client_addr);
        let record = Arc::new(ConnectionRecord::new(
            id.clone(),
            protocol.to_string(),
            client_addr.to_string(),
            target_addr.to_string(),
        ));
        self.connections.insert(id, record.clone());

        let counters = self.protocol_counters(protocol);
        counters.cumulative_connections.fetch_add(1, Ordering::Relaxed);
        counters.live_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        record
    }

    /// Remove the record for `(protocol, client_addr)` and decrement live count.
    pub fn remove_connection(&self, protocol: &str, client_addr: &str) {
        let id = format!("{}:{}", protocol, client_addr);
        if self.connections.remove(&id).is_some() {
            if let Some(counters) = self.protocols.get(protocol) {
                counters.live_connections.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Add traffic to per-protocol and global totals, advancing the hourly ring
    /// if the wall-clock hour has rolled over since the last call.
    pub fn add_traffic(&self, protocol: &str, up: u64, down: u64) {
        let counters = self.protocol_counters(protocol);
        counters.upload.fetch_add(up, Ordering::Relaxed);
        counters.download.fetch_add(down, Ordering::Relaxed);
        self.total_upload.fetch_add(up, Ordering::Relaxed);
        self.total_download.fetch_add(down, Ordering::Relaxed);
        self.maybe_advance_hour();
    }

    fn maybe_advance_hour(&self) {
        let now_hour = current_hour_index();
        let last = self.last_hour_update.load(Ordering::Relaxed);
        if now_hour > last {
            self.last_hour_update.store(now_hour, Ordering::Relaxed);
            let bucket = HourlyBucket {
                hour_index: now_hour,
                timestamp: now_hour * 3600,
                cumulative_upload: self.total_upload.load(Ordering::Relaxed),
                cumulative_download: self.total_download.load(Ordering::Relaxed),
                cumulative_connections: self.total_connections.load(Ordering::Relaxed),
                protocols: self.protocol_snapshots(),
            };
            let mut ring = self.hourly.lock().unwrap();
            ring.push_back(bucket);
            while ring.len() > HOURLY_RING_CAPACITY {
                ring.pop_front();
            }
        }
    }

    fn protocol_snapshots(&self) -> std::collections::HashMap<String, ProtocolCountersSnapshot> {
        self.protocols
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Point-in-time snapshot: uptime, totals, per-protocol copy, live count (§4.7).
    pub fn snapshot(&self) -> StatsSnapshot {
        let start_time = *self.start_time.lock().unwrap();
        let now = Utc::now();
        StatsSnapshot {
            uptime: (now - start_time).num_seconds(),
            start_time,
            current_time: now,
            total_upload: self.total_upload.load(Ordering::Relaxed),
            total_download: self.total_download.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.connections.len(),
            protocols: self.protocol_snapshots(),
        }
    }

    /// `{id, tag, client, target, duration_s, bytes_up, bytes_down}` per live connection.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|entry| entry.value().to_info()).collect()
    }

    pub fn hourly(&self) -> Vec<HourlyBucket> {
        self.hourly.lock().unwrap().iter().cloned().collect()
    }

    /// Zero all counters and reset start_time = now (§4.7).
    pub fn reset(&self) {
        self.connections.clear();
        self.protocols.clear();
        self.total_upload.store(0, Ordering::Relaxed);
        self.total_download.store(0, Ordering::Relaxed);
        self.total_connections.store(0, Ordering::Relaxed);
        self.hourly.lock().unwrap().clear();
        self.last_hour_update.store(current_hour_index(), Ordering::Relaxed);
        *self.start_time.lock().unwrap() = Utc::now();
    }

    pub fn upload_total(&self) -> u64 {
        self.total_upload.load(Ordering::Relaxed)
    }

    pub fn download_total(&self) -> u64 {
        self.total_download.load(Ordering::Relaxed)
    }

    /// Same shape as `/api/stats` plus `active_connections`/`hourly_stats`/`export_time`.
    pub fn export(&self) -> StatsExport {
        let snap = self.snapshot();
        StatsExport {
            current_stats: StatsExportCurrent {
                uptime: snap.uptime,
                start_time: snap.start_time,
                current_time: snap.current_time,
                total_upload: snap.total_upload,
                total_download: snap.total_download,
                total_connections: snap.total_connections,
                active_connections: snap.active_connections,
                protocols: snap.protocols,
            },
            active_connections: self.list_connections(),
            hourly_stats: self.hourly(),
            export_time: Utc::now(),
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let export = self.export();
        let json = serde_json::to_string_pretty(&export)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<StatsExport> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(Error::from)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn current_hour_index() -> i64 {
    Utc::now().timestamp() / 3600
}
