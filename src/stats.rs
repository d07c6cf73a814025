//! Tunnel counters
//!
//! Counters are plain atomics so the encapsulation path can bump them from
//! any context without taking a lock.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PeerConfig;
use crate::error::{DropReason, Result};

/// Live counters for one tunnel instance
#[derive(Debug, Default)]
pub struct TunnelStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    dropped_oversize: AtomicU64,
    dropped_truncated: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_checksum: AtomicU64,
    dropped_protocol: AtomicU64,
    dropped_corrupt: AtomicU64,
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub dropped_oversize: u64,
    pub dropped_truncated: u64,
    pub dropped_malformed: u64,
    pub dropped_checksum: u64,
    pub dropped_protocol: u64,
    pub dropped_corrupt: u64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// An inner packet of `bytes` was encapsulated
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// An inner packet of `bytes` was recovered
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Oversize => &self.dropped_oversize,
            DropReason::Truncated => &self.dropped_truncated,
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Checksum => &self.dropped_checksum,
            DropReason::Protocol => &self.dropped_protocol,
            DropReason::Corrupt => &self.dropped_corrupt,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
            dropped_truncated: self.dropped_truncated.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_checksum: self.dropped_checksum.load(Ordering::Relaxed),
            dropped_protocol: self.dropped_protocol.load(Ordering::Relaxed),
            dropped_corrupt: self.dropped_corrupt.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn total_dropped(&self) -> u64 {
        self.dropped_oversize
            + self.dropped_truncated
            + self.dropped_malformed
            + self.dropped_checksum
            + self.dropped_protocol
            + self.dropped_corrupt
    }
}

/// Status information written by the daemon, read by `eipip status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub interface: String,
    pub peer: PeerConfig,
    pub uptime_secs: u64,
    pub generated_at: DateTime<Utc>,
    pub stats: StatsSnapshot,
}

impl StatusReport {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;

        // Readers only ever see a complete report
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content).map_err(std::io::Error::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = TunnelStats::new();
        stats.record_tx(40);
        stats.record_tx(60);
        stats.record_rx(40);
        stats.record_drop(DropReason::Checksum);
        stats.record_drop(DropReason::Protocol);
        stats.record_drop(DropReason::Protocol);

        let snap = stats.snapshot();
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_bytes, 100);
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.dropped_protocol, 2);
        assert_eq!(snap.total_dropped(), 3);
    }

    #[test]
    fn test_status_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/status.json");
        let report = StatusReport {
            interface: "turtle".into(),
            peer: PeerConfig::default(),
            uptime_secs: 12,
            generated_at: Utc::now(),
            stats: StatsSnapshot {
                rx_packets: 5,
                ..Default::default()
            },
        };
        report.write_to(&path).unwrap();

        let loaded = StatusReport::read_from(&path).unwrap();
        assert_eq!(loaded.interface, "turtle");
        assert_eq!(loaded.peer, report.peer);
        assert_eq!(loaded.stats.rx_packets, 5);
    }

    #[test]
    fn test_status_report_replaced_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut report = StatusReport {
            interface: "turtle".into(),
            peer: PeerConfig::default(),
            uptime_secs: 1,
            generated_at: Utc::now(),
            stats: StatsSnapshot::default(),
        };
        report.write_to(&path).unwrap();
        report.uptime_secs = 61;
        report.write_to(&path).unwrap();

        assert_eq!(StatusReport::read_from(&path).unwrap().uptime_secs, 61);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("status.json")]);
    }
}
