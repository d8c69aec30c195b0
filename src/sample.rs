//! The emitted metric record and its wire shape.
//!
//! Optional numeric fields are `Option<f64>` with omit-when-absent
//! serialization: an unset or invalid value never appears on the wire, and
//! never as a literal NaN/Infinity. Raw deltas, elapsed time and the
//! has-delta flag are internal fields excluded from the encoding.

use serde::Serialize;
use tracing::debug;

use crate::delta::IoDelta;
use crate::probe::{PartitionStat, UsageStat};

/// Scales a platform byte count into the f64 carried on the wire.
pub fn platform_byte_scale(bytes: u64) -> f64 {
    bytes as f64
}

/// Drops non-finite values so NaN/Inf never reaches a sample field.
fn finite_or_none(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        debug!(value, "dropping non-finite metric value");
        None
    }
}

/// One metric record for one (device, mountpoint) pair in one cycle.
///
/// Immutable once returned from a cycle; ownership passes to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSample {
    pub mount_point: String,
    pub device: String,
    /// Stringified boolean, per the ingest contract.
    pub is_read_only: String,
    #[serde(rename = "filesystemType")]
    pub file_system_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters_source: Option<String>,

    #[serde(rename = "diskUsedBytes", skip_serializing_if = "Option::is_none")]
    pub used_bytes: Option<f64>,
    #[serde(rename = "diskUsedPercent", skip_serializing_if = "Option::is_none")]
    pub used_percent: Option<f64>,
    #[serde(rename = "diskFreeBytes", skip_serializing_if = "Option::is_none")]
    pub free_bytes: Option<f64>,
    #[serde(rename = "diskFreePercent", skip_serializing_if = "Option::is_none")]
    pub free_percent: Option<f64>,
    #[serde(rename = "diskTotalBytes", skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_utilization_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_utilization_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_utilization_percent: Option<f64>,
    #[serde(rename = "readBytesPerSecond", skip_serializing_if = "Option::is_none")]
    pub read_bytes_per_sec: Option<f64>,
    #[serde(rename = "writeBytesPerSecond", skip_serializing_if = "Option::is_none")]
    pub write_bytes_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_write_bytes_per_second: Option<f64>,
    #[serde(rename = "readIoPerSecond", skip_serializing_if = "Option::is_none")]
    pub reads_per_sec: Option<f64>,
    #[serde(rename = "writeIoPerSecond", skip_serializing_if = "Option::is_none")]
    pub writes_per_sec: Option<f64>,

    // Internal fields for downstream aggregation, never encoded.
    #[serde(skip)]
    pub io_time_delta: u64,
    #[serde(skip)]
    pub read_time_delta: u64,
    #[serde(skip)]
    pub write_time_delta: u64,
    #[serde(skip)]
    pub read_count_delta: u64,
    #[serde(skip)]
    pub write_count_delta: u64,
    #[serde(skip)]
    pub elapsed_sample_delta_ms: i64,
    #[serde(skip)]
    pub has_delta: bool,
}

impl StorageSample {
    /// Base record for one partition, before usage and delta fields.
    pub fn from_partition(p: &PartitionStat, elapsed_ms: i64) -> Self {
        Self {
            mount_point: p.mountpoint.clone(),
            device: p.device.clone(),
            is_read_only: p.is_read_only().to_string(),
            file_system_type: p.fstype.clone(),
            elapsed_sample_delta_ms: elapsed_ms,
            ..Default::default()
        }
    }

    /// Sets the usage fields from a usage reading.
    ///
    /// Percentages are computed over used + free rather than total, since
    /// total on some platforms includes space reserved outside usable
    /// capacity.
    pub fn populate_usage(&mut self, usage: &UsageStat) {
        let used = platform_byte_scale(usage.used);
        let total = platform_byte_scale(usage.total);
        let free = platform_byte_scale(usage.free);

        self.used_bytes = finite_or_none(used);
        self.total_bytes = finite_or_none(total);
        self.free_bytes = finite_or_none(free);

        let used_percent = used / (used + free) * 100.0;
        self.used_percent = finite_or_none(used_percent);
        self.free_percent = finite_or_none(100.0 - used_percent);
    }

    /// Merges delta-derived fields in. Usage fields are left untouched;
    /// they come from a different source.
    pub fn merge_delta(&mut self, delta: &IoDelta, source: &str) {
        self.has_delta = true;
        self.counters_source = Some(source.to_string());

        self.total_utilization_percent = finite_or_none(delta.total_utilization_percent);
        self.read_utilization_percent = finite_or_none(delta.read_utilization_percent);
        self.write_utilization_percent = finite_or_none(delta.write_utilization_percent);
        self.reads_per_sec = finite_or_none(delta.reads_per_sec);
        self.writes_per_sec = finite_or_none(delta.writes_per_sec);
        self.read_bytes_per_sec = finite_or_none(delta.read_bytes_per_sec);
        self.write_bytes_per_sec = finite_or_none(delta.write_bytes_per_sec);
        self.read_write_bytes_per_second = match (self.read_bytes_per_sec, self.write_bytes_per_sec)
        {
            (Some(r), Some(w)) => finite_or_none(r + w),
            _ => None,
        };

        self.io_time_delta = delta.io_time_delta;
        self.read_time_delta = delta.read_time_delta;
        self.write_time_delta = delta.write_time_delta;
        self.read_count_delta = delta.read_count_delta;
        self.write_count_delta = delta.write_count_delta;
    }
}
