//! Delta engine: derives throughput, IOPS and utilization from a pair of
//! cumulative counter readings.
//!
//! rate = (current − previous) / elapsed seconds;
//! utilization = busy-time delta / elapsed time × 100.
//!
//! Deltas use `saturating_sub`, so a kernel counter reset or wraparound
//! clamps the affected delta to zero for one cycle instead of producing a
//! garbage rate. A zero or negative elapsed time yields non-finite rates;
//! the sample layer drops those before they reach the wire.

use std::collections::HashMap;

/// Cumulative raw I/O counters for one platform device key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoCounters {
    /// Completed read operations.
    pub read_count: u64,
    /// Completed write operations.
    pub write_count: u64,
    /// Bytes read.
    pub read_bytes: u64,
    /// Bytes written.
    pub write_bytes: u64,
    /// Time spent reading, in milliseconds.
    pub read_time_ms: u64,
    /// Time spent writing, in milliseconds.
    pub write_time_ms: u64,
    /// Time the device was busy with I/O, in milliseconds.
    pub io_time_ms: u64,
    /// Counter backend label (e.g. "diskstats").
    pub source: &'static str,
}

/// One cycle's counters, keyed by the platform device key. The key is not
/// guaranteed to match the logical device name from the partition listing.
pub type CounterSnapshot = HashMap<String, IoCounters>;

/// Metrics derived from two counter readings of the same device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoDelta {
    pub reads_per_sec: f64,
    pub writes_per_sec: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
    pub total_utilization_percent: f64,
    pub read_utilization_percent: f64,
    pub write_utilization_percent: f64,

    // Raw deltas, kept for downstream aggregation.
    pub io_time_delta: u64,
    pub read_time_delta: u64,
    pub write_time_delta: u64,
    pub read_count_delta: u64,
    pub write_count_delta: u64,
}

/// Computes derived metrics for one device over `elapsed_ms`.
pub fn compute_delta(curr: &IoCounters, prev: &IoCounters, elapsed_ms: i64) -> IoDelta {
    let elapsed_sec = elapsed_ms as f64 / 1000.0;
    let elapsed_ms_f = elapsed_ms as f64;

    let d_reads = curr.read_count.saturating_sub(prev.read_count);
    let d_writes = curr.write_count.saturating_sub(prev.write_count);
    let d_read_bytes = curr.read_bytes.saturating_sub(prev.read_bytes);
    let d_write_bytes = curr.write_bytes.saturating_sub(prev.write_bytes);
    let d_read_time = curr.read_time_ms.saturating_sub(prev.read_time_ms);
    let d_write_time = curr.write_time_ms.saturating_sub(prev.write_time_ms);
    let d_io_time = curr.io_time_ms.saturating_sub(prev.io_time_ms);

    IoDelta {
        reads_per_sec: d_reads as f64 / elapsed_sec,
        writes_per_sec: d_writes as f64 / elapsed_sec,
        read_bytes_per_sec: d_read_bytes as f64 / elapsed_sec,
        write_bytes_per_sec: d_write_bytes as f64 / elapsed_sec,
        total_utilization_percent: d_io_time as f64 / elapsed_ms_f * 100.0,
        read_utilization_percent: d_read_time as f64 / elapsed_ms_f * 100.0,
        write_utilization_percent: d_write_time as f64 / elapsed_ms_f * 100.0,
        io_time_delta: d_io_time,
        read_time_delta: d_read_time,
        write_time_delta: d_write_time,
        read_count_delta: d_reads,
        write_count_delta: d_writes,
    }
}
