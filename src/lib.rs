//! storsamp — periodic host-storage metrics sampler.
//!
//! On each scheduling tick the sampler enumerates mounted filesystems,
//! reads usage and raw I/O counters from the operating system, and emits
//! normalized per-(device, mountpoint) records (usage percentages,
//! throughput rates, IOPS and utilization) for a downstream telemetry
//! transport.
//!
//! Modules:
//! - `sampler`: cycle orchestration and cross-cycle state
//! - `sample`: the emitted record and its wire shape
//! - `delta`: rate/utilization derivation from cumulative counters
//! - `cache`: time-bounded partition-list cache
//! - `probe`: platform seam for partition listing, usage, I/O counters and
//!   device-key mapping (Linux implementation plus in-memory mocks)
//! - `config`: configuration supplied by the embedding agent
//!
//! The sampler performs no internal parallelism and is not safe for
//! concurrent invocation; the embedding scheduler must guarantee at most
//! one cycle in flight per instance.

pub mod cache;
pub mod config;
pub mod delta;
pub mod probe;
pub mod sample;
pub mod sampler;

pub use config::Config;
pub use sample::StorageSample;
pub use sampler::{SampleError, StorageSampler};
