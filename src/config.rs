//! Sampler configuration.
//!
//! The embedding agent supplies a [`Config`] value; the core never loads
//! configuration files itself.

use std::path::PathBuf;

use serde::Deserialize;

/// Default sampling period in seconds.
pub const DEFAULT_SAMPLE_RATE_SECS: i64 = 20;

/// Sampling periods at or below this value disable the sampler.
pub const FREQ_DISABLE_SAMPLING_SECS: i64 = 0;

/// Default maximum age of the cached partition list.
pub const DEFAULT_PARTITIONS_TTL_SECS: u64 = 60;

/// Configuration consumed by the storage sampler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sampling period in seconds. Values at or below
    /// [`FREQ_DISABLE_SAMPLING_SECS`] disable the sampler.
    pub sample_rate_secs: i64,

    /// Restricts sampling to these filesystem types. Names outside the
    /// built-in supported set are dropped. Empty means the full built-in
    /// set.
    pub custom_supported_filesystems: Vec<String>,

    /// True when the agent runs inside a container with the host
    /// filesystem bind-mounted under [`Config::override_host_root`].
    pub is_containerized: bool,

    /// Host root prefix used to resolve mountpoints when containerized.
    pub override_host_root: Option<PathBuf>,

    /// Device-name substrings to exclude from sampling.
    pub file_devices_ignored: Vec<String>,

    /// Maximum age of the cached partition list, in seconds.
    pub partitions_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate_secs: DEFAULT_SAMPLE_RATE_SECS,
            custom_supported_filesystems: Vec::new(),
            is_containerized: false,
            override_host_root: None,
            file_devices_ignored: Vec::new(),
            partitions_ttl_secs: DEFAULT_PARTITIONS_TTL_SECS,
        }
    }
}
