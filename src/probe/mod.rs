//! Platform probe seam.
//!
//! The sampler core never touches the operating system directly; it talks
//! to a [`StorageProbe`] (partition listing, per-mountpoint usage, raw I/O
//! counters) and a [`DeviceMapper`] (raw counter keys to logical device
//! names). One implementation exists per supported platform and is injected
//! at composition time; the core never branches on platform.

pub mod fs;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod mock;

pub use fs::{FileSystem, RealFs};
#[cfg(target_os = "linux")]
pub use linux::{LinuxDeviceMapper, LinuxProbe};
pub use mock::{MockFs, MockMapper, MockProbe};

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::delta::CounterSnapshot;

/// Filesystem types the sampler reports by default.
pub const BUILTIN_SUPPORTED_FS: &[&str] = &[
    "ext", "ext2", "ext3", "ext4", "xfs", "btrfs", "zfs", "hfs", "vxfs",
];

/// One mounted filesystem as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStat {
    /// Logical device name (e.g. "/dev/sda1").
    pub device: String,
    /// Mountpoint as reported by the host.
    pub mountpoint: String,
    /// Filesystem type (e.g. "ext4").
    pub fstype: String,
    /// Comma-separated mount options.
    pub opts: String,
}

impl PartitionStat {
    /// True when the mount options carry the `ro` token.
    pub fn is_read_only(&self) -> bool {
        self.opts.split(',').any(|o| o == "ro")
    }
}

/// Disk usage for one mountpoint, in platform byte units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageStat {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Errors surfaced by platform probes.
#[derive(Debug)]
pub enum ProbeError {
    /// I/O error reading platform data.
    Io(std::io::Error),
    /// Malformed platform data.
    Parse(String),
    /// The platform cannot provide the requested data.
    Unsupported(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Io(e) => write!(f, "I/O error: {}", e),
            ProbeError::Parse(msg) => write!(f, "parse error: {}", msg),
            ProbeError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::Io(e)
    }
}

/// Capability interface the sampler needs from the operating system.
pub trait StorageProbe {
    /// Lists mounted filesystems. `containerized` selects the host view
    /// when the agent runs inside a container.
    fn partitions(&self, containerized: bool) -> Result<Vec<PartitionStat>, ProbeError>;

    /// Disk usage for a resolved mountpoint path.
    fn usage(&self, mountpoint: &Path) -> Result<UsageStat, ProbeError>;

    /// Raw cumulative I/O counters keyed by the platform device key.
    fn io_counters(&self) -> Result<CounterSnapshot, ProbeError>;
}

impl<P: StorageProbe + ?Sized> StorageProbe for &P {
    fn partitions(&self, containerized: bool) -> Result<Vec<PartitionStat>, ProbeError> {
        (**self).partitions(containerized)
    }

    fn usage(&self, mountpoint: &Path) -> Result<UsageStat, ProbeError> {
        (**self).usage(mountpoint)
    }

    fn io_counters(&self) -> Result<CounterSnapshot, ProbeError> {
        (**self).io_counters()
    }
}

/// Result of resolving raw counter keys for a set of active devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceMapping {
    /// Raw counter device key to logical device name from the partition
    /// listing.
    pub key_to_device: HashMap<String, String>,
    /// Active devices with no resolvable counter key. Diagnostics only,
    /// never an error.
    pub unresolved: Vec<String>,
}

/// Resolves raw counter device keys to logical device names.
pub trait DeviceMapper {
    fn mapping(&self, active_devices: &HashSet<String>, containerized: bool) -> DeviceMapping;
}

/// Intersection of a configured filesystem allowlist with the built-in
/// supported set; the full built-in set when the allowlist is empty.
/// Computed once at composition time, with no process-wide mutable state
/// behind it.
pub fn effective_supported_filesystems(custom: &[String]) -> HashSet<String> {
    if custom.is_empty() {
        return BUILTIN_SUPPORTED_FS.iter().map(|s| s.to_string()).collect();
    }
    custom
        .iter()
        .filter(|c| BUILTIN_SUPPORTED_FS.contains(&c.as_str()))
        .cloned()
        .collect()
}
