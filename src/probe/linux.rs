//! Linux probe: `/proc/mounts`, statvfs and `/proc/diskstats`.
//!
//! Partition listing and counters are parsed through the [`FileSystem`]
//! trait so the parsers run against fixtures in tests; usage goes straight
//! to the statvfs syscall for the resolved mountpoint.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::delta::{CounterSnapshot, IoCounters};
use crate::probe::{
    DeviceMapper, DeviceMapping, FileSystem, PartitionStat, ProbeError, StorageProbe, UsageStat,
};

/// Label reported as the counter source for this probe.
pub const COUNTERS_SOURCE: &str = "diskstats";

const SECTOR_SIZE: u64 = 512;

/// Storage probe backed by the Linux proc filesystem.
pub struct LinuxProbe<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    host_root: Option<PathBuf>,
    supported_fs: HashSet<String>,
}

impl<F: FileSystem> LinuxProbe<F> {
    /// Creates a probe reading proc files under `proc_path`.
    ///
    /// `host_root` is the bind-mount prefix of the host filesystem when
    /// running containerized; `supported_fs` is the effective filesystem
    /// allowlist computed at composition time.
    pub fn new(
        fs: F,
        proc_path: impl Into<PathBuf>,
        host_root: Option<PathBuf>,
        supported_fs: HashSet<String>,
    ) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            host_root,
            supported_fs,
        }
    }

    fn proc_dir(&self, containerized: bool) -> PathBuf {
        if containerized {
            if let Some(root) = &self.host_root {
                return root.join("proc");
            }
        }
        self.proc_path.clone()
    }
}

impl<F: FileSystem> StorageProbe for LinuxProbe<F> {
    fn partitions(&self, containerized: bool) -> Result<Vec<PartitionStat>, ProbeError> {
        let path = self.proc_dir(containerized).join("mounts");
        let content = self.fs.read_to_string(&path)?;
        Ok(parse_mounts(&content, &self.supported_fs))
    }

    fn usage(&self, mountpoint: &Path) -> Result<UsageStat, ProbeError> {
        let stat = nix::sys::statvfs::statvfs(mountpoint)
            .map_err(|e| ProbeError::Io(std::io::Error::from(e)))?;
        let frsize = stat.fragment_size() as u64;
        let blocks = stat.blocks() as u64;
        let bfree = stat.blocks_free() as u64;
        let bavail = stat.blocks_available() as u64;
        Ok(UsageStat {
            total: blocks * frsize,
            used: blocks.saturating_sub(bfree) * frsize,
            // user-visible free space; blocks_free includes the reserve
            free: bavail * frsize,
        })
    }

    fn io_counters(&self) -> Result<CounterSnapshot, ProbeError> {
        let path = self.proc_dir(self.host_root.is_some()).join("diskstats");
        let content = self.fs.read_to_string(&path)?;
        Ok(parse_diskstats(&content))
    }
}

/// Parses `/proc/mounts` lines (device mountpoint fstype options dump pass),
/// keeping block devices whose filesystem type is supported.
fn parse_mounts(content: &str, supported_fs: &HashSet<String>) -> Vec<PartitionStat> {
    let mut partitions = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (device, mountpoint, fstype, opts) = (fields[0], fields[1], fields[2], fields[3]);
        if !device.starts_with("/dev/") {
            continue;
        }
        if !supported_fs.contains(fstype) {
            continue;
        }
        partitions.push(PartitionStat {
            device: device.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: fstype.to_string(),
            opts: opts.to_string(),
        });
    }
    partitions
}

/// Parses `/proc/diskstats` into cumulative counters keyed by kernel device
/// name.
///
/// Format: major minor name reads r_merged r_sectors r_time writes w_merged
/// w_sectors w_time io_pending io_time w_io_time [discards ...]
fn parse_diskstats(content: &str) -> CounterSnapshot {
    let mut counters = CounterSnapshot::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue; // skip malformed lines
        }
        let get = |idx: usize| -> u64 { fields[idx].parse().unwrap_or(0) };
        counters.insert(
            fields[2].to_string(),
            IoCounters {
                read_count: get(3),
                read_bytes: get(5) * SECTOR_SIZE,
                read_time_ms: get(6),
                write_count: get(7),
                write_bytes: get(9) * SECTOR_SIZE,
                write_time_ms: get(10),
                io_time_ms: get(12),
                source: COUNTERS_SOURCE,
            },
        );
    }
    counters
}

/// Resolves logical device names to the kernel block-device names used as
/// diskstats keys.
///
/// Symlinked devices (`/dev/mapper/vg-lv`, `/dev/disk/by-uuid/...`) are
/// canonicalized to their target (`dm-0`, `sda1`). Plain `/dev/<name>`
/// entries that cannot be canonicalized fall back to `<name>` itself;
/// anything else (network shares, tmpfs-style pseudo devices) lands on the
/// unresolved list.
#[derive(Debug, Clone, Default)]
pub struct LinuxDeviceMapper {
    host_root: Option<PathBuf>,
}

impl LinuxDeviceMapper {
    pub fn new(host_root: Option<PathBuf>) -> Self {
        Self { host_root }
    }

    fn resolve_key(&self, device: &str, containerized: bool) -> Option<String> {
        let rel = device.strip_prefix("/dev/")?;
        let dev_path = if containerized {
            match &self.host_root {
                Some(root) => root.join("dev").join(rel),
                None => PathBuf::from(device),
            }
        } else {
            PathBuf::from(device)
        };

        match std::fs::canonicalize(&dev_path) {
            Ok(real) => real.file_name().map(|n| n.to_string_lossy().into_owned()),
            // No node to follow; a flat /dev name is its own diskstats key.
            Err(_) if !rel.contains('/') => Some(rel.to_string()),
            Err(_) => None,
        }
    }
}

impl DeviceMapper for LinuxDeviceMapper {
    fn mapping(&self, active_devices: &HashSet<String>, containerized: bool) -> DeviceMapping {
        let mut mapping = DeviceMapping::default();
        for device in active_devices {
            match self.resolve_key(device, containerized) {
                Some(key) => {
                    mapping.key_to_device.insert(key, device.clone());
                }
                None => mapping.unresolved.push(device.clone()),
            }
        }
        mapping
    }
}
