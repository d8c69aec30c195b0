//! In-memory doubles for exercising the sampler without a live platform.
//!
//! `MockFs` simulates the virtual files Linux parsers read; `MockProbe`
//! and `MockMapper` script whole probe responses, including failures and
//! panics, for sampler-level tests. The mock probe also backs the daemon
//! on platforms without a native probe.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use crate::delta::CounterSnapshot;
use crate::probe::{
    DeviceMapper, DeviceMapping, FileSystem, PartitionStat, ProbeError, StorageProbe, UsageStat,
};

/// In-memory filesystem for testing parsers.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content. Parent directories are created
    /// implicitly.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
        self.files.insert(path, content.into());
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("file not found: {:?}", path))
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }
        let mut entries: Vec<PathBuf> = self
            .files
            .keys()
            .chain(self.directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }
}

/// Scripted probe for sampler tests.
///
/// Partitions and usage are fixed data; counter snapshots are a queue
/// consumed one per cycle (an empty queue or a scripted failure yields an
/// error from `io_counters`). Interior mutability lets tests hold a shared
/// reference while the sampler owns another.
#[derive(Debug, Default)]
pub struct MockProbe {
    partitions: Vec<PartitionStat>,
    usages: HashMap<PathBuf, UsageStat>,
    counters: RefCell<VecDeque<Option<CounterSnapshot>>>,
    fail_partitions: Cell<bool>,
    panic_on_counters: Cell<bool>,
    partition_calls: Cell<usize>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(mut self, p: PartitionStat) -> Self {
        self.partitions.push(p);
        self
    }

    pub fn with_usage(mut self, mountpoint: impl Into<PathBuf>, usage: UsageStat) -> Self {
        self.usages.insert(mountpoint.into(), usage);
        self
    }

    /// Queues one cycle's counter snapshot.
    pub fn push_counters(&self, snapshot: CounterSnapshot) {
        self.counters.borrow_mut().push_back(Some(snapshot));
    }

    /// Queues one cycle's counter-fetch failure.
    pub fn push_counters_failure(&self) {
        self.counters.borrow_mut().push_back(None);
    }

    pub fn set_fail_partitions(&self, fail: bool) {
        self.fail_partitions.set(fail);
    }

    pub fn set_panic_on_counters(&self, panic: bool) {
        self.panic_on_counters.set(panic);
    }

    /// Number of partition-listing calls observed.
    pub fn partition_calls(&self) -> usize {
        self.partition_calls.get()
    }
}

impl StorageProbe for MockProbe {
    fn partitions(&self, _containerized: bool) -> Result<Vec<PartitionStat>, ProbeError> {
        self.partition_calls.set(self.partition_calls.get() + 1);
        if self.fail_partitions.get() {
            return Err(ProbeError::Unsupported("partition listing failed".to_string()));
        }
        Ok(self.partitions.clone())
    }

    fn usage(&self, mountpoint: &Path) -> Result<UsageStat, ProbeError> {
        self.usages.get(mountpoint).copied().ok_or_else(|| {
            ProbeError::Unsupported(format!("no usage for {}", mountpoint.display()))
        })
    }

    fn io_counters(&self) -> Result<CounterSnapshot, ProbeError> {
        if self.panic_on_counters.get() {
            panic!("scripted probe panic");
        }
        match self.counters.borrow_mut().pop_front() {
            Some(Some(snapshot)) => Ok(snapshot),
            Some(None) | None => {
                Err(ProbeError::Unsupported("io counters unavailable".to_string()))
            }
        }
    }
}

/// Device mapper returning a fixed mapping.
#[derive(Debug, Clone, Default)]
pub struct MockMapper {
    map: HashMap<String, String>,
    unresolved: Vec<String>,
}

impl MockMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a raw counter key to a logical device name.
    pub fn with_mapping(mut self, key: impl Into<String>, device: impl Into<String>) -> Self {
        self.map.insert(key.into(), device.into());
        self
    }

    pub fn with_unresolved(mut self, device: impl Into<String>) -> Self {
        self.unresolved.push(device.into());
        self
    }
}

impl DeviceMapper for MockMapper {
    fn mapping(&self, _active_devices: &HashSet<String>, _containerized: bool) -> DeviceMapping {
        DeviceMapping {
            key_to_device: self.map.clone(),
            unresolved: self.unresolved.clone(),
        }
    }
}
