//! Cycle orchestration: one `sample()` call per scheduler tick.
//!
//! The sampler owns all cross-cycle state (last-run instant, previous
//! counter snapshot, cached partition list, last emitted batch) and is
//! mutated only through [`StorageSampler::sample`]. It is not safe for
//! concurrent invocation; the embedding scheduler must guarantee at most
//! one cycle in flight per instance.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::cache::PartitionsCache;
use crate::config::{Config, FREQ_DISABLE_SAMPLING_SECS};
use crate::delta::{self, CounterSnapshot};
use crate::probe::{
    DeviceMapper, ProbeError, StorageProbe, effective_supported_filesystems,
};
use crate::sample::StorageSample;

/// Errors terminating one sampling cycle. The sampler itself stays usable
/// for the next tick.
#[derive(Debug)]
pub enum SampleError {
    /// Partition listing failed; the cycle was aborted.
    Partitions(ProbeError),
    /// An unexpected fault inside the cycle was intercepted.
    CyclePanic(String),
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleError::Partitions(e) => write!(f, "can't get partitions: {}", e),
            SampleError::CyclePanic(msg) => write!(f, "panic in sampling cycle: {}", msg),
        }
    }
}

impl std::error::Error for SampleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SampleError::Partitions(e) => Some(e),
            SampleError::CyclePanic(_) => None,
        }
    }
}

/// Periodic host-storage metrics sampler.
pub struct StorageSampler<P, M> {
    config: Config,
    probe: P,
    mapper: M,
    partitions: PartitionsCache,
    last_run: Option<Instant>,
    has_bootstrapped: bool,
    last_disk_stats: Option<CounterSnapshot>,
    last_samples: Vec<StorageSample>,
}

impl<P: StorageProbe, M: DeviceMapper> StorageSampler<P, M> {
    pub fn new(config: Config, probe: P, mapper: M) -> Self {
        let partitions = PartitionsCache::new(
            Duration::from_secs(config.partitions_ttl_secs),
            config.is_containerized,
        );
        Self {
            config,
            probe,
            mapper,
            partitions,
            last_run: None,
            has_bootstrapped: false,
            last_disk_stats: None,
            last_samples: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        "StorageSampler"
    }

    /// Configured sampling period. Zero when disabled.
    pub fn interval(&self) -> Duration {
        if self.is_disabled() {
            Duration::ZERO
        } else {
            Duration::from_secs(self.config.sample_rate_secs as u64)
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.config.sample_rate_secs <= FREQ_DISABLE_SAMPLING_SECS
    }

    /// Logs the effective filesystem allowlist. The allowlist itself is
    /// computed at composition time and handed to the probe; nothing here
    /// mutates shared state.
    pub fn on_startup(&self) {
        let custom = &self.config.custom_supported_filesystems;
        if custom.is_empty() {
            return;
        }
        let effective = effective_supported_filesystems(custom);
        let dropped: Vec<&str> = custom
            .iter()
            .map(String::as_str)
            .filter(|c| !effective.contains(*c))
            .collect();
        if !dropped.is_empty() {
            debug!(?dropped, "dropping unsupported filesystems from allowlist");
        }
        debug!(?effective, "using custom supported filesystems");
    }

    /// The batch emitted by the last successful cycle.
    pub fn last_batch(&self) -> &[StorageSample] {
        &self.last_samples
    }

    /// The counter snapshot retained from the last cycle with a successful
    /// counter fetch.
    pub fn last_counters(&self) -> Option<&CounterSnapshot> {
        self.last_disk_stats.as_ref()
    }

    /// Runs one sampling cycle and returns the emitted batch.
    ///
    /// Any unexpected fault inside the cycle is intercepted and reported
    /// as [`SampleError::CyclePanic`]; partial results from a failed cycle
    /// are discarded and the previously emitted batch stays unchanged.
    pub fn sample(&mut self) -> Result<Vec<StorageSample>, SampleError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(payload);
                error!(message = %msg, "intercepted panic in sampling cycle");
                Err(SampleError::CyclePanic(msg))
            }
        }
    }

    fn run_cycle(&mut self) -> Result<Vec<StorageSample>, SampleError> {
        // Cycle timing advances unconditionally, before anything that can
        // fail. The very first cycle reports zero elapsed time regardless
        // of the wall-clock gap since construction.
        let now = Instant::now();
        let elapsed_ms: i64 = if self.has_bootstrapped {
            self.last_run
                .map(|t| now.duration_since(t).as_millis() as i64)
                .unwrap_or(0)
        } else {
            0
        };
        self.last_run = Some(now);
        self.has_bootstrapped = true;

        let partitions = self.partitions.get(&self.probe).map_err(|e| {
            error!(error = %e, "can't get partitions");
            SampleError::Partitions(e)
        })?;

        let host_root: Option<&Path> = if self.config.is_containerized {
            self.config.override_host_root.as_deref()
        } else {
            None
        };

        let mut active_devices: HashSet<String> = HashSet::new();
        let mut dev_samples: HashMap<String, Vec<StorageSample>> = HashMap::new();

        for p in &partitions {
            // Mountpoints are reported from the host's perspective; with a
            // bind-mounted host root they resolve under that prefix.
            let mountpoint = resolve_mountpoint(host_root, &p.mountpoint);

            let usage = match self.probe.usage(&mountpoint) {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(mountpoint = %mountpoint.display(), error = %e,
                        "can't get disk usage, skipping mountpoint");
                    continue;
                }
            };

            if let Some(ignored) = self
                .config
                .file_devices_ignored
                .iter()
                .find(|name| p.device.contains(name.as_str()))
            {
                debug!(device = %p.device, matched = %ignored, "skipping ignored device");
                continue;
            }

            // The sample keeps the reported mountpoint, not the prefixed one.
            let mut sample = StorageSample::from_partition(p, elapsed_ms);
            sample.populate_usage(&usage);

            active_devices.insert(p.device.clone());
            dev_samples.entry(p.device.clone()).or_default().push(sample);
        }

        match self.probe.io_counters() {
            Err(e) => {
                // Soft degradation: usage-only samples this cycle.
                warn!(error = %e, "can't get io counters");
            }
            Ok(counters) => {
                if let Some(last_stats) = &self.last_disk_stats {
                    let mapping = self
                        .mapper
                        .mapping(&active_devices, self.config.is_containerized);
                    if !mapping.unresolved.is_empty() {
                        debug!(devices = ?mapping.unresolved, "no counter key for devices");
                    }

                    let mut unmapped: Vec<&str> = Vec::new();
                    for (key, counter) in &counters {
                        let Some(device) = mapping.key_to_device.get(key) else {
                            unmapped.push(key);
                            continue;
                        };
                        // No previous reading for this key means no deltas
                        // this cycle.
                        let Some(prev) = last_stats.get(key) else {
                            continue;
                        };
                        let Some(samples) = dev_samples.get_mut(device) else {
                            continue;
                        };
                        let d = delta::compute_delta(counter, prev, elapsed_ms);
                        // A device mounted in several places gets the same
                        // delta fields on every record.
                        for sample in samples {
                            sample.merge_delta(&d, counter.source);
                        }
                    }
                    if !unmapped.is_empty() {
                        debug!(keys = ?unmapped, "no device mapping for counter keys");
                    }
                }
                self.last_disk_stats = Some(counters);
            }
        }

        let mut batch: Vec<StorageSample> = dev_samples.into_values().flatten().collect();
        batch.sort_by(|a, b| {
            (&a.device, &a.mount_point).cmp(&(&b.device, &b.mount_point))
        });
        self.last_samples = batch.clone();
        Ok(batch)
    }
}

/// Resolves a host-reported mountpoint under an optional host-root prefix.
fn resolve_mountpoint(host_root: Option<&Path>, mountpoint: &str) -> PathBuf {
    match host_root {
        Some(root) => {
            let rel = mountpoint.trim_start_matches('/');
            if rel.is_empty() {
                root.to_path_buf()
            } else {
                root.join(rel)
            }
        }
        None => PathBuf::from(mountpoint),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::IoCounters;
    use crate::probe::{MockMapper, MockProbe, PartitionStat, UsageStat};

    fn partition(device: &str, mountpoint: &str) -> PartitionStat {
        PartitionStat {
            device: device.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: "ext4".to_string(),
            opts: "rw,relatime".to_string(),
        }
    }

    fn usage(used: u64, free: u64, total: u64) -> UsageStat {
        UsageStat { total, used, free }
    }

    fn counters(read_count: u64, io_time_ms: u64) -> IoCounters {
        IoCounters {
            read_count,
            write_count: read_count / 2,
            read_bytes: read_count * 512,
            write_bytes: read_count * 256,
            read_time_ms: io_time_ms / 2,
            write_time_ms: io_time_ms / 2,
            io_time_ms,
            source: "mock",
        }
    }

    fn snapshot(entries: &[(&str, IoCounters)]) -> CounterSnapshot {
        entries
            .iter()
            .map(|(k, c)| (k.to_string(), c.clone()))
            .collect()
    }

    fn test_config() -> Config {
        Config {
            // no caching between cycles so each test controls the probe
            partitions_ttl_secs: 0,
            ..Default::default()
        }
    }

    fn sampler_for<'p>(
        config: Config,
        probe: &'p MockProbe,
        mapper: MockMapper,
    ) -> StorageSampler<&'p MockProbe, MockMapper> {
        StorageSampler::new(config, probe, mapper)
    }

    /// Rewinds the last-run instant so the next cycle sees ~elapsed_ms.
    fn rewind_last_run<P, M>(sampler: &mut StorageSampler<P, M>, elapsed_ms: u64) {
        sampler.last_run = Some(Instant::now() - Duration::from_millis(elapsed_ms));
    }

    #[test]
    fn usage_only_record_with_percentages() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(50, 50, 100));
        probe.push_counters_failure();
        let mut sampler = sampler_for(test_config(), &probe, MockMapper::new());

        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 1);
        let s = &batch[0];
        assert_eq!(s.device, "/dev/sda1");
        assert_eq!(s.mount_point, "/");
        assert_eq!(s.used_percent, Some(50.0));
        assert_eq!(s.free_percent, Some(50.0));
        assert_eq!(s.elapsed_sample_delta_ms, 0);
        assert!(!s.has_delta);
    }

    #[test]
    fn first_cycle_has_zero_elapsed_and_no_deltas() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(10, 90, 100));
        probe.push_counters(snapshot(&[("sda1", counters(100, 0))]));
        let mapper = MockMapper::new().with_mapping("sda1", "/dev/sda1");
        let mut sampler = sampler_for(test_config(), &probe, mapper);

        let batch = sampler.sample().unwrap();
        let s = &batch[0];
        assert_eq!(s.elapsed_sample_delta_ms, 0);
        assert!(s.used_bytes.is_some());
        // first cycle: counters recorded as baseline, no delta fields yet
        assert!(!s.has_delta);
        assert_eq!(s.reads_per_sec, None);
        assert!(sampler.last_counters().is_some());
    }

    #[test]
    fn second_cycle_computes_io_rates() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(10, 90, 100));
        probe.push_counters(snapshot(&[("sda1", counters(100, 0))]));
        probe.push_counters(snapshot(&[("sda1", counters(150, 500))]));
        let mapper = MockMapper::new().with_mapping("sda1", "/dev/sda1");
        let mut sampler = sampler_for(test_config(), &probe, mapper);

        sampler.sample().unwrap();
        rewind_last_run(&mut sampler, 1000);
        let batch = sampler.sample().unwrap();

        let s = &batch[0];
        assert!(s.has_delta);
        assert_eq!(s.counters_source.as_deref(), Some("mock"));
        // 50 reads over ~1s; allow for scheduling jitter in the elapsed time
        let rps = s.reads_per_sec.unwrap();
        assert!((45.0..=55.0).contains(&rps), "reads_per_sec = {}", rps);
        let util = s.total_utilization_percent.unwrap();
        assert!((45.0..=55.0).contains(&util), "utilization = {}", util);
        assert_eq!(s.read_count_delta, 50);
        assert_eq!(s.io_time_delta, 500);
        assert!(s.elapsed_sample_delta_ms >= 1000);
    }

    #[test]
    fn mountpoints_of_one_device_share_delta_fields() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_partition(partition("/dev/sda1", "/var"))
            .with_usage("/", usage(10, 90, 100))
            .with_usage("/var", usage(20, 80, 100));
        probe.push_counters(snapshot(&[("sda1", counters(100, 0))]));
        probe.push_counters(snapshot(&[("sda1", counters(200, 400))]));
        let mapper = MockMapper::new().with_mapping("sda1", "/dev/sda1");
        let mut sampler = sampler_for(test_config(), &probe, mapper);

        sampler.sample().unwrap();
        rewind_last_run(&mut sampler, 1000);
        let batch = sampler.sample().unwrap();

        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|s| s.has_delta));
        assert_eq!(batch[0].reads_per_sec, batch[1].reads_per_sec);
        assert_eq!(
            batch[0].total_utilization_percent,
            batch[1].total_utilization_percent
        );
        assert_eq!(batch[0].read_count_delta, batch[1].read_count_delta);
        // usage stays per-mountpoint
        assert_ne!(batch[0].used_percent, batch[1].used_percent);
    }

    #[test]
    fn ignored_device_never_appears() {
        let mut config = test_config();
        config.file_devices_ignored = vec!["loop".to_string()];

        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_partition(partition("/dev/loop0", "/snap"))
            .with_usage("/", usage(10, 90, 100))
            .with_usage("/snap", usage(1, 1, 2));
        probe.push_counters(snapshot(&[
            ("sda1", counters(100, 0)),
            ("loop0", counters(100, 0)),
        ]));
        let mut sampler = sampler_for(config, &probe, MockMapper::new());

        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].device, "/dev/sda1");
    }

    #[test]
    fn usage_failure_skips_only_that_mountpoint() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_partition(partition("/dev/sdb1", "/broken"))
            .with_usage("/", usage(10, 90, 100));
        // no usage scripted for /broken
        probe.push_counters_failure();
        let mut sampler = sampler_for(test_config(), &probe, MockMapper::new());

        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].device, "/dev/sda1");
    }

    #[test]
    fn partition_failure_aborts_cycle_and_keeps_last_batch() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(10, 90, 100));
        probe.push_counters_failure();
        probe.push_counters_failure();
        let mut sampler = sampler_for(test_config(), &probe, MockMapper::new());

        let first = sampler.sample().unwrap();
        assert_eq!(first.len(), 1);

        probe.set_fail_partitions(true);
        let err = sampler.sample().unwrap_err();
        assert!(matches!(err, SampleError::Partitions(_)));
        assert_eq!(sampler.last_batch(), first.as_slice());

        // next tick recovers
        probe.set_fail_partitions(false);
        assert!(sampler.sample().is_ok());
    }

    #[test]
    fn counter_failure_degrades_to_usage_only() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(10, 90, 100));
        probe.push_counters(snapshot(&[("sda1", counters(100, 0))]));
        // second cycle: counter fetch fails
        let mapper = MockMapper::new().with_mapping("sda1", "/dev/sda1");
        let mut sampler = sampler_for(test_config(), &probe, mapper);

        sampler.sample().unwrap();
        rewind_last_run(&mut sampler, 1000);
        let batch = sampler.sample().unwrap();

        let s = &batch[0];
        assert!(!s.has_delta);
        assert!(s.used_bytes.is_some());
        assert_eq!(s.reads_per_sec, None);
        // the baseline snapshot from the first cycle is retained
        assert!(sampler.last_counters().unwrap().contains_key("sda1"));
    }

    #[test]
    fn counter_key_without_prior_reading_gets_no_delta() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_partition(partition("/dev/sdb1", "/data"))
            .with_usage("/", usage(10, 90, 100))
            .with_usage("/data", usage(10, 90, 100));
        probe.push_counters(snapshot(&[("sda1", counters(100, 0))]));
        probe.push_counters(snapshot(&[
            ("sda1", counters(150, 100)),
            ("sdb1", counters(10, 10)),
        ]));
        let mapper = MockMapper::new()
            .with_mapping("sda1", "/dev/sda1")
            .with_mapping("sdb1", "/dev/sdb1");
        let mut sampler = sampler_for(test_config(), &probe, mapper);

        sampler.sample().unwrap();
        rewind_last_run(&mut sampler, 1000);
        let batch = sampler.sample().unwrap();

        let sda = batch.iter().find(|s| s.device == "/dev/sda1").unwrap();
        let sdb = batch.iter().find(|s| s.device == "/dev/sdb1").unwrap();
        assert!(sda.has_delta);
        assert!(!sdb.has_delta);
        // sdb1 is now in the baseline for the next cycle
        assert!(sampler.last_counters().unwrap().contains_key("sdb1"));
    }

    #[test]
    fn unmapped_counter_keys_are_not_errors() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(10, 90, 100));
        probe.push_counters(snapshot(&[("sda1", counters(100, 0))]));
        probe.push_counters(snapshot(&[
            ("sda1", counters(150, 100)),
            ("nvme9n9", counters(5, 5)),
        ]));
        let mapper = MockMapper::new().with_mapping("sda1", "/dev/sda1");
        let mut sampler = sampler_for(test_config(), &probe, mapper);

        sampler.sample().unwrap();
        rewind_last_run(&mut sampler, 1000);
        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].has_delta);
    }

    #[test]
    fn panic_in_probe_is_isolated() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_usage("/", usage(10, 90, 100));
        probe.set_panic_on_counters(true);
        let mut sampler = sampler_for(test_config(), &probe, MockMapper::new());

        let err = sampler.sample().unwrap_err();
        match err {
            SampleError::CyclePanic(msg) => assert!(msg.contains("scripted probe panic")),
            other => panic!("expected CyclePanic, got {:?}", other),
        }
        // the failed cycle emitted nothing
        assert!(sampler.last_batch().is_empty());

        // the sampler keeps working on the next tick
        probe.set_panic_on_counters(false);
        probe.push_counters_failure();
        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn containerized_remaps_mountpoints_but_reports_originals() {
        let mut config = test_config();
        config.is_containerized = true;
        config.override_host_root = Some(PathBuf::from("/host"));

        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_partition(partition("/dev/sdb1", "/data1"))
            .with_usage("/host", usage(10, 90, 100))
            .with_usage("/host/data1", usage(20, 80, 100));
        probe.push_counters_failure();
        let mut sampler = sampler_for(config, &probe, MockMapper::new());

        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 2);
        // the records carry the host-reported mountpoints
        let mounts: Vec<&str> = batch.iter().map(|s| s.mount_point.as_str()).collect();
        assert_eq!(mounts, vec!["/", "/data1"]);
    }

    #[test]
    fn batch_is_sorted_by_device_and_mountpoint() {
        let probe = MockProbe::new()
            .with_partition(partition("/dev/sdb1", "/b"))
            .with_partition(partition("/dev/sda1", "/a"))
            .with_usage("/a", usage(1, 1, 2))
            .with_usage("/b", usage(1, 1, 2));
        probe.push_counters_failure();
        let mut sampler = sampler_for(test_config(), &probe, MockMapper::new());

        let batch = sampler.sample().unwrap();
        let devices: Vec<&str> = batch.iter().map(|s| s.device.as_str()).collect();
        assert_eq!(devices, vec!["/dev/sda1", "/dev/sdb1"]);
    }

    #[test]
    fn interval_and_disabled() {
        let probe = MockProbe::new();
        let mut config = test_config();
        config.sample_rate_secs = 30;
        let sampler = sampler_for(config, &probe, MockMapper::new());
        assert_eq!(sampler.interval(), Duration::from_secs(30));
        assert!(!sampler.is_disabled());

        let mut config = test_config();
        config.sample_rate_secs = 0;
        let sampler = sampler_for(config, &probe, MockMapper::new());
        assert!(sampler.is_disabled());
        assert_eq!(sampler.interval(), Duration::ZERO);
    }

    #[test]
    fn emitted_count_matches_surviving_partitions() {
        let mut config = test_config();
        config.file_devices_ignored = vec!["sdc".to_string()];

        let probe = MockProbe::new()
            .with_partition(partition("/dev/sda1", "/"))
            .with_partition(partition("/dev/sdb1", "/nousage"))
            .with_partition(partition("/dev/sdc1", "/ignored"))
            .with_usage("/", usage(10, 90, 100))
            .with_usage("/ignored", usage(10, 90, 100));
        probe.push_counters_failure();
        let mut sampler = sampler_for(config, &probe, MockMapper::new());

        // three partitions; one fails usage, one is ignored
        let batch = sampler.sample().unwrap();
        assert_eq!(batch.len(), 1);
    }
}
