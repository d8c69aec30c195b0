//! Time-bounded cache in front of the probe's partition listing.
//!
//! Mounted filesystems change rarely compared to the sampling period, so
//! the listing is reused until its TTL expires. A failed refresh clears
//! the cached list: the next call retries immediately, TTL notwithstanding,
//! and never serves stale data from before the failure.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::probe::{PartitionStat, ProbeError, StorageProbe};

pub struct PartitionsCache {
    ttl: Duration,
    is_containerized: bool,
    last_attempt: Option<Instant>,
    last_stat: Option<Vec<PartitionStat>>,
}

impl PartitionsCache {
    pub fn new(ttl: Duration, is_containerized: bool) -> Self {
        Self {
            ttl,
            is_containerized,
            last_attempt: None,
            last_stat: None,
        }
    }

    /// Returns the cached list while fresh, otherwise refreshes from the
    /// probe. Refresh errors propagate to the caller.
    pub fn get<P: StorageProbe>(&mut self, probe: &P) -> Result<Vec<PartitionStat>, ProbeError> {
        if let (Some(list), Some(at)) = (&self.last_stat, self.last_attempt) {
            if at.elapsed() < self.ttl {
                return Ok(list.clone());
            }
        }

        self.last_attempt = Some(Instant::now());
        match self.refresh(probe) {
            Ok(list) => {
                self.last_stat = Some(list.clone());
                Ok(list)
            }
            Err(e) => {
                self.last_stat = None;
                Err(e)
            }
        }
    }

    fn refresh<P: StorageProbe>(&self, probe: &P) -> Result<Vec<PartitionStat>, ProbeError> {
        debug!("refreshing partitions cache");
        probe.partitions(self.is_containerized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockProbe;

    fn partition(device: &str) -> PartitionStat {
        PartitionStat {
            device: device.to_string(),
            mountpoint: "/".to_string(),
            fstype: "ext4".to_string(),
            opts: "rw".to_string(),
        }
    }

    #[test]
    fn fresh_entry_skips_the_probe() {
        let probe = MockProbe::new().with_partition(partition("/dev/sda1"));
        let mut cache = PartitionsCache::new(Duration::from_secs(60), false);

        let first = cache.get(&probe).unwrap();
        let second = cache.get(&probe).unwrap();
        assert_eq!(first, second);
        assert_eq!(probe.partition_calls(), 1);
    }

    #[test]
    fn zero_ttl_always_refreshes() {
        let probe = MockProbe::new().with_partition(partition("/dev/sda1"));
        let mut cache = PartitionsCache::new(Duration::ZERO, false);

        cache.get(&probe).unwrap();
        cache.get(&probe).unwrap();
        assert_eq!(probe.partition_calls(), 2);
    }

    #[test]
    fn failure_propagates_and_clears_cache() {
        let probe = MockProbe::new().with_partition(partition("/dev/sda1"));
        let mut cache = PartitionsCache::new(Duration::from_secs(60), false);

        cache.get(&probe).unwrap();
        assert_eq!(probe.partition_calls(), 1);

        // Expire the entry by hand, then fail the refresh.
        cache.last_attempt = Some(Instant::now() - Duration::from_secs(120));
        probe.set_fail_partitions(true);
        assert!(cache.get(&probe).is_err());

        // The failed fetch cleared the cache: the next call retries even
        // though its own TTL has not expired.
        probe.set_fail_partitions(false);
        let list = cache.get(&probe).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(probe.partition_calls(), 3);
    }
}
