//! In-memory record of one data partition.
//!
//! Partition records are shared immutably across readers; the refresh path
//! swaps the master-sourced fields wholesale, and the few hot fields the
//! data path mutates (advisory leader, error timestamps, latency counters)
//! sit behind their own narrow locks or atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::meta::{DataPartitionView, MediumType, PartitionStatus};

/// How long a sorted-by-ping host list stays cached.
pub const PING_SORT_TTL: Duration = Duration::from_secs(10);

/// Window within which a host error keeps the host at the back of the
/// candidate list.
pub const DEFAULT_HOST_ERR_TIMEOUT: Duration = Duration::from_secs(30);

/// Master-sourced partition fields, replaced as a unit on refresh.
#[derive(Debug, Clone, Default)]
pub struct PartitionInfo {
    /// Health.
    pub status: PartitionStatus,
    /// Health of the tiering transfer target.
    pub transfer_status: PartitionStatus,
    /// Replica count.
    pub replica_num: u8,
    /// Replica addresses, index 0 preferred for writes.
    pub hosts: Vec<String>,
    /// Membership epoch.
    pub epoch: u64,
    /// Replica repair in progress.
    pub is_recover: bool,
    /// Writes administratively frozen.
    pub is_frozen: bool,
    /// Backing medium.
    pub medium_type: MediumType,
    /// EC shard hosts, data shards first.
    pub ec_hosts: Vec<String>,
    /// EC data-shard count.
    pub ec_data_num: u32,
    /// EC stripe unit size.
    pub ec_stripe_unit_size: u64,
    /// EC migration progress state.
    pub ec_migrate_status: u8,
    /// Hosts in the quorum (master) region under cross-region HA.
    pub master_region_hosts: Vec<String>,
    /// Remaining hosts under cross-region HA.
    pub slave_region_hosts: Vec<String>,
    /// Capacity in bytes.
    pub total: u64,
    /// Used bytes.
    pub used: u64,
}

#[derive(Debug, Default)]
struct LatencyCounter {
    ops: AtomicU64,
    nanos: AtomicU64,
}

impl LatencyCounter {
    fn record(&self, d: Duration) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.nanos.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    fn take(&self) -> (u64, Duration) {
        let ops = self.ops.swap(0, Ordering::Relaxed);
        let nanos = self.nanos.swap(0, Ordering::Relaxed);
        let avg = if ops == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(nanos / ops)
        };
        (ops, avg)
    }

    fn peek_avg(&self) -> Duration {
        let ops = self.ops.load(Ordering::Relaxed);
        if ops == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed) / ops)
    }
}

#[derive(Debug)]
struct PingCache {
    sorted: Vec<String>,
    at: Instant,
}

/// One data partition as the client sees it.
#[derive(Debug)]
pub struct DataPartition {
    /// Partition id.
    pub id: u64,
    info: RwLock<PartitionInfo>,
    leader: RwLock<String>,
    host_errs: Mutex<HashMap<String, Instant>>,
    ping_cache: Mutex<Option<PingCache>>,
    follower_delays: Mutex<HashMap<String, Duration>>,
    read_latency: LatencyCounter,
    write_latency: LatencyCounter,
}

impl DataPartition {
    /// Build a record from a master view row. `quorum` > 0 turns on
    /// cross-region host classification.
    pub fn from_view(view: &DataPartitionView, quorum: u32) -> Self {
        let dp = DataPartition {
            id: view.partition_id,
            info: RwLock::new(PartitionInfo::default()),
            leader: RwLock::new(view.leader_addr.clone()),
            host_errs: Mutex::new(HashMap::new()),
            ping_cache: Mutex::new(None),
            follower_delays: Mutex::new(HashMap::new()),
            read_latency: LatencyCounter::default(),
            write_latency: LatencyCounter::default(),
        };
        *dp.info.write() = Self::info_from_view(view, quorum);
        dp
    }

    fn info_from_view(view: &DataPartitionView, quorum: u32) -> PartitionInfo {
        let (master_region_hosts, slave_region_hosts) = classify_regions(&view.hosts, quorum);
        PartitionInfo {
            status: view.status,
            transfer_status: view.transfer_status,
            replica_num: view.replica_num,
            hosts: view.hosts.clone(),
            epoch: view.epoch,
            is_recover: view.is_recover,
            is_frozen: view.is_frozen,
            medium_type: view.medium_type,
            ec_hosts: view.ec_hosts.clone(),
            ec_data_num: view.ec_data_num,
            ec_stripe_unit_size: view.ec_stripe_unit_size,
            ec_migrate_status: view.ec_migrate_status,
            master_region_hosts,
            slave_region_hosts,
            total: view.total,
            used: view.used,
        }
    }

    /// Merge a refreshed master row. The advisory leader survives unless it
    /// left the host set, in which case the advertised leader (or the first
    /// host) takes over.
    pub fn update_from_view(&self, view: &DataPartitionView, quorum: u32) {
        {
            let mut leader = self.leader.write();
            if !view.hosts.iter().any(|h| h == leader.as_str()) {
                *leader = if view.leader_addr.is_empty() {
                    view.hosts.first().cloned().unwrap_or_default()
                } else {
                    view.leader_addr.clone()
                };
            }
        }
        let hosts_changed = {
            let info = self.info.read();
            info.hosts != view.hosts
        };
        *self.info.write() = Self::info_from_view(view, quorum);
        if hosts_changed {
            *self.ping_cache.lock() = None;
        }
    }

    /// Snapshot of the master-sourced fields.
    pub fn info(&self) -> PartitionInfo {
        self.info.read().clone()
    }

    /// Current membership epoch.
    pub fn epoch(&self) -> u64 {
        self.info.read().epoch
    }

    /// Replica addresses.
    pub fn hosts(&self) -> Vec<String> {
        self.info.read().hosts.clone()
    }

    /// The host a write should be sent to first.
    pub fn preferred_write_host(&self) -> Option<String> {
        self.info.read().hosts.first().cloned()
    }

    /// Advisory leader, defaulting to the first host.
    pub fn leader(&self) -> String {
        let leader = self.leader.read();
        if leader.is_empty() {
            self.info.read().hosts.first().cloned().unwrap_or_default()
        } else {
            leader.clone()
        }
    }

    /// Point the advisory leader at the replica that actually accepted a
    /// request.
    pub fn set_leader(&self, addr: &str) {
        *self.leader.write() = addr.to_string();
    }

    /// Remember that `addr` just failed.
    pub fn record_host_error(&self, addr: &str) {
        self.host_errs
            .lock()
            .insert(addr.to_string(), Instant::now());
    }

    /// Host list for retries: up hosts first, recent failures pushed to the
    /// end. Error entries older than `err_window` are dropped.
    pub fn sorted_hosts(
        &self,
        err_window: Duration,
        host_is_up: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let mut errs = self.host_errs.lock();
        errs.retain(|_, at| at.elapsed() < err_window);
        let mut hosts = self.info.read().hosts.clone();
        hosts.sort_by_key(|h| {
            let down = !host_is_up(h);
            let errored = errs.contains_key(h.as_str());
            (down, errored)
        });
        hosts
    }

    /// Hosts ordered by measured ping latency, cached for [`PING_SORT_TTL`]
    /// so hot paths do not pay the sort per operation. Hosts with no
    /// measurement (delay zero) go last.
    pub fn ping_sorted_hosts(&self, delays: &HashMap<String, Duration>) -> Vec<String> {
        let mut cache = self.ping_cache.lock();
        if let Some(c) = cache.as_ref() {
            if c.at.elapsed() < PING_SORT_TTL {
                return c.sorted.clone();
            }
        }
        let mut hosts = self.info.read().hosts.clone();
        hosts.sort_by_key(|h| match delays.get(h) {
            Some(d) if !d.is_zero() => *d,
            _ => Duration::MAX,
        });
        *cache = Some(PingCache {
            sorted: hosts.clone(),
            at: Instant::now(),
        });
        hosts
    }

    /// Fold one follower read latency sample into the per-host estimate.
    pub fn record_follower_delay(&self, host: &str, sample: Duration) {
        let mut delays = self.follower_delays.lock();
        let entry = delays.entry(host.to_string()).or_insert(sample);
        // Exponentially weighted toward recent samples.
        *entry = (*entry * 7 + sample) / 8;
    }

    /// Snapshot of follower read-delay estimates.
    pub fn follower_delays(&self) -> HashMap<String, Duration> {
        self.follower_delays.lock().clone()
    }

    /// Record a read round-trip.
    pub fn record_read(&self, d: Duration) {
        self.read_latency.record(d);
    }

    /// Record a write round-trip.
    pub fn record_write(&self, d: Duration) {
        self.write_latency.record(d);
    }

    /// Running average write latency since the last summary drain, without
    /// resetting it. Selector input.
    pub fn avg_write_latency(&self) -> Duration {
        self.write_latency.peek_avg()
    }

    /// Drain `(read_ops, read_avg, write_ops, write_avg)` for reporting.
    pub fn take_latency_summary(&self) -> (u64, Duration, u64, Duration) {
        let (r_ops, r_avg) = self.read_latency.take();
        let (w_ops, w_avg) = self.write_latency.take();
        (r_ops, r_avg, w_ops, w_avg)
    }

    /// The EC data-shard host whose stripe unit covers `extent_offset`,
    /// skipping hosts that are down.
    pub fn ec_read_host(
        &self,
        extent_offset: u64,
        host_is_up: impl Fn(&str) -> bool,
    ) -> Option<String> {
        let info = self.info.read();
        if info.ec_hosts.is_empty() || info.ec_data_num == 0 || info.ec_stripe_unit_size == 0 {
            return None;
        }
        let data = &info.ec_hosts[..(info.ec_data_num as usize).min(info.ec_hosts.len())];
        let primary = ((extent_offset / info.ec_stripe_unit_size) % data.len() as u64) as usize;
        (0..data.len())
            .map(|i| &data[(primary + i) % data.len()])
            .find(|h| host_is_up(h))
            .cloned()
    }

    /// Whether this partition accepts new extents for the given client
    /// mode.
    pub fn is_writable(&self, smart: bool) -> bool {
        let info = self.info.read();
        if info.is_frozen || info.is_recover {
            return false;
        }
        if smart {
            info.medium_type == MediumType::Hdd && info.transfer_status == PartitionStatus::ReadWrite
        } else {
            info.status == PartitionStatus::ReadWrite
        }
    }
}

/// Under cross-region HA the first `quorum` hosts form the master region;
/// the rest are the slave region. Without a quorum everything is master.
fn classify_regions(hosts: &[String], quorum: u32) -> (Vec<String>, Vec<String>) {
    if quorum == 0 || quorum as usize >= hosts.len() {
        return (hosts.to_vec(), Vec::new());
    }
    let (master, slave) = hosts.split_at(quorum as usize);
    (master.to_vec(), slave.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DataPartitionView;

    fn view(id: u64, hosts: &[&str]) -> DataPartitionView {
        DataPartitionView {
            partition_id: id,
            status: PartitionStatus::ReadWrite,
            replica_num: hosts.len() as u8,
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn leader_defaults_to_first_host() {
        let dp = DataPartition::from_view(&view(1, &["a:1", "b:1", "c:1"]), 0);
        assert_eq!(dp.leader(), "a:1");
        dp.set_leader("b:1");
        assert_eq!(dp.leader(), "b:1");
    }

    #[test]
    fn stale_leader_replaced_on_update() {
        let dp = DataPartition::from_view(&view(1, &["a:1", "b:1", "c:1"]), 0);
        dp.set_leader("c:1");

        // c:1 left the replica set; the advertised leader takes over.
        let mut v = view(1, &["a:1", "b:1", "d:1"]);
        v.leader_addr = "d:1".to_string();
        dp.update_from_view(&v, 0);
        assert_eq!(dp.leader(), "d:1");

        // Still-present leaders survive a refresh.
        dp.set_leader("b:1");
        dp.update_from_view(&view(1, &["a:1", "b:1", "d:1"]), 0);
        assert_eq!(dp.leader(), "b:1");
    }

    #[test]
    fn host_errors_push_to_back_and_expire() {
        let dp = DataPartition::from_view(&view(1, &["a:1", "b:1", "c:1"]), 0);
        dp.record_host_error("a:1");
        let sorted = dp.sorted_hosts(Duration::from_secs(30), |_| true);
        assert_eq!(sorted.last().map(String::as_str), Some("a:1"));

        // A zero window means every recorded error has already expired.
        let sorted = dp.sorted_hosts(Duration::ZERO, |_| true);
        assert_eq!(sorted[0], "a:1");
    }

    #[test]
    fn down_hosts_sort_after_errored_ones() {
        let dp = DataPartition::from_view(&view(1, &["a:1", "b:1", "c:1"]), 0);
        dp.record_host_error("b:1");
        let sorted = dp.sorted_hosts(Duration::from_secs(30), |h| h != "a:1");
        assert_eq!(sorted, vec!["c:1", "b:1", "a:1"]);
    }

    #[test]
    fn ping_sort_is_cached() {
        let dp = DataPartition::from_view(&view(1, &["a:1", "b:1", "c:1"]), 0);
        let mut delays = HashMap::new();
        delays.insert("a:1".to_string(), Duration::from_millis(30));
        delays.insert("b:1".to_string(), Duration::from_millis(10));
        delays.insert("c:1".to_string(), Duration::ZERO);

        let sorted = dp.ping_sorted_hosts(&delays);
        assert_eq!(sorted, vec!["b:1", "a:1", "c:1"]);

        // New measurements do not show through until the TTL lapses.
        delays.insert("c:1".to_string(), Duration::from_millis(1));
        assert_eq!(dp.ping_sorted_hosts(&delays), sorted);
    }

    #[test]
    fn cross_region_split() {
        let dp = DataPartition::from_view(&view(1, &["a:1", "b:1", "c:1", "d:1", "e:1"]), 3);
        let info = dp.info();
        assert_eq!(info.master_region_hosts.len(), 3);
        assert_eq!(info.slave_region_hosts, vec!["d:1", "e:1"]);
    }

    #[test]
    fn ec_shard_routing() {
        let mut v = view(1, &["a:1"]);
        v.ec_hosts = vec!["e0:1".into(), "e1:1".into(), "e2:1".into(), "p0:1".into()];
        v.ec_data_num = 3;
        v.ec_stripe_unit_size = 1024;
        let dp = DataPartition::from_view(&v, 0);

        assert_eq!(dp.ec_read_host(0, |_| true).as_deref(), Some("e0:1"));
        assert_eq!(dp.ec_read_host(1024, |_| true).as_deref(), Some("e1:1"));
        assert_eq!(dp.ec_read_host(3 * 1024, |_| true).as_deref(), Some("e0:1"));
        // Primary down: next shard host answers.
        assert_eq!(
            dp.ec_read_host(0, |h| h != "e0:1").as_deref(),
            Some("e1:1")
        );
    }

    #[test]
    fn writability_modes() {
        let mut v = view(1, &["a:1"]);
        v.medium_type = MediumType::Hdd;
        v.transfer_status = PartitionStatus::ReadWrite;
        let dp = DataPartition::from_view(&v, 0);
        assert!(dp.is_writable(false));
        assert!(dp.is_writable(true));

        let mut v2 = view(2, &["a:1"]);
        v2.status = PartitionStatus::ReadOnly;
        v2.medium_type = MediumType::Ssd;
        let dp2 = DataPartition::from_view(&v2, 0);
        assert!(!dp2.is_writable(false));
        assert!(!dp2.is_writable(true));
    }
}
