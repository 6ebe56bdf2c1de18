//! Cluster-wide partition state and routing.
//!
//! One wrapper exists per mounted volume. It owns the partition table,
//! tracks host health and ping latency, resolves write and read targets,
//! and runs the background refresh machinery. Streamers and handlers hold
//! partition ids only and look records up here, so nothing in the data
//! path keeps a partition alive past its removal from the cluster.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnTimeouts, ExtentConfig};
use crate::conn::ConnectionPool;
use crate::error::{Result, StreamError};
use crate::limit::RateLimiter;
use crate::meta::{ClusterInfo, DataPartitionsView, MasterApi, SimpleVolView};
use crate::partition::{DEFAULT_HOST_ERR_TIMEOUT, DataPartition};
use crate::select::{DpSelector, epoch_rotated, pick_lowest_delay, sort_by_distance};
use crate::state::ClientState;

/// Cadence of the view/partition refresh loop.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the removed-partition sweep.
const REMOVED_DP_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of follower-delay aggregation.
const FOLLOWER_DELAY_INTERVAL: Duration = Duration::from_secs(15);

/// Floor for the writable set when the volume view does not set one.
const DEFAULT_MIN_WRITABLE: usize = 1;

/// Ordered host candidates for one read, produced by the routing policy in
/// effect.
#[derive(Debug)]
pub struct ReadRoute {
    /// Hosts to try, best first.
    pub hosts: Vec<String>,
    /// Whether the follower-capable read opcode may be used.
    pub follower_read: bool,
}

/// Process-wide (per volume) partition wrapper.
pub struct Wrapper {
    volume: String,
    master: Arc<dyn MasterApi>,
    pool: Arc<ConnectionPool>,

    cluster_name: RwLock<String>,
    local_ip: RwLock<String>,
    cluster_view: RwLock<Option<ClusterInfo>>,

    partitions: DashMap<u64, Arc<DataPartition>>,
    rw_partitions: RwLock<Vec<Arc<DataPartition>>>,
    removed_partitions: RwLock<HashSet<u64>>,

    host_status: RwLock<HashMap<String, bool>>,
    host_ping: RwLock<HashMap<String, Duration>>,
    failed_pings: Mutex<HashSet<String>>,
    read_delays: RwLock<HashMap<String, Duration>>,

    selector: RwLock<DpSelector>,
    vol_view: RwLock<SimpleVolView>,
    create_time: AtomicI64,
    vol_failures: AtomicU32,
    vol_not_exists: AtomicBool,
    vol_not_exists_threshold: u32,

    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
    conn_timeouts: Mutex<ConnTimeouts>,

    read_limiter: Arc<RateLimiter>,
    write_limiter: Arc<RateLimiter>,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wrapper")
            .field("volume", &self.volume)
            .field("partitions", &self.partitions.len())
            .field("writable", &self.rw_partitions.read().len())
            .finish()
    }
}

impl Wrapper {
    /// Build and bootstrap a wrapper: cluster info, volume view, selector,
    /// first partition table. With `seed` set, the persisted views are
    /// applied first and the network fetches merely update them; a seeded
    /// wrapper is usable even if the first fetch fails.
    pub async fn bootstrap(
        master: Arc<dyn MasterApi>,
        config: &ExtentConfig,
        pool: Arc<ConnectionPool>,
        read_limiter: Arc<RateLimiter>,
        write_limiter: Arc<RateLimiter>,
        seed: Option<ClientState>,
    ) -> Result<Arc<Wrapper>> {
        let w = Arc::new(Wrapper {
            volume: config.volume.clone(),
            master,
            pool,
            cluster_name: RwLock::new(String::new()),
            local_ip: RwLock::new(String::new()),
            cluster_view: RwLock::new(None),
            partitions: DashMap::new(),
            rw_partitions: RwLock::new(Vec::new()),
            removed_partitions: RwLock::new(HashSet::new()),
            host_status: RwLock::new(HashMap::new()),
            host_ping: RwLock::new(HashMap::new()),
            failed_pings: Mutex::new(HashSet::new()),
            read_delays: RwLock::new(HashMap::new()),
            selector: RwLock::new(DpSelector::Random),
            vol_view: RwLock::new(SimpleVolView::default()),
            create_time: AtomicI64::new(0),
            vol_failures: AtomicU32::new(0),
            vol_not_exists: AtomicBool::new(false),
            vol_not_exists_threshold: config.vol_not_exists_threshold,
            read_timeout_ms: AtomicU64::new(ConnTimeouts::default().read.as_millis() as u64),
            write_timeout_ms: AtomicU64::new(ConnTimeouts::default().write.as_millis() as u64),
            conn_timeouts: Mutex::new(ConnTimeouts::default()),
            read_limiter,
            write_limiter,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(state) = seed {
            w.apply_seed(state);
        }

        match w.refresh_once().await {
            Ok(()) => {}
            Err(e) if w.partitions.is_empty() => return Err(e),
            Err(e) => warn!("bootstrap refresh failed, continuing on seeded state: {e}"),
        }
        Ok(w)
    }

    fn apply_seed(&self, state: ClientState) {
        *self.cluster_name.write() = state.cluster_name;
        *self.local_ip.write() = state.local_ip;
        self.vol_failures
            .store(state.vol_not_exist_count, Ordering::Relaxed);
        if let Some(view) = state.cluster_view {
            self.apply_cluster_info(&view);
            *self.cluster_view.write() = Some(view);
        }
        if let Some(view) = state.volume_view {
            self.apply_volume_view(view);
        }
        if let Some(view) = state.partition_view {
            self.merge_partitions(view);
        }
        info!(
            "seeded wrapper for {} with {} partitions",
            self.volume,
            self.partitions.len()
        );
    }

    /// Serialize the current views for a warm restart.
    pub fn snapshot_state(&self) -> ClientState {
        ClientState {
            cluster_name: self.cluster_name.read().clone(),
            local_ip: self.local_ip.read().clone(),
            vol_not_exist_count: self.vol_failures.load(Ordering::Relaxed),
            volume_view: Some(self.vol_view.read().clone()),
            partition_view: Some(DataPartitionsView {
                partitions: self
                    .partitions
                    .iter()
                    .map(|e| partition_to_view(e.value()))
                    .collect(),
            }),
            cluster_view: self.cluster_view.read().clone(),
        }
    }

    /// Spawn the background loops. Idempotent callers should invoke this
    /// once, right after bootstrap.
    pub fn start_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let w = self.clone();
        tasks.push(tokio::spawn(async move {
            w.refresh_loop().await;
        }));

        let w = self.clone();
        tasks.push(tokio::spawn(async move {
            w.removed_dp_loop().await;
        }));

        let view = self.vol_view.read().clone();
        if view.collect_follower_read_delay {
            let w = self.clone();
            tasks.push(tokio::spawn(async move {
                w.follower_delay_loop().await;
            }));
        }

        let w = self.clone();
        tasks.push(tokio::spawn(async move {
            w.metrics_loop().await;
        }));
    }

    /// Signal every background task and wait for them to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for t in tasks {
            if let Err(e) = t.await {
                warn!("background task join failed: {e}");
            }
        }
    }

    async fn refresh_loop(&self) {
        let mut tick = tokio::time::interval(REFRESH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.refresh_once().await {
                error!("partition refresh for {} failed: {e}", self.volume);
            }
        }
    }

    /// One full refresh sweep: volume view, partition table, host pings.
    pub async fn refresh_once(&self) -> Result<()> {
        if self.cluster_name.read().is_empty() {
            match self.master.get_cluster_info().await {
                Ok(view) => {
                    *self.cluster_name.write() = view.cluster.clone();
                    *self.local_ip.write() = view.ip.clone();
                    self.apply_cluster_info(&view);
                    *self.cluster_view.write() = Some(view);
                }
                Err(e) => warn!("cluster info fetch failed: {e}"),
            }
        }

        match self.master.get_volume_view(&self.volume).await {
            Ok(view) => {
                self.vol_failures.store(0, Ordering::Relaxed);
                self.vol_not_exists.store(false, Ordering::Relaxed);
                let old_create_time = self.create_time.load(Ordering::Relaxed);
                if old_create_time != 0 && old_create_time != view.create_time {
                    warn!(
                        "volume {} was recreated (create time {} -> {}), dropping partition table",
                        self.volume, old_create_time, view.create_time
                    );
                    self.partitions.clear();
                    self.rw_partitions.write().clear();
                }
                self.apply_volume_view(view);
            }
            Err(e) => {
                let failures = self.vol_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.vol_not_exists_threshold {
                    self.vol_not_exists.store(true, Ordering::Relaxed);
                }
                return Err(e);
            }
        }

        let view = self.master.get_data_partitions(&self.volume, &[]).await?;
        self.merge_partitions(view);

        self.ping_sweep().await;
        Ok(())
    }

    fn apply_cluster_info(&self, view: &ClusterInfo) {
        let mut timeouts = ConnTimeouts::default();
        if let Some(cfg) = &view.conn_config {
            timeouts = timeouts.merge(cfg);
        }
        // Zone and volume layers overlay later, in apply_volume_view.
        *self.conn_timeouts.lock() = timeouts;
    }

    fn apply_volume_view(&self, view: SimpleVolView) {
        self.create_time.store(view.create_time, Ordering::Relaxed);

        let old = *self.conn_timeouts.lock();
        let mut timeouts = old;
        let cluster = self.cluster_view.read().clone();
        if let Some(cluster) = &cluster {
            if let Some(zone_cfg) = cluster.zone_conn_config.get(&view.zone) {
                timeouts = timeouts.merge(zone_cfg);
            }
        }
        if let Some(cfg) = &view.conn_config {
            timeouts = timeouts.merge(cfg);
        }
        let read_ms = timeouts.read.as_millis() as u64;
        let write_ms = timeouts.write.as_millis() as u64;
        if self.read_timeout_ms.swap(read_ms, Ordering::Relaxed) != read_ms {
            debug!("read timeout now {read_ms}ms");
        }
        if self.write_timeout_ms.swap(write_ms, Ordering::Relaxed) != write_ms {
            debug!("write timeout now {write_ms}ms");
        }
        if old.idle != timeouts.idle || old.connect != timeouts.connect {
            self.pool
                .update(crate::conn::DEFAULT_POOL_LIMIT, timeouts.idle, timeouts.connect);
        }
        *self.conn_timeouts.lock() = timeouts;

        self.read_limiter.set_rate(view.read_rate_limit);
        self.write_limiter.set_rate(view.write_rate_limit);

        *self.selector.write() = DpSelector::parse(&view.dp_selector_name, &view.dp_selector_parm);
        *self.vol_view.write() = view;
    }

    fn merge_partitions(&self, view: DataPartitionsView) {
        let quorum = self.vol_view.read().quorum;
        let smart = self.vol_view.read().smart;
        let mut seen: HashSet<u64> = HashSet::with_capacity(view.partitions.len());

        for record in &view.partitions {
            seen.insert(record.partition_id);
            match self.partitions.entry(record.partition_id) {
                dashmap::Entry::Occupied(e) => e.get().update_from_view(record, quorum),
                dashmap::Entry::Vacant(e) => {
                    e.insert(Arc::new(DataPartition::from_view(record, quorum)));
                }
            }
        }

        // A full table tells us which partitions are gone; a filtered fetch
        // does not.
        let full_view = !view.partitions.is_empty();
        if full_view {
            let gone: Vec<u64> = self
                .partitions
                .iter()
                .map(|e| *e.key())
                .filter(|id| !seen.contains(id))
                .collect();
            if !gone.is_empty() {
                let mut removed = self.removed_partitions.write();
                for id in gone {
                    self.partitions.remove(&id);
                    removed.insert(id);
                }
            }
        }

        let writable: Vec<Arc<DataPartition>> = {
            let mut v: Vec<Arc<DataPartition>> = self
                .partitions
                .iter()
                .filter(|e| e.value().is_writable(smart))
                .map(|e| e.value().clone())
                .collect();
            v.sort_by_key(|dp| dp.id);
            v
        };

        let min_writable = self
            .vol_view
            .read()
            .min_writable_partitions
            .max(DEFAULT_MIN_WRITABLE);
        let mut rw = self.rw_partitions.write();
        if writable.len() < min_writable && !rw.is_empty() {
            error!(
                "writable partitions dropped to {} (< {min_writable}), keeping previous set of {}",
                writable.len(),
                rw.len()
            );
        } else {
            *rw = writable;
        }
    }

    async fn ping_sweep(&self) {
        let mut hosts: HashSet<String> = HashSet::new();
        for e in self.partitions.iter() {
            for h in e.value().hosts() {
                hosts.insert(h);
            }
        }
        // Hosts that failed last sweep get retried even if they left the
        // table since.
        for h in self.failed_pings.lock().drain() {
            hosts.insert(h);
        }

        let connect_timeout = self.conn_timeouts.lock().connect;
        let mut status = HashMap::with_capacity(hosts.len());
        let mut delays = HashMap::with_capacity(hosts.len());
        let mut failed = HashSet::new();
        for host in hosts {
            let started = Instant::now();
            let ok = matches!(
                tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(&host)).await,
                Ok(Ok(_))
            );
            if ok {
                delays.insert(host.clone(), started.elapsed());
            } else {
                // Zero means "unknown"; sorters push these hosts last.
                delays.insert(host.clone(), Duration::ZERO);
                failed.insert(host.clone());
            }
            status.insert(host, ok);
        }
        *self.host_status.write() = status;
        *self.host_ping.write() = delays;
        *self.failed_pings.lock() = failed;
    }

    async fn removed_dp_loop(&self) {
        let mut tick = tokio::time::interval(REMOVED_DP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            // Confirm suspected removals against the master before streamers
            // rewrite buffered data.
            let suspects: Vec<u64> = self.removed_partitions.read().iter().copied().collect();
            if suspects.is_empty() {
                continue;
            }
            match self.master.get_data_partitions(&self.volume, &suspects).await {
                Ok(view) => {
                    let mut removed = self.removed_partitions.write();
                    for record in &view.partitions {
                        removed.remove(&record.partition_id);
                    }
                }
                Err(e) => debug!("removed-partition check failed: {e}"),
            }
        }
    }

    async fn follower_delay_loop(&self) {
        let mut tick = tokio::time::interval(FOLLOWER_DELAY_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let mut merged: HashMap<String, (Duration, u32)> = HashMap::new();
            for e in self.partitions.iter() {
                for (host, d) in e.value().follower_delays() {
                    let entry = merged.entry(host).or_insert((Duration::ZERO, 0));
                    entry.0 += d;
                    entry.1 += 1;
                }
            }
            let mut delays = self.read_delays.write();
            for (host, (sum, n)) in merged {
                delays.insert(host, sum / n.max(1));
            }
        }
    }

    async fn metrics_loop(&self) {
        loop {
            let interval = {
                let secs = self.vol_view.read().metrics_report_interval_secs;
                if secs == 0 {
                    REFRESH_INTERVAL
                } else {
                    Duration::from_secs(secs)
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.vol_view.read().metrics_report_interval_secs == 0 {
                continue;
            }
            let mut summaries = Vec::new();
            for e in self.partitions.iter() {
                let (r_ops, r_avg, _w_ops, _w_avg) = e.value().take_latency_summary();
                if r_ops > 0 {
                    summaries.push((e.value().id, e.value().leader(), r_avg.as_micros() as u64));
                }
            }
            if summaries.is_empty() {
                continue;
            }
            if let Err(e) = self.master.report_read_metrics(&self.volume, summaries).await {
                debug!("metrics report failed: {e}");
            }
        }
    }

    /// Look up a partition, or refetch it from the master if the local
    /// table lost it.
    pub async fn get_partition(&self, id: u64) -> Result<Arc<DataPartition>> {
        if let Some(dp) = self.partitions.get(&id) {
            return Ok(dp.clone());
        }
        let view = self.master.get_data_partitions(&self.volume, &[id]).await?;
        let quorum = self.vol_view.read().quorum;
        for record in &view.partitions {
            if record.partition_id == id {
                let dp = Arc::new(DataPartition::from_view(record, quorum));
                self.partitions.insert(id, dp.clone());
                self.removed_partitions.write().remove(&id);
                return Ok(dp);
            }
        }
        Err(StreamError::PartitionNotExists(id))
    }

    /// Drop a partition from the table so the next access refetches it.
    pub fn invalidate_partition(&self, id: u64) {
        self.partitions.remove(&id);
    }

    /// Whether the master confirmed `id` as removed.
    pub fn is_partition_removed(&self, id: u64) -> bool {
        self.removed_partitions.read().contains(&id)
    }

    /// Pick a partition for a new extent. `exclude` carries the hosts that
    /// already failed during this write; if it blocks every candidate it is
    /// cleared rather than stalling the write forever.
    pub fn pick_write_partition(
        &self,
        exclude: &mut HashSet<String>,
    ) -> Result<Arc<DataPartition>> {
        if self.vol_not_exists.load(Ordering::Relaxed) {
            return Err(StreamError::VolNotExists(self.volume.clone()));
        }
        let writable = self.rw_partitions.read().clone();
        if writable.is_empty() {
            return Err(StreamError::NoWritablePartition);
        }
        let selector = self.selector.read();
        if let Some(dp) = selector.select(&writable, exclude) {
            return Ok(dp);
        }
        debug!("every writable partition excluded, clearing exclusion set");
        exclude.clear();
        selector
            .select(&writable, exclude)
            .ok_or(StreamError::NoWritablePartition)
    }

    /// Ordered host candidates for reading `extent_offset` of an extent on
    /// `dp`, per the volume's routing policy.
    pub fn read_route(&self, dp: &DataPartition, extent_offset: u64) -> ReadRoute {
        let view = self.vol_view.read();
        let status = self.host_status.read();
        let up = |h: &str| status.get(h).copied().unwrap_or(true);

        if view.ec_enable {
            if let Some(host) = dp.ec_read_host(extent_offset, up) {
                let mut hosts = vec![host];
                hosts.push(dp.leader());
                hosts.dedup();
                return ReadRoute {
                    hosts,
                    follower_read: true,
                };
            }
        }

        if !view.follower_read {
            let mut hosts = vec![dp.leader()];
            for h in dp.sorted_hosts(DEFAULT_HOST_ERR_TIMEOUT, up) {
                if !hosts.contains(&h) {
                    hosts.push(h);
                }
            }
            return ReadRoute {
                hosts,
                follower_read: false,
            };
        }

        let hosts = if view.cross_region_ha {
            let info = dp.info();
            let ping = self.host_ping.read();
            let mut near = info.master_region_hosts.clone();
            near.sort_by_key(|h| match ping.get(h) {
                Some(d) if !d.is_zero() => *d,
                _ => Duration::MAX,
            });
            near.extend(info.slave_region_hosts);
            near
        } else if view.near_read {
            sort_by_distance(&dp.hosts(), &self.local_ip.read())
        } else if view.collect_follower_read_delay {
            let delays = self.read_delays.read();
            let all = dp.hosts();
            let mut hosts = Vec::with_capacity(all.len());
            if let Some(first) = pick_lowest_delay(&all, &delays) {
                hosts.push(first);
            }
            for h in all {
                if !hosts.contains(&h) {
                    hosts.push(h);
                }
            }
            hosts
        } else {
            epoch_rotated(&dp.hosts(), dp.epoch())
        };

        let mut ordered: Vec<String> = hosts.iter().filter(|h| up(h)).cloned().collect();
        for h in hosts {
            if !ordered.contains(&h) {
                ordered.push(h);
            }
        }
        ReadRoute {
            hosts: ordered,
            follower_read: true,
        }
    }

    /// Whether `addr` looked reachable on the last sweep. Unknown hosts
    /// count as up.
    pub fn host_is_up(&self, addr: &str) -> bool {
        self.host_status.read().get(addr).copied().unwrap_or(true)
    }

    /// Per-operation read timeout currently in effect.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.load(Ordering::Relaxed))
    }

    /// Per-operation write timeout currently in effect.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.load(Ordering::Relaxed))
    }

    /// Snapshot of the volume policy flags.
    pub fn volume_view(&self) -> SimpleVolView {
        self.vol_view.read().clone()
    }

    /// Overwrites are rerouted through reallocation when the volume policy
    /// forbids updating extents in place.
    pub fn overwrite_allowed(&self) -> bool {
        let view = self.vol_view.read();
        !view.force_row && !view.cross_region_ha && !view.remote_cache_enable
    }

    /// Quorum-limited follower count a streaming write should fan out to.
    pub fn write_fanout(&self, replica_num: u8) -> u8 {
        let quorum = self.vol_view.read().quorum;
        if quorum > 0 {
            (quorum.saturating_sub(1) as u8).min(replica_num.saturating_sub(1))
        } else {
            replica_num.saturating_sub(1)
        }
    }

    /// Number of currently writable partitions.
    pub fn writable_count(&self) -> usize {
        self.rw_partitions.read().len()
    }

    /// The shared connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The volume this wrapper serves.
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// The client IP as the master reported it.
    pub fn local_ip(&self) -> String {
        self.local_ip.read().clone()
    }
}

fn partition_to_view(dp: &DataPartition) -> crate::meta::DataPartitionView {
    let info = dp.info();
    crate::meta::DataPartitionView {
        partition_id: dp.id,
        status: info.status,
        transfer_status: info.transfer_status,
        replica_num: info.replica_num,
        hosts: info.hosts,
        leader_addr: dp.leader(),
        epoch: info.epoch,
        is_recover: info.is_recover,
        is_frozen: info.is_frozen,
        medium_type: info.medium_type,
        ec_hosts: info.ec_hosts,
        ec_data_num: info.ec_data_num,
        ec_stripe_unit_size: info.ec_stripe_unit_size,
        ec_migrate_status: info.ec_migrate_status,
        total: info.total,
        used: info.used,
    }
}
