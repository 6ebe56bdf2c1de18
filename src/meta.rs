//! Interfaces to the meta and master collaborators.
//!
//! The data plane consumes a handful of synchronous RPCs from the metadata
//! service and the cluster master. How they are implemented (wire format,
//! leader election, retries against replicas) is the embedder's business;
//! the traits here are the entire contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::extent_key::ExtentKey;

/// The authoritative extent map of an inode, as returned by the meta
/// service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtentSnapshot {
    /// Monotonic generation; stale snapshots carry lower values.
    pub generation: u64,
    /// Logical file size.
    pub size: u64,
    /// Keys in ascending file-offset order, non-overlapping.
    pub extents: Vec<ExtentKey>,
}

/// Metadata-service calls the data plane makes.
#[async_trait]
pub trait MetaApi: Send + Sync + 'static {
    /// Persist one extent key for `inode`. The server deduplicates
    /// redundant inserts. `is_pre_extent` marks keys that continue a
    /// previous extent rather than starting a new one.
    async fn insert_extent_key(&self, inode: u64, key: ExtentKey, is_pre_extent: bool)
    -> Result<()>;

    /// Fetch the authoritative extent map.
    async fn get_extents(&self, inode: u64) -> Result<ExtentSnapshot>;

    /// Record a truncation before the client mutates its local view.
    async fn truncate(&self, inode: u64, old_size: u64, new_size: u64) -> Result<()>;
}

/// Cluster identity as reported by the master, including the IP the master
/// saw this client dial in from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster name, used to scope persisted state.
    pub cluster: String,
    /// This client's IP as observed by the master.
    pub ip: String,
    /// Cluster-level connection tuning, if the operator set any.
    #[serde(default)]
    pub conn_config: Option<ConnTimeoutView>,
    /// Zone-level connection tuning overrides, keyed by zone name.
    #[serde(default)]
    pub zone_conn_config: HashMap<String, ConnTimeoutView>,
}

/// Connection tuning knobs as they appear in master views. Zero means
/// "not set at this level".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnTimeoutView {
    /// Idle seconds before a pooled connection is dropped.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Dial timeout in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: u64,
    /// Per-operation read timeout in milliseconds.
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Per-operation write timeout in milliseconds.
    #[serde(default)]
    pub write_timeout_ms: u64,
}

/// Volume policy and tuning, fetched on a minute cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimpleVolView {
    /// Volume name.
    pub name: String,
    /// Volume owner id.
    pub owner: String,
    /// Creation timestamp; a change means the volume was recreated and every
    /// cached partition must be dropped.
    pub create_time: i64,
    /// Cross-region write quorum (0 disables quorum routing).
    #[serde(default)]
    pub quorum: u32,
    /// Whether follower replicas may serve reads.
    #[serde(default)]
    pub follower_read: bool,
    /// Whether reads should prefer the topologically nearest host.
    #[serde(default)]
    pub near_read: bool,
    /// Forbid in-place overwrite; every overwrite reallocates.
    #[serde(default)]
    pub force_row: bool,
    /// Cross-region high availability enabled.
    #[serde(default)]
    pub cross_region_ha: bool,
    /// Zone this volume is pinned to.
    #[serde(default)]
    pub zone: String,
    /// Write-partition selector name.
    #[serde(default)]
    pub dp_selector_name: String,
    /// Selector parameter string.
    #[serde(default)]
    pub dp_selector_parm: String,
    /// Erasure-coded storage attached to this volume.
    #[serde(default)]
    pub ec_enable: bool,
    /// A remote cache layer sits in front of this volume; its internals
    /// live elsewhere, but overwrites must reallocate so cached extents
    /// stay immutable.
    #[serde(default)]
    pub remote_cache_enable: bool,
    /// Smart tiering: writes go to HDD partitions still accepting transfer.
    #[serde(default)]
    pub smart: bool,
    /// Per-volume read byte-rate cap, bytes/sec, 0 = unlimited.
    #[serde(default)]
    pub read_rate_limit: u64,
    /// Per-volume write byte-rate cap, bytes/sec, 0 = unlimited.
    #[serde(default)]
    pub write_rate_limit: u64,
    /// Volume-level connection tuning.
    #[serde(default)]
    pub conn_config: Option<ConnTimeoutView>,
    /// Floor under which the writable-partition set refuses to shrink.
    #[serde(default)]
    pub min_writable_partitions: usize,
    /// Collect per-host follower read latency and use it for read routing.
    #[serde(default)]
    pub collect_follower_read_delay: bool,
    /// Seconds between latency-summary reports, 0 disables reporting.
    #[serde(default)]
    pub metrics_report_interval_secs: u64,
    /// Scheduler domain the summaries are pushed to.
    #[serde(default)]
    pub metrics_domain: String,
}

/// Partition health as the master reports it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    num_enum::FromPrimitive,
    num_enum::IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(i8)]
#[serde(from = "i8", into = "i8")]
pub enum PartitionStatus {
    /// Accepting reads and new extents.
    ReadWrite = 2,
    /// Serving reads only.
    ReadOnly = 1,
    /// Out of service.
    #[default]
    Unavailable = -1,
}

/// Storage medium backing a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumType {
    /// Solid-state tier.
    #[default]
    Ssd,
    /// Spinning tier.
    Hdd,
}

/// One record of the master's partition table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPartitionView {
    /// Partition id.
    pub partition_id: u64,
    /// Health.
    pub status: PartitionStatus,
    /// Health of the tiering transfer target, for smart volumes.
    #[serde(default)]
    pub transfer_status: PartitionStatus,
    /// Replica count.
    pub replica_num: u8,
    /// Replica addresses; index 0 is the preferred write target.
    pub hosts: Vec<String>,
    /// Advertised leader, advisory only.
    #[serde(default)]
    pub leader_addr: String,
    /// Membership epoch, bumped when hosts change.
    #[serde(default)]
    pub epoch: u64,
    /// Replica repair in progress.
    #[serde(default)]
    pub is_recover: bool,
    /// Writes administratively frozen.
    #[serde(default)]
    pub is_frozen: bool,
    /// Backing medium.
    #[serde(default)]
    pub medium_type: MediumType,
    /// Erasure-coded shard hosts, data shards first.
    #[serde(default)]
    pub ec_hosts: Vec<String>,
    /// Number of EC data shards.
    #[serde(default)]
    pub ec_data_num: u32,
    /// EC stripe unit size in bytes.
    #[serde(default)]
    pub ec_stripe_unit_size: u64,
    /// EC migration progress state.
    #[serde(default)]
    pub ec_migrate_status: u8,
    /// Total capacity in bytes.
    #[serde(default)]
    pub total: u64,
    /// Used bytes.
    #[serde(default)]
    pub used: u64,
}

/// The master's partition table for one volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPartitionsView {
    /// Partition records.
    pub partitions: Vec<DataPartitionView>,
}

/// Master calls the data plane makes.
#[async_trait]
pub trait MasterApi: Send + Sync + 'static {
    /// Cluster name, observed client IP and cluster/zone connection tuning.
    async fn get_cluster_info(&self) -> Result<ClusterInfo>;

    /// Current volume policy and config.
    async fn get_volume_view(&self, vol: &str) -> Result<SimpleVolView>;

    /// The partition table. With a non-empty `ids` filter only those
    /// partitions are returned.
    async fn get_data_partitions(&self, vol: &str, ids: &[u64]) -> Result<DataPartitionsView>;

    /// Per-host read latency summaries pushed to the scheduler domain, when
    /// metrics reporting is enabled. The default implementation discards
    /// them.
    async fn report_read_metrics(&self, _vol: &str, _summaries: Vec<(u64, String, u64)>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_status_from_wire() {
        assert_eq!(PartitionStatus::from(2), PartitionStatus::ReadWrite);
        assert_eq!(PartitionStatus::from(1), PartitionStatus::ReadOnly);
        assert_eq!(PartitionStatus::from(-1), PartitionStatus::Unavailable);
        // Unknown codes degrade to unavailable rather than failing the view.
        assert_eq!(PartitionStatus::from(9), PartitionStatus::Unavailable);
    }

    #[test]
    fn views_deserialize_with_defaults() {
        let view: DataPartitionView = serde_json::from_str(
            r#"{"partition_id": 7, "status": 2, "replica_num": 3,
                "hosts": ["a:17030", "b:17030", "c:17030"]}"#,
        )
        .unwrap();
        assert_eq!(view.partition_id, 7);
        assert_eq!(view.status, PartitionStatus::ReadWrite);
        assert!(view.leader_addr.is_empty());
        assert_eq!(view.medium_type, MediumType::Ssd);
    }
}
