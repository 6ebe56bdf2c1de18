//! Optional persisted client state for warm restarts.
//!
//! A client can serialize its last cluster, volume and partition views and
//! reseed a fresh client from them, so a restarted mount serves requests
//! before the first full refresh completes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::meta::{ClusterInfo, DataPartitionsView, SimpleVolView};

/// Snapshot of everything a new client needs to start without talking to
/// the master first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientState {
    /// Cluster name from the last cluster-info fetch.
    pub cluster_name: String,
    /// This client's IP as the master saw it.
    pub local_ip: String,
    /// Consecutive volume-view failures at snapshot time.
    pub vol_not_exist_count: u32,
    /// Last volume view.
    pub volume_view: Option<SimpleVolView>,
    /// Last partition table.
    pub partition_view: Option<DataPartitionsView>,
    /// Last cluster info.
    pub cluster_view: Option<ClusterInfo>,
}

impl ClientState {
    /// Serialize to `path` as JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| StreamError::Other(format!("serialize client state: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load a snapshot previously written with [`save_to`](Self::save_to).
    pub fn load_from(path: &Path) -> Result<ClientState> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| StreamError::Other(format!("parse client state: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DataPartitionView;

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.state");

        let state = ClientState {
            cluster_name: "cluster-a".into(),
            local_ip: "10.0.0.9".into(),
            vol_not_exist_count: 0,
            volume_view: Some(SimpleVolView {
                name: "vol".into(),
                create_time: 42,
                ..Default::default()
            }),
            partition_view: Some(DataPartitionsView {
                partitions: vec![DataPartitionView {
                    partition_id: 7,
                    hosts: vec!["a:17030".into()],
                    replica_num: 1,
                    ..Default::default()
                }],
            }),
            cluster_view: None,
        };
        state.save_to(&path).unwrap();

        let back = ClientState::load_from(&path).unwrap();
        assert_eq!(back.cluster_name, "cluster-a");
        assert_eq!(back.volume_view.unwrap().create_time, 42);
        assert_eq!(back.partition_view.unwrap().partitions[0].partition_id, 7);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ClientState::load_from(Path::new("/nonexistent/client.state")).unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
