//! In-process mock cluster: data nodes speaking the real wire protocol on
//! loopback listeners, plus in-memory meta and master collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use extentfs::error::{Result, StreamError};
use extentfs::meta::{
    ClusterInfo, DataPartitionView, DataPartitionsView, ExtentSnapshot, MasterApi, MetaApi,
    PartitionStatus, SimpleVolView,
};
use extentfs::proto::{ExtentType, Opcode, Packet, ResultCode, WireMode};
use extentfs::{ExtentClient, ExtentConfig, ExtentKey};

const READ_CHUNK: usize = 64 * 1024;

/// Extent contents shared by every node of the mock cluster.
#[derive(Default)]
pub struct Storage {
    extents: Mutex<HashMap<(u64, u64), Vec<u8>>>,
    next_extent: Mutex<HashMap<u64, u64>>,
    next_tiny: Mutex<HashMap<u64, (u64, u64)>>,
}

impl Storage {
    fn create_extent(&self, dp: u64) -> u64 {
        let mut next = self.next_extent.lock();
        let id = next.entry(dp).or_insert(65);
        let got = *id;
        *id += 1;
        self.extents.lock().insert((dp, got), Vec::new());
        got
    }

    fn append_tiny(&self, dp: u64, data: &[u8]) -> (u64, u64) {
        let mut tiny = self.next_tiny.lock();
        let (id, used) = *tiny.entry(dp).or_insert((1, 0));
        let mut extents = self.extents.lock();
        let buf = extents.entry((dp, id)).or_default();
        buf.extend_from_slice(data);
        tiny.insert(dp, (id, used + data.len() as u64));
        (id, used)
    }

    fn write_at(
        &self,
        dp: u64,
        extent: u64,
        offset: u64,
        data: &[u8],
    ) -> std::result::Result<(), ResultCode> {
        let mut extents = self.extents.lock();
        let Some(buf) = extents.get_mut(&(dp, extent)) else {
            return Err(ResultCode::NotExistErr);
        };
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(
        &self,
        dp: u64,
        extent: u64,
        offset: u64,
        len: usize,
    ) -> std::result::Result<Vec<u8>, ResultCode> {
        let extents = self.extents.lock();
        let Some(buf) = extents.get(&(dp, extent)) else {
            return Err(ResultCode::NotExistErr);
        };
        if offset as usize >= buf.len() {
            return Err(ResultCode::NotExistErr);
        }
        let end = (offset as usize + len).min(buf.len());
        Ok(buf[offset as usize..end].to_vec())
    }
}

/// One mock data node on a loopback listener.
pub struct MockDataNode {
    pub addr: String,
    inject: Arc<Mutex<HashMap<u8, VecDeque<ResultCode>>>>,
    pub write_packets: Arc<AtomicUsize>,
    pub corrupt_reads: Arc<AtomicBool>,
    pub applied_id: Arc<AtomicU64>,
}

impl MockDataNode {
    pub async fn start(storage: Arc<Storage>) -> MockDataNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let node = MockDataNode {
            addr,
            inject: Arc::new(Mutex::new(HashMap::new())),
            write_packets: Arc::new(AtomicUsize::new(0)),
            corrupt_reads: Arc::new(AtomicBool::new(false)),
            applied_id: Arc::new(AtomicU64::new(1)),
        };
        let inject = node.inject.clone();
        let write_packets = node.write_packets.clone();
        let corrupt_reads = node.corrupt_reads.clone();
        let applied_id = node.applied_id.clone();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                let storage = storage.clone();
                let inject = inject.clone();
                let write_packets = write_packets.clone();
                let corrupt_reads = corrupt_reads.clone();
                let applied_id = applied_id.clone();
                tokio::spawn(async move {
                    let _ = serve_conn(
                        conn,
                        storage,
                        inject,
                        write_packets,
                        corrupt_reads,
                        applied_id,
                    )
                    .await;
                });
            }
        });
        node
    }

    /// Make the next packet of `op` fail with `code`.
    pub fn inject(&self, op: Opcode, code: ResultCode) {
        self.inject
            .lock()
            .entry(op.into())
            .or_default()
            .push_back(code);
    }
}

async fn serve_conn(
    mut conn: TcpStream,
    storage: Arc<Storage>,
    inject: Arc<Mutex<HashMap<u8, VecDeque<ResultCode>>>>,
    write_packets: Arc<AtomicUsize>,
    corrupt_reads: Arc<AtomicBool>,
    applied_id: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        let req = Packet::read_from(WireMode::Normal, &mut conn, Duration::from_secs(60)).await?;

        let injected = inject
            .lock()
            .get_mut(&u8::from(req.opcode))
            .and_then(VecDeque::pop_front);
        if let Some(code) = injected {
            let mut reply = req.clone();
            reply.result_code = code;
            reply.arg = Bytes::new();
            reply.data = Bytes::from_static(b"mock injected failure");
            reply
                .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                .await?;
            continue;
        }

        match req.opcode {
            Opcode::CreateExtent => {
                let id = storage.create_extent(req.partition_id);
                let mut reply = req.clone();
                reply.result_code = ResultCode::Ok;
                reply.arg = Bytes::new();
                reply.data = Bytes::new();
                reply.extent_id = id;
                reply
                    .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                    .await?;
            }
            Opcode::Write | Opcode::SyncWrite => {
                write_packets.fetch_add(1, Ordering::Relaxed);
                let mut reply = req.clone();
                reply.arg = Bytes::new();
                if crc32fast::hash(&req.data) != req.crc {
                    reply.result_code = ResultCode::Err;
                    reply.data = Bytes::from_static(b"crc mismatch at server");
                } else if req.extent_type == ExtentType::Tiny && req.extent_id == 0 {
                    let (id, offset) = storage.append_tiny(req.partition_id, &req.data);
                    reply.result_code = ResultCode::Ok;
                    reply.extent_id = id;
                    reply.extent_offset = offset as i64;
                    reply.data = Bytes::new();
                } else {
                    match storage.write_at(
                        req.partition_id,
                        req.extent_id,
                        req.extent_offset as u64,
                        &req.data,
                    ) {
                        Ok(()) => {
                            reply.result_code = ResultCode::Ok;
                            reply.data = Bytes::new();
                        }
                        Err(code) => {
                            reply.result_code = code;
                            reply.data = Bytes::from_static(b"no such extent");
                        }
                    }
                }
                reply
                    .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                    .await?;
            }
            Opcode::RandomWrite | Opcode::SyncRandomWrite => {
                let mut reply = req.clone();
                reply.arg = Bytes::new();
                match storage.write_at(
                    req.partition_id,
                    req.extent_id,
                    req.extent_offset as u64,
                    &req.data,
                ) {
                    Ok(()) => {
                        reply.result_code = ResultCode::Ok;
                        reply.data = Bytes::new();
                    }
                    Err(code) => {
                        reply.result_code = code;
                        reply.data = Bytes::from_static(b"no such extent");
                    }
                }
                reply
                    .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                    .await?;
            }
            Opcode::StreamRead | Opcode::StreamFollowerRead | Opcode::Read => {
                let wanted = req.kernel_offset as usize;
                match storage.read_at(
                    req.partition_id,
                    req.extent_id,
                    req.extent_offset as u64,
                    wanted,
                ) {
                    Ok(data) => {
                        let mut sent = 0;
                        while sent < data.len() {
                            let chunk = &data[sent..(sent + READ_CHUNK).min(data.len())];
                            let mut payload = chunk.to_vec();
                            let crc = crc32fast::hash(&payload);
                            if corrupt_reads.load(Ordering::Relaxed) {
                                if let Some(b) = payload.first_mut() {
                                    *b = b.wrapping_add(1);
                                }
                            }
                            let mut reply = req.clone();
                            reply.result_code = ResultCode::Ok;
                            reply.arg = Bytes::new();
                            reply.crc = crc;
                            reply.extent_offset = req.extent_offset + sent as i64;
                            reply.data = Bytes::from(payload);
                            reply
                                .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                                .await?;
                            sent += chunk.len();
                        }
                    }
                    Err(code) => {
                        let mut reply = req.clone();
                        reply.result_code = code;
                        reply.arg = Bytes::new();
                        reply.data = Bytes::from_static(b"no such extent");
                        reply
                            .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                            .await?;
                    }
                }
            }
            Opcode::MarkDelete | Opcode::LockOrUnlockExtent => {
                let mut reply = req.clone();
                reply.result_code = ResultCode::Ok;
                reply.arg = Bytes::new();
                reply.data = Bytes::new();
                reply
                    .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                    .await?;
            }
            Opcode::GetAppliedId => {
                let mut reply = req.clone();
                reply.result_code = ResultCode::Ok;
                reply.arg = Bytes::new();
                reply.data =
                    Bytes::copy_from_slice(&applied_id.load(Ordering::Relaxed).to_be_bytes());
                reply
                    .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                    .await?;
            }
            _ => {
                let mut reply = req.clone();
                reply.result_code = ResultCode::Err;
                reply.arg = Bytes::new();
                reply.data = Bytes::from_static(b"unsupported opcode");
                reply
                    .write_to(WireMode::Normal, &mut conn, Duration::from_secs(5))
                    .await?;
            }
        }
    }
}

/// In-memory master.
#[derive(Default)]
pub struct MockMaster {
    pub vol: Mutex<SimpleVolView>,
    pub dps: Mutex<Vec<DataPartitionView>>,
}

#[async_trait]
impl MasterApi for MockMaster {
    async fn get_cluster_info(&self) -> Result<ClusterInfo> {
        Ok(ClusterInfo {
            cluster: "mock-cluster".into(),
            ip: "127.0.0.1".into(),
            ..Default::default()
        })
    }

    async fn get_volume_view(&self, _vol: &str) -> Result<SimpleVolView> {
        Ok(self.vol.lock().clone())
    }

    async fn get_data_partitions(&self, _vol: &str, ids: &[u64]) -> Result<DataPartitionsView> {
        let all = self.dps.lock().clone();
        let partitions = if ids.is_empty() {
            all
        } else {
            all.into_iter()
                .filter(|p| ids.contains(&p.partition_id))
                .collect()
        };
        Ok(DataPartitionsView { partitions })
    }
}

/// In-memory meta service.
#[derive(Default)]
pub struct MockMeta {
    pub snapshots: Mutex<HashMap<u64, ExtentSnapshot>>,
    pub fail_inserts: AtomicBool,
}

#[async_trait]
impl MetaApi for MockMeta {
    async fn insert_extent_key(
        &self,
        inode: u64,
        key: ExtentKey,
        _is_pre_extent: bool,
    ) -> Result<()> {
        if self.fail_inserts.load(Ordering::Relaxed) {
            return Err(StreamError::Other("meta unavailable".into()));
        }
        let mut snaps = self.snapshots.lock();
        let snap = snaps.entry(inode).or_default();
        snap.generation += 1;
        // Dedup and shadow exactly like the real server: the new key wins
        // over whatever it overlaps.
        snap.extents
            .retain(|k| k.end() <= key.file_offset || k.file_offset >= key.end());
        snap.extents.push(key);
        snap.extents.sort_by_key(|k| k.file_offset);
        snap.size = snap.size.max(key.end());
        Ok(())
    }

    async fn get_extents(&self, inode: u64) -> Result<ExtentSnapshot> {
        Ok(self
            .snapshots
            .lock()
            .get(&inode)
            .cloned()
            .unwrap_or_default())
    }

    async fn truncate(&self, inode: u64, _old_size: u64, new_size: u64) -> Result<()> {
        let mut snaps = self.snapshots.lock();
        let snap = snaps.entry(inode).or_default();
        snap.generation += 1;
        snap.size = new_size;
        snap.extents.retain(|k| k.file_offset < new_size);
        if let Some(last) = snap.extents.last_mut() {
            if last.end() > new_size {
                last.size = (new_size - last.file_offset) as u32;
            }
        }
        Ok(())
    }
}

/// A whole cluster: nodes, partition table, collaborators.
pub struct MockCluster {
    pub master: Arc<MockMaster>,
    pub meta: Arc<MockMeta>,
    pub storage: Arc<Storage>,
    pub nodes: Vec<MockDataNode>,
}

impl MockCluster {
    /// Start `num_nodes` data nodes sharing one storage.
    pub async fn start(num_nodes: usize) -> MockCluster {
        let _ = env_logger::builder().is_test(true).try_init();
        let storage = Arc::new(Storage::default());
        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            nodes.push(MockDataNode::start(storage.clone()).await);
        }
        let master = Arc::new(MockMaster::default());
        {
            let mut vol = master.vol.lock();
            vol.name = "mock-vol".into();
            vol.owner = "tester".into();
            vol.create_time = 1;
        }
        MockCluster {
            master,
            meta: Arc::new(MockMeta::default()),
            storage,
            nodes,
        }
    }

    /// Register a partition served by the given node indices.
    pub fn add_partition(&self, id: u64, node_indices: &[usize]) {
        let hosts: Vec<String> = node_indices
            .iter()
            .map(|&i| self.nodes[i].addr.clone())
            .collect();
        self.master.dps.lock().push(DataPartitionView {
            partition_id: id,
            status: PartitionStatus::ReadWrite,
            replica_num: hosts.len() as u8,
            leader_addr: hosts.first().cloned().unwrap_or_default(),
            hosts,
            ..Default::default()
        });
    }

    /// Build a client for this cluster.
    pub async fn client(&self, config: ExtentConfig) -> ExtentClient {
        ExtentClient::new(self.master.clone(), self.meta.clone(), config)
            .await
            .unwrap()
    }

    /// The persisted keys for `inode`, from the meta service.
    pub fn meta_keys(&self, inode: u64) -> Vec<ExtentKey> {
        self.meta
            .snapshots
            .lock()
            .get(&inode)
            .map(|s| s.extents.clone())
            .unwrap_or_default()
    }

    /// Total write packets observed across all nodes.
    pub fn write_packets(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.write_packets.load(Ordering::Relaxed))
            .sum()
    }
}

/// Default config against the mock volume.
pub fn test_config() -> ExtentConfig {
    ExtentConfig::new("mock-vol")
}
