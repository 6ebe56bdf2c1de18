//! End-to-end tests against an in-process mock cluster.

mod common;

use std::sync::atomic::Ordering;

use common::{MockCluster, test_config};
use extentfs::error::StreamError;
use extentfs::proto::{Opcode, ResultCode};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn write_flush_reopen_read_roundtrip() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let client = cluster.client(test_config()).await;

    let inode = 42;
    let data = pattern(300 * KIB, 7);
    client.open_stream(inode).await.unwrap();
    let n = client.write(inode, 0, &data, false).await.unwrap();
    assert_eq!(n, data.len());
    client.flush(inode).await.unwrap();
    client.evict_stream(inode).await.unwrap();
    assert_eq!(client.open_streams(), 0);

    // Reopen: the cache reseeds from the meta service.
    client.open_stream(inode).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    let n = client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);

    assert_eq!(client.file_size(inode).await.unwrap(), data.len() as u64);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_length_write_sends_nothing() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let client = cluster.client(test_config()).await;

    let inode = 42;
    client.open_stream(inode).await.unwrap();
    client
        .write(inode, 0, &vec![5u8; 64 * KIB], false)
        .await
        .unwrap();
    assert_eq!(
        client.write(inode, 64 * KIB as u64, &[], false).await.unwrap(),
        0
    );
    client.flush(inode).await.unwrap();

    let keys = cluster.meta_keys(inode);
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].file_offset, 0);
    assert_eq!(keys[0].size, 64 * KIB as u32);
    assert_eq!(cluster.write_packets(), 1, "one packet for one block");
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn append_across_extent_boundary() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let mut config = test_config();
    config.extent_size = MIB as u64;
    // Keep the first write out of the tiny path so it lands in the sized
    // extent.
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 7;
    client.open_stream(inode).await.unwrap();
    let first = pattern(512 * KIB, 1);
    let second = pattern(MIB, 2);
    client.write(inode, 0, &first, false).await.unwrap();
    client
        .write(inode, 512 * KIB as u64, &second, false)
        .await
        .unwrap();
    client.flush(inode).await.unwrap();

    let keys = cluster.meta_keys(inode);
    assert_eq!(keys.len(), 2, "exactly one handler recycle");
    assert_eq!(keys[0].file_offset, 0);
    assert_eq!(keys[0].size as usize, MIB, "first extent filled");
    assert_eq!(keys[1].file_offset as usize, MIB);
    assert_eq!(keys[1].size as usize, 512 * KIB);
    assert_ne!(keys[0].extent_id, keys[1].extent_id);

    // Contents survive the boundary.
    let mut buf = vec![0u8; 1536 * KIB];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..512 * KIB], &first[..]);
    assert_eq!(&buf[512 * KIB..], &second[..]);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn force_row_replaces_extent() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    cluster.add_partition(2, &[0]);
    cluster.master.vol.lock().force_row = true;
    let mut config = test_config();
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 9;
    client.open_stream(inode).await.unwrap();
    let first = pattern(128 * KIB, 3);
    client.write(inode, 0, &first, false).await.unwrap();
    client.flush(inode).await.unwrap();
    let old = cluster.meta_keys(inode)[0];

    let second = pattern(128 * KIB, 4);
    client.write(inode, 0, &second, false).await.unwrap();
    client.flush(inode).await.unwrap();

    let keys = cluster.meta_keys(inode);
    assert_eq!(keys.len(), 1);
    let new = keys[0];
    assert!(
        (new.partition_id, new.extent_id) != (old.partition_id, old.extent_id),
        "overwrite must land in a fresh extent"
    );

    let mut buf = vec![0u8; 128 * KIB];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(buf, second);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn try_other_addr_moves_the_leader() {
    let cluster = MockCluster::start(3).await;
    cluster.add_partition(1, &[0, 1, 2]);
    let mut config = test_config();
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 11;
    client.open_stream(inode).await.unwrap();
    let data = pattern(64 * KIB, 5);
    client.write(inode, 0, &data, false).await.unwrap();
    client.flush(inode).await.unwrap();

    // The leader refuses the in-place overwrite once; the client must
    // rotate, succeed elsewhere, and move the advisory leader there.
    cluster.nodes[0].inject(Opcode::RandomWrite, ResultCode::TryOtherAddr);
    let update = pattern(64 * KIB, 6);
    client.write(inode, 0, &update, false).await.unwrap();

    let dp = client.wrapper().get_partition(1).await.unwrap();
    assert_ne!(dp.leader(), cluster.nodes[0].addr);

    let mut buf = vec![0u8; 64 * KIB];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(buf, update);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn no_space_excludes_partition_within_one_write() {
    let cluster = MockCluster::start(2).await;
    cluster.add_partition(1, &[0]);
    cluster.add_partition(2, &[1]);
    let mut config = test_config();
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    // Whichever partition the selector tries first is out of space.
    cluster.nodes[0].inject(Opcode::CreateExtent, ResultCode::DiskNoSpaceErr);
    cluster.nodes[1].inject(Opcode::CreateExtent, ResultCode::DiskNoSpaceErr);

    let inode = 13;
    client.open_stream(inode).await.unwrap();
    let data = pattern(32 * KIB, 8);
    let n = client.write(inode, 0, &data, false).await.unwrap();
    assert_eq!(n, data.len());
    client.flush(inode).await.unwrap();

    let keys = cluster.meta_keys(inode);
    assert_eq!(keys.len(), 1);

    let mut buf = vec![0u8; data.len()];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(buf, data);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_writes_merge_pending_packets() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let mut config = test_config();
    config.write_cache = true;
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 15;
    client.open_stream(inode).await.unwrap();
    let a = pattern(32 * KIB, 9);
    let b = pattern(32 * KIB, 10);
    client.write(inode, 0, &a, false).await.unwrap();
    client
        .write(inode, 32 * KIB as u64, &b, false)
        .await
        .unwrap();
    assert_eq!(cluster.write_packets(), 0, "still buffered locally");

    client.flush(inode).await.unwrap();
    assert!(cluster.write_packets() <= 2);

    let mut buf = vec![0u8; 64 * KIB];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..32 * KIB], &a[..]);
    assert_eq!(&buf[32 * KIB..], &b[..]);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn buffered_overwrite_hits_pending_packet_without_io() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let mut config = test_config();
    config.write_cache = true;
    let client = cluster.client(config).await;

    let inode = 16;
    client.open_stream(inode).await.unwrap();
    client
        .write(inode, 0, &pattern(16 * KIB, 1), false)
        .await
        .unwrap();
    // Rewrite a slice of the still-buffered range: no packet may leave.
    let patch = pattern(4 * KIB, 2);
    client
        .write(inode, 4 * KIB as u64, &patch, false)
        .await
        .unwrap();
    assert_eq!(cluster.write_packets(), 0);

    client.flush(inode).await.unwrap();
    let mut buf = vec![0u8; 16 * KIB];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[4 * KIB..8 * KIB], &patch[..]);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn truncate_then_read_past_eof() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let client = cluster.client(test_config()).await;

    let inode = 17;
    client.open_stream(inode).await.unwrap();
    let data = pattern(128 * KIB, 11);
    client.write(inode, 0, &data, false).await.unwrap();
    client.flush(inode).await.unwrap();

    client.truncate(inode, 32 * KIB as u64).await.unwrap();
    assert_eq!(client.file_size(inode).await.unwrap(), 32 * KIB as u64);

    let mut buf = vec![0u8; 16 * KIB];
    let n = client
        .read(inode, 64 * KIB as u64, &mut buf)
        .await
        .unwrap();
    assert_eq!(n, 0, "reads past the new size see EOF");

    let mut head = vec![0u8; 32 * KIB];
    let n = client.read(inode, 0, &mut head).await.unwrap();
    assert_eq!(n, 32 * KIB);
    assert_eq!(head, &data[..32 * KIB]);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn holes_read_as_zeros() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let mut config = test_config();
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 19;
    client.open_stream(inode).await.unwrap();
    let tail = pattern(8 * KIB, 12);
    client
        .write(inode, 64 * KIB as u64, &tail, false)
        .await
        .unwrap();
    client.flush(inode).await.unwrap();

    let mut buf = vec![0xAAu8; 72 * KIB];
    let n = client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(n, 72 * KIB);
    assert!(buf[..64 * KIB].iter().all(|&b| b == 0), "hole zero-filled");
    assert_eq!(&buf[64 * KIB..], &tail[..]);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_reply_is_a_crc_error() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let mut config = test_config();
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 21;
    client.open_stream(inode).await.unwrap();
    client
        .write(inode, 0, &pattern(16 * KIB, 13), false)
        .await
        .unwrap();
    client.flush(inode).await.unwrap();

    cluster.nodes[0].corrupt_reads.store(true, Ordering::Relaxed);
    let mut buf = vec![0u8; 16 * KIB];
    let err = client.read(inode, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, StreamError::CrcMismatch { .. }), "got {err}");
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn consistency_read_prefers_most_applied_replica() {
    let cluster = MockCluster::start(3).await;
    cluster.add_partition(1, &[0, 1, 2]);
    cluster.nodes[0].applied_id.store(3, Ordering::Relaxed);
    cluster.nodes[1].applied_id.store(9, Ordering::Relaxed);
    cluster.nodes[2].applied_id.store(5, Ordering::Relaxed);
    let mut config = test_config();
    config.tiny_size_limit = 4 * KIB as u64;
    let client = cluster.client(config).await;

    let inode = 23;
    client.open_stream(inode).await.unwrap();
    let data = pattern(24 * KIB, 14);
    client.write(inode, 0, &data, false).await.unwrap();
    client.flush(inode).await.unwrap();

    let mut buf = vec![0u8; data.len()];
    let n = client.read_consistent(inode, 0, &mut buf).await.unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn tiny_write_packs_small_file() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let client = cluster.client(test_config()).await;

    let inode = 25;
    client.open_stream(inode).await.unwrap();
    let data = pattern(10 * KIB, 15);
    client.write(inode, 0, &data, false).await.unwrap();
    client.flush(inode).await.unwrap();

    let keys = cluster.meta_keys(inode);
    assert_eq!(keys.len(), 1);
    assert!(
        (1..=64).contains(&keys[0].extent_id),
        "small file must land in a tiny extent, got {}",
        keys[0].extent_id
    );

    client.evict_stream(inode).await.unwrap();
    client.open_stream(inode).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    client.read(inode, 0, &mut buf).await.unwrap();
    assert_eq!(buf, data);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn meta_failure_surfaces_after_bounded_retries() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let client = cluster.client(test_config()).await;

    let inode = 27;
    client.open_stream(inode).await.unwrap();
    client
        .write(inode, 0, &pattern(8 * KIB, 16), false)
        .await
        .unwrap();

    cluster.meta.fail_inserts.store(true, Ordering::Relaxed);
    let err = client.flush(inode).await.unwrap_err();
    assert!(matches!(err, StreamError::Other(_)), "got {err}");

    // Once the meta service recovers a later flush drains the key.
    cluster.meta.fail_inserts.store(false, Ordering::Relaxed);
    client.flush(inode).await.unwrap();
    assert_eq!(cluster.meta_keys(inode).len(), 1);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn double_open_keeps_stream_alive() {
    let cluster = MockCluster::start(1).await;
    cluster.add_partition(1, &[0]);
    let client = cluster.client(test_config()).await;

    let inode = 29;
    client.open_stream(inode).await.unwrap();
    client.open_stream(inode).await.unwrap();
    assert_eq!(client.open_streams(), 1);

    client.close_stream(inode).await.unwrap();
    assert_eq!(client.open_streams(), 1, "second reference still open");
    client.close_stream(inode).await.unwrap();
    client.close().await.unwrap();
}
