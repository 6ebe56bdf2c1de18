//! Extent handler: the state machine appending into one open extent.
//!
//! A handler accepts contiguous user bytes, packs them into write packets
//! of at most one block, and pipelines those packets over a single pooled
//! connection. A spawned collector task matches replies in FIFO order and
//! acknowledges bytes; any failed or mismatched reply flips the handler to
//! recovery, after which the streamer persists the acknowledged prefix and
//! replays the rest through a replacement handler.
//!
//! Status only moves forward: `Open -> Closed -> Recovery -> Error`. A
//! handler never reopens; recovery is by replacement.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::client::DataContext;
use crate::config::{MAX_SELECT_DATA_PARTITION_FOR_WRITE, STREAM_RETRY_INTERVAL};
use crate::error::{Result, StreamError};
use crate::extent_key::ExtentKey;
use crate::proto::{BLOCK_SIZE, ExtentType, Opcode, Packet, WireMode};

/// How the handler's bytes are stored server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Packed into a shared physical file; single-packet, offset assigned
    /// by the server.
    Tiny,
    /// A dedicated append-only extent created for this handler.
    Normal,
}

/// Handler lifecycle. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum HandlerStatus {
    /// Accepting appends.
    Open = 0,
    /// No further appends; in-flight packets may still drain.
    Closed = 1,
    /// A packet failed; acknowledged bytes are durable, the rest must be
    /// replayed elsewhere.
    Recovery = 2,
    /// Flush could not complete; surfaced to the streamer.
    Error = 3,
}

impl HandlerStatus {
    fn from_u8(v: u8) -> HandlerStatus {
        match v {
            0 => HandlerStatus::Open,
            1 => HandlerStatus::Closed,
            2 => HandlerStatus::Recovery,
            _ => HandlerStatus::Error,
        }
    }
}

/// Reply bookkeeping handed to the collector, one per packet on the wire.
struct Expected {
    request_id: i64,
    opcode: Opcode,
    len: usize,
    kernel_offset: u64,
    data: Bytes,
}

/// State shared between the handler and its reply collector.
struct Shared {
    status: AtomicU8,
    inflight: AtomicUsize,
    acked: AtomicU64,
    /// Extent id learned from the first reply (tiny mode).
    reply_extent_id: AtomicU64,
    /// Extent offset learned from the first reply (tiny mode), -1 until
    /// known.
    reply_extent_offset: AtomicI64,
    progress: Notify,
    /// Packets that were sent but never acknowledged, preserved for replay.
    unacked: parking_lot::Mutex<Vec<(u64, Bytes)>>,
}

impl Shared {
    fn new() -> Arc<Shared> {
        Arc::new(Shared {
            status: AtomicU8::new(HandlerStatus::Open as u8),
            inflight: AtomicUsize::new(0),
            acked: AtomicU64::new(0),
            reply_extent_id: AtomicU64::new(0),
            reply_extent_offset: AtomicI64::new(-1),
            progress: Notify::new(),
            unacked: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn status(&self) -> HandlerStatus {
        HandlerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Advance status, never retreating.
    fn advance(&self, to: HandlerStatus) {
        self.status.fetch_max(to as u8, Ordering::AcqRel);
        self.progress.notify_waiters();
    }
}

struct PacketBuf {
    data: BytesMut,
    kernel_offset: u64,
    extent_offset: u64,
}

/// The handler proper. Owned by its streamer; never shared.
pub struct ExtentHandler {
    ctx: Arc<DataContext>,
    inode: u64,
    store_mode: StoreMode,
    direct: bool,
    is_pre_extent: bool,

    dp_id: u64,
    extent_id: u64,
    host: String,
    fanout: u8,
    arg: Bytes,

    /// Kernel offset of the handler's first byte.
    file_offset: u64,
    /// Extent offset of the handler's first byte (normal mode).
    base_extent_offset: u64,
    /// Bytes accepted (buffered + sent).
    size: u64,
    /// Capacity left before the extent is full.
    capacity: u64,

    packet: Option<PacketBuf>,
    shared: Arc<Shared>,
    writer: Option<OwnedWriteHalf>,
    expect_tx: Option<mpsc::UnboundedSender<Expected>>,
    collector: Option<JoinHandle<()>>,

    /// Set once the handler holds bytes the meta service has not seen.
    pub dirty: bool,
}

impl std::fmt::Debug for ExtentHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentHandler")
            .field("inode", &self.inode)
            .field("mode", &self.store_mode)
            .field("dp", &self.dp_id)
            .field("extent", &self.extent_id)
            .field("file_offset", &self.file_offset)
            .field("size", &self.size)
            .field("status", &self.status())
            .finish()
    }
}

impl ExtentHandler {
    /// Open a handler over a freshly allocated normal extent at
    /// `file_offset`.
    pub async fn open_normal(
        ctx: Arc<DataContext>,
        inode: u64,
        file_offset: u64,
        direct: bool,
    ) -> Result<ExtentHandler> {
        let mut exclude: HashSet<String> = HashSet::new();
        let mut last_err = StreamError::NoWritablePartition;
        for _ in 0..MAX_SELECT_DATA_PARTITION_FOR_WRITE {
            let dp = ctx.wrapper.pick_write_partition(&mut exclude)?;
            let hosts = dp.hosts();
            let Some(host) = hosts.first().cloned() else {
                exclude.extend(hosts);
                continue;
            };
            match create_extent(&ctx, dp.id, inode, &host).await {
                Ok(extent_id) => {
                    let fanout = ctx.wrapper.write_fanout(hosts.len() as u8);
                    let arg = follower_arg(&hosts);
                    return Ok(ExtentHandler {
                        ctx: ctx.clone(),
                        inode,
                        store_mode: StoreMode::Normal,
                        direct,
                        is_pre_extent: false,
                        dp_id: dp.id,
                        extent_id,
                        host,
                        fanout,
                        arg,
                        file_offset,
                        base_extent_offset: 0,
                        size: 0,
                        capacity: ctx.config.extent_size,
                        packet: None,
                        shared: Shared::new(),
                        writer: None,
                        expect_tx: None,
                        collector: None,
                        dirty: false,
                    });
                }
                Err(e @ StreamError::NoSpace(_)) => {
                    debug!("partition {} out of space, excluding", dp.id);
                    exclude.extend(dp.hosts());
                    last_err = e;
                }
                Err(e) => {
                    dp.record_host_error(&host);
                    exclude.extend(dp.hosts());
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Open a handler that continues `pre`'s extent at its current end.
    pub async fn open_pre(
        ctx: Arc<DataContext>,
        inode: u64,
        pre: ExtentKey,
        direct: bool,
    ) -> Result<ExtentHandler> {
        let dp = ctx.wrapper.get_partition(pre.partition_id).await?;
        let hosts = dp.hosts();
        let host = hosts
            .first()
            .cloned()
            .ok_or(StreamError::PartitionNotExists(pre.partition_id))?;
        let fanout = ctx.wrapper.write_fanout(hosts.len() as u8);
        let arg = follower_arg(&hosts);
        let used = pre.extent_offset + pre.size as u64;
        Ok(ExtentHandler {
            ctx: ctx.clone(),
            inode,
            store_mode: StoreMode::Normal,
            direct,
            is_pre_extent: true,
            dp_id: pre.partition_id,
            extent_id: pre.extent_id,
            host,
            fanout,
            arg,
            file_offset: pre.end(),
            base_extent_offset: used,
            size: 0,
            capacity: ctx.config.extent_size.saturating_sub(used),
            packet: None,
            shared: Shared::new(),
            writer: None,
            expect_tx: None,
            collector: None,
            dirty: false,
        })
    }

    /// Open a tiny-mode handler for a small file starting at offset zero.
    /// The server picks the extent and the offset; both come back on the
    /// first reply.
    pub fn open_tiny(ctx: Arc<DataContext>, inode: u64, direct: bool) -> Result<ExtentHandler> {
        let mut exclude = HashSet::new();
        let dp = ctx.wrapper.pick_write_partition(&mut exclude)?;
        let hosts = dp.hosts();
        let host = hosts
            .first()
            .cloned()
            .ok_or(StreamError::PartitionNotExists(dp.id))?;
        let fanout = ctx.wrapper.write_fanout(hosts.len() as u8);
        let arg = follower_arg(&hosts);
        let capacity = ctx.config.tiny_size_limit;
        Ok(ExtentHandler {
            ctx,
            inode,
            store_mode: StoreMode::Tiny,
            direct,
            is_pre_extent: false,
            dp_id: dp.id,
            extent_id: 0,
            host,
            fanout,
            arg,
            file_offset: 0,
            base_extent_offset: 0,
            size: 0,
            capacity,
            packet: None,
            shared: Shared::new(),
            writer: None,
            expect_tx: None,
            collector: None,
            dirty: false,
        })
    }

    /// Current status.
    pub fn status(&self) -> HandlerStatus {
        self.shared.status()
    }

    /// Whether appends are still accepted.
    pub fn is_open(&self) -> bool {
        self.status() == HandlerStatus::Open
    }

    /// Packets sent and not yet acknowledged.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    /// Store mode of this handler.
    pub fn store_mode(&self) -> StoreMode {
        self.store_mode
    }

    /// Kernel offset one past the last accepted byte.
    pub fn end_offset(&self) -> u64 {
        self.file_offset + self.size
    }

    /// Bytes accepted so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Partition this handler writes to.
    pub fn partition_id(&self) -> u64 {
        self.dp_id
    }

    /// The key as currently known. Before the first tiny reply the extent
    /// id is still zero, making the key temporary by definition.
    pub fn key(&self) -> Option<ExtentKey> {
        if self.size == 0 {
            return None;
        }
        let (extent_id, extent_offset) = match self.store_mode {
            StoreMode::Normal => (self.extent_id, self.base_extent_offset),
            StoreMode::Tiny => {
                let off = self.shared.reply_extent_offset.load(Ordering::Acquire);
                (
                    self.shared.reply_extent_id.load(Ordering::Acquire),
                    off.max(0) as u64,
                )
            }
        };
        Some(ExtentKey {
            file_offset: self.file_offset,
            partition_id: if extent_id == 0 { 0 } else { self.dp_id },
            extent_id,
            extent_offset,
            size: self.size as u32,
            crc: 0,
        })
    }

    /// Append contiguous bytes at `kernel_offset`. Returns how many were
    /// accepted; zero means the handler cannot take this write (closed,
    /// full, or non-contiguous) and the caller must open a replacement.
    pub async fn write(&mut self, kernel_offset: u64, data: &[u8]) -> Result<usize> {
        if !self.is_open() || kernel_offset != self.end_offset() {
            return Ok(0);
        }
        let room = (self.capacity - self.size).min(data.len() as u64) as usize;
        let mut written = 0;
        while written < room {
            let packet_cap = match self.store_mode {
                StoreMode::Normal => BLOCK_SIZE,
                StoreMode::Tiny => self.capacity as usize,
            };
            if self
                .packet
                .as_ref()
                .is_some_and(|p| p.data.len() >= packet_cap)
            {
                self.flush_packet().await?;
            }
            if self.packet.is_none() {
                let extent_offset = match self.store_mode {
                    StoreMode::Normal => self.base_extent_offset + self.size,
                    StoreMode::Tiny => 0,
                };
                self.packet = Some(PacketBuf {
                    data: BytesMut::with_capacity(packet_cap.min(room)),
                    kernel_offset: self.file_offset + self.size,
                    extent_offset,
                });
            }
            let mut filled = false;
            if let Some(packet) = self.packet.as_mut() {
                let take = (packet_cap - packet.data.len()).min(room - written);
                packet.data.extend_from_slice(&data[written..written + take]);
                written += take;
                self.size += take as u64;
                self.dirty = true;
                filled = packet.data.len() == packet_cap;
            }
            if filled {
                self.flush_packet().await?;
            }
        }
        Ok(written)
    }

    /// Push the current packet onto the wire without waiting for its reply.
    pub async fn flush_packet(&mut self) -> Result<()> {
        let Some(buf) = self.packet.take() else {
            return Ok(());
        };
        if buf.data.is_empty() {
            return Ok(());
        }
        self.ensure_conn().await?;

        let data = buf.data.freeze();
        let mut packet = Packet::new_write(
            &self.ctx.codec,
            self.dp_id,
            self.extent_id,
            buf.extent_offset as i64,
            buf.kernel_offset,
            data.clone(),
            self.direct,
            self.fanout,
        );
        if self.store_mode == StoreMode::Tiny {
            packet.extent_type = ExtentType::Tiny;
        }
        packet.arg = self.arg.clone();

        let mode = self.ctx.codec.mode();
        let timeout = self.ctx.wrapper.write_timeout();
        let writer = self.writer.as_mut().ok_or_else(|| {
            StreamError::Other("connection lost before packet send".into())
        })?;
        self.shared.inflight.fetch_add(1, Ordering::AcqRel);
        match packet.write_to(mode, writer, timeout).await {
            Ok(()) => {
                if let Some(tx) = &self.expect_tx {
                    let _ = tx.send(Expected {
                        request_id: packet.request_id,
                        opcode: packet.opcode,
                        len: data.len(),
                        kernel_offset: buf.kernel_offset,
                        data,
                    });
                }
                // A tiny packet's placement is chosen by the server, so a
                // second packet would not be contiguous with the first.
                // One packet per tiny handler.
                if self.store_mode == StoreMode::Tiny {
                    self.shared.advance(HandlerStatus::Closed);
                }
                Ok(())
            }
            Err(e) => {
                self.shared.inflight.fetch_sub(1, Ordering::AcqRel);
                self.shared
                    .unacked
                    .lock()
                    .push((buf.kernel_offset, data));
                self.shared.advance(HandlerStatus::Recovery);
                Err(e)
            }
        }
    }

    async fn ensure_conn(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let stream = self.ctx.pool.get(&self.host).await?;
        let (reader, writer) = stream.into_split();
        self.writer = Some(writer);

        let (tx, rx) = mpsc::unbounded_channel();
        self.expect_tx = Some(tx);
        let shared = self.shared.clone();
        let mode = self.ctx.codec.mode();
        let timeout = self.ctx.wrapper.read_timeout();
        let tiny = self.store_mode == StoreMode::Tiny;
        self.collector = Some(tokio::spawn(collect_replies(
            mode, reader, rx, shared, timeout, tiny,
        )));
        Ok(())
    }

    /// Wait for every in-flight packet to be acknowledged, then persist
    /// the formed key to the meta service and return it. When packets were
    /// lost to recovery, the acknowledged prefix is persisted (when any)
    /// and an error surfaces so the streamer replays the rest. Bytes that
    /// are durable on the data node but not yet persisted (a failed meta
    /// call) keep the handler dirty; a later flush retries just the
    /// persist.
    pub async fn flush(&mut self) -> Result<Option<ExtentKey>> {
        let send_err = self.flush_packet().await.err();
        self.wait_drain().await;

        let acked = self.shared.acked.load(Ordering::Acquire);
        let lost = self.size - acked;
        if lost > 0 || send_err.is_some() {
            if let Some(key) = self.acked_key() {
                self.persist_key(key).await?;
            }
            return Err(send_err.unwrap_or_else(|| {
                StreamError::Other(format!(
                    "handler for inode {} entered recovery with {lost} bytes unacknowledged",
                    self.inode
                ))
            }));
        }

        let key = self.key();
        if let Some(key) = key {
            self.persist_key(key).await?;
        }
        self.dirty = false;
        Ok(self.key())
    }

    /// The key clipped to the acknowledged byte count, or `None` when
    /// nothing usable was acknowledged.
    pub fn acked_key(&self) -> Option<ExtentKey> {
        let acked = self.shared.acked.load(Ordering::Acquire);
        if acked == 0 {
            return None;
        }
        let mut key = self.key()?;
        if key.is_temporary() {
            return None;
        }
        key.size = acked as u32;
        Some(key)
    }

    async fn wait_drain(&self) {
        loop {
            if self.status() >= HandlerStatus::Recovery || self.inflight() == 0 {
                return;
            }
            let notified = self.shared.progress.notified();
            if self.status() >= HandlerStatus::Recovery || self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn persist_key(&self, key: ExtentKey) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .ctx
                .meta
                .insert_extent_key(self.inode, key, self.is_pre_extent)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < 3 => {
                    warn!(
                        "extent key persist failed for inode {} (attempt {attempt}): {e}",
                        self.inode
                    );
                    tokio::time::sleep(STREAM_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    self.shared.advance(HandlerStatus::Error);
                    return Err(e);
                }
            }
        }
    }

    /// Refuse further appends. In-flight packets keep draining.
    pub fn set_closed(&self) {
        self.shared.advance(HandlerStatus::Closed);
    }

    /// Close and flush in one step.
    pub async fn close(&mut self) -> Result<Option<ExtentKey>> {
        self.set_closed();
        let res = self.flush().await;
        self.teardown();
        res
    }

    /// Abort without flushing; unacknowledged data is dropped.
    pub fn abort(&mut self) {
        self.shared.advance(HandlerStatus::Error);
        self.teardown();
    }

    fn teardown(&mut self) {
        self.expect_tx = None;
        if let Some(c) = self.collector.take() {
            c.abort();
        }
        // The write half drops here; the pooled connection is not returned
        // because it was split for streaming.
        self.writer = None;
    }

    /// Sent-but-unacknowledged payloads, for replay after recovery.
    pub fn take_unacked(&mut self) -> Vec<(u64, Bytes)> {
        let mut out: Vec<(u64, Bytes)> = self.shared.unacked.lock().drain(..).collect();
        if let Some(buf) = self.packet.take() {
            out.push((buf.kernel_offset, buf.data.freeze()));
        }
        out.sort_by_key(|(off, _)| *off);
        out
    }
}

impl Drop for ExtentHandler {
    fn drop(&mut self) {
        if let Some(c) = self.collector.take() {
            c.abort();
        }
    }
}

/// Reply collector: matches replies FIFO against the expected queue.
async fn collect_replies(
    mode: WireMode,
    mut reader: OwnedReadHalf,
    mut rx: mpsc::UnboundedReceiver<Expected>,
    shared: Arc<Shared>,
    timeout: Duration,
    tiny: bool,
) {
    while let Some(exp) = rx.recv().await {
        let fail = |exp: Expected, shared: &Shared| {
            shared.unacked.lock().push((exp.kernel_offset, exp.data));
            shared.advance(HandlerStatus::Recovery);
        };
        match Packet::read_from(mode, &mut reader, timeout).await {
            Ok(reply) => {
                if reply.request_id != exp.request_id || reply.opcode != exp.opcode {
                    warn!(
                        "reply mismatch: got ({}, {:?}), want ({}, {:?})",
                        reply.request_id, reply.opcode, exp.request_id, exp.opcode
                    );
                    fail(exp, &shared);
                    break;
                }
                if let Err(e) = reply.reply_status() {
                    warn!("write packet {} rejected: {e}", exp.request_id);
                    fail(exp, &shared);
                    break;
                }
                if tiny {
                    shared
                        .reply_extent_id
                        .store(reply.extent_id, Ordering::Release);
                    if shared.reply_extent_offset.load(Ordering::Acquire) < 0 {
                        shared
                            .reply_extent_offset
                            .store(reply.extent_offset, Ordering::Release);
                    }
                }
                shared.acked.fetch_add(exp.len as u64, Ordering::AcqRel);
                shared.inflight.fetch_sub(1, Ordering::AcqRel);
                shared.progress.notify_waiters();
            }
            Err(e) => {
                debug!("reply read failed: {e}");
                fail(exp, &shared);
                break;
            }
        }
    }
    // Preserve anything still queued for replay.
    while let Ok(exp) = rx.try_recv() {
        shared.unacked.lock().push((exp.kernel_offset, exp.data));
    }
    shared.progress.notify_waiters();
}

/// Allocate a new extent on `dp_id` via `host`.
async fn create_extent(ctx: &DataContext, dp_id: u64, inode: u64, host: &str) -> Result<u64> {
    let mut conn = ctx.pool.get(host).await?;
    let req = Packet::new_create_extent(&ctx.codec, dp_id, inode);
    let mode = ctx.codec.mode();
    let result: Result<u64> = async {
        req.write_to(mode, &mut conn, ctx.wrapper.write_timeout())
            .await?;
        let reply = Packet::read_from(mode, &mut conn, ctx.wrapper.read_timeout()).await?;
        if !req.is_reply_to(&reply) {
            return Err(StreamError::BadMessage(format!(
                "create-extent reply mismatch for request {}",
                req.request_id
            )));
        }
        reply.reply_status()?;
        if reply.extent_id == 0 {
            return Err(StreamError::BadMessage(
                "create-extent reply carries no extent id".into(),
            ));
        }
        Ok(reply.extent_id)
    }
    .await;
    ctx.pool.put(host, conn, result.is_err());
    result
}

/// Best-effort deletion of a replaced extent.
pub async fn mark_delete(ctx: &DataContext, key: &ExtentKey) -> Result<()> {
    let dp = ctx.wrapper.get_partition(key.partition_id).await?;
    let host = dp
        .preferred_write_host()
        .ok_or(StreamError::PartitionNotExists(key.partition_id))?;
    let mut conn = ctx.pool.get(&host).await?;
    let req = Packet::new_mark_delete(
        &ctx.codec,
        key.partition_id,
        key.extent_id,
        key.extent_offset as i64,
        key.size,
    );
    let mode = ctx.codec.mode();
    let result: Result<()> = async {
        req.write_to(mode, &mut conn, ctx.wrapper.write_timeout())
            .await?;
        let reply = Packet::read_from(mode, &mut conn, ctx.wrapper.read_timeout()).await?;
        reply.reply_status()
    }
    .await;
    ctx.pool.put(&host, conn, result.is_err());
    result
}

fn follower_arg(hosts: &[String]) -> Bytes {
    if hosts.len() <= 1 {
        return Bytes::new();
    }
    Bytes::from(hosts[1..].join("/").into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_monotonic() {
        let shared = Shared::new();
        shared.advance(HandlerStatus::Closed);
        assert_eq!(shared.status(), HandlerStatus::Closed);
        shared.advance(HandlerStatus::Recovery);
        assert_eq!(shared.status(), HandlerStatus::Recovery);
        // No going back.
        shared.advance(HandlerStatus::Open);
        assert_eq!(shared.status(), HandlerStatus::Recovery);
        shared.advance(HandlerStatus::Error);
        assert_eq!(shared.status(), HandlerStatus::Error);
    }

    #[test]
    fn follower_arg_format() {
        let hosts: Vec<String> = ["a:1", "b:1", "c:1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(&follower_arg(&hosts)[..], b"b:1/c:1");
        assert!(follower_arg(&hosts[..1]).is_empty());
    }
}
