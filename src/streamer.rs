//! Per-inode streamer: the single writer loop for an open file.
//!
//! Every mutating operation on an inode (open, write, flush, truncate,
//! release, evict) is enqueued as a typed request and consumed serially by
//! one loop task, which is how per-inode ordering is enforced without a
//! coarse lock around the cache and the handler. Reads bypass the queue:
//! they only take the cache's shared lock and never touch handler state.
//!
//! Before the loop is started, open/release/evict execute inline under the
//! streamer-map lock so short-lived opens never pay for a task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use bytes::Bytes;
use log::{debug, error, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::DataContext;
use crate::config::{
    STREAM_RETRY_INTERVAL, STREAM_SEND_READ_MAX_RETRY, STREAM_SEND_TIMEOUT, STREAMER_TICK,
};
use crate::error::{Result, StreamError};
use crate::extent_cache::{ExtentCache, ExtentRequest};
use crate::extent_key::ExtentKey;
use crate::handler::{self, ExtentHandler, HandlerStatus};
use crate::pending::{OverwriteBuffer, PendingPackets};
use crate::proto::{MAX_OVERWRITE_PACKET_SIZE, Opcode, Packet};
use crate::wrapper::ReadRoute;

/// Map of live streamers, shared with the client facade.
pub(crate) type StreamerMap = Arc<Mutex<HashMap<u64, Arc<StreamerHandle>>>>;

/// Requests the loop consumes.
pub(crate) enum StreamRequest {
    Open {
        reply: oneshot::Sender<Result<()>>,
    },
    Write {
        offset: u64,
        data: Bytes,
        direct: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
    Flush {
        flush_pending: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Truncate {
        size: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        reply: oneshot::Sender<Result<()>>,
    },
    Evict {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl StreamRequest {
    fn reply_eagain(self) {
        match self {
            StreamRequest::Open { reply } => drop(reply.send(Err(StreamError::Eagain))),
            StreamRequest::Write { reply, .. } => drop(reply.send(Err(StreamError::Eagain))),
            StreamRequest::Flush { reply, .. } => drop(reply.send(Err(StreamError::Eagain))),
            StreamRequest::Truncate { reply, .. } => drop(reply.send(Err(StreamError::Eagain))),
            StreamRequest::Release { reply } => drop(reply.send(Err(StreamError::Eagain))),
            StreamRequest::Evict { reply } => drop(reply.send(Err(StreamError::Eagain))),
        }
    }
}

/// The externally visible part of a streamer: the queue, the cache and the
/// reference count. Lives in the client's streamer map.
pub(crate) struct StreamerHandle {
    pub inode: u64,
    pub tx: mpsc::Sender<StreamRequest>,
    pub refcnt: AtomicI64,
    pub cache: Arc<ExtentCache>,
    pub done: CancellationToken,
    /// True once the loop task is running; until then open/release/evict
    /// run inline.
    pub started: AtomicBool,
    /// Serializes the enqueue step of writes, which snapshots cache state
    /// to decide between local buffering and the queue.
    pub write_lock: tokio::sync::Mutex<()>,
    /// Receiver stashed until the loop starts.
    pub(crate) pending_rx: Mutex<Option<mpsc::Receiver<StreamRequest>>>,
}

impl StreamerHandle {
    pub fn new(inode: u64, queue_depth: usize) -> Arc<StreamerHandle> {
        let (tx, rx) = mpsc::channel(queue_depth);
        Arc::new(StreamerHandle {
            inode,
            tx,
            refcnt: AtomicI64::new(0),
            cache: Arc::new(ExtentCache::new(inode)),
            done: CancellationToken::new(),
            started: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
            pending_rx: Mutex::new(Some(rx)),
        })
    }

    fn queue_is_empty(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }
}

/// Streamer health. `Error` forces writes to fail until the dirty list
/// drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamerStatus {
    Normal,
    Error,
}

/// Loop-owned streamer state.
pub(crate) struct Streamer {
    ctx: Arc<DataContext>,
    inode: u64,
    cache: Arc<ExtentCache>,
    handle: Arc<StreamerHandle>,
    streamers: StreamerMap,

    handler: Option<ExtentHandler>,
    dirty: SmallVec<[ExtentHandler; 2]>,
    pending: PendingPackets,
    overwrites: OverwriteBuffer,

    status: StreamerStatus,
    flush_failures: u32,
    idle_ticks: usize,
}

impl Streamer {
    pub fn new(ctx: Arc<DataContext>, handle: Arc<StreamerHandle>, streamers: StreamerMap) -> Self {
        Streamer {
            inode: handle.inode,
            cache: handle.cache.clone(),
            ctx,
            handle,
            streamers,
            handler: None,
            dirty: SmallVec::new(),
            pending: PendingPackets::new(),
            overwrites: OverwriteBuffer::new(),
            status: StreamerStatus::Normal,
            flush_failures: 0,
            idle_ticks: 0,
        }
    }

    /// The request loop. Runs until eviction or cancellation.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StreamRequest>) {
        let mut tick = tokio::time::interval(STREAMER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.handle.done.cancelled() => {
                    self.abort_all();
                    rx.close();
                    while let Ok(req) = rx.try_recv() {
                        req.reply_eagain();
                    }
                    self.remove_from_map();
                    return;
                }
                req = rx.recv() => {
                    match req {
                        Some(req) => self.dispatch(req).await,
                        None => {
                            self.remove_from_map();
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    if self.housekeeping().await {
                        self.remove_from_map();
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, req: StreamRequest) {
        self.idle_ticks = 0;
        match req {
            StreamRequest::Open { reply } => {
                self.handle.refcnt.fetch_add(1, Ordering::AcqRel);
                let _ = reply.send(Ok(()));
            }
            StreamRequest::Write {
                offset,
                data,
                direct,
                reply,
            } => {
                let res = self.write(offset, data, direct).await;
                let _ = reply.send(res);
            }
            StreamRequest::Flush {
                flush_pending,
                reply,
            } => {
                let res = self.flush(flush_pending).await;
                let _ = reply.send(res);
            }
            StreamRequest::Truncate { size, reply } => {
                let res = self.truncate(size).await;
                let _ = reply.send(res);
            }
            StreamRequest::Release { reply } => {
                let res = self.flush(true).await;
                self.handle.refcnt.fetch_sub(1, Ordering::AcqRel);
                let _ = reply.send(res);
            }
            StreamRequest::Evict { reply } => {
                let res = self.flush(true).await;
                self.remove_from_map();
                self.handle.done.cancel();
                let _ = reply.send(res);
            }
        }
    }

    /// Tick housekeeping. Returns true when the streamer evicted itself.
    async fn housekeeping(&mut self) -> bool {
        // Handlers with unpersisted bytes do not age well; settle them each
        // tick. Buffered packets only go out when auto-flush is on.
        let dirty_handlers =
            !self.dirty.is_empty() || self.handler.as_ref().is_some_and(|h| h.dirty);
        let flush_pending = self.ctx.config.auto_flush && !self.pending.is_empty();
        if dirty_handlers || flush_pending {
            if let Err(e) = self.flush(flush_pending).await {
                warn!("periodic flush for inode {} failed: {e}", self.inode);
            }
        }

        self.sweep_removed_partitions().await;

        if self.handle.refcnt.load(Ordering::Acquire) <= 0 && self.handle.queue_is_empty() {
            self.idle_ticks += 1;
            if self.idle_ticks >= self.ctx.config.idle_ticks {
                if let Err(e) = self.flush(true).await {
                    warn!("final flush for inode {} failed: {e}", self.inode);
                }
                debug!("evicting idle streamer for inode {}", self.inode);
                self.handle.done.cancel();
                return true;
            }
        } else {
            self.idle_ticks = 0;
        }
        false
    }

    /// Buffered overwrites whose partition the master dropped cannot go
    /// in place anymore; reallocate them.
    async fn sweep_removed_partitions(&mut self) {
        let targets = self.overwrites.partitions();
        for dp_id in targets {
            if !self.ctx.wrapper.is_partition_removed(dp_id) {
                continue;
            }
            warn!(
                "partition {dp_id} removed with buffered overwrites, rerouting inode {}",
                self.inode
            );
            for entry in self.overwrites.remove_partition(dp_id) {
                let req = ExtentRequest {
                    file_offset: entry.file_offset,
                    size: entry.data.len(),
                    key: Some(entry.key),
                    data: Bytes::from(entry.data),
                };
                if let Err(e) = self.do_row(&req, false).await {
                    error!(
                        "rerouting buffered overwrite at {} failed: {e}",
                        entry.file_offset
                    );
                    self.status = StreamerStatus::Error;
                }
            }
        }
    }

    fn remove_from_map(&self) {
        let mut map = self.streamers.lock();
        let ours = map
            .get(&self.inode)
            .is_some_and(|current| Arc::ptr_eq(current, &self.handle));
        if ours {
            map.remove(&self.inode);
        }
    }

    fn abort_all(&mut self) {
        if let Some(mut h) = self.handler.take() {
            h.abort();
        }
        for mut h in self.dirty.drain(..) {
            h.abort();
        }
    }

    // --- write path -----------------------------------------------------

    async fn write(&mut self, offset: u64, data: Bytes, direct: bool) -> Result<usize> {
        if self.status == StreamerStatus::Error && !self.dirty.is_empty() {
            return Err(StreamError::StreamBroken);
        }

        let (mut requests, _) = self.cache.prepare_requests(offset, data.len(), Some(&data));

        // Anything we cannot satisfy from the local pending buffer needs
        // disk; in buffered mode the buffer must land first to keep
        // ordering.
        if self.ctx.config.write_cache {
            let all_local = requests.iter().all(|r| match &r.key {
                Some(k) if k.is_temporary() => self.pending.covers(r.file_offset, r.size),
                Some(_) => false,
                None => true,
            });
            if !all_local && (!self.pending.is_empty() || self.handler.is_some()) {
                self.flush(true).await?;
                (requests, _) = self.cache.prepare_requests(offset, data.len(), Some(&data));
            }
        }

        let mut total = 0;
        for req in requests {
            let n = match &req.key {
                None => self.write_hole(&req, direct).await?,
                Some(k) if k.is_temporary() => {
                    if self.pending.try_overwrite(req.file_offset, &req.data) {
                        req.size
                    } else {
                        // The append owning this range is still in flight;
                        // settle it, then take the overwrite path.
                        self.flush(true).await?;
                        self.write_durable(&req, direct).await?
                    }
                }
                Some(_) => self.write_durable(&req, direct).await?,
            };
            total += n;
        }
        Ok(total)
    }

    /// A hole: append through a handler, or buffer locally in cached mode.
    async fn write_hole(&mut self, req: &ExtentRequest, direct: bool) -> Result<usize> {
        if self.ctx.config.write_cache && !direct {
            self.pending.insert(req.file_offset, &req.data);
            // Readers planning against the cache must not see a hole here.
            self.cache.insert(
                ExtentKey {
                    file_offset: req.file_offset,
                    partition_id: 0,
                    extent_id: 0,
                    extent_offset: 0,
                    size: req.size as u32,
                    crc: 0,
                },
                false,
            );
            return Ok(req.size);
        }
        self.do_write(req.file_offset, req.data.clone(), direct).await
    }

    /// Overwrite of a durable key, in place when allowed, otherwise by
    /// reallocation.
    async fn write_durable(&mut self, req: &ExtentRequest, direct: bool) -> Result<usize> {
        // Never overwrite a range the open handler is still appending to;
        // the overwrite travels on another connection and could land first.
        let overlaps_handler = self.handler.as_ref().is_some_and(|h| {
            let start = h.end_offset() - h.size();
            req.file_offset < h.end_offset() && start < req.file_offset + req.size as u64
        });
        if overlaps_handler {
            self.retire_current().await?;
        }
        if self.ctx.wrapper.overwrite_allowed() {
            if self.ctx.config.write_cache && !direct {
                if let Some(key) = req.key {
                    self.overwrites.push(key, req.file_offset, &req.data);
                    return Ok(req.size);
                }
            }
            match self.do_overwrite(req, direct).await {
                Ok(n) => return Ok(n),
                Err(StreamError::NotExist) => return Err(StreamError::NotExist),
                Err(e) => {
                    debug!(
                        "in-place overwrite at {} failed ({e}), reallocating",
                        req.file_offset
                    );
                }
            }
        }
        self.do_row(req, direct).await
    }

    /// Append `data` at `offset` through the current handler, opening and
    /// recycling handlers as extents fill or fail.
    async fn do_write(&mut self, offset: u64, data: Bytes, direct: bool) -> Result<usize> {
        let mut written = 0usize;
        let mut stalls = 0u32;
        while written < data.len() {
            let off = offset + written as u64;
            let usable = self
                .handler
                .as_ref()
                .is_some_and(|h| h.is_open() && h.end_offset() == off);
            if !usable {
                self.retire_current().await?;
                let h = self.open_handler(off, data.len() - written, direct).await?;
                self.handler = Some(h);
                stalls = 0;
            }
            let handler = match self.handler.as_mut() {
                Some(h) => h,
                None => return Err(StreamError::Other("no handler after open".into())),
            };
            let n = handler.write(off, &data[written..]).await?;
            if n == 0 {
                stalls += 1;
                if stalls > 2 {
                    return Err(StreamError::Other(format!(
                        "append at {off} made no progress"
                    )));
                }
                self.retire_current().await?;
                continue;
            }
            written += n;
            stalls = 0;
            if let Some(key) = self.handler.as_ref().and_then(ExtentHandler::key) {
                self.cache.insert(key, false);
            }
        }
        Ok(written)
    }

    async fn open_handler(
        &mut self,
        offset: u64,
        len_hint: usize,
        direct: bool,
    ) -> Result<ExtentHandler> {
        let tiny_fit = offset == 0
            && len_hint as u64 <= self.ctx.config.tiny_size_limit
            && self.cache.key_count() == 0
            && self.cache.size() == 0;
        if tiny_fit {
            return ExtentHandler::open_tiny(self.ctx.clone(), self.inode, direct);
        }
        if let Some(pre) = self.cache.pre(offset) {
            let continuable = !pre.is_temporary()
                && !crate::proto::is_tiny_extent(pre.extent_id)
                && pre.extent_offset + (pre.size as u64) < self.ctx.config.extent_size
                && self.ctx.wrapper.get_partition(pre.partition_id).await.is_ok();
            if continuable {
                return ExtentHandler::open_pre(self.ctx.clone(), self.inode, pre, direct).await;
            }
        }
        ExtentHandler::open_normal(self.ctx.clone(), self.inode, offset, direct).await
    }

    /// Close the current handler, persist what it wrote, and replay any
    /// bytes lost to recovery through fresh handlers.
    async fn retire_current(&mut self) -> Result<()> {
        let Some(mut h) = self.handler.take() else {
            return Ok(());
        };
        match h.close().await {
            Ok(Some(key)) => {
                self.cache.insert(key, true);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                let unacked = h.take_unacked();
                // The acknowledged prefix was persisted inside close();
                // reflect it locally before replaying the rest.
                if let Some(key) = h.acked_key() {
                    self.cache.insert(key, true);
                }
                if unacked.is_empty() {
                    // Data durable but invisible: keep the handler around so
                    // a later flush retries the meta persist.
                    self.dirty.push(h);
                    return Err(e);
                }
                warn!(
                    "replaying {} unacknowledged chunks for inode {} after {e}",
                    unacked.len(),
                    self.inode
                );
                self.replay(unacked).await
            }
        }
    }

    /// Replay recovered chunks through fresh handlers. A failure here is
    /// final; there is no recovery-of-recovery.
    async fn replay(&mut self, chunks: Vec<(u64, Bytes)>) -> Result<()> {
        for (off, data) in chunks {
            let mut h = ExtentHandler::open_normal(self.ctx.clone(), self.inode, off, true).await?;
            let n = h.write(off, &data).await?;
            if n < data.len() {
                h.abort();
                return Err(StreamError::Other(format!(
                    "replayed chunk at {off} truncated to {n} bytes"
                )));
            }
            match h.close().await {
                Ok(Some(key)) => self.cache.insert(key, true),
                Ok(None) => {}
                Err(e) => {
                    h.abort();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// In-place overwrite against the key's partition, in packet-sized
    /// chunks on one connection.
    async fn do_overwrite(&mut self, req: &ExtentRequest, direct: bool) -> Result<usize> {
        let key = match req.key {
            Some(k) if !k.is_temporary() => k,
            _ => return Err(StreamError::Other("overwrite needs a durable key".into())),
        };
        let deadline = Instant::now() + STREAM_SEND_TIMEOUT;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.overwrite_once(key, req, direct).await {
                Ok(n) => return Ok(n),
                Err(e @ StreamError::NotExist) => return Err(e),
                Err(e) if attempt >= 3 || Instant::now() >= deadline => return Err(e),
                Err(StreamError::PartitionNotExists(id)) => {
                    self.ctx.wrapper.invalidate_partition(id);
                    tokio::time::sleep(STREAM_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    debug!("overwrite attempt {attempt} failed: {e}");
                    tokio::time::sleep(STREAM_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// One overwrite attempt: the advisory leader first, then the other
    /// replicas when it redirects us. The replica that accepts becomes the
    /// new advisory leader.
    async fn overwrite_once(
        &self,
        key: ExtentKey,
        req: &ExtentRequest,
        direct: bool,
    ) -> Result<usize> {
        let ctx = &self.ctx;
        let dp = ctx.wrapper.get_partition(key.partition_id).await?;
        let leader = dp.leader();
        let mut hosts = vec![leader.clone()];
        for h in dp.sorted_hosts(crate::partition::DEFAULT_HOST_ERR_TIMEOUT, |h| {
            ctx.wrapper.host_is_up(h)
        }) {
            if !hosts.contains(&h) {
                hosts.push(h);
            }
        }

        let mut last_err = StreamError::TryOtherAddr(String::new());
        for host in hosts {
            match self.overwrite_on_host(&dp, &host, key, req, direct).await {
                Ok(n) => {
                    if host != leader {
                        dp.set_leader(&host);
                    }
                    return Ok(n);
                }
                Err(StreamError::TryOtherAddr(msg)) => {
                    debug!("host {host} redirected overwrite: {msg}");
                    dp.record_host_error(&host);
                    last_err = StreamError::TryOtherAddr(msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn overwrite_on_host(
        &self,
        dp: &Arc<crate::partition::DataPartition>,
        host: &str,
        key: ExtentKey,
        req: &ExtentRequest,
        direct: bool,
    ) -> Result<usize> {
        let ctx = &self.ctx;
        let mut conn = ctx.pool.get(host).await?;
        let started = Instant::now();

        let result: Result<usize> = async {
            let mut sent = 0usize;
            while sent < req.size {
                let chunk = req
                    .data
                    .slice(sent..req.size.min(sent + MAX_OVERWRITE_PACKET_SIZE));
                let file_offset = req.file_offset + sent as u64;
                let packet = Packet::new_overwrite(
                    &ctx.codec,
                    key.partition_id,
                    key.extent_id,
                    key.extent_offset_at(file_offset) as i64,
                    file_offset,
                    chunk,
                    direct,
                );
                packet
                    .write_to(ctx.codec.mode(), &mut conn, ctx.wrapper.write_timeout())
                    .await?;
                let reply =
                    Packet::read_from(ctx.codec.mode(), &mut conn, ctx.wrapper.read_timeout())
                        .await?;
                if !packet.is_reply_to(&reply) {
                    return Err(StreamError::BadMessage(format!(
                        "overwrite reply mismatch for request {}",
                        packet.request_id
                    )));
                }
                reply.reply_status()?;
                sent += packet.data.len();
            }
            Ok(sent)
        }
        .await;

        match &result {
            Ok(_) => dp.record_write(started.elapsed()),
            Err(e) => {
                if e.is_reroute() || e.is_retryable() {
                    dp.record_host_error(host);
                }
            }
        }
        ctx.pool.put(host, conn, result.is_err());
        result
    }

    /// Reallocate: write the sub-request into a brand-new extent, persist
    /// the key, swap it into the cache and drop the old extent.
    async fn do_row(&mut self, req: &ExtentRequest, direct: bool) -> Result<usize> {
        // The new key overlaps whatever the current handler is appending;
        // settle it first.
        self.retire_current().await?;

        let deadline = Instant::now() + STREAM_SEND_TIMEOUT;
        loop {
            match self.row_once(req, direct).await {
                Ok(n) => return Ok(n),
                Err(e @ StreamError::NotExist) => return Err(e),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(e) => {
                    debug!("reallocation at {} failed: {e}", req.file_offset);
                    tokio::time::sleep(STREAM_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn row_once(&mut self, req: &ExtentRequest, direct: bool) -> Result<usize> {
        let mut h =
            ExtentHandler::open_normal(self.ctx.clone(), self.inode, req.file_offset, direct)
                .await?;
        let n = h.write(req.file_offset, &req.data).await?;
        if n < req.size {
            h.abort();
            return Err(StreamError::Other(
                "reallocated extent too small for overwrite".into(),
            ));
        }
        let key = match h.close().await? {
            Some(k) => k,
            None => return Err(StreamError::Other("reallocation produced no key".into())),
        };
        self.cache.insert(key, true);

        if let Some(old) = req.key {
            if !old.is_temporary() {
                if let Err(e) = handler::mark_delete(&self.ctx, &old).await {
                    debug!(
                        "mark-delete of replaced extent {}/{} failed: {e}",
                        old.partition_id, old.extent_id
                    );
                }
            }
        }
        Ok(n)
    }

    // --- flush / truncate ----------------------------------------------

    /// Drain the dirty list in order, settle the current handler, then the
    /// overwrite queue. With `flush_pending`, buffered packets are written
    /// through first.
    async fn flush(&mut self, flush_pending: bool) -> Result<()> {
        let res = self.flush_inner(flush_pending).await;
        match &res {
            Ok(()) => {
                self.flush_failures = 0;
                if self.dirty.is_empty() {
                    self.status = StreamerStatus::Normal;
                }
            }
            Err(e) => {
                self.flush_failures += 1;
                warn!(
                    "flush for inode {} failed ({} consecutive): {e}",
                    self.inode, self.flush_failures
                );
                if self.flush_failures >= 3 {
                    self.status = StreamerStatus::Error;
                }
            }
        }
        res
    }

    async fn flush_inner(&mut self, flush_pending: bool) -> Result<()> {
        if flush_pending {
            for (off, data) in self.pending.drain() {
                self.do_write(off, data, false).await?;
            }
        }

        let mut first_err = None;
        let dirty: Vec<ExtentHandler> = self.dirty.drain(..).collect();
        for mut h in dirty {
            match h.flush().await {
                Ok(Some(key)) => self.cache.insert(key, true),
                Ok(None) => {}
                Err(e) => {
                    let unacked = h.take_unacked();
                    if unacked.is_empty() {
                        // Durable but not yet visible; retry on a later
                        // flush.
                        self.dirty.push(h);
                        first_err.get_or_insert(e);
                    } else if let Err(e2) = self.replay(unacked).await {
                        first_err.get_or_insert(e2);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if let Some(mut h) = self.handler.take() {
            match h.flush().await {
                Ok(key) => {
                    if let Some(key) = key {
                        self.cache.insert(key, true);
                    }
                    if h.status() == HandlerStatus::Open {
                        self.handler = Some(h);
                    }
                }
                Err(e) => {
                    let unacked = h.take_unacked();
                    if unacked.is_empty() {
                        self.dirty.push(h);
                        return Err(e);
                    }
                    h.abort();
                    self.replay(unacked).await?;
                }
            }
        }

        for entry in self.overwrites.drain() {
            let req = ExtentRequest {
                file_offset: entry.file_offset,
                size: entry.data.len(),
                key: Some(entry.key),
                data: Bytes::from(entry.data),
            };
            match self.do_overwrite(&req, false).await {
                Ok(_) => {}
                Err(StreamError::NotExist) => return Err(StreamError::NotExist),
                Err(_) => {
                    self.do_row(&req, false).await?;
                }
            }
        }
        Ok(())
    }

    async fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.flush(true).await?;
        self.retire_current().await?;
        let old_size = self.cache.size();
        self.ctx
            .meta
            .truncate(self.inode, old_size, new_size)
            .await?;
        self.cache.truncate(new_size);
        Ok(())
    }
}

// --- read path (queue-free) --------------------------------------------

/// Read `buf.len()` bytes at `offset`, returning how many were filled.
/// Holes read as zeros; reads past end-of-file are clipped.
pub(crate) async fn read(
    ctx: &Arc<DataContext>,
    handle: &Arc<StreamerHandle>,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let cache = &handle.cache;
    if !cache.initialized() {
        refresh_cache(ctx, cache, false).await?;
    }
    // The caller may be racing an append on another client; kick off a
    // background refresh when reading past what we believe is the end.
    if offset + buf.len() as u64 > cache.size()
        && !cache.refreshed_within(std::time::Duration::from_secs(1))
    {
        let _ = ctx.prepare_tx.try_send(crate::client::PrepareTask::Refresh {
            cache: cache.clone(),
        });
    }

    let size = cache.size();
    if offset >= size {
        return Ok(0);
    }
    let len = buf.len().min((size - offset) as usize);

    let mut refreshed_after_miss = false;
    let mut settled_in_flight = false;
    let mut filled = 0usize;
    while filled < len {
        let (requests, _) = cache.prepare_requests(offset + filled as u64, len - filled, None);
        let mut progressed = false;
        let mut retry_plan = false;
        for req in requests {
            let at = (req.file_offset - offset) as usize;
            let dst = &mut buf[at..at + req.size];
            match req.key {
                None => {
                    dst.fill(0);
                    filled += req.size;
                    progressed = true;
                }
                Some(key) if key.is_temporary() => {
                    if settled_in_flight {
                        return Err(StreamError::Other(format!(
                            "range at {} still in flight after flush",
                            req.file_offset
                        )));
                    }
                    // An append to this range is still buffered; settle the
                    // streamer and re-plan.
                    flush_through_queue(handle).await?;
                    settled_in_flight = true;
                    retry_plan = true;
                    break;
                }
                Some(key) => match read_extent(ctx, &key, &req, dst).await {
                    Ok(n) => {
                        filled += n;
                        progressed = true;
                    }
                    Err(StreamError::NotExist)
                        if !refreshed_after_miss
                            && !cache.refreshed_within(std::time::Duration::from_secs(1)) =>
                    {
                        // Our view may predate a reallocation; one forced
                        // round of flush + refresh, then try again.
                        flush_through_queue(handle).await?;
                        refresh_cache(ctx, cache, true).await?;
                        refreshed_after_miss = true;
                        retry_plan = true;
                        break;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        if retry_plan {
            continue;
        }
        if !progressed {
            break;
        }
    }
    Ok(filled)
}

/// Fetch the authoritative extent map into the cache.
pub(crate) async fn refresh_cache(
    ctx: &Arc<DataContext>,
    cache: &Arc<ExtentCache>,
    force: bool,
) -> Result<()> {
    let snapshot = ctx.meta.get_extents(cache.inode()).await?;
    cache.refresh(snapshot, force);
    Ok(())
}

async fn flush_through_queue(handle: &Arc<StreamerHandle>) -> Result<()> {
    let (reply, rx) = oneshot::channel();
    handle
        .tx
        .send(StreamRequest::Flush {
            flush_pending: true,
            reply,
        })
        .await
        .map_err(|_| StreamError::Eagain)?;
    rx.await.map_err(|_| StreamError::Eagain)?
}

/// Read one key-backed sub-request, rotating through the routed hosts.
async fn read_extent(
    ctx: &Arc<DataContext>,
    key: &ExtentKey,
    req: &ExtentRequest,
    dst: &mut [u8],
) -> Result<usize> {
    let dp = ctx.wrapper.get_partition(key.partition_id).await?;
    let deadline = Instant::now() + STREAM_SEND_TIMEOUT;
    let mut attempts = 0usize;
    let mut last_err = StreamError::Timeout(STREAM_SEND_TIMEOUT);

    loop {
        let ReadRoute {
            hosts,
            follower_read,
        } = ctx.wrapper.read_route(&dp, key.extent_offset_at(req.file_offset));
        for host in hosts {
            if attempts >= STREAM_SEND_READ_MAX_RETRY || Instant::now() >= deadline {
                return Err(last_err);
            }
            attempts += 1;
            let started = Instant::now();
            match read_from_host(ctx, &host, key, req, follower_read, dst).await {
                Ok(n) => {
                    let elapsed = started.elapsed();
                    dp.record_read(elapsed);
                    if follower_read {
                        dp.record_follower_delay(&host, elapsed);
                    } else if host != dp.leader() {
                        dp.set_leader(&host);
                    }
                    return Ok(n);
                }
                Err(e @ StreamError::NotExist) => return Err(e),
                Err(StreamError::TryOtherAddr(msg)) => {
                    debug!("host {host} redirected read: {msg}");
                    dp.record_host_error(&host);
                    last_err = StreamError::TryOtherAddr(msg);
                }
                Err(StreamError::PartitionNotExists(id)) => {
                    ctx.wrapper.invalidate_partition(id);
                    return Err(StreamError::PartitionNotExists(id));
                }
                Err(e) if e.poisons_connection() => return Err(e),
                Err(e) => {
                    dp.record_host_error(&host);
                    last_err = e;
                }
            }
        }
        if attempts >= STREAM_SEND_READ_MAX_RETRY || Instant::now() >= deadline {
            return Err(last_err);
        }
        tokio::time::sleep(STREAM_RETRY_INTERVAL).await;
    }
}

/// One request/reply exchange for a read. The server may stream the range
/// back in several packets; each is CRC-checked and copied into place.
async fn read_from_host(
    ctx: &Arc<DataContext>,
    host: &str,
    key: &ExtentKey,
    req: &ExtentRequest,
    follower_read: bool,
    dst: &mut [u8],
) -> Result<usize> {
    let mut conn = ctx.pool.get(host).await?;
    let extent_offset = key.extent_offset_at(req.file_offset);
    let request = Packet::new_stream_read(
        &ctx.codec,
        key.partition_id,
        key.extent_id,
        extent_offset as i64,
        req.size as u32,
        follower_read,
    );

    let result: Result<usize> = async {
        request
            .write_to(ctx.codec.mode(), &mut conn, ctx.wrapper.write_timeout())
            .await?;
        let mut received = 0usize;
        while received < req.size {
            let reply =
                Packet::read_from(ctx.codec.mode(), &mut conn, ctx.wrapper.read_timeout()).await?;
            if reply.request_id != request.request_id
                || !matches!(
                    reply.opcode,
                    Opcode::StreamRead | Opcode::StreamFollowerRead | Opcode::Read
                )
            {
                return Err(StreamError::BadMessage(format!(
                    "read reply mismatch for request {}",
                    request.request_id
                )));
            }
            reply.reply_status()?;
            reply.verify_crc()?;
            if reply.data.is_empty() || received + reply.data.len() > req.size {
                return Err(StreamError::BadMessage(format!(
                    "read reply sized {} outside requested window",
                    reply.data.len()
                )));
            }
            dst[received..received + reply.data.len()].copy_from_slice(&reply.data);
            received += reply.data.len();
        }
        Ok(received)
    }
    .await;

    ctx.pool.put(host, conn, result.is_err());
    result
}

/// Like [`read`], but every key-backed sub-request is served by the
/// replica with the highest applied id, giving read-your-writes semantics
/// across replicas.
pub(crate) async fn read_consistent(
    ctx: &Arc<DataContext>,
    handle: &Arc<StreamerHandle>,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let cache = &handle.cache;
    if !cache.initialized() {
        refresh_cache(ctx, cache, false).await?;
    }
    let size = cache.size();
    if offset >= size {
        return Ok(0);
    }
    let len = buf.len().min((size - offset) as usize);

    let (requests, _) = cache.prepare_requests(offset, len, None);
    let mut filled = 0usize;
    for req in requests {
        let at = (req.file_offset - offset) as usize;
        let dst = &mut buf[at..at + req.size];
        match req.key {
            None => {
                dst.fill(0);
                filled += req.size;
            }
            Some(key) if key.is_temporary() => {
                flush_through_queue(handle).await?;
                return Err(StreamError::Again);
            }
            Some(key) => {
                let host = consistency_read_host(ctx, key.partition_id).await?;
                let n = read_from_host(ctx, &host, &key, &req, true, dst).await?;
                filled += n;
            }
        }
    }
    Ok(filled)
}

/// Strong read-your-writes: query every replica's applied raft id and pick
/// a host at the maximum. Fan-out is concurrent and bounded by the read
/// timeout; the slowest replicas are simply not waited for once a quorum
/// answered.
pub(crate) async fn consistency_read_host(
    ctx: &Arc<DataContext>,
    partition_id: u64,
) -> Result<String> {
    let dp = ctx.wrapper.get_partition(partition_id).await?;
    let hosts = dp.hosts();
    let mut tasks = Vec::with_capacity(hosts.len());
    for host in hosts {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            let applied = fetch_applied_id(&ctx, &host, partition_id).await;
            (host, applied)
        }));
    }

    let collect = async {
        let mut best: Option<(String, u64)> = None;
        for task in tasks {
            let Ok((host, applied)) = task.await else {
                continue;
            };
            match applied {
                Ok(id) => {
                    if best.as_ref().is_none_or(|(_, b)| id > *b) {
                        best = Some((host, id));
                    }
                }
                Err(e) => debug!("applied-id fetch from {host} failed: {e}"),
            }
        }
        best
    };
    let best = tokio::time::timeout(STREAM_SEND_TIMEOUT, collect)
        .await
        .map_err(|_| StreamError::Timeout(STREAM_SEND_TIMEOUT))?;
    best.map(|(h, _)| h)
        .ok_or_else(|| StreamError::Other("no replica answered applied-id query".into()))
}

async fn fetch_applied_id(ctx: &Arc<DataContext>, host: &str, partition_id: u64) -> Result<u64> {
    let mut conn = ctx.pool.get(host).await?;
    let request = Packet::new_get_applied_id(&ctx.codec, partition_id);
    let result: Result<u64> = async {
        request
            .write_to(ctx.codec.mode(), &mut conn, ctx.wrapper.write_timeout())
            .await?;
        let reply =
            Packet::read_from(ctx.codec.mode(), &mut conn, ctx.wrapper.read_timeout()).await?;
        if !request.is_reply_to(&reply) {
            return Err(StreamError::BadMessage("applied-id reply mismatch".into()));
        }
        reply.reply_status()?;
        let bytes: [u8; 8] = reply.data.as_ref().try_into().map_err(|_| {
            StreamError::BadMessage("applied-id reply must carry 8 bytes".into())
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
    .await;
    ctx.pool.put(host, conn, result.is_err());
    result
}
