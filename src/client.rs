//! The client facade: one `ExtentClient` per mounted volume.
//!
//! The client owns the partition wrapper, the shared connection pool, the
//! byte-rate limiters and the map of live streamers. Ownership is a strict
//! tree: client -> wrapper -> partitions, client -> streamers -> handler.
//! Handlers and read paths refer to partitions by id and resolve them
//! through the wrapper on use, so nothing holds a removed partition alive.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ExtentConfig;
use crate::conn::ConnectionPool;
use crate::error::{Result, StreamError};
use crate::extent_cache::ExtentCache;
use crate::limit::RateLimiter;
use crate::meta::{MasterApi, MetaApi};
use crate::proto::CodecContext;
use crate::state::ClientState;
use crate::streamer::{self, StreamRequest, Streamer, StreamerHandle, StreamerMap};
use crate::wrapper::Wrapper;

/// Depth of the prepare-task channel and number of workers draining it.
const PREPARE_QUEUE_DEPTH: usize = 64;
const PREPARE_WORKERS: usize = 2;

/// Background work dispatched off the hot paths.
pub(crate) enum PrepareTask {
    /// Opportunistic extent-map refresh (read-ahead support).
    Refresh {
        /// Cache to refresh.
        cache: Arc<ExtentCache>,
    },
}

/// Shared context threaded through streamers and handlers instead of
/// process-wide globals.
pub struct DataContext {
    /// Wire codec state (header layout, request-id counter).
    pub codec: CodecContext,
    /// Client construction options.
    pub config: ExtentConfig,
    /// Partition table and routing.
    pub wrapper: Arc<Wrapper>,
    /// Metadata collaborator.
    pub meta: Arc<dyn MetaApi>,
    /// Shared connection pool.
    pub pool: Arc<ConnectionPool>,
    pub(crate) prepare_tx: mpsc::Sender<PrepareTask>,
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("volume", &self.config.volume)
            .finish()
    }
}

/// Client-side data plane for one volume.
pub struct ExtentClient {
    ctx: Arc<DataContext>,
    streamers: StreamerMap,
    read_limiter: Arc<RateLimiter>,
    write_limiter: Arc<RateLimiter>,
    prepare_workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ExtentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentClient")
            .field("volume", &self.ctx.config.volume)
            .field("streamers", &self.streamers.lock().len())
            .finish()
    }
}

impl ExtentClient {
    /// Build a client: bootstrap the wrapper against the master and start
    /// the background machinery.
    pub async fn new(
        master: Arc<dyn MasterApi>,
        meta: Arc<dyn MetaApi>,
        config: ExtentConfig,
    ) -> Result<ExtentClient> {
        ExtentClient::with_state(master, meta, config, None).await
    }

    /// Like [`new`](Self::new), seeded from a persisted snapshot so the
    /// client serves requests before its first full refresh.
    pub async fn with_state(
        master: Arc<dyn MasterApi>,
        meta: Arc<dyn MetaApi>,
        config: ExtentConfig,
        seed: Option<ClientState>,
    ) -> Result<ExtentClient> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(
            config.pool_limit,
            crate::conn::DEFAULT_IDLE_TIMEOUT,
            crate::conn::DEFAULT_CONNECT_TIMEOUT,
        ));
        let read_limiter = Arc::new(RateLimiter::new(0));
        let write_limiter = Arc::new(RateLimiter::new(0));

        let wrapper = Wrapper::bootstrap(
            master,
            &config,
            pool.clone(),
            read_limiter.clone(),
            write_limiter.clone(),
            seed,
        )
        .await?;
        wrapper.start_background();

        let (prepare_tx, prepare_rx) = mpsc::channel(PREPARE_QUEUE_DEPTH);
        let ctx = Arc::new(DataContext {
            codec: CodecContext::with_process_registry(config.wire_mode),
            config,
            wrapper,
            meta,
            pool,
            prepare_tx,
        });

        let client = ExtentClient {
            ctx: ctx.clone(),
            streamers: Arc::new(Mutex::new(HashMap::new())),
            read_limiter,
            write_limiter,
            prepare_workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        client.spawn_prepare_workers(prepare_rx);
        info!("extent client ready for volume {}", client.ctx.config.volume);
        Ok(client)
    }

    fn spawn_prepare_workers(&self, rx: mpsc::Receiver<PrepareTask>) {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.prepare_workers.lock();
        for _ in 0..PREPARE_WORKERS {
            let rx = rx.clone();
            let ctx = self.ctx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(PrepareTask::Refresh { cache }) => {
                            if let Err(e) = streamer::refresh_cache(&ctx, &cache, false).await {
                                debug!("background refresh for inode {} failed: {e}", cache.inode());
                            }
                        }
                        None => return,
                    }
                }
            }));
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Eagain);
        }
        Ok(())
    }

    fn handle_of(&self, inode: u64) -> Result<Arc<StreamerHandle>> {
        self.streamers
            .lock()
            .get(&inode)
            .cloned()
            .ok_or_else(|| StreamError::Other(format!("inode {inode} has no open stream")))
    }

    /// Make sure the request loop is running for `handle`.
    fn ensure_loop(&self, handle: &Arc<StreamerHandle>) {
        if handle.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(rx) = handle.pending_rx.lock().take() else {
            return;
        };
        let s = Streamer::new(self.ctx.clone(), handle.clone(), self.streamers.clone());
        tokio::spawn(s.run(rx));
    }

    /// Open (or re-open) `inode` for streaming I/O. Cheap before the first
    /// write: no task is spawned yet and the open executes inline.
    pub async fn open_stream(&self, inode: u64) -> Result<()> {
        self.check_open()?;
        let handle = {
            let mut map = self.streamers.lock();
            match map.get(&inode) {
                Some(handle) => handle.clone(),
                None => {
                    let handle = StreamerHandle::new(inode, self.ctx.config.request_queue_depth);
                    map.insert(inode, handle.clone());
                    handle
                }
            }
        };
        if handle.started.load(Ordering::Acquire) {
            return self
                .roundtrip_unit(&handle, |reply| StreamRequest::Open { reply })
                .await;
        }
        handle.refcnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Write `data` at `offset`. Ordering across writes on one inode is
    /// the enqueue order.
    pub async fn write(&self, inode: u64, offset: u64, data: &[u8], direct: bool) -> Result<usize> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.write_limiter.acquire(data.len()).await;
        let handle = self.handle_of(inode)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            // Serialize the enqueue step so concurrent writers keep their
            // queue order stable.
            let _order = handle.write_lock.lock().await;
            self.ensure_loop(&handle);
            handle
                .tx
                .send(StreamRequest::Write {
                    offset,
                    data: Bytes::copy_from_slice(data),
                    direct,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| StreamError::Eagain)?;
        }
        reply_rx.await.map_err(|_| StreamError::Eagain)?
    }

    /// Read into `buf` at `offset`. Reads bypass the request queue.
    pub async fn read(&self, inode: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_limiter.acquire(buf.len()).await;
        let handle = self.handle_of(inode)?;
        streamer::read(&self.ctx, &handle, offset, buf).await
    }

    /// Read with read-your-writes consistency: replicas are polled for
    /// their applied id and the most advanced one serves the data.
    pub async fn read_consistent(&self, inode: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_limiter.acquire(buf.len()).await;
        let handle = self.handle_of(inode)?;
        streamer::read_consistent(&self.ctx, &handle, offset, buf).await
    }

    /// Flush buffered and in-flight writes and persist their keys.
    pub async fn flush(&self, inode: u64) -> Result<()> {
        self.check_open()?;
        let handle = self.handle_of(inode)?;
        if !handle.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.roundtrip_unit(&handle, |reply| StreamRequest::Flush {
            flush_pending: true,
            reply,
        })
        .await
    }

    /// Truncate `inode` to `size`, through the meta service first.
    pub async fn truncate(&self, inode: u64, size: u64) -> Result<()> {
        self.check_open()?;
        let handle = self.handle_of(inode)?;
        self.ensure_loop(&handle);
        self.roundtrip_unit(&handle, |reply| StreamRequest::Truncate { size, reply })
            .await
    }

    /// Logical file size as currently cached, refreshing once if the cache
    /// was never initialized.
    pub async fn file_size(&self, inode: u64) -> Result<u64> {
        let handle = self.handle_of(inode)?;
        if !handle.cache.initialized() {
            streamer::refresh_cache(&self.ctx, &handle.cache, false).await?;
        }
        Ok(handle.cache.size())
    }

    /// Force-refresh the extent cache from the meta service.
    pub async fn refresh_extents(&self, inode: u64) -> Result<()> {
        let handle = self.handle_of(inode)?;
        streamer::refresh_cache(&self.ctx, &handle.cache, true).await
    }

    /// Release one reference to the stream, flushing through the loop when
    /// one is running.
    pub async fn close_stream(&self, inode: u64) -> Result<()> {
        let handle = self.handle_of(inode)?;
        if !handle.started.load(Ordering::Acquire) {
            // Inline fast path: no loop was ever needed.
            let left = handle.refcnt.fetch_sub(1, Ordering::AcqRel) - 1;
            if left <= 0 {
                self.streamers.lock().remove(&inode);
            }
            return Ok(());
        }
        self.roundtrip_unit(&handle, |reply| StreamRequest::Release { reply })
            .await
    }

    /// Force the stream closed regardless of reference count.
    pub async fn must_close_stream(&self, inode: u64) -> Result<()> {
        let handle = self.handle_of(inode)?;
        handle.refcnt.store(0, Ordering::Release);
        self.evict_stream(inode).await
    }

    /// Flush and remove the streamer from the process map.
    pub async fn evict_stream(&self, inode: u64) -> Result<()> {
        let handle = self.handle_of(inode)?;
        if !handle.started.load(Ordering::Acquire) {
            self.streamers.lock().remove(&inode);
            return Ok(());
        }
        let res = self
            .roundtrip_unit(&handle, |reply| StreamRequest::Evict { reply })
            .await;
        match res {
            Ok(()) => Ok(()),
            // The loop may already be gone; eviction then already happened.
            Err(StreamError::Eagain) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn roundtrip_unit<F>(&self, handle: &Arc<StreamerHandle>, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> StreamRequest,
    {
        if !handle.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StreamError::Eagain)?;
        reply_rx.await.map_err(|_| StreamError::Eagain)?
    }

    /// Snapshot of cluster/volume/partition views for a warm restart.
    pub fn snapshot_state(&self) -> ClientState {
        self.ctx.wrapper.snapshot_state()
    }

    /// Persist the snapshot to `path`.
    pub fn save_state(&self, path: &Path) -> Result<()> {
        self.snapshot_state().save_to(path)
    }

    /// Number of live streamers, mostly for tests and introspection.
    pub fn open_streams(&self) -> usize {
        self.streamers.lock().len()
    }

    /// The partition wrapper, for advanced embedders.
    pub fn wrapper(&self) -> &Arc<Wrapper> {
        &self.ctx.wrapper
    }

    /// Shut the client down: flush and stop every streamer, stop the
    /// background loops, drop pooled connections.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handles: Vec<Arc<StreamerHandle>> =
            self.streamers.lock().values().cloned().collect();
        for handle in handles {
            if handle.started.load(Ordering::Acquire) {
                let (reply_tx, reply_rx) = oneshot::channel();
                let sent = handle
                    .tx
                    .send(StreamRequest::Evict { reply: reply_tx })
                    .await
                    .is_ok();
                if sent && reply_rx.await.is_err() {
                    warn!("streamer for inode {} exited uncleanly", handle.inode);
                }
            }
            handle.done.cancel();
        }
        self.streamers.lock().clear();

        self.ctx.wrapper.close().await;
        let workers: Vec<_> = self.prepare_workers.lock().drain(..).collect();
        for w in workers {
            w.abort();
        }
        self.ctx.pool.close();
        info!("extent client for {} closed", self.ctx.config.volume);
        Ok(())
    }
}
