//! Pooled TCP connections to data nodes.
//!
//! One process keeps a bounded set of long-lived connections per host.
//! Callers take a connection for the duration of one request/reply exchange
//! and give it back with the outcome; connections that saw an error, or that
//! sat idle past the TTL, are closed instead of reused.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{Result, StreamError};

/// Default cap on pooled connections per host.
pub const DEFAULT_POOL_LIMIT: usize = 64;

/// Default idle TTL before a pooled connection is discarded.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

struct IdleConn {
    stream: TcpStream,
    idle_since: Instant,
}

/// Process-shared pool of data-node connections.
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, VecDeque<IdleConn>>>,
    limit: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    connect_timeout_ms: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("hosts", &self.idle.lock().len())
            .finish()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(
            DEFAULT_POOL_LIMIT,
            DEFAULT_IDLE_TIMEOUT,
            DEFAULT_CONNECT_TIMEOUT,
        )
    }
}

impl ConnectionPool {
    /// Pool with the given per-host cap, idle TTL and dial timeout.
    pub fn new(limit: usize, idle_timeout: Duration, connect_timeout: Duration) -> Self {
        ConnectionPool {
            idle: Mutex::new(HashMap::new()),
            limit: AtomicUsize::new(limit),
            idle_timeout_ms: AtomicU64::new(idle_timeout.as_millis() as u64),
            connect_timeout_ms: AtomicU64::new(connect_timeout.as_millis() as u64),
        }
    }

    /// Retune pool parameters. Applies to future `get` calls; connections
    /// currently lent out are unaffected.
    pub fn update(&self, limit: usize, idle_timeout: Duration, connect_timeout: Duration) {
        self.limit.store(limit, Ordering::Relaxed);
        self.idle_timeout_ms
            .store(idle_timeout.as_millis() as u64, Ordering::Relaxed);
        self.connect_timeout_ms
            .store(connect_timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed))
    }

    /// Take a healthy connection to `addr`, reusing an idle one when
    /// available and dialing otherwise.
    pub async fn get(&self, addr: &str) -> Result<TcpStream> {
        let ttl = self.idle_timeout();
        loop {
            let candidate = {
                let mut pools = self.idle.lock();
                pools.get_mut(addr).and_then(VecDeque::pop_front)
            };
            match candidate {
                Some(conn) => {
                    if conn.idle_since.elapsed() > ttl {
                        debug!("dropping idle-expired connection to {addr}");
                        continue;
                    }
                    return Ok(conn.stream);
                }
                None => break,
            }
        }
        self.dial(addr).await
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let timeout = self.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(StreamError::Io(e)),
            Err(_) => return Err(StreamError::Timeout(timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("set_nodelay failed for {addr}: {e}");
        }
        Ok(stream)
    }

    /// Return a connection after use. `failed` connections are closed, as
    /// are returns beyond the per-host cap.
    pub fn put(&self, addr: &str, stream: TcpStream, failed: bool) {
        if failed {
            return;
        }
        let limit = self.limit.load(Ordering::Relaxed);
        let mut pools = self.idle.lock();
        let queue = pools.entry(addr.to_string()).or_default();
        if queue.len() >= limit {
            return;
        }
        queue.push_back(IdleConn {
            stream,
            idle_since: Instant::now(),
        });
    }

    /// Drop every pooled connection.
    pub fn close(&self) {
        self.idle.lock().clear();
    }

    #[cfg(test)]
    fn idle_count(&self, addr: &str) -> usize {
        self.idle.lock().get(addr).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn reuses_returned_connections() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::default();
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, false);
        assert_eq!(pool.idle_count(&addr), 1);

        let _conn = pool.get(&addr).await.unwrap();
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn failed_connections_are_discarded() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::default();
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, true);
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn idle_ttl_expires_connections() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(4, Duration::from_millis(0), DEFAULT_CONNECT_TIMEOUT);
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn, false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Expired entry is skipped and a fresh dial happens instead.
        let _conn = pool.get(&addr).await.unwrap();
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn per_host_cap_is_enforced() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(1, DEFAULT_IDLE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT);
        let a = pool.get(&addr).await.unwrap();
        let b = pool.get(&addr).await.unwrap();
        pool.put(&addr, a, false);
        pool.put(&addr, b, false);
        assert_eq!(pool.idle_count(&addr), 1);
    }

    #[tokio::test]
    async fn dial_failure_is_io_error() {
        let pool = ConnectionPool::default();
        // Reserved port with nothing listening.
        let err = pool.get("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Io(_) | StreamError::Timeout(_)
        ));
    }
}
