//! Client configuration.

use std::time::Duration;

use crate::conn::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_POOL_LIMIT};
use crate::error::{Result, StreamError};
use crate::meta::ConnTimeoutView;
use crate::proto::WireMode;

/// Smallest allowed extent size.
pub const MIN_EXTENT_SIZE: u64 = 64 * 1024;

/// Largest allowed extent size, and the default.
pub const MAX_EXTENT_SIZE: u64 = 128 * 1024 * 1024;

/// Default cap on a file that may be packed into a tiny extent.
pub const DEFAULT_TINY_SIZE_LIMIT: u64 = 1024 * 1024;

/// How many candidate partitions an extent allocation tries before giving
/// up.
pub const MAX_SELECT_DATA_PARTITION_FOR_WRITE: usize = 32;

/// Host attempts a single read sub-request may burn before surfacing an
/// I/O error.
pub const STREAM_SEND_READ_MAX_RETRY: usize = 10;

/// Wall-clock budget for one read or overwrite sub-request, including all
/// of its retries.
pub const STREAM_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between overwrite/reallocation retries.
pub const STREAM_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Streamer housekeeping tick.
pub const STREAMER_TICK: Duration = Duration::from_secs(5);

/// Ticks an unreferenced idle streamer survives before eviction.
pub const DEFAULT_IDLE_TICKS: usize = 3;

/// Resolved connection timeouts, after the config layers are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnTimeouts {
    /// Idle TTL for pooled connections.
    pub idle: Duration,
    /// Dial timeout.
    pub connect: Duration,
    /// Per-operation read timeout.
    pub read: Duration,
    /// Per-operation write timeout.
    pub write: Duration,
}

impl Default for ConnTimeouts {
    fn default() -> Self {
        ConnTimeouts {
            idle: DEFAULT_IDLE_TIMEOUT,
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
        }
    }
}

impl ConnTimeouts {
    /// Overlay one config layer. Zero fields leave the current value in
    /// place, so applying defaults < cluster < zone < volume in order gives
    /// the documented precedence.
    pub fn merge(mut self, view: &ConnTimeoutView) -> ConnTimeouts {
        if view.idle_timeout_secs > 0 {
            self.idle = Duration::from_secs(view.idle_timeout_secs);
        }
        if view.connect_timeout_ms > 0 {
            self.connect = Duration::from_millis(view.connect_timeout_ms);
        }
        if view.read_timeout_ms > 0 {
            self.read = Duration::from_millis(view.read_timeout_ms);
        }
        if view.write_timeout_ms > 0 {
            self.write = Duration::from_millis(view.write_timeout_ms);
        }
        self
    }
}

/// Options fixed at client construction.
#[derive(Debug, Clone)]
pub struct ExtentConfig {
    /// Volume to mount.
    pub volume: String,
    /// Wire header layout.
    pub wire_mode: WireMode,
    /// Extent capacity; must be a power of two in
    /// `[MIN_EXTENT_SIZE, MAX_EXTENT_SIZE]`.
    pub extent_size: u64,
    /// Files at or below this size are packed into tiny extents.
    pub tiny_size_limit: u64,
    /// Buffer small writes locally and merge them before sending.
    pub write_cache: bool,
    /// Flush buffered writes from the housekeeping tick.
    pub auto_flush: bool,
    /// Per-host pooled-connection cap.
    pub pool_limit: usize,
    /// Depth of each streamer's request queue.
    pub request_queue_depth: usize,
    /// Ticks an idle unreferenced streamer survives.
    pub idle_ticks: usize,
    /// Consecutive volume-view failures before `VolNotExists` surfaces.
    pub vol_not_exists_threshold: u32,
}

impl Default for ExtentConfig {
    fn default() -> Self {
        ExtentConfig {
            volume: String::new(),
            wire_mode: WireMode::Normal,
            extent_size: MAX_EXTENT_SIZE,
            tiny_size_limit: DEFAULT_TINY_SIZE_LIMIT,
            write_cache: false,
            auto_flush: false,
            pool_limit: DEFAULT_POOL_LIMIT,
            request_queue_depth: 1024,
            idle_ticks: DEFAULT_IDLE_TICKS,
            vol_not_exists_threshold: 6,
        }
    }
}

impl ExtentConfig {
    /// Config for `volume` with defaults everywhere else.
    pub fn new(volume: impl Into<String>) -> Self {
        ExtentConfig {
            volume: volume.into(),
            ..Default::default()
        }
    }

    /// Reject configurations the data nodes would not accept.
    pub fn validate(&self) -> Result<()> {
        if self.volume.is_empty() {
            return Err(StreamError::Other("volume name must not be empty".into()));
        }
        if !self.extent_size.is_power_of_two()
            || !(MIN_EXTENT_SIZE..=MAX_EXTENT_SIZE).contains(&self.extent_size)
        {
            return Err(StreamError::Other(format!(
                "extent size {} must be a power of two within [{MIN_EXTENT_SIZE}, {MAX_EXTENT_SIZE}]",
                self.extent_size
            )));
        }
        if self.request_queue_depth == 0 {
            return Err(StreamError::Other(
                "request queue depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_precedence() {
        let cluster = ConnTimeoutView {
            read_timeout_ms: 3000,
            write_timeout_ms: 3000,
            ..Default::default()
        };
        let zone = ConnTimeoutView {
            write_timeout_ms: 2000,
            ..Default::default()
        };
        let volume = ConnTimeoutView {
            idle_timeout_secs: 90,
            ..Default::default()
        };

        let resolved = ConnTimeouts::default()
            .merge(&cluster)
            .merge(&zone)
            .merge(&volume);
        assert_eq!(resolved.read, Duration::from_secs(3));
        assert_eq!(resolved.write, Duration::from_secs(2));
        assert_eq!(resolved.idle, Duration::from_secs(90));
        assert_eq!(resolved.connect, ConnTimeouts::default().connect);
    }

    #[test]
    fn extent_size_validation() {
        let mut cfg = ExtentConfig::new("vol");
        assert!(cfg.validate().is_ok());

        cfg.extent_size = 96 * 1024;
        assert!(cfg.validate().is_err());

        cfg.extent_size = 32 * 1024;
        assert!(cfg.validate().is_err());

        cfg.extent_size = 1024 * 1024;
        assert!(cfg.validate().is_ok());
    }
}
