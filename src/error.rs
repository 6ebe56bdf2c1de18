//! Error type shared by the whole data plane.
//!
//! Low-level failures (socket errors, protocol violations, server result
//! codes) are folded into a single enum so that the streamer loop can map
//! them onto a small set of request-reply outcomes.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::proto::ResultCode;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Well-known substring a data node embeds in a reply body when the
/// requested partition has been removed from the cluster.
pub const PARTITION_NOT_EXISTS_MSG: &str = "DataPartitionNotExists";

/// Errors surfaced by the client data plane.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying socket or file I/O failure.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server asked us to back off and retry.
    #[error("server busy, try again")]
    Again,

    /// A reply or stream started with something other than the magic byte.
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),

    /// Framing violation: short read, size mismatch, or a reply that does
    /// not match the outstanding request. The connection that produced it
    /// must be discarded.
    #[error("malformed message: {0}")]
    BadMessage(String),

    /// Body checksum did not match the header.
    #[error("crc mismatch: header says {expected:#010x}, body is {actual:#010x}")]
    CrcMismatch {
        /// CRC carried in the packet header.
        expected: u32,
        /// CRC computed over the received body.
        actual: u32,
    },

    /// The replica cannot serve this request; re-route to another host.
    #[error("try other address: {0}")]
    TryOtherAddr(String),

    /// The data partition is gone from the cluster view.
    #[error("data partition {0} no longer exists")]
    PartitionNotExists(u64),

    /// Target disk is out of space; exclude the partition and move on.
    #[error("no space left on partition {0}")]
    NoSpace(u64),

    /// Target disk reported a hard error.
    #[error("disk error on partition {0}")]
    DiskErr(u64),

    /// Permission denied by the server. Not retryable.
    #[error("operation not permitted")]
    NotPerm,

    /// The addressed extent or inode does not exist. Not retryable.
    #[error("extent or inode does not exist")]
    NotExist,

    /// The object being created already exists. Not retryable.
    #[error("already exists")]
    Exist,

    /// Directory not empty. Not retryable.
    #[error("directory not empty")]
    DirNotEmpty,

    /// Inode is outside the server's accepted range.
    #[error("inode out of range")]
    InodeOutOfRange,

    /// The server side has this operation disabled.
    #[error("operation disabled by server")]
    Disabled,

    /// The volume has repeatedly vanished from the master's view.
    #[error("volume {0} does not exist")]
    VolNotExists(String),

    /// No data partition is currently eligible for writes.
    #[error("no writable data partition")]
    NoWritablePartition,

    /// The per-volume byte-rate limiter rejected the operation.
    #[error("rate limit exceeded")]
    LimitExceeded,

    /// The streamer is shutting down; the caller should retry the request.
    #[error("stream is closing, try again")]
    Eagain,

    /// The streamer entered error state after repeated flush failures.
    #[error("stream in error state, pending data not yet flushed")]
    StreamBroken,

    /// Catch-all for server error strings that map to nothing above.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Build an error from a reply's result code and its error-message body.
    pub fn from_result_code(code: ResultCode, partition_id: u64, msg: &str) -> StreamError {
        match code {
            ResultCode::Again => StreamError::Again,
            ResultCode::TryOtherAddr => {
                if msg.contains(PARTITION_NOT_EXISTS_MSG) {
                    StreamError::PartitionNotExists(partition_id)
                } else {
                    StreamError::TryOtherAddr(msg.to_string())
                }
            }
            ResultCode::DiskNoSpaceErr => StreamError::NoSpace(partition_id),
            ResultCode::DiskErr => StreamError::DiskErr(partition_id),
            ResultCode::NotPerm => StreamError::NotPerm,
            ResultCode::NotExistErr => StreamError::NotExist,
            ResultCode::ExistErr => StreamError::Exist,
            ResultCode::DirNotEmpty => StreamError::DirNotEmpty,
            ResultCode::InodeOutOfRange => StreamError::InodeOutOfRange,
            ResultCode::Disabled => StreamError::Disabled,
            _ => {
                if msg.contains(PARTITION_NOT_EXISTS_MSG) {
                    StreamError::PartitionNotExists(partition_id)
                } else {
                    StreamError::Other(msg.to_string())
                }
            }
        }
    }

    /// Whether a local retry against the same target may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Again | StreamError::Timeout(_) | StreamError::Io(_)
        )
    }

    /// Whether the failure calls for routing to a different replica or a
    /// refreshed partition view rather than burning the retry budget.
    pub fn is_reroute(&self) -> bool {
        matches!(
            self,
            StreamError::TryOtherAddr(_) | StreamError::PartitionNotExists(_)
        )
    }

    /// Protocol violations poison the connection they arrived on.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            StreamError::BadMagic(_) | StreamError::BadMessage(_) | StreamError::CrcMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_mapping() {
        assert!(matches!(
            StreamError::from_result_code(ResultCode::DiskNoSpaceErr, 7, ""),
            StreamError::NoSpace(7)
        ));
        assert!(matches!(
            StreamError::from_result_code(ResultCode::NotPerm, 0, "denied"),
            StreamError::NotPerm
        ));
        // The magic partition-gone string wins over the generic code.
        assert!(matches!(
            StreamError::from_result_code(ResultCode::Err, 3, "DataPartitionNotExists: dp 3"),
            StreamError::PartitionNotExists(3)
        ));
    }

    #[test]
    fn retry_classification() {
        assert!(StreamError::Again.is_retryable());
        assert!(!StreamError::NotPerm.is_retryable());
        assert!(StreamError::TryOtherAddr(String::new()).is_reroute());
        assert!(
            StreamError::CrcMismatch {
                expected: 1,
                actual: 2
            }
            .poisons_connection()
        );
    }
}
