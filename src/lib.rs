//! Client-side data plane for the ExtentFS distributed filesystem.
//!
//! This crate translates a POSIX file's logical byte range into reads and
//! writes against a cluster of replicated data partitions. It keeps a
//! per-inode view of the file's extent map, serializes concurrent mutation
//! through per-inode streamer loops, and routes every packet through a
//! partition wrapper that tracks cluster health. The metadata service and
//! the cluster master are collaborators behind the [`MetaApi`] and
//! [`MasterApi`] traits; everything downstream of an open file's
//! read/write/flush and upstream of bytes on a replica's wire lives here.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::client::{DataContext, ExtentClient};
pub use crate::config::ExtentConfig;
pub use crate::conn::ConnectionPool;
pub use crate::error::{Result, StreamError};
pub use crate::extent_cache::{ExtentCache, ExtentRequest};
pub use crate::extent_key::ExtentKey;
pub use crate::meta::{
    ClusterInfo, ConnTimeoutView, DataPartitionView, DataPartitionsView, ExtentSnapshot,
    MasterApi, MetaApi, PartitionStatus, SimpleVolView,
};
pub use crate::proto::{CodecContext, Opcode, Packet, ResultCode, WireMode};
pub use crate::state::ClientState;
pub use crate::wrapper::Wrapper;

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod extent_cache;
pub mod extent_key;
pub mod handler;
pub mod limit;
pub mod meta;
pub mod partition;
pub mod pending;
pub mod proto;
pub mod select;
pub mod state;
mod streamer;
pub mod wrapper;
