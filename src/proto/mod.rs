//! Wire protocol shared by the client and the data nodes.
//!
//! A packet is a fixed-size big-endian header, an optional argument blob and
//! an optional payload. The same envelope is used for requests and replies;
//! a reply echoes the request id and opcode with `result_code` set.

mod opcode;
mod packet;

pub use self::opcode::{ExtentType, Opcode, ResultCode};
pub use self::packet::{
    CodecContext, Packet, WireMode, DBBAK_HEADER_SIZE, HEADER_SIZE, MAX_OVERWRITE_PACKET_SIZE,
    PACKET_MAGIC,
};

/// Unit of client-side write buffering. A streaming write packet carries at
/// most this many payload bytes.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Extent ids at or below this value address tiny extents, which share a
/// packed physical file on the data node.
pub const MAX_TINY_EXTENT_ID: u64 = 64;

/// First valid tiny extent id. Id 0 is reserved as the "not yet allocated"
/// marker in extent keys.
pub const MIN_TINY_EXTENT_ID: u64 = 1;

/// Whether an extent id addresses a tiny extent.
pub fn is_tiny_extent(extent_id: u64) -> bool {
    (MIN_TINY_EXTENT_ID..=MAX_TINY_EXTENT_ID).contains(&extent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_extent_bounds() {
        assert!(!is_tiny_extent(0));
        assert!(is_tiny_extent(1));
        assert!(is_tiny_extent(64));
        assert!(!is_tiny_extent(65));
    }
}
