//! Opcode and result-code catalogues.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Which class of extent a packet addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExtentType {
    /// Tiny extents share a packed physical file on the data node.
    Tiny = 0,
    /// Normal extents each own an append-only file.
    Normal = 1,
    /// Both classes; used by maintenance operations.
    All = 2,
}

/// Operations understood by the data nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Allocate a fresh extent on a data partition.
    CreateExtent = 0x01,
    /// Mark an extent (or a range of a tiny extent) deleted.
    MarkDelete = 0x02,
    /// Append to the currently open extent.
    Write = 0x03,
    /// Read a range of an extent.
    Read = 0x04,
    /// Streaming read served by the partition leader.
    StreamRead = 0x05,
    /// Streaming read a follower replica is allowed to serve.
    StreamFollowerRead = 0x06,
    /// In-place overwrite of previously written extent bytes.
    RandomWrite = 0x07,
    /// Append that the replica fsyncs before acknowledging.
    SyncWrite = 0x08,
    /// In-place overwrite that the replica fsyncs before acknowledging.
    SyncRandomWrite = 0x09,
    /// Repair read used when rebuilding a replica.
    ExtentRepairRead = 0x0A,
    /// Read of the valid region of a tiny extent.
    TinyExtentAvaliRead = 0x0B,
    /// Lock or unlock an extent against concurrent mutation.
    LockOrUnlockExtent = 0x0C,
    /// Fetch the replica's applied raft id for consistency reads.
    GetAppliedId = 0x0D,
}

impl Opcode {
    /// Write-family opcodes carry a payload the server persists.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Opcode::Write | Opcode::RandomWrite | Opcode::SyncWrite | Opcode::SyncRandomWrite
        )
    }

    /// Read-family opcodes stream data back; their replies interpret the
    /// `size` header field as "payload still to come" while the result code
    /// is `Init`.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Opcode::Read
                | Opcode::StreamRead
                | Opcode::StreamFollowerRead
                | Opcode::ExtentRepairRead
                | Opcode::TinyExtentAvaliRead
        )
    }
}

/// Result codes carried in the header of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    /// Initial state; requests are sent with this code, and read-family
    /// replies keep it while data is still streaming.
    Init = 0x00,
    /// Success.
    Ok = 0xF0,
    /// Transient server-side congestion; retry after a pause.
    Again = 0xF1,
    /// Generic failure; the body holds an error message.
    Err = 0xF2,
    /// The object being created already exists.
    ExistErr = 0xF3,
    /// The addressed extent or inode does not exist.
    NotExistErr = 0xF4,
    /// This replica cannot serve the request; pick another host.
    TryOtherAddr = 0xF5,
    /// The target disk has no free space.
    DiskNoSpaceErr = 0xF6,
    /// The target disk reported an I/O error.
    DiskErr = 0xF7,
    /// Permission denied.
    NotPerm = 0xF8,
    /// Inode is outside the server's accepted range.
    InodeOutOfRange = 0xF9,
    /// Directory not empty.
    DirNotEmpty = 0xFA,
    /// The operation is administratively disabled.
    Disabled = 0xFB,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn opcode_roundtrip() {
        for op in [
            Opcode::CreateExtent,
            Opcode::Write,
            Opcode::StreamRead,
            Opcode::SyncRandomWrite,
            Opcode::GetAppliedId,
        ] {
            let raw: u8 = op.into();
            assert_eq!(Opcode::try_from(raw).unwrap(), op);
        }
        assert!(Opcode::try_from(0x7Fu8).is_err());
    }

    #[test]
    fn families() {
        assert!(Opcode::SyncWrite.is_write());
        assert!(!Opcode::StreamRead.is_write());
        assert!(Opcode::TinyExtentAvaliRead.is_read());
        assert!(!Opcode::CreateExtent.is_read());
    }
}
