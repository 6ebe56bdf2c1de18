//! Packet envelope: fixed-layout header, optional argument blob, optional
//! payload.
//!
//! All header fields are big-endian on the wire. Two header layouts exist:
//! the 57-byte current layout and a 45-byte compatibility layout ("dbbak")
//! with a 32-bit partition id and no kernel offset. A process speaks exactly
//! one layout for its lifetime; the choice lives on [`CodecContext`] rather
//! than in a global.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::byteorder::big_endian::{I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{ExtentType, Opcode, ResultCode};
use crate::error::{Result, StreamError};

/// First byte of every packet.
pub const PACKET_MAGIC: u8 = 0xFF;

/// Size of the current header layout.
pub const HEADER_SIZE: usize = 57;

/// Size of the compatibility header layout.
pub const DBBAK_HEADER_SIZE: usize = 45;

/// Upper bound on the payload of a single in-place overwrite packet. Larger
/// overwrites are split into sequential packets on one connection.
pub const MAX_OVERWRITE_PACKET_SIZE: usize = 512 * 1024;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct WireHeader {
    magic: u8,
    extent_type: u8,
    opcode: u8,
    result_code: u8,
    remaining_followers: u8,
    crc: U32,
    size: U32,
    arg_len: U32,
    partition_id: U64,
    extent_id: U64,
    extent_offset: I64,
    request_id: I64,
    kernel_offset: U64,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct WireHeaderDbbak {
    magic: u8,
    extent_type: u8,
    opcode: u8,
    result_code: u8,
    remaining_followers: u8,
    crc: U32,
    size: U32,
    arg_len: U32,
    partition_id: U32,
    extent_id: U64,
    extent_offset: I64,
    request_id: I64,
}

const _: () = assert!(size_of::<WireHeader>() == HEADER_SIZE);
const _: () = assert!(size_of::<WireHeaderDbbak>() == DBBAK_HEADER_SIZE);

/// Which header layout the process speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// Current 57-byte layout.
    #[default]
    Normal,
    /// 45-byte layout kept for old db-backup deployments.
    Dbbak,
}

impl WireMode {
    /// Header size of this layout.
    pub fn header_size(self) -> usize {
        match self {
            WireMode::Normal => HEADER_SIZE,
            WireMode::Dbbak => DBBAK_HEADER_SIZE,
        }
    }
}

/// Codec state shared by every packet a client produces: the header layout
/// and the monotonic request-id counter.
#[derive(Debug, Clone)]
pub struct CodecContext {
    mode: WireMode,
    request_ids: Arc<AtomicI64>,
}

impl CodecContext {
    /// Context with a counter of its own, seeded at 1.
    pub fn new(mode: WireMode) -> Self {
        CodecContext {
            mode,
            request_ids: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Context drawing ids from the shared process-wide counter. Multiple
    /// clients in one process then never reuse an id.
    pub fn with_process_registry(mode: WireMode) -> Self {
        static SHARED: std::sync::OnceLock<Arc<AtomicI64>> = std::sync::OnceLock::new();
        CodecContext {
            mode,
            request_ids: SHARED.get_or_init(|| Arc::new(AtomicI64::new(1))).clone(),
        }
    }

    /// The header layout in effect.
    pub fn mode(&self) -> WireMode {
        self.mode
    }

    /// Allocate the next request id.
    pub fn next_request_id(&self) -> i64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CodecContext {
    fn default() -> Self {
        CodecContext::new(WireMode::Normal)
    }
}

/// A protocol packet, request or reply.
#[derive(Clone)]
pub struct Packet {
    /// Extent class the packet addresses.
    pub extent_type: ExtentType,
    /// Operation.
    pub opcode: Opcode,
    /// `Init` in requests; the outcome in replies.
    pub result_code: ResultCode,
    /// How many more replicas the receiving node must forward a write to.
    pub remaining_followers: u8,
    /// CRC32 (IEEE) over the payload.
    pub crc: u32,
    /// Target data partition.
    pub partition_id: u64,
    /// Target extent within the partition.
    pub extent_id: u64,
    /// Byte offset inside the extent.
    pub extent_offset: i64,
    /// Monotonic id used to match replies to requests.
    pub request_id: i64,
    /// File-absolute offset of the payload within the inode.
    pub kernel_offset: u64,
    /// Opaque argument blob (e.g. follower addresses for fan-out writes).
    pub arg: Bytes,
    /// Payload.
    pub data: Bytes,
}

impl Packet {
    /// A blank request carrying the next id from `ctx`.
    pub fn new_request(ctx: &CodecContext, opcode: Opcode) -> Packet {
        Packet {
            extent_type: ExtentType::Normal,
            opcode,
            result_code: ResultCode::Init,
            remaining_followers: 0,
            crc: 0,
            partition_id: 0,
            extent_id: 0,
            extent_offset: 0,
            request_id: ctx.next_request_id(),
            kernel_offset: 0,
            arg: Bytes::new(),
            data: Bytes::new(),
        }
    }

    /// Extent-allocation request against `partition_id`.
    pub fn new_create_extent(ctx: &CodecContext, partition_id: u64, inode: u64) -> Packet {
        let mut p = Packet::new_request(ctx, Opcode::CreateExtent);
        p.partition_id = partition_id;
        // The inode travels in the extent-offset slot so the data node can
        // tag the extent with its owner for repair tooling.
        p.extent_offset = inode as i64;
        p
    }

    /// Streaming append carrying `data` at `extent_offset` within the
    /// currently open extent.
    pub fn new_write(
        ctx: &CodecContext,
        partition_id: u64,
        extent_id: u64,
        extent_offset: i64,
        kernel_offset: u64,
        data: Bytes,
        direct: bool,
        followers: u8,
    ) -> Packet {
        let mut p = Packet::new_request(
            ctx,
            if direct {
                Opcode::SyncWrite
            } else {
                Opcode::Write
            },
        );
        if super::is_tiny_extent(extent_id) {
            p.extent_type = ExtentType::Tiny;
        }
        p.partition_id = partition_id;
        p.extent_id = extent_id;
        p.extent_offset = extent_offset;
        p.kernel_offset = kernel_offset;
        p.remaining_followers = followers;
        p.crc = crc32fast::hash(&data);
        p.data = data;
        p
    }

    /// In-place overwrite of already-durable extent bytes.
    pub fn new_overwrite(
        ctx: &CodecContext,
        partition_id: u64,
        extent_id: u64,
        extent_offset: i64,
        kernel_offset: u64,
        data: Bytes,
        direct: bool,
    ) -> Packet {
        let mut p = Packet::new_request(
            ctx,
            if direct {
                Opcode::SyncRandomWrite
            } else {
                Opcode::RandomWrite
            },
        );
        p.partition_id = partition_id;
        p.extent_id = extent_id;
        p.extent_offset = extent_offset;
        p.kernel_offset = kernel_offset;
        p.crc = crc32fast::hash(&data);
        p.data = data;
        p
    }

    /// Read request for `size` bytes at `extent_offset`, choosing the
    /// follower-capable opcode when the policy allows it.
    pub fn new_stream_read(
        ctx: &CodecContext,
        partition_id: u64,
        extent_id: u64,
        extent_offset: i64,
        size: u32,
        follower_read: bool,
    ) -> Packet {
        let mut p = Packet::new_request(
            ctx,
            if follower_read {
                Opcode::StreamFollowerRead
            } else {
                Opcode::StreamRead
            },
        );
        if super::is_tiny_extent(extent_id) {
            p.extent_type = ExtentType::Tiny;
        }
        p.partition_id = partition_id;
        p.extent_id = extent_id;
        p.extent_offset = extent_offset;
        // Requested length travels in the size slot; there is no payload.
        p.crc = 0;
        p.kernel_offset = size as u64;
        p
    }

    /// Mark an extent deleted, e.g. after its key was replaced.
    pub fn new_mark_delete(
        ctx: &CodecContext,
        partition_id: u64,
        extent_id: u64,
        extent_offset: i64,
        size: u32,
    ) -> Packet {
        let mut p = Packet::new_request(ctx, Opcode::MarkDelete);
        if super::is_tiny_extent(extent_id) {
            p.extent_type = ExtentType::Tiny;
            p.extent_offset = extent_offset;
            p.kernel_offset = size as u64;
        }
        p.partition_id = partition_id;
        p.extent_id = extent_id;
        p
    }

    /// Ask a replica for its applied raft id.
    pub fn new_get_applied_id(ctx: &CodecContext, partition_id: u64) -> Packet {
        let mut p = Packet::new_request(ctx, Opcode::GetAppliedId);
        p.partition_id = partition_id;
        p
    }

    /// Encode the header into `out`, which must be exactly the header size
    /// of `mode`. Infallible by contract.
    pub fn encode_header(&self, mode: WireMode, out: &mut [u8]) {
        debug_assert_eq!(out.len(), mode.header_size());
        match mode {
            WireMode::Normal => {
                let hdr = WireHeader {
                    magic: PACKET_MAGIC,
                    extent_type: self.extent_type.into(),
                    opcode: self.opcode.into(),
                    result_code: self.result_code.into(),
                    remaining_followers: self.remaining_followers,
                    crc: U32::new(self.crc),
                    size: U32::new(self.data.len() as u32),
                    arg_len: U32::new(self.arg.len() as u32),
                    partition_id: U64::new(self.partition_id),
                    extent_id: U64::new(self.extent_id),
                    extent_offset: I64::new(self.extent_offset),
                    request_id: I64::new(self.request_id),
                    kernel_offset: U64::new(self.kernel_offset),
                };
                out.copy_from_slice(hdr.as_bytes());
            }
            WireMode::Dbbak => {
                let hdr = WireHeaderDbbak {
                    magic: PACKET_MAGIC,
                    extent_type: self.extent_type.into(),
                    opcode: self.opcode.into(),
                    result_code: self.result_code.into(),
                    remaining_followers: self.remaining_followers,
                    crc: U32::new(self.crc),
                    size: U32::new(self.data.len() as u32),
                    arg_len: U32::new(self.arg.len() as u32),
                    partition_id: U32::new(self.partition_id as u32),
                    extent_id: U64::new(self.extent_id),
                    extent_offset: I64::new(self.extent_offset),
                    request_id: I64::new(self.request_id),
                };
                out.copy_from_slice(hdr.as_bytes());
            }
        }
    }

    /// Decode a header slice. Returns the parsed packet shell (no arg/data
    /// yet) plus the arg and body lengths still to be read.
    pub fn decode_header(mode: WireMode, buf: &[u8]) -> Result<(Packet, usize, usize)> {
        if buf.len() < mode.header_size() {
            return Err(StreamError::BadMessage(format!(
                "short header: {} < {}",
                buf.len(),
                mode.header_size()
            )));
        }
        if buf[0] != PACKET_MAGIC {
            return Err(StreamError::BadMagic(buf[0]));
        }
        let bad_field = |what: &str, v: u8| StreamError::BadMessage(format!("{what} {v:#04x}"));
        match mode {
            WireMode::Normal => {
                let hdr = WireHeader::ref_from_bytes(&buf[..HEADER_SIZE])
                    .map_err(|_| StreamError::BadMessage("unparseable header".into()))?;
                let p = Packet {
                    extent_type: ExtentType::try_from(hdr.extent_type)
                        .map_err(|_| bad_field("bad extent type", hdr.extent_type))?,
                    opcode: Opcode::try_from(hdr.opcode)
                        .map_err(|_| bad_field("bad opcode", hdr.opcode))?,
                    result_code: ResultCode::try_from(hdr.result_code)
                        .map_err(|_| bad_field("bad result code", hdr.result_code))?,
                    remaining_followers: hdr.remaining_followers,
                    crc: hdr.crc.get(),
                    partition_id: hdr.partition_id.get(),
                    extent_id: hdr.extent_id.get(),
                    extent_offset: hdr.extent_offset.get(),
                    request_id: hdr.request_id.get(),
                    kernel_offset: hdr.kernel_offset.get(),
                    arg: Bytes::new(),
                    data: Bytes::new(),
                };
                Ok((p, hdr.arg_len.get() as usize, hdr.size.get() as usize))
            }
            WireMode::Dbbak => {
                let hdr = WireHeaderDbbak::ref_from_bytes(&buf[..DBBAK_HEADER_SIZE])
                    .map_err(|_| StreamError::BadMessage("unparseable header".into()))?;
                let p = Packet {
                    extent_type: ExtentType::try_from(hdr.extent_type)
                        .map_err(|_| bad_field("bad extent type", hdr.extent_type))?,
                    opcode: Opcode::try_from(hdr.opcode)
                        .map_err(|_| bad_field("bad opcode", hdr.opcode))?,
                    result_code: ResultCode::try_from(hdr.result_code)
                        .map_err(|_| bad_field("bad result code", hdr.result_code))?,
                    remaining_followers: hdr.remaining_followers,
                    crc: hdr.crc.get(),
                    partition_id: hdr.partition_id.get() as u64,
                    extent_id: hdr.extent_id.get(),
                    extent_offset: hdr.extent_offset.get(),
                    request_id: hdr.request_id.get(),
                    kernel_offset: 0,
                    arg: Bytes::new(),
                    data: Bytes::new(),
                };
                Ok((p, hdr.arg_len.get() as usize, hdr.size.get() as usize))
            }
        }
    }

    /// Write the whole packet to `conn` within `timeout`.
    pub async fn write_to<W>(&self, mode: WireMode, conn: &mut W, timeout: Duration) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut hdr = [0u8; HEADER_SIZE];
        let hdr = &mut hdr[..mode.header_size()];
        self.encode_header(mode, hdr);
        let fut = async {
            conn.write_all(hdr).await?;
            if !self.arg.is_empty() {
                conn.write_all(&self.arg).await?;
            }
            if !self.data.is_empty() {
                conn.write_all(&self.data).await?;
            }
            conn.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res.map_err(StreamError::Io),
            Err(_) => Err(StreamError::Timeout(timeout)),
        }
    }

    /// Read one packet from `conn` within `timeout`: header, then the
    /// argument blob, then the payload. Short reads surface as
    /// `BadMessage`.
    pub async fn read_from<R>(mode: WireMode, conn: &mut R, timeout: Duration) -> Result<Packet>
    where
        R: AsyncRead + Unpin + Send,
    {
        let fut = async {
            let mut hdr = [0u8; HEADER_SIZE];
            let hdr = &mut hdr[..mode.header_size()];
            read_exact_or_bad(conn, hdr, "header").await?;
            let (mut packet, arg_len, size) = Packet::decode_header(mode, hdr)?;
            if arg_len > 0 {
                let mut arg = vec![0u8; arg_len];
                read_exact_or_bad(conn, &mut arg, "argument").await?;
                packet.arg = Bytes::from(arg);
            }
            if size > 0 {
                let mut body = vec![0u8; size];
                read_exact_or_bad(conn, &mut body, "body").await?;
                packet.data = Bytes::from(body);
            }
            Ok(packet)
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StreamError::Timeout(timeout)),
        }
    }

    /// Whether `reply` answers this request. Anything else on the
    /// connection is a framing fault.
    pub fn is_reply_to(&self, reply: &Packet) -> bool {
        reply.request_id == self.request_id && reply.opcode == self.opcode
    }

    /// Interpret a reply's result code, turning failures into errors with
    /// the body as message.
    pub fn reply_status(&self) -> Result<()> {
        match self.result_code {
            ResultCode::Ok | ResultCode::Init => Ok(()),
            code => {
                let msg = String::from_utf8_lossy(&self.data);
                Err(StreamError::from_result_code(
                    code,
                    self.partition_id,
                    &msg,
                ))
            }
        }
    }

    /// Verify the payload against the header CRC.
    pub fn verify_crc(&self) -> Result<()> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.crc {
            return Err(StreamError::CrcMismatch {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("opcode", &self.opcode)
            .field("result_code", &self.result_code)
            .field("request_id", &self.request_id)
            .field("partition_id", &self.partition_id)
            .field("extent_id", &self.extent_id)
            .field("extent_offset", &self.extent_offset)
            .field("kernel_offset", &self.kernel_offset)
            .field("size", &self.data.len())
            .finish()
    }
}

async fn read_exact_or_bad<R>(conn: &mut R, buf: &mut [u8], what: &str) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    match conn.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(StreamError::BadMessage(
            format!("short read of {} ({} bytes wanted)", what, buf.len()),
        )),
        Err(e) => Err(StreamError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CodecContext {
        CodecContext::new(WireMode::Normal)
    }

    #[test]
    fn header_roundtrip() {
        let ctx = ctx();
        let p = Packet::new_write(&ctx, 17, 1032, 4096, 1 << 20, Bytes::from_static(b"abc"), true, 2);
        let mut buf = [0u8; HEADER_SIZE];
        p.encode_header(WireMode::Normal, &mut buf);
        assert_eq!(buf[0], PACKET_MAGIC);

        let (decoded, arg_len, size) = Packet::decode_header(WireMode::Normal, &buf).unwrap();
        assert_eq!(decoded.opcode, Opcode::SyncWrite);
        assert_eq!(decoded.partition_id, 17);
        assert_eq!(decoded.extent_id, 1032);
        assert_eq!(decoded.extent_offset, 4096);
        assert_eq!(decoded.kernel_offset, 1 << 20);
        assert_eq!(decoded.request_id, p.request_id);
        assert_eq!(decoded.crc, crc32fast::hash(b"abc"));
        assert_eq!(arg_len, 0);
        assert_eq!(size, 3);
    }

    #[test]
    fn dbbak_header_roundtrip() {
        let ctx = CodecContext::new(WireMode::Dbbak);
        let p = Packet::new_overwrite(&ctx, 9, 200, 512, 0, Bytes::from_static(b"xy"), false);
        let mut buf = [0u8; DBBAK_HEADER_SIZE];
        p.encode_header(WireMode::Dbbak, &mut buf);

        let (decoded, _, size) = Packet::decode_header(WireMode::Dbbak, &buf).unwrap();
        assert_eq!(decoded.opcode, Opcode::RandomWrite);
        assert_eq!(decoded.partition_id, 9);
        assert_eq!(decoded.extent_id, 200);
        // The compatibility layout has no kernel-offset slot.
        assert_eq!(decoded.kernel_offset, 0);
        assert_eq!(size, 2);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0x12;
        assert!(matches!(
            Packet::decode_header(WireMode::Normal, &buf),
            Err(StreamError::BadMagic(0x12))
        ));
    }

    #[test]
    fn request_ids_are_monotonic() {
        let ctx = ctx();
        let a = Packet::new_request(&ctx, Opcode::StreamRead);
        let b = Packet::new_request(&ctx, Opcode::StreamRead);
        assert!(b.request_id > a.request_id);
    }

    #[test]
    fn reply_matching() {
        let ctx = ctx();
        let req = Packet::new_stream_read(&ctx, 1, 100, 0, 1024, false);
        let mut reply = req.clone();
        reply.result_code = ResultCode::Ok;
        assert!(req.is_reply_to(&reply));

        let mut wrong_id = reply.clone();
        wrong_id.request_id += 1;
        assert!(!req.is_reply_to(&wrong_id));

        let mut wrong_op = reply.clone();
        wrong_op.opcode = Opcode::Read;
        assert!(!req.is_reply_to(&wrong_op));
    }

    #[test]
    fn reply_status_maps_errors() {
        let ctx = ctx();
        let mut p = Packet::new_stream_read(&ctx, 5, 70, 0, 16, false);
        p.result_code = ResultCode::TryOtherAddr;
        p.data = Bytes::from_static(b"leader changed");
        assert!(matches!(
            p.reply_status(),
            Err(StreamError::TryOtherAddr(_))
        ));

        p.result_code = ResultCode::Ok;
        assert!(p.reply_status().is_ok());
    }

    #[tokio::test]
    async fn wire_roundtrip() {
        let ctx = ctx();
        let p = Packet::new_write(
            &ctx,
            3,
            999,
            0,
            0,
            Bytes::from(vec![7u8; 1000]),
            false,
            0,
        );
        let mut wire = Vec::new();
        p.write_to(WireMode::Normal, &mut wire, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + 1000);

        let mut cursor = std::io::Cursor::new(wire);
        let back = Packet::read_from(WireMode::Normal, &mut cursor, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(p.is_reply_to(&back));
        assert_eq!(back.data, p.data);
        back.verify_crc().unwrap();
    }

    #[tokio::test]
    async fn truncated_stream_is_bad_message() {
        let ctx = ctx();
        let p = Packet::new_write(&ctx, 3, 999, 0, 0, Bytes::from(vec![1u8; 64]), false, 0);
        let mut wire = Vec::new();
        p.write_to(WireMode::Normal, &mut wire, Duration::from_secs(1))
            .await
            .unwrap();
        wire.truncate(HEADER_SIZE + 10);

        let mut cursor = std::io::Cursor::new(wire);
        let err = Packet::read_from(WireMode::Normal, &mut cursor, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::BadMessage(_)));
    }
}
