//! Wire format for object streams.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).
//!
//! Connection: preamble | accept status (receiver -> sender) | frames...
//! Frame:      len:u32 | header (len bytes) | payload (header.size bytes)
//!
//! A zero length prefix is reserved for "end of stream".

use crate::error::{FrameError, Result, TransportError};
use crate::streaming::compress::CodecKind;
use crate::streaming::header::{Checksum, Header, ObjAttrs};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Connection preamble magic
pub const MAGIC: [u8; 4] = *b"OBJS";

/// Protocol version carried in the preamble
pub const PROTOCOL_VERSION: u16 = 1;

/// Width of the frame length prefix
pub const LEN_PREFIX: usize = 4;

/// Length prefix value reserved for end-of-stream
pub const END_OF_STREAM: u32 = 0;

/// Maximum preamble body (8KB)
pub const MAX_PREAMBLE_SIZE: usize = 8 * 1024;

/// Receiver's answer to an end-of-stream frame, sent right before it closes.
pub const END_ACK: u8 = 0xAC;

// Fixed part of an encoded header: bucket_len(2) + name_len(2) + size(8) +
// atime(8) + mtime(8) + flags(1) + opaque_len(4)
const HEADER_FIXED_SIZE: usize = 2 + 2 + 8 + 8 + 8 + 1 + 4;

// =============================================================================
// Header Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u8 {
        const HAS_CKSUM = 1 << 0;
        const HAS_VERSION = 1 << 1;
    }
}

// =============================================================================
// Frames
// =============================================================================

/// A decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Object(Header),
    End,
}

impl Frame {
    pub fn into_header(self) -> Option<Header> {
        match self {
            Frame::Object(hdr) => Some(hdr),
            Frame::End => None,
        }
    }
}

fn put_str16(buf: &mut BytesMut, s: &str, what: &str) -> std::result::Result<(), FrameError> {
    if s.len() > u16::MAX as usize {
        return Err(FrameError::Malformed(format!(
            "{} too long: {} bytes",
            what,
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str16(buf: &mut &[u8], what: &str) -> std::result::Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Malformed(format!("{} length truncated", what)));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FrameError::Malformed(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            buf.remaining()
        )));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| FrameError::Malformed(format!("invalid UTF-8 in {}", what)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

/// Encode a header as a length-prefixed frame header. The payload follows
/// separately on the wire.
pub fn encode_header(hdr: &Header) -> std::result::Result<Bytes, FrameError> {
    let mut flags = AttrFlags::empty();
    let mut len = HEADER_FIXED_SIZE + hdr.bucket.len() + hdr.name.len() + hdr.opaque.len();
    if let Some(ck) = &hdr.attrs.cksum {
        flags |= AttrFlags::HAS_CKSUM;
        len += 2 + ck.kind.len() + 2 + ck.value.len();
    }
    if !hdr.attrs.version.is_empty() {
        flags |= AttrFlags::HAS_VERSION;
        len += 2 + hdr.attrs.version.len();
    }
    if len > u32::MAX as usize || hdr.opaque.len() > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            len,
            max: u32::MAX as usize,
        });
    }

    let mut buf = BytesMut::with_capacity(LEN_PREFIX + len);
    buf.put_u32(len as u32);
    put_str16(&mut buf, &hdr.bucket, "bucket")?;
    put_str16(&mut buf, &hdr.name, "object name")?;
    buf.put_u64(hdr.attrs.size);
    buf.put_i64(hdr.attrs.atime);
    buf.put_i64(hdr.attrs.mtime);
    buf.put_u8(flags.bits());
    if let Some(ck) = &hdr.attrs.cksum {
        put_str16(&mut buf, &ck.kind, "checksum type")?;
        put_str16(&mut buf, &ck.value, "checksum value")?;
    }
    if flags.contains(AttrFlags::HAS_VERSION) {
        put_str16(&mut buf, &hdr.attrs.version, "version")?;
    }
    buf.put_u32(hdr.opaque.len() as u32);
    buf.put_slice(&hdr.opaque);

    debug_assert_eq!(buf.len(), LEN_PREFIX + len);
    Ok(buf.freeze())
}

/// The end-of-stream marker.
pub fn encode_end() -> Bytes {
    Bytes::copy_from_slice(&END_OF_STREAM.to_be_bytes())
}

/// Decode one frame header from the front of `buf`.
/// Returns the frame and the number of bytes consumed (prefix included).
pub fn decode_frame(
    buf: &[u8],
    max_header_size: usize,
) -> std::result::Result<(Frame, usize), FrameError> {
    if buf.len() < LEN_PREFIX {
        return Err(FrameError::Truncated {
            need: LEN_PREFIX,
            have: buf.len(),
        });
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == END_OF_STREAM as usize {
        return Ok((Frame::End, LEN_PREFIX));
    }
    // Validate before looking at the body
    if len > max_header_size {
        return Err(FrameError::TooLarge {
            len,
            max: max_header_size,
        });
    }
    let total = LEN_PREFIX + len;
    if buf.len() < total {
        return Err(FrameError::Truncated {
            need: total,
            have: buf.len(),
        });
    }
    let hdr = decode_header_body(&buf[LEN_PREFIX..total])?;
    Ok((Frame::Object(hdr), total))
}

/// Decode a header body (everything after the length prefix).
pub fn decode_header_body(mut body: &[u8]) -> std::result::Result<Header, FrameError> {
    let buf = &mut body;
    let bucket = get_str16(buf, "bucket")?;
    let name = get_str16(buf, "object name")?;
    if buf.remaining() < 8 + 8 + 8 + 1 {
        return Err(FrameError::Malformed("object attributes truncated".into()));
    }
    let size = buf.get_u64();
    let atime = buf.get_i64();
    let mtime = buf.get_i64();
    let flags = AttrFlags::from_bits(buf.get_u8())
        .ok_or_else(|| FrameError::Malformed("unknown attribute flags".into()))?;

    let cksum = if flags.contains(AttrFlags::HAS_CKSUM) {
        let kind = get_str16(buf, "checksum type")?;
        let value = get_str16(buf, "checksum value")?;
        Some(Checksum { kind, value })
    } else {
        None
    };
    let version = if flags.contains(AttrFlags::HAS_VERSION) {
        get_str16(buf, "version")?
    } else {
        String::new()
    };

    if buf.remaining() < 4 {
        return Err(FrameError::Malformed("opaque length truncated".into()));
    }
    let opaque_len = buf.get_u32() as usize;
    if buf.remaining() != opaque_len {
        return Err(FrameError::Malformed(format!(
            "opaque: declared {} bytes, frame has {}",
            opaque_len,
            buf.remaining()
        )));
    }
    let opaque = Bytes::copy_from_slice(&buf[..opaque_len]);

    Ok(Header {
        bucket,
        name,
        attrs: ObjAttrs {
            size,
            atime,
            mtime,
            cksum,
            version,
        },
        opaque,
    })
}

/// Read the next frame header from the stream.
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_header_size: usize,
    scratch: &mut Vec<u8>,
) -> Result<Option<Frame>> {
    let mut prefix = [0u8; LEN_PREFIX];
    let mut got = 0;
    while got < LEN_PREFIX {
        let n = r.read(&mut prefix[got..]).await?;
        if n == 0 {
            if got == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                need: LEN_PREFIX,
                have: got,
            }
            .into());
        }
        got += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == END_OF_STREAM as usize {
        return Ok(Some(Frame::End));
    }
    // Validate frame size before allocation
    if len > max_header_size {
        return Err(FrameError::TooLarge {
            len,
            max: max_header_size,
        }
        .into());
    }

    scratch.clear();
    scratch.resize(len, 0);
    if let Err(e) = r.read_exact(scratch).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(FrameError::Truncated {
                need: LEN_PREFIX + len,
                have: LEN_PREFIX,
            }
            .into());
        }
        return Err(e.into());
    }
    Ok(Some(Frame::Object(decode_header_body(scratch)?)))
}

// =============================================================================
// Connection preamble
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PreambleFlags: u8 {
        const BLOCK_CHECKSUM = 1 << 0;
    }
}

/// Protocol-level connection headers sent once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    /// `/<api-version>/<network>/<transport-name>`
    pub path: String,
    /// Sender identity, scopes session ids on the receiver.
    pub origin: String,
    pub session_id: u64,
    /// `None` = uncompressed body
    pub compression: Option<CodecKind>,
    pub block_max_size: u32,
    pub flags: PreambleFlags,
}

impl Preamble {
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64 + self.path.len() + self.origin.len());
        put_str16(&mut body, &self.path, "route path")?;
        put_str16(&mut body, &self.origin, "origin")?;
        body.put_u64(self.session_id);
        body.put_u8(CodecKind::wire_id(self.compression));
        body.put_u32(self.block_max_size);
        body.put_u8(self.flags.bits());
        if body.len() > MAX_PREAMBLE_SIZE {
            return Err(FrameError::TooLarge {
                len: body.len(),
                max: MAX_PREAMBLE_SIZE,
            }
            .into());
        }

        let mut buf = BytesMut::with_capacity(4 + 2 + 4 + body.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn decode(body: &[u8]) -> std::result::Result<Self, FrameError> {
        let mut slice = body;
        let path = get_str16(&mut slice, "route path")?;
        let origin = get_str16(&mut slice, "origin")?;
        if slice.remaining() < 8 + 1 + 4 + 1 {
            return Err(FrameError::Malformed("preamble truncated".into()));
        }
        let session_id = slice.get_u64();
        let compression = CodecKind::from_wire_id(slice.get_u8())
            .ok_or_else(|| FrameError::Malformed("unknown compression".into()))?;
        let block_max_size = slice.get_u32();
        let flags = PreambleFlags::from_bits_truncate(slice.get_u8());

        Ok(Self {
            path,
            origin,
            session_id,
            compression,
            block_max_size,
            flags,
        })
    }
}

/// `/<api-version>/<network>/<transport-name>`
pub fn route_path(api_version: &str, network: &str, trname: &str) -> String {
    format!("/{}/{}/{}", api_version, network, trname)
}

/// Read and validate a preamble from a freshly accepted connection.
pub async fn read_preamble<R: AsyncRead + Unpin>(r: &mut R) -> Result<Preamble> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(FrameError::Malformed("bad preamble magic".into()).into());
    }
    let version = r.read_u16().await?;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::Malformed(format!("unsupported protocol version {}", version)).into());
    }
    let len = r.read_u32().await? as usize;
    if len > MAX_PREAMBLE_SIZE {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_PREAMBLE_SIZE,
        }
        .into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Preamble::decode(&body)?)
}

// =============================================================================
// Accept status
// =============================================================================

/// Receiver's one-byte answer to a preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptStatus {
    Accepted = 0,
    UnknownRoute = 1,
    BadPreamble = 2,
    StaleSession = 3,
}

impl AcceptStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnknownRoute),
            2 => Some(Self::BadPreamble),
            3 => Some(Self::StaleSession),
            _ => None,
        }
    }
}

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: AcceptStatus) -> Result<()> {
    w.write_u8(status as u8).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<AcceptStatus> {
    let b = r.read_u8().await?;
    AcceptStatus::from_u8(b)
        .ok_or_else(|| FrameError::Malformed(format!("unknown accept status {}", b)).into())
}

impl From<AcceptStatus> for TransportError {
    fn from(s: AcceptStatus) -> Self {
        TransportError::Rejected(s)
    }
}

// =============================================================================
// Tests
// =============================================================================
