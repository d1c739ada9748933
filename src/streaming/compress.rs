//! Block compression for stream bodies.
//!
//! The sender feeds everything after the preamble (frame headers and
//! payloads) through a `BlockWriter`; the receiver mirrors it with a
//! `BlockReader`. Each block on the wire:
//!
//! ```text
//! raw_len:u32 | stored_len:u32 | [xxh3:u64] | data (stored_len & LEN_MASK bytes)
//! ```
//!
//! The high bit of `stored_len` marks blocks kept uncompressed because the
//! codec did not shrink them.

use crate::error::{Result, TransportError};
use serde::Deserialize;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use xxhash_rust::xxh3::xxh3_64;

const STORED_FLAG: u32 = 1 << 31;
const LEN_MASK: u32 = !STORED_FLAG;

/// Default zstd level
const ZSTD_LEVEL: i32 = 3;

// =============================================================================
// Codecs
// =============================================================================

/// Which block codec compresses a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    Lz4,
    Zstd,
}

impl CodecKind {
    /// Compression indicator carried in the connection preamble.
    pub fn wire_id(kind: Option<CodecKind>) -> u8 {
        match kind {
            None => 0,
            Some(CodecKind::Lz4) => 1,
            Some(CodecKind::Zstd) => 2,
        }
    }

    pub fn from_wire_id(b: u8) -> Option<Option<CodecKind>> {
        match b {
            0 => Some(None),
            1 => Some(Some(CodecKind::Lz4)),
            2 => Some(Some(CodecKind::Zstd)),
            _ => None,
        }
    }

    pub fn codec(self) -> Box<dyn BlockCodec> {
        match self {
            CodecKind::Lz4 => Box::new(Lz4Block),
            CodecKind::Zstd => Box::new(ZstdBlock { level: ZSTD_LEVEL }),
        }
    }
}

/// A stateless block compressor. Every block is compressed independently.
pub trait BlockCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append the compressed form of `input` to `out`.
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Append exactly `raw_len` decompressed bytes to `out`.
    fn decompress(&self, input: &[u8], raw_len: usize, out: &mut Vec<u8>) -> Result<()>;
}

pub struct Lz4Block;

impl BlockCodec for Lz4Block {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.resize(start + lz4_flex::block::get_maximum_output_size(input.len()), 0);
        let n = lz4_flex::block::compress_into(input, &mut out[start..])
            .map_err(TransportError::compression)?;
        out.truncate(start + n);
        Ok(())
    }

    fn decompress(&self, input: &[u8], raw_len: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.resize(start + raw_len, 0);
        let n = lz4_flex::block::decompress_into(input, &mut out[start..])
            .map_err(TransportError::compression)?;
        if n != raw_len {
            return Err(TransportError::Compression(format!(
                "lz4 block decoded to {} bytes, expected {}",
                n, raw_len
            )));
        }
        Ok(())
    }
}

pub struct ZstdBlock {
    level: i32,
}

impl BlockCodec for ZstdBlock {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let compressed =
            zstd::bulk::compress(input, self.level).map_err(TransportError::compression)?;
        out.extend_from_slice(&compressed);
        Ok(())
    }

    fn decompress(&self, input: &[u8], raw_len: usize, out: &mut Vec<u8>) -> Result<()> {
        let raw = zstd::bulk::decompress(input, raw_len).map_err(TransportError::compression)?;
        if raw.len() != raw_len {
            return Err(TransportError::Compression(format!(
                "zstd block decoded to {} bytes, expected {}",
                raw.len(),
                raw_len
            )));
        }
        out.extend_from_slice(&raw);
        Ok(())
    }
}

fn block_header_len(checksum: bool) -> usize {
    if checksum {
        16
    } else {
        8
    }
}

// =============================================================================
// BlockWriter
// =============================================================================

/// Buffers up to `block_max_size` raw bytes, then writes one compressed block.
pub struct BlockWriter<W> {
    inner: W,
    codec: Box<dyn BlockCodec>,
    block_max_size: usize,
    checksum: bool,
    raw: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    raw_total: u64,
    wire_total: u64,
}

impl<W: AsyncWrite + Unpin> BlockWriter<W> {
    pub fn new(inner: W, codec: Box<dyn BlockCodec>, block_max_size: usize, checksum: bool) -> Self {
        Self {
            inner,
            codec,
            block_max_size,
            checksum,
            raw: Vec::with_capacity(block_max_size),
            out: Vec::new(),
            out_pos: 0,
            raw_total: 0,
            wire_total: 0,
        }
    }

    /// Raw bytes accepted so far.
    pub fn raw_bytes(&self) -> u64 {
        self.raw_total
    }

    /// Bytes produced for the wire so far (block headers included).
    pub fn wire_bytes(&self) -> u64 {
        self.wire_total
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Compress the buffered raw bytes into `out`.
    fn seal(&mut self) -> io::Result<()> {
        debug_assert!(self.out.is_empty());
        if self.raw.is_empty() {
            return Ok(());
        }
        let hlen = block_header_len(self.checksum);
        self.out.resize(hlen, 0);
        self.codec
            .compress(&self.raw, &mut self.out)
            .map_err(io::Error::from)?;

        let mut stored_len = (self.out.len() - hlen) as u32;
        if stored_len as usize >= self.raw.len() {
            self.out.truncate(hlen);
            self.out.extend_from_slice(&self.raw);
            stored_len = self.raw.len() as u32 | STORED_FLAG;
        }
        self.out[0..4].copy_from_slice(&(self.raw.len() as u32).to_be_bytes());
        self.out[4..8].copy_from_slice(&stored_len.to_be_bytes());
        if self.checksum {
            self.out[8..16].copy_from_slice(&xxh3_64(&self.raw).to_be_bytes());
        }

        self.wire_total += self.out.len() as u64;
        self.raw.clear();
        Ok(())
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BlockWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let room = this.block_max_size - this.raw.len();
        let n = room.min(buf.len());
        this.raw.extend_from_slice(&buf[..n]);
        this.raw_total += n as u64;
        if this.raw.len() == this.block_max_size {
            this.seal()?;
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        if !this.raw.is_empty() {
            this.seal()?;
            ready!(this.poll_drain(cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// =============================================================================
// BlockReader
// =============================================================================

enum ReadPhase {
    Header,
    Body {
        raw_len: usize,
        stored: bool,
        cksum: Option<u64>,
    },
}

/// Inverse of `BlockWriter`: yields the raw byte stream.
pub struct BlockReader<R> {
    inner: R,
    codec: Box<dyn BlockCodec>,
    block_max_size: usize,
    checksum: bool,
    phase: ReadPhase,
    hdr: [u8; 16],
    hdr_filled: usize,
    comp: Vec<u8>,
    comp_filled: usize,
    raw: Vec<u8>,
    raw_pos: usize,
}

fn poll_fill<R: AsyncRead + Unpin>(
    r: &mut R,
    cx: &mut Context<'_>,
    dst: &mut [u8],
    filled: &mut usize,
) -> Poll<io::Result<bool>> {
    while *filled < dst.len() {
        let mut rb = ReadBuf::new(&mut dst[*filled..]);
        ready!(Pin::new(&mut *r).poll_read(cx, &mut rb))?;
        let n = rb.filled().len();
        if n == 0 {
            return Poll::Ready(Ok(false));
        }
        *filled += n;
    }
    Poll::Ready(Ok(true))
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl<R: AsyncRead + Unpin> BlockReader<R> {
    pub fn new(inner: R, codec: Box<dyn BlockCodec>, block_max_size: usize, checksum: bool) -> Self {
        Self {
            inner,
            codec,
            block_max_size,
            checksum,
            phase: ReadPhase::Header,
            hdr: [0u8; 16],
            hdr_filled: 0,
            comp: Vec::new(),
            comp_filled: 0,
            raw: Vec::with_capacity(block_max_size),
            raw_pos: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn parse_header(&mut self) -> io::Result<()> {
        let raw_len = u32::from_be_bytes([self.hdr[0], self.hdr[1], self.hdr[2], self.hdr[3]]);
        let stored_len = u32::from_be_bytes([self.hdr[4], self.hdr[5], self.hdr[6], self.hdr[7]]);
        let stored = stored_len & STORED_FLAG != 0;
        let data_len = (stored_len & LEN_MASK) as usize;
        let raw_len = raw_len as usize;

        if raw_len == 0 || raw_len > self.block_max_size {
            return Err(invalid(format!(
                "{} block raw length {} outside (0, {}]",
                self.codec.name(),
                raw_len,
                self.block_max_size
            )));
        }
        // Writers store a block raw whenever compression did not shrink it
        let valid = if stored {
            data_len == raw_len
        } else {
            data_len < raw_len
        };
        if !valid {
            return Err(invalid(format!(
                "{} block stored length {} invalid for raw length {}",
                self.codec.name(),
                data_len,
                raw_len
            )));
        }
        let cksum = if self.checksum {
            let mut b = [0u8; 8];
            b.copy_from_slice(&self.hdr[8..16]);
            Some(u64::from_be_bytes(b))
        } else {
            None
        };

        self.comp.clear();
        self.comp.resize(data_len, 0);
        self.comp_filled = 0;
        self.phase = ReadPhase::Body {
            raw_len,
            stored,
            cksum,
        };
        Ok(())
    }

    fn unseal(&mut self, raw_len: usize, stored: bool, cksum: Option<u64>) -> io::Result<()> {
        self.raw.clear();
        self.raw_pos = 0;
        if stored {
            self.raw.extend_from_slice(&self.comp);
        } else {
            self.codec
                .decompress(&self.comp, raw_len, &mut self.raw)
                .map_err(io::Error::from)?;
        }
        if let Some(expected) = cksum {
            let actual = xxh3_64(&self.raw);
            if actual != expected {
                return Err(invalid(format!(
                    "{} block checksum mismatch: {:016x} != {:016x}",
                    self.codec.name(),
                    actual,
                    expected
                )));
            }
        }
        self.phase = ReadPhase::Header;
        self.hdr_filled = 0;
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BlockReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.raw_pos < this.raw.len() {
                let n = (this.raw.len() - this.raw_pos).min(buf.remaining());
                buf.put_slice(&this.raw[this.raw_pos..this.raw_pos + n]);
                this.raw_pos += n;
                return Poll::Ready(Ok(()));
            }
            match this.phase {
                ReadPhase::Header => {
                    let hlen = block_header_len(this.checksum);
                    let complete = ready!(poll_fill(
                        &mut this.inner,
                        cx,
                        &mut this.hdr[..hlen],
                        &mut this.hdr_filled
                    ))?;
                    if !complete {
                        if this.hdr_filled == 0 {
                            // Clean end between blocks
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    this.parse_header()?;
                }
                ReadPhase::Body {
                    raw_len,
                    stored,
                    cksum,
                } => {
                    let complete = ready!(poll_fill(
                        &mut this.inner,
                        cx,
                        &mut this.comp,
                        &mut this.comp_filled
                    ))?;
                    if !complete {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    this.unseal(raw_len, stored, cksum)?;
                }
            }
        }
    }
}

// =============================================================================
// Session-level wrappers
// =============================================================================

/// Outgoing body: plain or block-compressed, decided once per session.
pub enum CompressWriter<W> {
    Plain(W),
    Block(BlockWriter<W>),
}

impl<W: AsyncWrite + Unpin> CompressWriter<W> {
    pub fn new(inner: W, codec: Option<CodecKind>, block_max_size: usize, checksum: bool) -> Self {
        match codec {
            None => CompressWriter::Plain(inner),
            Some(kind) => CompressWriter::Block(BlockWriter::new(
                inner,
                kind.codec(),
                block_max_size,
                checksum,
            )),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, CompressWriter::Block(_))
    }

    /// Compressed bytes produced so far; 0 when uncompressed.
    pub fn wire_bytes(&self) -> u64 {
        match self {
            CompressWriter::Plain(_) => 0,
            CompressWriter::Block(w) => w.wire_bytes(),
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        match self {
            CompressWriter::Plain(w) => w,
            CompressWriter::Block(w) => w.get_mut(),
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CompressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            CompressWriter::Plain(w) => Pin::new(w).poll_write(cx, buf),
            CompressWriter::Block(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CompressWriter::Plain(w) => Pin::new(w).poll_flush(cx),
            CompressWriter::Block(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            CompressWriter::Plain(w) => Pin::new(w).poll_shutdown(cx),
            CompressWriter::Block(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// Incoming body, mirror of `CompressWriter`.
pub enum DecompressReader<R> {
    Plain(R),
    Block(BlockReader<R>),
}

impl<R: AsyncRead + Unpin> DecompressReader<R> {
    pub fn new(inner: R, codec: Option<CodecKind>, block_max_size: usize, checksum: bool) -> Self {
        match codec {
            None => DecompressReader::Plain(inner),
            Some(kind) => DecompressReader::Block(BlockReader::new(
                inner,
                kind.codec(),
                block_max_size,
                checksum,
            )),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecompressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DecompressReader::Plain(r) => Pin::new(r).poll_read(cx, buf),
            DecompressReader::Block(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| b"object-storage "[i % 15]).collect()
    }

    async fn roundtrip(kind: CodecKind, block: usize, checksum: bool, payload: &[u8]) -> (Vec<u8>, u64) {
        let mut w = BlockWriter::new(Vec::new(), kind.codec(), block, checksum);
        w.write_all(payload).await.unwrap();
        w.flush().await.unwrap();
        let wire_bytes = w.wire_bytes();
        assert_eq!(w.raw_bytes(), payload.len() as u64);
        let wire = w.into_inner();
        assert_eq!(wire.len() as u64, wire_bytes);

        let mut r = BlockReader::new(&wire[..], kind.codec(), block, checksum);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        (out, wire_bytes)
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (out, wire) = roundtrip(CodecKind::Lz4, 4096, false, &[]).await;
        assert!(out.is_empty());
        assert_eq!(wire, 0);
    }

    #[tokio::test]
    async fn test_single_block() {
        let payload = compressible(1000);
        let (out, wire) = roundtrip(CodecKind::Lz4, 4096, false, &payload).await;
        assert_eq!(out, payload);
        assert!(wire < payload.len() as u64);
    }

    #[tokio::test]
    async fn test_multi_block_with_checksum() {
        let payload = compressible(4096 * 5 + 17);
        for kind in [CodecKind::Lz4, CodecKind::Zstd] {
            let (out, _) = roundtrip(kind, 4096, true, &payload).await;
            assert_eq!(out, payload, "codec {:?}", kind);
        }
    }

    #[tokio::test]
    async fn test_incompressible_block_is_stored() {
        // xorshift noise does not compress
        let mut x = 0x9E3779B97F4A7C15u64;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();
        let (out, wire) = roundtrip(CodecKind::Lz4, 4096, false, &payload).await;
        assert_eq!(out, payload);
        assert_eq!(wire, 4096 + 8);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_detected() {
        let payload = compressible(2000);
        let mut w = BlockWriter::new(Vec::new(), CodecKind::Lz4.codec(), 4096, true);
        w.write_all(&payload).await.unwrap();
        w.flush().await.unwrap();
        let mut wire = w.into_inner();
        wire[9] ^= 0xFF;

        let mut r = BlockReader::new(&wire[..], CodecKind::Lz4.codec(), 4096, true);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_block() {
        let payload = compressible(3000);
        let mut w = BlockWriter::new(Vec::new(), CodecKind::Lz4.codec(), 4096, false);
        w.write_all(&payload).await.unwrap();
        w.flush().await.unwrap();
        let wire = w.into_inner();

        let mut r = BlockReader::new(&wire[..wire.len() - 3], CodecKind::Lz4.codec(), 4096, false);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_block_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(8192u32).to_be_bytes());
        wire.extend_from_slice(&(10u32).to_be_bytes());
        wire.extend_from_slice(&[0u8; 10]);
        let mut r = BlockReader::new(&wire[..], CodecKind::Lz4.codec(), 4096, false);
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).await.is_err());
    }

    #[test]
    fn test_wire_ids() {
        for kind in [None, Some(CodecKind::Lz4), Some(CodecKind::Zstd)] {
            assert_eq!(CodecKind::from_wire_id(CodecKind::wire_id(kind)), Some(kind));
        }
        assert_eq!(CodecKind::from_wire_id(7), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn prop_decompress_inverts_compress(
            payload in proptest::collection::vec(any::<u8>(), 0..20_000),
            chunk in 1usize..5000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let out = rt.block_on(async {
                let mut w = BlockWriter::new(Vec::new(), CodecKind::Lz4.codec(), 4096, false);
                for piece in payload.chunks(chunk) {
                    w.write_all(piece).await.unwrap();
                }
                w.shutdown().await.unwrap();
                let wire = w.into_inner();
                let mut r = BlockReader::new(&wire[..], CodecKind::Lz4.codec(), 4096, false);
                let mut out = Vec::new();
                r.read_to_end(&mut out).await.unwrap();
                out
            });
            prop_assert_eq!(out, payload);
        }
    }
}
