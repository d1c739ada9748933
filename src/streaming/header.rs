//! Object header carried by every frame.

use bytes::Bytes;
use std::fmt;

/// Checksum descriptor: algorithm name plus its printable value.
/// Computing checksums is up to the caller; the transport only carries them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: String,
    pub value: String,
}

impl Checksum {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Object attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjAttrs {
    /// Payload size in bytes; 0 means header-only
    pub size: u64,
    /// Access time (Unix nanoseconds)
    pub atime: i64,
    /// Modification time (Unix nanoseconds)
    pub mtime: i64,
    pub cksum: Option<Checksum>,
    pub version: String,
}

/// Identity, attributes and caller-defined metadata of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub bucket: String,
    pub name: String,
    pub attrs: ObjAttrs,
    /// Opaque caller metadata, carried verbatim.
    pub opaque: Bytes,
}

impl Header {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            attrs: ObjAttrs {
                size,
                ..Default::default()
            },
            opaque: Bytes::new(),
        }
    }

    pub fn with_opaque(mut self, opaque: impl Into<Bytes>) -> Self {
        self.opaque = opaque.into();
        self
    }

    pub fn with_cksum(mut self, cksum: Checksum) -> Self {
        self.attrs.cksum = Some(cksum);
        self
    }

    pub fn size(&self) -> u64 {
        self.attrs.size
    }

    /// Header-only objects are used for control and heartbeat signaling.
    pub fn is_header_only(&self) -> bool {
        self.attrs.size == 0
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.bucket, self.name, self.attrs.size)
    }
}
