//! Intra-cluster object streaming.
//!
//! Many callers push objects (header + optional payload) into one `Stream`;
//! a single sender task frames them onto one long-lived connection, in
//! order, with bounded buffering. On the other end a `Mux` routes each
//! connection to the `Handler` registered for its route.
//!
//! # Architecture
//!
//! ```text
//! Sender node                                   Receiver node
//! +---------+    +--------------+    +------+    +-----+    +---------+
//! | send()* | -> | burst queue  | -> | task | -> | Mux | -> | Handler |
//! +---------+    +--------------+    +------+    +-----+    +---------+
//!                  (mpsc, burst)    frames, lz4   route,     one call
//!                                   /zstd blocks  session    per object
//! ```
//!
//! # Wire
//!
//! 1. Preamble: route path, origin, session id, compression, block size
//! 2. Accept status byte from the receiver
//! 3. Frames: `len:u32 | header | payload`, optionally block-compressed
//! 4. End-of-stream (`len == 0`), answered with one ack byte

pub mod channel;
pub mod compress;
pub mod dialer;
pub mod header;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod stats;

pub use channel::{Callback, Completion, Payload, SendRequest};
pub use compress::{BlockCodec, BlockReader, BlockWriter, CodecKind, CompressWriter, DecompressReader};
pub use dialer::{Conn, Dialer, LocalDialer, TcpDialer};
pub use header::{Checksum, Header, ObjAttrs};
pub use pool::{BufferPool, SlabPool};
pub use receiver::{Handler, Mux, ObjectReader};
pub use sender::{State, Stream};
pub use stats::{Stats, StatsSnapshot};

pub use protocol::{
    decode_frame, encode_end, encode_header, read_frame, route_path, AcceptStatus, Frame,
    Preamble, PreambleFlags, END_OF_STREAM, PROTOCOL_VERSION,
};
