//! objstream - ordered, backpressured object streams between cluster nodes.
//!
//! ```no_run
//! use objstream::config::{MuxConfig, StreamConfig};
//! use objstream::streaming::{LocalDialer, Mux, SendRequest, Stream, Header};
//! # use objstream::streaming::{Handler, ObjectReader};
//! # use std::sync::Arc;
//! # struct Sink;
//! # #[async_trait::async_trait]
//! # impl Handler for Sink {
//! #     async fn receive(&self, _: Header, _: &mut ObjectReader<'_>) -> anyhow::Result<()> { Ok(()) }
//! # }
//! # async fn demo() -> objstream::Result<()> {
//! let mux = Arc::new(Mux::new(MuxConfig::default()));
//! let route = mux.register("data", "replica", Arc::new(Sink))?;
//!
//! let stream: Stream = Stream::new(Arc::new(LocalDialer::new(mux)), route, StreamConfig::default())?;
//! stream
//!     .send(SendRequest::new(Header::new("bucket", "obj", 5)).with_bytes(&b"hello"[..]))
//!     .await?;
//! stream.fin().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod streaming;

pub use error::{FrameError, Result, TransportError};
