//! Opening connections for a stream.

use crate::config::StreamConfig;
use crate::streaming::receiver::Mux;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket};
use tracing::debug;

/// A bidirectional byte stream owned by one sender task.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<Box<dyn Conn>>;

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// TCP with optional socket buffer sizes and `TCP_NODELAY`.
pub struct TcpDialer {
    addr: String,
    sndrcv_buf_size: u32,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            sndrcv_buf_size: 0,
        }
    }

    /// SO_SNDBUF / SO_RCVBUF; 0 keeps the OS default.
    pub fn with_buf_size(mut self, size: u32) -> Self {
        self.sndrcv_buf_size = size;
        self
    }

    /// Dialer carrying the socket buffer size of `config`.
    pub fn for_config(addr: impl Into<String>, config: &StreamConfig) -> Self {
        Self::new(addr).with_buf_size(config.sndrcv_buf_size)
    }

    pub fn buf_size(&self) -> u32 {
        self.sndrcv_buf_size
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<Box<dyn Conn>> {
        let mut last_err = None;
        for addr in lookup_host(self.addr.as_str()).await? {
            let sock = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if self.sndrcv_buf_size > 0 {
                sock.set_send_buffer_size(self.sndrcv_buf_size)?;
                sock.set_recv_buffer_size(self.sndrcv_buf_size)?;
            }
            match sock.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(peer = %addr, "connected");
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve", self.addr),
            )
        }))
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

/// Connects straight into an in-process `Mux` over `tokio::io::duplex`.
pub struct LocalDialer {
    mux: Arc<Mux>,
    buf_size: usize,
}

impl LocalDialer {
    pub fn new(mux: Arc<Mux>) -> Self {
        Self {
            mux,
            buf_size: 64 * 1024,
        }
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial(&self) -> io::Result<Box<dyn Conn>> {
        let (client, server) = tokio::io::duplex(self.buf_size);
        let mux = self.mux.clone();
        tokio::spawn(async move {
            if let Err(e) = mux.serve_conn(server).await {
                debug!("local connection closed with error: {}", e);
            }
        });
        Ok(Box::new(client))
    }

    fn peer(&self) -> String {
        "local".to_string()
    }
}
