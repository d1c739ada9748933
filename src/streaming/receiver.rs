//! Receiving side: routing table and per-connection frame loop.
//!
//! A `Mux` maps `/<api-version>/<network>/<transport-name>` to a `Handler`.
//! Every inbound connection is served by `serve_conn`:
//!
//! 1. Read the preamble, resolve the route, check the session id.
//! 2. Answer one accept-status byte.
//! 3. Decode frames (through the decompressor when the session is
//!    compressed) and hand each object to the handler with a reader bounded
//!    to exactly `size` bytes.
//! 4. On the end-of-stream frame, answer `END_ACK` and close.

use crate::config::{MuxConfig, MAX_BLOCK_MAX_SIZE, MIN_BLOCK_MAX_SIZE};
use crate::error::{FrameError, Result, TransportError};
use crate::streaming::compress::DecompressReader;
use crate::streaming::header::Header;
use crate::streaming::protocol::{
    read_frame, read_preamble, route_path, write_status, AcceptStatus, Frame, Preamble,
    PreambleFlags, END_ACK,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, Take};
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

/// Application callback for one route.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called once per object, in wire order. `body` yields exactly
    /// `hdr.size()` bytes; whatever the handler leaves unread is discarded.
    async fn receive(&self, hdr: Header, body: &mut ObjectReader<'_>) -> anyhow::Result<()>;

    /// Receive-side failure that closed a connection on this route.
    fn on_error(&self, _err: &TransportError) {}
}

/// Payload of one object, bounded to its declared size.
pub struct ObjectReader<'a> {
    inner: Take<&'a mut (dyn AsyncRead + Send + Unpin)>,
    size: u64,
}

impl<'a> ObjectReader<'a> {
    fn new(inner: &'a mut (dyn AsyncRead + Send + Unpin), size: u64) -> Self {
        Self {
            inner: inner.take(size),
            size,
        }
    }

    /// Declared object size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not yet read
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    pub async fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.remaining().min(16 * 1024 * 1024) as usize);
        self.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Skip the unread rest. A connection that ends early is a framing error.
    async fn drain(&mut self) -> Result<()> {
        let left = self.remaining();
        if left == 0 {
            return Ok(());
        }
        let n = tokio::io::copy(&mut self.inner, &mut tokio::io::sink()).await?;
        if n < left {
            let read = self.size - left + n;
            return Err(FrameError::Truncated {
                need: self.size as usize,
                have: read as usize,
            }
            .into());
        }
        Ok(())
    }
}

impl AsyncRead for ObjectReader<'_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        // A short body must not look like a complete one
        if buf.filled().len() == before && buf.remaining() > 0 && self.remaining() > 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "object body ended after {} of {} bytes",
                    self.size - self.remaining(),
                    self.size
                ),
            )));
        }
        Poll::Ready(Ok(()))
    }
}

struct Route {
    network: String,
    trname: String,
    handler: Arc<dyn Handler>,
}

/// (route path, origin)
type SessionKey = (String, String);

/// Routing table plus last-seen session per sender.
pub struct Mux {
    config: MuxConfig,
    routes: RwLock<HashMap<String, Arc<Route>>>,
    sessions: Mutex<HashMap<SessionKey, u64>>,
}

impl Mux {
    pub fn new(config: MuxConfig) -> Self {
        Self {
            config,
            routes: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Register `handler` for (network, trname) and return its route path.
    pub fn register(
        &self,
        network: &str,
        trname: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<String> {
        let path = route_path(&self.config.api_version, network, trname);
        let mut routes = self
            .routes
            .write()
            .map_err(|_| TransportError::Config("route table poisoned".into()))?;
        if routes.contains_key(&path) {
            return Err(TransportError::DuplicateRoute {
                network: network.to_string(),
                trname: trname.to_string(),
            });
        }
        routes.insert(
            path.clone(),
            Arc::new(Route {
                network: network.to_string(),
                trname: trname.to_string(),
                handler,
            }),
        );
        debug!(path = %path, "registered route");
        Ok(path)
    }

    /// Remove a route. Connections already being served keep their handler.
    pub fn unregister(&self, network: &str, trname: &str) -> bool {
        let path = route_path(&self.config.api_version, network, trname);
        let removed = self
            .routes
            .write()
            .map(|mut r| r.remove(&path).is_some())
            .unwrap_or(false);
        if removed {
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.retain(|(p, _), _| *p != path);
            }
            debug!(path = %path, "unregistered route");
        }
        removed
    }

    pub fn routes(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .routes
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.read().ok()?.get(path).cloned()
    }

    /// Record `session_id` as current for `key` unless a newer one was seen.
    fn begin_session(&self, key: &SessionKey, session_id: u64) -> bool {
        let Ok(mut sessions) = self.sessions.lock() else {
            return false;
        };
        match sessions.get(key) {
            Some(&last) if session_id < last => false,
            _ => {
                sessions.insert(key.clone(), session_id);
                true
            }
        }
    }

    /// Forget `key` if `session_id` is still its current session.
    fn end_session(&self, key: &SessionKey, session_id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(key) == Some(&session_id) {
                sessions.remove(key);
            }
        }
    }

    /// Senders with an open or unfinished session.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn is_current(&self, key: &SessionKey, session_id: u64) -> bool {
        self.sessions
            .lock()
            .map(|s| s.get(key).copied() == Some(session_id))
            .unwrap_or(false)
    }

    /// Accept loop. Each connection is served on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (sock, peer) = listener.accept().await?;
            if let Err(e) = sock.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {}", e);
            }
            let mux = self.clone();
            tokio::spawn(async move {
                if let Err(e) = mux.serve_conn(sock).await {
                    debug!(%peer, "connection closed with error: {}", e);
                }
            });
        }
    }

    /// Serve one connection to completion.
    /// Returns the number of objects received.
    pub async fn serve_conn<S>(&self, io: S) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = BufReader::with_capacity(self.config.read_buffer_size, io);

        let preamble = match read_preamble(&mut conn).await {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, TransportError::Framing(_)) {
                    let _ = write_status(&mut conn, AcceptStatus::BadPreamble).await;
                }
                warn!("rejecting connection: {}", e);
                return Err(e);
            }
        };
        if let Err(e) = check_preamble(&preamble) {
            warn!(path = %preamble.path, "rejecting connection: {}", e);
            let _ = write_status(&mut conn, AcceptStatus::BadPreamble).await;
            return Err(e);
        }

        let Some(route) = self.resolve(&preamble.path) else {
            warn!(path = %preamble.path, origin = %preamble.origin, "unknown route");
            let _ = write_status(&mut conn, AcceptStatus::UnknownRoute).await;
            return Err(TransportError::UnknownRoute(preamble.path));
        };

        let key = (preamble.path.clone(), preamble.origin.clone());
        if !self.begin_session(&key, preamble.session_id) {
            warn!(
                path = %preamble.path,
                origin = %preamble.origin,
                session = preamble.session_id,
                "stale session"
            );
            let _ = write_status(&mut conn, AcceptStatus::StaleSession).await;
            return Err(AcceptStatus::StaleSession.into());
        }
        write_status(&mut conn, AcceptStatus::Accepted).await?;
        debug!(
            path = %preamble.path,
            origin = %preamble.origin,
            session = preamble.session_id,
            compression = ?preamble.compression,
            "session open"
        );

        match self.recv_frames(&route, &key, &preamble, &mut conn).await {
            Ok(count) => {
                debug!(
                    path = %preamble.path,
                    session = preamble.session_id,
                    objects = count,
                    "session closed"
                );
                Ok(count)
            }
            Err(e) => {
                error!(
                    network = %route.network,
                    trname = %route.trname,
                    session = preamble.session_id,
                    "receive failed: {}",
                    e
                );
                route.handler.on_error(&e);
                Err(e)
            }
        }
    }

    async fn recv_frames<S>(
        &self,
        route: &Route,
        key: &SessionKey,
        preamble: &Preamble,
        conn: &mut BufReader<S>,
    ) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut body = DecompressReader::new(
            &mut *conn,
            preamble.compression,
            preamble.block_max_size as usize,
            preamble.flags.contains(PreambleFlags::BLOCK_CHECKSUM),
        );
        let mut scratch = Vec::new();
        let mut count = 0u64;
        let mut discarded = 0u64;

        loop {
            let frame = match read_frame(&mut body, self.config.max_header_size, &mut scratch).await? {
                Some(frame) => frame,
                None => {
                    // Sender went away without an end-of-stream frame
                    debug!(path = %key.0, session = preamble.session_id, "peer closed mid-session");
                    return Ok(count);
                }
            };
            let hdr = match frame {
                Frame::End => break,
                Frame::Object(hdr) => hdr,
            };

            let size = hdr.size();
            let current = self.is_current(key, preamble.session_id);
            let mut reader = ObjectReader::new(&mut body, size);
            if current {
                let name = hdr.to_string();
                if let Err(e) = route.handler.receive(hdr, &mut reader).await {
                    warn!(path = %key.0, object = %name, "handler failed: {:#}", e);
                }
                count += 1;
            } else {
                discarded += 1;
            }
            reader.drain().await?;
        }
        drop(body);

        if discarded > 0 {
            warn!(
                path = %key.0,
                origin = %key.1,
                session = preamble.session_id,
                discarded,
                "discarded objects of superseded session"
            );
        }
        // Cleanly ended: the sender will open any later session with a
        // larger id, so its entry can go
        self.end_session(key, preamble.session_id);
        conn.write_u8(END_ACK).await?;
        conn.flush().await?;
        let _ = conn.shutdown().await;
        Ok(count)
    }
}

fn check_preamble(p: &Preamble) -> Result<()> {
    if p.compression.is_some()
        && !(MIN_BLOCK_MAX_SIZE..=MAX_BLOCK_MAX_SIZE).contains(&(p.block_max_size as usize))
    {
        return Err(FrameError::Malformed(format!(
            "block size {} outside [{}, {}]",
            p.block_max_size, MIN_BLOCK_MAX_SIZE, MAX_BLOCK_MAX_SIZE
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::compress::CodecKind;
    use crate::streaming::protocol::{encode_end, encode_header, read_status};
    use tokio::io::{duplex, AsyncReadExt};

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(Header, Vec<u8>)>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Collect {
        async fn receive(&self, hdr: Header, body: &mut ObjectReader<'_>) -> anyhow::Result<()> {
            let data = body.read_all().await?;
            self.seen.lock().unwrap().push((hdr, data));
            Ok(())
        }

        fn on_error(&self, err: &TransportError) {
            self.errors.lock().unwrap().push(err.to_string());
        }
    }

    fn preamble(path: &str, session_id: u64) -> Preamble {
        Preamble {
            path: path.to_string(),
            origin: "test".to_string(),
            session_id,
            compression: None,
            block_max_size: 0,
            flags: PreambleFlags::empty(),
        }
    }

    #[test]
    fn test_register_duplicate() {
        let mux = Mux::new(MuxConfig::default());
        let h = Arc::new(Collect::default());
        let path = mux.register("data", "ec", h.clone()).unwrap();
        assert_eq!(path, "/v1/data/ec");
        assert!(matches!(
            mux.register("data", "ec", h.clone()),
            Err(TransportError::DuplicateRoute { .. })
        ));
        mux.register("control", "ec", h.clone()).unwrap();
        assert_eq!(mux.routes(), vec!["/v1/control/ec", "/v1/data/ec"]);

        assert!(mux.unregister("data", "ec"));
        assert!(!mux.unregister("data", "ec"));
        mux.register("data", "ec", h).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_route_rejected_before_frames() {
        let mux = Mux::new(MuxConfig::default());
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(async move { mux.serve_conn(server).await });

        client.write_all(&preamble("/v1/nope/x", 1).encode().unwrap()).await.unwrap();
        assert_eq!(read_status(&mut client).await.unwrap(), AcceptStatus::UnknownRoute);
        assert!(matches!(
            task.await.unwrap(),
            Err(TransportError::UnknownRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_preamble() {
        let mux = Mux::new(MuxConfig::default());
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move { mux.serve_conn(server).await });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(read_status(&mut client).await.unwrap(), AcceptStatus::BadPreamble);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_frames_and_end_ack() {
        let mux = Arc::new(Mux::new(MuxConfig::default()));
        let h = Arc::new(Collect::default());
        let path = mux.register("data", "t", h.clone()).unwrap();

        let (mut client, server) = duplex(64 * 1024);
        let m = mux.clone();
        let task = tokio::spawn(async move { m.serve_conn(server).await });

        client.write_all(&preamble(&path, 1).encode().unwrap()).await.unwrap();
        assert_eq!(read_status(&mut client).await.unwrap(), AcceptStatus::Accepted);

        client.write_all(&encode_header(&Header::new("b", "one", 3)).unwrap()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.write_all(&encode_header(&Header::new("b", "ping", 0)).unwrap()).await.unwrap();
        client.write_all(&encode_end()).await.unwrap();

        assert_eq!(client.read_u8().await.unwrap(), END_ACK);
        assert_eq!(task.await.unwrap().unwrap(), 2);

        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.name, "one");
        assert_eq!(seen[0].1, b"abc");
        assert_eq!(seen[1].0.name, "ping");
        assert!(seen[1].1.is_empty());
    }

    #[tokio::test]
    async fn test_unread_body_is_skipped() {
        struct Lazy(Mutex<Vec<String>>);

        #[async_trait]
        impl Handler for Lazy {
            async fn receive(&self, hdr: Header, body: &mut ObjectReader<'_>) -> anyhow::Result<()> {
                let mut first = [0u8; 1];
                body.read_exact(&mut first).await?;
                self.0.lock().unwrap().push(format!("{}:{}", hdr.name, first[0] as char));
                anyhow::bail!("not interested")
            }
        }

        let mux = Arc::new(Mux::new(MuxConfig::default()));
        let h = Arc::new(Lazy(Mutex::new(Vec::new())));
        let path = mux.register("data", "lazy", h.clone()).unwrap();
        let (mut client, server) = duplex(64 * 1024);
        let m = mux.clone();
        let task = tokio::spawn(async move { m.serve_conn(server).await });

        client.write_all(&preamble(&path, 1).encode().unwrap()).await.unwrap();
        read_status(&mut client).await.unwrap();
        client.write_all(&encode_header(&Header::new("b", "a", 4)).unwrap()).await.unwrap();
        client.write_all(b"xyzw").await.unwrap();
        client.write_all(&encode_header(&Header::new("b", "b", 2)).unwrap()).await.unwrap();
        client.write_all(b"qr").await.unwrap();
        client.write_all(&encode_end()).await.unwrap();

        assert_eq!(client.read_u8().await.unwrap(), END_ACK);
        assert_eq!(task.await.unwrap().unwrap(), 2);
        assert_eq!(*h.0.lock().unwrap(), vec!["a:x", "b:q"]);
    }

    #[tokio::test]
    async fn test_compressed_session() {
        use crate::streaming::compress::CompressWriter;

        let mux = Arc::new(Mux::new(MuxConfig::default()));
        let h = Arc::new(Collect::default());
        let path = mux.register("data", "z", h.clone()).unwrap();
        let (mut client, server) = duplex(64 * 1024);
        let m = mux.clone();
        let task = tokio::spawn(async move { m.serve_conn(server).await });

        let mut p = preamble(&path, 9);
        p.compression = Some(CodecKind::Lz4);
        p.block_max_size = 4096;
        p.flags = PreambleFlags::BLOCK_CHECKSUM;
        client.write_all(&p.encode().unwrap()).await.unwrap();
        read_status(&mut client).await.unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        let mut w = CompressWriter::new(&mut client, Some(CodecKind::Lz4), 4096, true);
        w.write_all(&encode_header(&Header::new("b", "big", payload.len() as u64)).unwrap())
            .await
            .unwrap();
        w.write_all(&payload).await.unwrap();
        w.write_all(&encode_end()).await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        assert_eq!(client.read_u8().await.unwrap(), END_ACK);
        task.await.unwrap().unwrap();
        assert_eq!(h.seen.lock().unwrap()[0].1, payload);
    }

    #[tokio::test]
    async fn test_truncated_body_reports_error() {
        let mux = Arc::new(Mux::new(MuxConfig::default()));
        let h = Arc::new(Collect::default());
        let path = mux.register("data", "t", h.clone()).unwrap();
        let (mut client, server) = duplex(64 * 1024);
        let m = mux.clone();
        let task = tokio::spawn(async move { m.serve_conn(server).await });

        client.write_all(&preamble(&path, 1).encode().unwrap()).await.unwrap();
        read_status(&mut client).await.unwrap();
        client.write_all(&encode_header(&Header::new("b", "cut", 100)).unwrap()).await.unwrap();
        client.write_all(&[1u8; 10]).await.unwrap();
        drop(client);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Framing(FrameError::Truncated { need: 100, have: 10 })));
        assert_eq!(h.errors.lock().unwrap().len(), 1);
        // The partial object never reached the handler as a good one
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_body_read_fails() {
        let mut wire: &[u8] = &[7u8; 10];
        let src: &mut (dyn AsyncRead + Send + Unpin) = &mut wire;
        let mut body = ObjectReader::new(src, 100);

        let err = body.read_all().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(body.remaining(), 90);
        assert!(matches!(
            body.drain().await,
            Err(TransportError::Framing(FrameError::Truncated { need: 100, have: 10 }))
        ));
    }

    #[tokio::test]
    async fn test_exact_body_reads_to_end() {
        let mut wire: &[u8] = b"hello, trailing frame bytes";
        let src: &mut (dyn AsyncRead + Send + Unpin) = &mut wire;
        let mut body = ObjectReader::new(src, 5);
        assert_eq!(body.read_all().await.unwrap(), b"hello");
        assert_eq!(body.remaining(), 0);
        body.drain().await.unwrap();
    }

    #[test]
    fn test_session_tracking() {
        let mux = Mux::new(MuxConfig::default());
        let key = ("/v1/a/b".to_string(), "o".to_string());
        assert!(mux.begin_session(&key, 5));
        assert!(mux.is_current(&key, 5));
        assert!(mux.begin_session(&key, 6));
        assert!(!mux.is_current(&key, 5));
        assert!(!mux.begin_session(&key, 5));

        let other = ("/v1/a/b".to_string(), "p".to_string());
        assert!(mux.begin_session(&other, 1));
        assert_eq!(mux.session_count(), 2);

        // Only the current session clears its entry
        mux.end_session(&key, 5);
        assert_eq!(mux.session_count(), 2);
        mux.end_session(&key, 6);
        assert_eq!(mux.session_count(), 1);
        assert!(!mux.is_current(&key, 6));
    }
}
