//! Stream: one ordered, backpressured object stream to one route.
//!
//! ```text
//! send() ──┐
//! send() ──┼──> burst queue (mpsc, cap = burst) ──> sender task ──> connection
//! send() ──┘                                             │
//!                                             callbacks, stats
//! ```
//!
//! The sender task is the only owner of the connection. It dials lazily on
//! the first request, flushes whenever the queue runs dry, and ends the
//! connection with an end-of-stream frame on `fin` (or after an idle
//! period, when configured). Lifecycle is published through a `watch`
//! channel so `fin` can wait on it and the task can react to `stop`.

use crate::config::{ReconnectPolicy, StreamConfig};
use crate::error::{FrameError, Result, TransportError};
use crate::streaming::channel::{send_queue, Payload, QueueItem, QueueRx, QueueTx, SendRequest};
use crate::streaming::compress::CompressWriter;
use crate::streaming::dialer::{Conn, Dialer};
use crate::streaming::header::Header;
use crate::streaming::pool::{BufferPool, SlabPool};
use crate::streaming::protocol::{
    encode_end, encode_header, read_status, AcceptStatus, Preamble, PreambleFlags, END_ACK,
    LEN_PREFIX,
};
use crate::streaming::stats::{Stats, StatsSnapshot};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest chunk moved from a payload source per read.
const COPY_CHUNK: usize = 64 * 1024;

static STREAM_SEQ: AtomicU64 = AtomicU64::new(0);
static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Session ids are process-wide, strictly increasing and seeded from the
/// wall clock, so a restarted sender reusing an origin still moves forward.
fn next_session_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let next = |cur: u64| if now > cur { now } else { cur + 1 };
    match SESSION_SEQ.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(next(cur))) {
        Ok(prev) | Err(prev) => next(prev),
    }
}

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection yet
    Idle,
    /// Sender task is transmitting
    Active,
    /// `fin` called: queued requests are flushed, new ones refused
    Draining,
    Closed,
    /// Stopped, or failed with a fatal error
    Aborted,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Closed | State::Aborted)
    }

    pub fn accepts_sends(self) -> bool {
        matches!(self, State::Idle | State::Active)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Idle => "idle",
            State::Active => "active",
            State::Draining => "draining",
            State::Closed => "closed",
            State::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// State visible to both the `Stream` handle and its sender task.
struct Shared {
    name: String,
    state: watch::Sender<State>,
    error: Mutex<Option<TransportError>>,
    stats: Stats,
}

impl Shared {
    fn state(&self) -> State {
        *self.state.borrow()
    }

    fn activate(&self) {
        self.state.send_if_modified(|s| {
            if *s == State::Idle {
                *s = State::Active;
                true
            } else {
                false
            }
        });
    }

    fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.accepts_sends() {
                *s = State::Draining;
                true
            } else {
                false
            }
        })
    }

    fn close(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = State::Closed;
                true
            }
        })
    }

    /// First terminal error wins.
    fn abort(&self, err: TransportError) -> bool {
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            if let Ok(mut slot) = self.error.lock() {
                *slot = Some(err);
            }
            *s = State::Aborted;
            true
        })
    }

    fn terminal_error(&self) -> Option<TransportError> {
        self.error.lock().ok().and_then(|e| e.clone())
    }
}

/// An ordered object stream to one receiver route.
///
/// `C` is the caller context carried by every request back to its callback.
pub struct Stream<C = ()> {
    shared: Arc<Shared>,
    tx: QueueTx<C>,
    route: String,
    origin: String,
}

impl<C: Send + 'static> Stream<C> {
    /// Create a stream and spawn its sender task. Must be called from within
    /// a Tokio runtime. No connection is made until the first request.
    pub fn new(dialer: Arc<dyn Dialer>, route: impl Into<String>, config: StreamConfig) -> Result<Self> {
        let pool = Arc::new(SlabPool::new(COPY_CHUNK, config.burst));
        Self::spawn(Some(dialer), route.into(), config, pool)
    }

    /// Like `new`, with caller-provided payload buffers.
    pub fn with_pool(
        dialer: Arc<dyn Dialer>,
        route: impl Into<String>,
        config: StreamConfig,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Self> {
        Self::spawn(Some(dialer), route.into(), config, pool)
    }

    /// A stream that consumes requests without any network I/O.
    pub fn dry_run(route: impl Into<String>, mut config: StreamConfig) -> Result<Self> {
        config.dry_run = true;
        let pool = Arc::new(SlabPool::new(COPY_CHUNK, config.burst));
        Self::spawn(None, route.into(), config, pool)
    }

    fn spawn(
        dialer: Option<Arc<dyn Dialer>>,
        route: String,
        config: StreamConfig,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Self> {
        config.validate()?;
        let config = config.effective();
        if dialer.is_none() && !config.dry_run {
            return Err(TransportError::Config("stream needs a dialer unless dry-run".into()));
        }

        let seq = STREAM_SEQ.fetch_add(1, Ordering::Relaxed);
        let origin = config
            .origin
            .clone()
            .unwrap_or_else(|| format!("{}:{}", std::process::id(), seq));
        let name = format!("stream[{}=>{}]", origin, route);

        let (tx, rx) = send_queue(config.burst);
        let (state_tx, state_rx) = watch::channel(State::Idle);
        let shared = Arc::new(Shared {
            name,
            state: state_tx,
            error: Mutex::new(None),
            stats: Stats::new(),
        });
        debug!(
            stream = %shared.name,
            burst = config.burst,
            dry_run = config.dry_run,
            compressed = config.compressed(),
            "stream created"
        );

        let task = SenderTask {
            shared: shared.clone(),
            rx,
            stop: state_rx,
            dialer,
            config,
            route: route.clone(),
            origin: origin.clone(),
            pool,
            session: None,
            failures: 0,
            touched: false,
        };
        tokio::spawn(task.run());

        Ok(Self {
            shared,
            tx,
            route,
            origin,
        })
    }

    /// Enqueue a request. Waits while `burst` requests are already queued.
    ///
    /// Fails immediately, without invoking the callback, once the stream is
    /// draining or terminated.
    pub async fn send(&self, req: SendRequest<C>) -> Result<()> {
        let state = self.shared.state();
        if !state.accepts_sends() {
            return Err(TransportError::Terminated(state));
        }
        self.tx
            .send(QueueItem::Obj(req))
            .await
            .map_err(|_| TransportError::Terminated(self.shared.state()))
    }

    /// `send` for callers outside the runtime. Panics if called from
    /// within an async context.
    pub fn send_blocking(&self, req: SendRequest<C>) -> Result<()> {
        let state = self.shared.state();
        if !state.accepts_sends() {
            return Err(TransportError::Terminated(state));
        }
        self.tx
            .blocking_send(QueueItem::Obj(req))
            .map_err(|_| TransportError::Terminated(self.shared.state()))
    }

    /// Header-only object (control, heartbeat).
    pub async fn send_header(&self, hdr: Header) -> Result<()>
    where
        C: Default,
    {
        self.send(SendRequest::new(hdr)).await
    }

    /// Stop accepting requests, transmit everything already queued, end the
    /// connection and wait for the receiver's acknowledgement.
    ///
    /// Idempotent: later calls return the same terminal outcome.
    pub async fn fin(&self) -> Result<()> {
        if self.shared.begin_drain() {
            info!(stream = %self.shared.name, "fin");
            // Fails only if the task already aborted; the outcome is below
            let _ = self.tx.send(QueueItem::Fin).await;
        }
        self.wait_terminal().await
    }
}

impl<C> Stream<C> {
    /// Abort without waiting. Every queued and in-flight request completes
    /// with `TransportError::Cancelled` on the sender task.
    pub fn stop(&self) {
        if self.shared.abort(TransportError::Cancelled) {
            info!(stream = %self.shared.name, "stop");
        }
    }

    async fn wait_terminal(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(State::Aborted);
        match state {
            State::Closed => Ok(()),
            _ => Err(self
                .shared
                .terminal_error()
                .unwrap_or(TransportError::Cancelled)),
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Error that aborted the stream, if any.
    pub fn terminal_error(&self) -> Option<TransportError> {
        self.shared.terminal_error()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl<C> fmt::Display for Stream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shared.name)
    }
}

// =============================================================================
// Sender task
// =============================================================================

struct Session {
    id: u64,
    wire: CompressWriter<BufStream<Box<dyn Conn>>>,
    /// `wire.wire_bytes()` already added to stats
    wire_seen: u64,
}

enum Failure {
    /// Nothing reached the wire; the session is intact.
    Request(TransportError),
    /// The connection is unusable.
    Session(TransportError),
}

enum Wake<C> {
    Item(Option<QueueItem<C>>),
    Stop,
    Idle,
}

struct SenderTask<C> {
    shared: Arc<Shared>,
    rx: QueueRx<C>,
    stop: watch::Receiver<State>,
    dialer: Option<Arc<dyn Dialer>>,
    config: StreamConfig,
    route: String,
    origin: String,
    pool: Arc<dyn BufferPool>,
    session: Option<Session>,
    /// Consecutive session failures
    failures: u32,
    /// Payload bytes of the in-flight request were consumed
    touched: bool,
}

/// Run `fut` unless the stream gets stopped first.
async fn unless_stopped<T>(
    stop: &mut watch::Receiver<State>,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = stop.wait_for(|s| *s == State::Aborted) => None,
        out = fut => Some(out),
    }
}

/// Copy exactly `size` bytes from the payload source to `w`.
async fn copy_payload<W: AsyncWrite + Unpin + ?Sized>(
    payload: Option<&mut Payload>,
    size: u64,
    w: &mut W,
    pool: &dyn BufferPool,
    touched: &mut bool,
) -> Result<u64> {
    if size == 0 {
        return Ok(0);
    }
    let Some(src) = payload else {
        return Err(TransportError::ShortPayload {
            expected: size,
            got: 0,
        });
    };

    let mut buf = pool.acquire(COPY_CHUNK.min(size as usize));
    let mut left = size;
    let result = loop {
        if left == 0 {
            break Ok(size);
        }
        let want = (buf.len() as u64).min(left) as usize;
        let n = match src.read(&mut buf[..want]).await {
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };
        if n == 0 {
            break Err(TransportError::ShortPayload {
                expected: size,
                got: size - left,
            });
        }
        *touched = true;
        if let Err(e) = w.write_all(&buf[..n]).await {
            break Err(e.into());
        }
        left -= n as u64;
    };
    pool.release(buf);
    result
}

impl<C: Send + 'static> SenderTask<C> {
    async fn run(mut self) {
        match self.serve().await {
            Ok(()) => {
                self.shared.close();
                let s = self.shared.stats.snapshot();
                info!(
                    stream = %self.shared.name,
                    objects = s.num,
                    bytes = s.size,
                    idle_pct = s.idle_pct,
                    "closed"
                );
            }
            Err(err) => {
                self.session = None;
                if self.shared.abort(err.clone()) {
                    warn!(stream = %self.shared.name, "aborted: {}", err);
                }
                let err = self.shared.terminal_error().unwrap_or(err);
                self.fail_queued(err).await;
            }
        }
    }

    async fn serve(&mut self) -> Result<()> {
        while let Some(item) = self.next_item().await? {
            match item {
                QueueItem::Obj(req) => self.process(req).await?,
                QueueItem::Fin => break,
            }
        }

        // Draining: whatever was accepted still goes out
        self.rx.close();
        let mut stop = self.stop.clone();
        loop {
            let Some(item) = unless_stopped(&mut stop, self.rx.recv()).await else {
                return Err(TransportError::Cancelled);
            };
            match item {
                Some(QueueItem::Obj(req)) => self.process(req).await?,
                Some(QueueItem::Fin) => {}
                None => break,
            }
        }
        unless_stopped(&mut stop, self.end_session())
            .await
            .unwrap_or(Err(TransportError::Cancelled))
    }

    /// Next queued item; `None` once every `Stream` handle is gone.
    async fn next_item(&mut self) -> Result<Option<QueueItem<C>>> {
        match self.rx.try_recv() {
            Ok(item) => return Ok(Some(item)),
            Err(TryRecvError::Disconnected) => return Ok(None),
            Err(TryRecvError::Empty) => {}
        }

        let mut stop = self.stop.clone();
        // Queue ran dry: push buffered frames out before waiting
        unless_stopped(&mut stop, self.flush())
            .await
            .unwrap_or(Err(TransportError::Cancelled))?;

        let started = Instant::now();
        loop {
            let teardown = self
                .config
                .idle_teardown()
                .filter(|_| self.session.is_some());
            let wake = tokio::select! {
                biased;
                _ = stop.wait_for(|s| *s == State::Aborted) => Wake::Stop,
                item = self.rx.recv() => Wake::Item(item),
                _ = tokio::time::sleep(teardown.unwrap_or_default()), if teardown.is_some() => Wake::Idle,
            };
            match wake {
                Wake::Item(item) => {
                    self.shared.stats.add_idle(started.elapsed());
                    return Ok(item);
                }
                Wake::Stop => {
                    self.shared.stats.add_idle(started.elapsed());
                    return Err(TransportError::Cancelled);
                }
                Wake::Idle => {
                    if unless_stopped(&mut stop, self.teardown()).await.is_none() {
                        return Err(TransportError::Cancelled);
                    }
                }
            }
        }
    }

    /// Transmit one request and complete it. Returns `Err` only when the
    /// whole stream must abort.
    async fn process(&mut self, mut req: SendRequest<C>) -> Result<()> {
        let mut stop = self.stop.clone();
        loop {
            self.touched = false;
            let Some(res) = unless_stopped(&mut stop, self.transmit(&mut req)).await else {
                req.complete(Err(TransportError::Cancelled));
                return Err(TransportError::Cancelled);
            };
            match res {
                Ok(n) => {
                    self.failures = 0;
                    self.shared.stats.add_payload(n);
                    self.shared.stats.inc_num();
                    self.sync_wire_stats();
                    req.complete(Ok(()));
                    return Ok(());
                }
                Err(Failure::Request(err)) => {
                    warn!(stream = %self.shared.name, object = %req.hdr, "send failed: {}", err);
                    req.complete(Err(err));
                    return Ok(());
                }
                Err(Failure::Session(err)) => {
                    let retry = matches!(self.config.reconnect, ReconnectPolicy::RetryInFlight { .. })
                        && !self.touched;
                    if let Err(err) = self.session_failed(err.clone()) {
                        req.complete(Err(err.clone()));
                        return Err(err);
                    }
                    if !retry {
                        req.complete(Err(err));
                        return Ok(());
                    }
                    debug!(stream = %self.shared.name, object = %req.hdr, "resending on a new session");
                }
            }
        }
    }

    async fn transmit(&mut self, req: &mut SendRequest<C>) -> std::result::Result<u64, Failure> {
        let size = req.hdr.size();
        if self.config.dry_run {
            self.shared.activate();
            let mut sink = tokio::io::sink();
            return copy_payload(req.payload.as_mut(), size, &mut sink, &*self.pool, &mut self.touched)
                .await
                .map_err(Failure::Request);
        }

        let frame = encode_header(&req.hdr).map_err(|e| Failure::Request(e.into()))?;
        let header_len = frame.len() - LEN_PREFIX;
        if header_len > self.config.max_header_size {
            return Err(Failure::Request(
                FrameError::TooLarge {
                    len: header_len,
                    max: self.config.max_header_size,
                }
                .into(),
            ));
        }
        if size > 0 && req.payload.is_none() {
            return Err(Failure::Request(TransportError::ShortPayload {
                expected: size,
                got: 0,
            }));
        }

        let session = match self.session.take() {
            Some(s) => s,
            None => self.connect().await.map_err(Failure::Session)?,
        };
        let session = self.session.insert(session);
        session
            .wire
            .write_all(&frame)
            .await
            .map_err(|e| Failure::Session(e.into()))?;
        copy_payload(req.payload.as_mut(), size, &mut session.wire, &*self.pool, &mut self.touched)
            .await
            .map_err(Failure::Session)
    }

    async fn connect(&mut self) -> Result<Session> {
        let Some(dialer) = self.dialer.as_ref() else {
            return Err(TransportError::Config("stream has no dialer".into()));
        };
        let mut conn = dialer.dial().await?;

        let id = next_session_id();
        let compression = self.config.compressed().then_some(self.config.codec);
        let mut flags = PreambleFlags::empty();
        if compression.is_some() && self.config.block_checksum {
            flags |= PreambleFlags::BLOCK_CHECKSUM;
        }
        let preamble = Preamble {
            path: self.route.clone(),
            origin: self.origin.clone(),
            session_id: id,
            compression,
            block_max_size: self.config.block_max_size as u32,
            flags,
        };
        conn.write_all(&preamble.encode()?).await?;
        conn.flush().await?;
        match read_status(&mut conn).await? {
            AcceptStatus::Accepted => {}
            status => return Err(status.into()),
        }

        let io = BufStream::with_capacity(
            self.config.read_buffer_size,
            self.config.write_buffer_size,
            conn,
        );
        let wire = CompressWriter::new(
            io,
            compression,
            self.config.block_max_size,
            flags.contains(PreambleFlags::BLOCK_CHECKSUM),
        );
        self.shared.stats.new_session(id);
        self.shared.activate();
        debug!(
            stream = %self.shared.name,
            session = id,
            peer = %dialer.peer(),
            "session open"
        );
        Ok(Session {
            id,
            wire,
            wire_seen: 0,
        })
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let res = session.wire.flush().await;
        self.sync_wire_stats();
        match res {
            Ok(()) => Ok(()),
            Err(e) => self.session_failed(e.into()),
        }
    }

    /// Write the end-of-stream frame and wait for the receiver's ack.
    async fn end_session(&mut self) -> Result<()> {
        self.flush().await?;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.wire.write_all(&encode_end()).await?;
        session.wire.flush().await?;
        let total = session.wire.wire_bytes();
        self.shared.stats.add_compressed(total - session.wire_seen);

        let ack = session.wire.get_mut().read_u8().await?;
        if ack != END_ACK {
            return Err(FrameError::Malformed(format!("unexpected end-of-stream ack {:#04x}", ack)).into());
        }
        let _ = session.wire.get_mut().shutdown().await;
        debug!(stream = %self.shared.name, session = session.id, "session closed");
        Ok(())
    }

    async fn teardown(&mut self) {
        let id = self.session.as_ref().map(|s| s.id);
        match self.end_session().await {
            Ok(()) => debug!(stream = %self.shared.name, session = ?id, "idle teardown"),
            Err(e) => warn!(stream = %self.shared.name, session = ?id, "idle teardown failed: {}", e),
        }
        self.session = None;
    }

    /// Drop the connection; `Err` when the reconnect budget is spent.
    fn session_failed(&mut self, err: TransportError) -> Result<()> {
        self.session = None;
        let max = self.config.reconnect.max_attempts();
        if self.failures >= max {
            return Err(err);
        }
        self.failures += 1;
        warn!(
            stream = %self.shared.name,
            attempt = self.failures,
            max,
            "session failed, reconnecting: {}",
            err
        );
        Ok(())
    }

    fn sync_wire_stats(&mut self) {
        if let Some(s) = self.session.as_mut() {
            let total = s.wire.wire_bytes();
            self.shared.stats.add_compressed(total - s.wire_seen);
            s.wire_seen = total;
        }
    }

    async fn fail_queued(&mut self, err: TransportError) {
        self.rx.close();
        let mut failed = 0usize;
        while let Some(item) = self.rx.recv().await {
            if let QueueItem::Obj(req) = item {
                req.complete(Err(err.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(stream = %self.shared.name, failed, "failed queued requests: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::header::Header;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_predicates() {
        assert!(State::Idle.accepts_sends());
        assert!(State::Active.accepts_sends());
        assert!(!State::Draining.accepts_sends());
        assert!(State::Closed.is_terminal());
        assert!(State::Aborted.is_terminal());
        assert!(!State::Draining.is_terminal());
        assert_eq!(State::Draining.to_string(), "draining");
    }

    #[test]
    fn test_session_ids_increase() {
        let mut last = next_session_id();
        for _ in 0..1000 {
            let id = next_session_id();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_dry_run_counts() {
        let stream: Stream = Stream::dry_run("/v1/data/dry", StreamConfig::default()).unwrap();
        assert_eq!(stream.state(), State::Idle);
        stream
            .send(SendRequest::new(Header::new("b", "o", 5)).with_bytes(&b"hello"[..]))
            .await
            .unwrap();
        stream.send_header(Header::new("b", "ping", 0)).await.unwrap();
        stream.fin().await.unwrap();

        let stats = stream.stats();
        assert_eq!(stats.num, 2);
        assert_eq!(stats.size, 5);
        assert_eq!(stats.compressed_size, 0);
        assert_eq!(stream.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_fin_idempotent_and_rejects_sends() {
        let stream: Stream = Stream::dry_run("/v1/data/fin", StreamConfig::default()).unwrap();
        stream.fin().await.unwrap();
        stream.fin().await.unwrap();
        let err = stream.send_header(Header::new("b", "late", 0)).await.unwrap_err();
        assert!(matches!(err, TransportError::Terminated(State::Closed)));
        stream.stop();
        assert_eq!(stream.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_and_queued() {
        let cfg = StreamConfig {
            burst: 8,
            ..Default::default()
        };
        let stream: Stream<usize> = Stream::dry_run("/v1/data/stop", cfg).unwrap();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        // Never written to: the first request stays in flight
        let (_writer, pending) = tokio::io::duplex(64);
        let tx = done_tx.clone();
        stream
            .send(
                SendRequest::new(Header::new("b", "stuck", 10))
                    .with_ctx(0)
                    .with_payload(Box::new(pending))
                    .with_callback(move |c| tx.send((c.ctx, c.result)).unwrap()),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 1..=5 {
            let tx = done_tx.clone();
            stream
                .send(
                    SendRequest::new(Header::new("b", "queued", 0))
                        .with_ctx(i)
                        .with_callback(move |c| tx.send((c.ctx, c.result)).unwrap()),
                )
                .await
                .unwrap();
        }
        stream.stop();
        stream.stop();
        assert_eq!(stream.state(), State::Aborted);

        let mut ctxs = Vec::new();
        for _ in 0..6 {
            let (ctx, result) = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(result.unwrap_err().is_cancelled());
            ctxs.push(ctx);
        }
        assert_eq!(ctxs, vec![0, 1, 2, 3, 4, 5]);
        assert!(stream.fin().await.unwrap_err().is_cancelled());
        assert_eq!(stream.stats().num, 0);
    }

    #[tokio::test]
    async fn test_short_payload_fails_request_only() {
        let stream: Stream = Stream::dry_run("/v1/data/short", StreamConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream
            .send(
                SendRequest::new(Header::new("b", "short", 10))
                    .with_bytes(&b"abc"[..])
                    .with_callback(move |c| tx.send(c.result).unwrap()),
            )
            .await
            .unwrap();
        stream.fin().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(TransportError::ShortPayload { expected: 10, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_origin_and_name() {
        let cfg = StreamConfig {
            origin: Some("node-a".into()),
            ..Default::default()
        };
        let stream: Stream = Stream::dry_run("/v1/data/x", cfg).unwrap();
        assert_eq!(stream.origin(), "node-a");
        assert_eq!(stream.name(), "stream[node-a=>/v1/data/x]");
        assert_eq!(stream.to_string(), stream.name());
        stream.fin().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_blocking_from_plain_thread() {
        let cfg = StreamConfig {
            burst: 2,
            ..Default::default()
        };
        let stream: Arc<Stream<usize>> = Arc::new(Stream::dry_run("/v1/data/blocking", cfg).unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));

        let (s, o) = (stream.clone(), order.clone());
        tokio::task::spawn_blocking(move || {
            for i in 0..100 {
                let o = o.clone();
                let req = SendRequest::new(Header::new("b", format!("o{}", i), 4))
                    .with_ctx(i)
                    .with_bytes(&b"data"[..])
                    .with_callback(move |c| {
                        assert!(c.result.is_ok());
                        o.lock().unwrap().push(c.ctx);
                    });
                s.send_blocking(req).unwrap();
            }
        })
        .await
        .unwrap();
        stream.fin().await.unwrap();

        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
        assert_eq!(stream.stats().num, 100);
        assert_eq!(stream.stats().size, 400);

        let s = stream.clone();
        let late = tokio::task::spawn_blocking(move || s.send_blocking(SendRequest::new(Header::new("b", "late", 0))))
            .await
            .unwrap();
        assert!(matches!(late, Err(TransportError::Terminated(State::Closed))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let cfg = StreamConfig {
            burst: 0,
            ..Default::default()
        };
        assert!(Stream::<()>::dry_run("/v1/data/x", cfg).is_err());
    }
}
