//! Send requests and the burst queue.
//!
//! Callers -> burst queue -> sender task (one per stream).
//! The queue is a bounded channel: its capacity is the burst.

use crate::error::Result;
use crate::streaming::header::Header;
use bytes::Bytes;
use std::fmt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Readable payload source. Must yield at least `hdr.size()` bytes.
pub type Payload = Box<dyn AsyncRead + Send + Unpin>;

/// Called exactly once per accepted request, on the sender task.
pub type Callback<C> = Box<dyn FnOnce(Completion<C>) + Send + 'static>;

/// What a callback gets back: the request's parts and its outcome.
pub struct Completion<C> {
    pub hdr: Header,
    /// The payload source, returned to the caller for reuse or cleanup.
    pub payload: Option<Payload>,
    pub ctx: C,
    pub result: Result<()>,
}

impl<C> fmt::Debug for Completion<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("hdr", &self.hdr)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// One unit of work for a stream.
pub struct SendRequest<C = ()> {
    pub hdr: Header,
    pub payload: Option<Payload>,
    pub callback: Option<Callback<C>>,
    pub ctx: C,
}

impl<C: Default> SendRequest<C> {
    pub fn new(hdr: Header) -> Self {
        Self {
            hdr,
            payload: None,
            callback: None,
            ctx: C::default(),
        }
    }
}

impl<C> SendRequest<C> {
    pub fn with_ctx(mut self, ctx: C) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// In-memory payload.
    pub fn with_bytes(self, data: impl Into<Bytes>) -> Self {
        self.with_payload(Box::new(std::io::Cursor::new(data.into())))
    }

    pub fn with_callback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Completion<C>) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    /// Consume the request and report its outcome.
    pub(crate) fn complete(self, result: Result<()>) {
        let SendRequest {
            hdr,
            payload,
            callback,
            ctx,
        } = self;
        if let Some(cb) = callback {
            cb(Completion {
                hdr,
                payload,
                ctx,
                result,
            });
        }
    }
}

impl<C> fmt::Debug for SendRequest<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest")
            .field("hdr", &self.hdr)
            .field("has_payload", &self.payload.is_some())
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Item in the burst queue
pub(crate) enum QueueItem<C> {
    Obj(SendRequest<C>),
    /// Stop accepting, flush what is queued, end the stream.
    Fin,
}

pub(crate) type QueueTx<C> = mpsc::Sender<QueueItem<C>>;
pub(crate) type QueueRx<C> = mpsc::Receiver<QueueItem<C>>;

pub(crate) fn send_queue<C>(burst: usize) -> (QueueTx<C>, QueueRx<C>) {
    mpsc::channel(burst)
}
