//! Payload buffer pool.
//!
//! Streams and multiplexers take an `Arc<dyn BufferPool>` instead of
//! reaching for a process-wide allocator.

use bytes::BytesMut;
use std::sync::Mutex;

pub trait BufferPool: Send + Sync {
    /// A zeroed buffer of at least `size` bytes (`len() == size`).
    fn acquire(&self, size: usize) -> BytesMut;

    fn release(&self, buf: BytesMut);
}

/// Keeps up to `max_free` buffers of one slab size.
/// Requests larger than the slab size are allocated and dropped normally.
pub struct SlabPool {
    slab_size: usize,
    max_free: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl SlabPool {
    pub fn new(slab_size: usize, max_free: usize) -> Self {
        Self {
            slab_size,
            max_free,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

impl BufferPool for SlabPool {
    fn acquire(&self, size: usize) -> BytesMut {
        if size <= self.slab_size {
            let reused = self.free.lock().ok().and_then(|mut f| f.pop());
            if let Some(mut buf) = reused {
                buf.resize(size, 0);
                return buf;
            }
            let mut buf = BytesMut::with_capacity(self.slab_size);
            buf.resize(size, 0);
            return buf;
        }
        BytesMut::zeroed(size)
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() < self.slab_size {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_free {
                free.push(buf);
            }
        }
    }
}
