use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

const INITIAL_CAPACITY: usize = 256;

/// Bounded pool of reusable byte buffers for row serialization.
///
/// Buffers that grew past `max_capacity` are dropped on return so a single
/// oversized row cannot pin memory for the life of the pool.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    max_capacity: usize,
}

static SHARED: Lazy<Arc<BufferPool>> = Lazy::new(|| Arc::new(BufferPool::new(32, 64 * 1024)));

impl BufferPool {
    pub fn new(max_pooled: usize, max_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            max_capacity,
        }
    }

    /// Process-wide pool used when an export does not bring its own.
    pub fn shared() -> Arc<BufferPool> {
        SHARED.clone()
    }

    pub fn rent(&self) -> Vec<u8> {
        match self.buffers.lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn give_back(&self, buf: Vec<u8>) {
        if buf.capacity() > self.max_capacity {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16, 64 * 1024)
    }
}
