//! Reusable read buffers.
//!
//! Every [`LoopHandle::read`](crate::LoopHandle::read) fills a buffer taken
//! from a shared `object-pool`; dropping the returned [`PooledBuf`] puts the
//! allocation back. The pool never holds more than its configured capacity.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::{Pool, ReusableOwned};

/// Default size of each read buffer (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of buffers kept in the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// A pool of fixed-size byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Pool with default capacity and buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Pool of `capacity` buffers of `buffer_size` bytes each.
    ///
    /// When the pool is exhausted, fresh buffers are allocated and freed on
    /// drop instead of joining the pool.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Take an empty buffer with at least `buffer_size` bytes of capacity.
    pub fn get(&self) -> PooledBuf {
        let inner = match self.pool.try_pull_owned() {
            Some(mut reused) => {
                reused.clear();
                Loan::Pooled(reused)
            }
            None => Loan::Detached(Vec::with_capacity(self.buffer_size)),
        };
        PooledBuf {
            inner,
            buffer_size: self.buffer_size,
        }
    }

    /// Take a buffer zero-filled to `buffer_size`, ready to be read into.
    pub(crate) fn get_filled(&self) -> PooledBuf {
        let mut buf = self.get();
        buf.resize(self.buffer_size, 0);
        buf
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Its length is the number of bytes filled; zero after a read means the
/// peer closed the stream.
pub struct PooledBuf {
    inner: Loan,
    buffer_size: usize,
}

enum Loan {
    Pooled(ReusableOwned<Vec<u8>>),
    /// Allocated past capacity; freed on drop.
    Detached(Vec<u8>),
}

impl PooledBuf {
    /// Size of the buffers in the originating pool.
    pub fn pool_buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Whether the buffer goes back to the pool when dropped.
    pub fn is_pooled(&self) -> bool {
        matches!(self.inner, Loan::Pooled(_))
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        match &self.inner {
            Loan::Pooled(buf) => &**buf,
            Loan::Detached(buf) => buf,
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            Loan::Pooled(buf) => &mut **buf,
            Loan::Detached(buf) => buf,
        }
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len())
            .field("pooled", &self.is_pooled())
            .field("pool_buffer_size", &self.buffer_size)
            .finish()
    }
}
