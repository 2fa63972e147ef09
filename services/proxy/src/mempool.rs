//! Reusable byte buffers for relaying traffic.
//!
//! Every relay iteration and every UDP datagram needs a scratch buffer. The
//! pool keeps an arena of fixed-size buffers and a free-list of slot indices;
//! a claimed buffer is moved out of its slot, so no two holders can ever see
//! the same memory. Buffers go back to their slot when the [`PooledBuffer`]
//! guard is dropped, which also covers errors and task cancellation.
//!
//! The pool only grows. It is bounded indirectly by the number of concurrent
//! sessions.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Size of every pooled buffer.
pub const BUFFER_SIZE: usize = 8 * 1024;

#[derive(Default)]
struct Slots {
    /// `None` while the buffer in that slot is claimed.
    buffers: Vec<Option<Box<[u8]>>>,
    /// Indices of slots holding an unclaimed buffer.
    free: Vec<usize>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers ever allocated.
    pub allocated: usize,
    /// Buffers currently free.
    pub free: usize,
}

impl BufferPoolStats {
    pub fn in_use(&self) -> usize {
        self.allocated - self.free
    }
}

/// A grow-only pool of [`BUFFER_SIZE`] byte buffers.
#[derive(Default)]
pub struct BufferPool {
    slots: Mutex<Slots>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // The lock only guards plain Vec pushes and pops.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a buffer, reusing a free one when there is any.
    pub fn claim(self: &Arc<Self>) -> PooledBuffer {
        let index = {
            let mut slots = self.slots();
            while let Some(index) = slots.free.pop() {
                if let Some(data) = slots.buffers[index].take() {
                    return PooledBuffer {
                        pool: Arc::clone(self),
                        index,
                        data,
                    };
                }
            }
            slots.buffers.push(None);
            slots.buffers.len() - 1
        };

        PooledBuffer {
            pool: Arc::clone(self),
            index,
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Run `f` with a claimed buffer and return the buffer afterwards.
    ///
    /// The buffer is returned whether `f` completes, fails, or the returned
    /// future is dropped mid-way.
    pub async fn with_buffer<F, R>(self: &Arc<Self>, f: F) -> R
    where
        F: AsyncFnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.claim();
        f(&mut *buffer).await
    }

    pub fn stats(&self) -> BufferPoolStats {
        let slots = self.slots();
        BufferPoolStats {
            allocated: slots.buffers.len(),
            free: slots.free.len(),
        }
    }

    fn release(&self, index: usize, data: Box<[u8]>) {
        let mut slots = self.slots();
        slots.buffers[index] = Some(data);
        slots.free.push(index);
    }
}

/// Exclusive handle to one pooled buffer.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    index: usize,
    data: Box<[u8]>,
}

impl PooledBuffer {
    /// Arena slot this buffer belongs to.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(self.index, data);
    }
}
