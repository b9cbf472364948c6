//! Pixel buffer pool
//!
//! Page renders are large (a letter page at 2x is several megabytes of RGBA)
//! and a scrolling reader produces them continuously. Render targets are
//! taken from a shared pool and handed back when the last owner drops them,
//! so steady-state scrolling allocates almost nothing.
//!
//! ```text
//!  acquire(w, h) ──► PixelBuffer ──► PageImage ──► cache / callers
//!       ▲                                              │
//!       └──────────── reclaim on drop ◄────────────────┘
//! ```
//!
//! Once a pool is invalidated (its session closed) returning buffers are
//! dropped instead of recycled.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::debug;

/// Bytes per pixel of every pooled buffer (RGBA8)
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Default)]
struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    invalidated: AtomicBool,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    outstanding: AtomicUsize,
}

impl PoolShared {
    fn reclaim(&self, data: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.invalidated.load(Ordering::Acquire) || data.capacity() == 0 {
            return;
        }
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data);
    }
}

/// Thread-safe pool of RGBA pixel buffers.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone, Default)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a zeroed buffer of exactly `width * height` pixels.
    ///
    /// The smallest free buffer that fits is reused and capped to the
    /// requested size; otherwise a new one is allocated.
    #[must_use]
    pub fn acquire(&self, width: u32, height: u32) -> PixelBuffer {
        let len = byte_len(width, height);
        let recycled = if self.shared.invalidated.load(Ordering::Acquire) {
            None
        } else {
            let mut free = self
                .shared
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let best_fit = free
                .iter()
                .enumerate()
                .filter(|(_, buf)| buf.capacity() >= len)
                .min_by_key(|(_, buf)| buf.capacity())
                .map(|(idx, _)| idx);
            best_fit.map(|idx| free.swap_remove(idx))
        };

        let data = match recycled {
            Some(mut data) => {
                data.clear();
                data.resize(len, 0);
                data.shrink_to(len);
                self.shared.recycled.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0; len]
            }
        };
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);

        PixelBuffer {
            data,
            width,
            height,
            origin: Some(Arc::downgrade(&self.shared)),
        }
    }

    /// Return a buffer to the pool it was acquired from.
    ///
    /// Equivalent to dropping it; spelled out for call sites that want the
    /// hand-back to be visible.
    pub fn release(&self, buffer: PixelBuffer) {
        drop(buffer);
    }

    /// Stop recycling: free buffers are dropped now, outstanding ones when
    /// they come back.
    pub fn invalidate(&self) {
        if self.shared.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut free = self
                .shared
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *free).len()
        };
        debug!(
            "Buffer pool invalidated: dropped {dropped} free buffers, {} still outstanding",
            self.shared.outstanding.load(Ordering::Acquire)
        );
    }

    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            available: self
                .shared
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated fresh
    pub allocated: usize,
    /// Acquisitions served from a recycled buffer
    pub recycled: usize,
    /// Buffers currently held outside the pool
    pub outstanding: usize,
    /// Free buffers waiting in the pool
    pub available: usize,
}

/// RGBA pixel storage, returned to its pool on drop
pub struct PixelBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    origin: Option<Weak<PoolShared>>,
}

impl PixelBuffer {
    /// Wrap pixels that do not belong to any pool (e.g. decoded from disk)
    #[must_use]
    pub fn detached(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), byte_len(width, height));
        Self {
            data,
            width,
            height,
            origin: None,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.origin.is_some()
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(shared) = origin.upgrade() {
            shared.reclaim(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pooled", &self.origin.is_some())
            .finish_non_exhaustive()
    }
}

#[must_use]
pub fn byte_len(width: u32, height: u32) -> usize {
    (width as usize)
        .saturating_mul(height as usize)
        .saturating_mul(BYTES_PER_PIXEL)
}
