//! Fixed-capacity packet buffer pool.
//!
//! One contiguous mapping holds `capacity` buffers of `buf_size` bytes; huge
//! pages are preferred and silently degraded to a standard anonymous mapping.
//! The free list is a lock-free index queue, so allocation never blocks:
//! exhaustion returns `None` and the caller decides to wait, coalesce, or
//! drop.

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, Result};

pub const DEFAULT_CAPACITY: usize = 16_384;
pub const DEFAULT_BUF_SIZE: usize = 2_048;

pub struct PacketPool {
    base: NonNull<u8>,
    region_len: usize,
    capacity: usize,
    buf_size: usize,
    huge_pages: bool,
    free: ArrayQueue<u32>,
    allocs: AtomicU64,
    alloc_failures: AtomicU64,
}

// The mapping is owned by the pool and buffers are handed out with exclusive
// indices, so shared access to the pool itself is sound.
unsafe impl Send for PacketPool {}
unsafe impl Sync for PacketPool {}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub buf_size: usize,
    pub free: usize,
    pub outstanding: usize,
    pub allocs: u64,
    pub alloc_failures: u64,
    pub huge_pages: bool,
}

impl PacketPool {
    pub fn new(capacity: usize, buf_size: usize) -> Result<Arc<Self>> {
        if capacity == 0 || buf_size == 0 {
            return Err(EngineError::Fatal("packet pool dimensions must be non-zero".into()));
        }
        let region_len = capacity * buf_size;
        let (base, huge_pages) = map_region(region_len)?;
        info!(
            capacity,
            buf_size, huge_pages, "packet pool allocated ({} bytes)", region_len
        );
        let free = ArrayQueue::new(capacity);
        for i in 0..capacity as u32 {
            // Queue capacity equals the index count, so this cannot fail.
            let _ = free.push(i);
        }
        Ok(Arc::new(Self {
            base,
            region_len,
            capacity,
            buf_size,
            huge_pages,
            free,
            allocs: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
        }))
    }

    pub fn with_defaults() -> Result<Arc<Self>> {
        Self::new(DEFAULT_CAPACITY, DEFAULT_BUF_SIZE)
    }

    /// Takes a buffer from the pool, or `None` when exhausted.
    pub fn alloc(self: &Arc<Self>) -> Option<PacketHandle> {
        match self.free.pop() {
            Some(index) => {
                self.allocs.fetch_add(1, Ordering::Relaxed);
                Some(PacketHandle {
                    pool: Arc::clone(self),
                    index,
                    len: 0,
                })
            }
            None => {
                self.alloc_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.len();
        PoolStats {
            capacity: self.capacity,
            buf_size: self.buf_size,
            free,
            outstanding: self.capacity - free,
            allocs: self.allocs.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            huge_pages: self.huge_pages,
        }
    }

    fn release(&self, index: u32) {
        // An index can only come back from a handle we issued.
        let _ = self.free.push(index);
    }

    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.capacity);
        unsafe { self.base.as_ptr().add(index as usize * self.buf_size) }
    }
}

impl Drop for PacketPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.region_len);
        }
    }
}

fn map_region(len: usize) -> Result<(NonNull<u8>, bool)> {
    let base_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            base_flags | libc::MAP_HUGETLB,
            -1,
            0,
        );
        if ptr != libc::MAP_FAILED {
            return Ok((NonNull::new_unchecked(ptr.cast()), true));
        }
        let ptr = libc::mmap(std::ptr::null_mut(), len, prot, base_flags, -1, 0);
        if ptr != libc::MAP_FAILED {
            return Ok((NonNull::new_unchecked(ptr.cast()), false));
        }
    }
    Err(EngineError::Fatal(format!(
        "packet pool mapping of {len} bytes failed: {}",
        std::io::Error::last_os_error()
    )))
}

/// Exclusive borrow of one pool buffer; returns it on drop.
pub struct PacketHandle {
    pool: Arc<PacketPool>,
    index: u32,
    len: usize,
}

impl PacketHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.pool.buf_size
    }

    /// Copies `data` into the buffer, truncating at capacity, and sets the
    /// frame length.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.pool.buf_size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.pool.buffer_ptr(self.index), len);
        }
        self.len = len;
        len
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.pool.buf_size);
        self.len = len;
    }
}

impl Deref for PacketHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.pool.buffer_ptr(self.index), self.len) }
    }
}

impl DerefMut for PacketHandle {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.pool.buffer_ptr(self.index), self.len) }
    }
}

impl Drop for PacketHandle {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
