//! Device-visible buffer memory.
//!
//! A `DeviceBuffer` is the owning handle to one region the audio hardware
//! can read directly. The engine writes into it while it owns the region and
//! hands the mixer a `SharedBuffer` (read-only view of the same memory) on
//! submission. Returning the region to its allocator consumes the owning
//! handle, so a region cannot be freed twice.
//!
//! The `DeviceAllocator` trait is the seam for real linear/DMA heaps;
//! [`linear::LinearPool`] is the bounded software pool.

pub mod linear;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, WavStreamError};

/// Identifier assigned by the allocator to each live region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

type Memory = Arc<RwLock<Box<[u8]>>>;

/// Owning handle to a device-visible memory region.
#[derive(Debug)]
pub struct DeviceBuffer {
    id: BufferId,
    mem: Memory,
}

impl DeviceBuffer {
    /// Wrap a zeroed region of `len` bytes. Called by allocators.
    pub fn new(id: BufferId, len: usize) -> Self {
        Self {
            id,
            mem: Arc::new(RwLock::new(vec![0u8; len].into_boxed_slice())),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.mem.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive write access. Only valid while the mixer is not reading
    /// this region.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.mem.write()
    }

    /// Read-only view handed to the mixer.
    pub fn share(&self) -> SharedBuffer {
        SharedBuffer {
            id: self.id,
            mem: Arc::clone(&self.mem),
        }
    }
}

/// Read-only view of a `DeviceBuffer`, held by the mixer queue.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    id: BufferId,
    mem: Memory,
}

impl SharedBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.mem.read()
    }
}

/// Contract for device-visible memory allocators.
pub trait DeviceAllocator: Send + Sync + 'static {
    /// Allocate a zeroed region of `size` bytes.
    ///
    /// # Errors
    /// `OutOfMemory` when the pool cannot satisfy the request.
    fn alloc(&self, size: usize) -> Result<DeviceBuffer>;

    /// Return a region to the pool.
    fn free(&self, buffer: DeviceBuffer);

    /// Bytes that can still be allocated.
    fn available_bytes(&self) -> usize;
}

/// Thread-safe reference-counted handle to any `DeviceAllocator`.
#[derive(Clone)]
pub struct AllocatorHandle(pub Arc<dyn DeviceAllocator>);

impl AllocatorHandle {
    pub fn new<A: DeviceAllocator>(allocator: A) -> Self {
        Self(Arc::new(allocator))
    }

    /// Fail with `OutOfMemory` unless `bytes` can be allocated right now.
    ///
    /// Checked before allocating so a failed load or play leaves the pool
    /// untouched.
    pub fn ensure_available(&self, bytes: usize) -> Result<()> {
        let available = self.0.available_bytes();
        if available < bytes {
            return Err(WavStreamError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        Ok(())
    }
}

impl std::ops::Deref for AllocatorHandle {
    type Target = dyn DeviceAllocator;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl std::fmt::Debug for AllocatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorHandle")
            .field("available_bytes", &self.0.available_bytes())
            .finish_non_exhaustive()
    }
}
