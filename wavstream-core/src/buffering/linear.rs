//! `LinearPool`: bounded software stand-in for a linear (DMA-coherent) heap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{BufferId, DeviceAllocator, DeviceBuffer};
use crate::error::{Result, WavStreamError};

/// Fixed-capacity pool. Tracks every live region so callers (and tests) can
/// ask whether a region is still allocated.
pub struct LinearPool {
    capacity: usize,
    next_id: AtomicU64,
    live: Mutex<HashMap<BufferId, usize>>,
}

impl LinearPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.live.lock().values().sum()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_live(&self, id: BufferId) -> bool {
        self.live.lock().contains_key(&id)
    }
}

impl DeviceAllocator for LinearPool {
    fn alloc(&self, size: usize) -> Result<DeviceBuffer> {
        let mut live = self.live.lock();
        let used: usize = live.values().sum();
        let available = self.capacity.saturating_sub(used);
        if size > available {
            return Err(WavStreamError::OutOfMemory {
                requested: size,
                available,
            });
        }

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        live.insert(id, size);
        debug!(id = id.0, size, "linear alloc");
        Ok(DeviceBuffer::new(id, size))
    }

    fn free(&self, buffer: DeviceBuffer) {
        let id = buffer.id();
        if self.live.lock().remove(&id).is_none() {
            warn!(id = id.0, "free of a region this pool does not own");
        } else {
            debug!(id = id.0, "linear free");
        }
    }

    fn available_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.used_bytes())
    }
}
