// Device Memory Accounting — live/peak counters for device buffers
//
// Every buffer handle is charged here when it is created and credited when
// it is released. Counters are atomics so allocation from several host
// threads never contends on a lock.
//
// The limit check is optimistic: the charge is applied first and rolled back
// if it pushed the total past `memory_limit`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use vela_core::DeviceError;

/// Snapshot of a device's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes held by live buffers.
    pub allocated_bytes: usize,
    /// Number of live buffers.
    pub live_buffers: usize,
    /// Highest `allocated_bytes` seen since the device was created.
    pub peak_bytes: usize,
    /// Cumulative buffer creations.
    pub allocations: u64,
    /// Cumulative buffer releases.
    pub releases: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryTracker {
    allocated: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl MemoryTracker {
    pub(crate) fn charge(&self, bytes: usize, limit: Option<usize>) -> Result<(), DeviceError> {
        let total = self.allocated.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(limit) = limit {
            if total > limit {
                self.allocated.fetch_sub(bytes, Ordering::AcqRel);
                return Err(DeviceError::Allocation {
                    bytes,
                    reason: format!("device memory limit of {limit} bytes exceeded"),
                });
            }
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        self.peak.fetch_max(total, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn credit(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo a successful `charge` whose allocation then failed.
    pub(crate) fn rollback(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.allocations.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            allocated_bytes: self.allocated.load(Ordering::Acquire),
            live_buffers: self.live.load(Ordering::Acquire),
            peak_bytes: self.peak.load(Ordering::Acquire),
            allocations: self.allocations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}
