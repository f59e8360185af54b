//! Counters published by the maintenance task.
//!
//! Every counter has a single writer: the maintenance task. Readers get a
//! `PoolStats` snapshot through `AllocHandle::stats`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured number of slots.
    pub target: usize,
    /// Inventory count as of the last checkpoint.
    pub allocated: usize,
    pub allocations: u64,
    pub allocation_failures: u64,
    pub destroys: u64,
    pub destroy_failures: u64,
    /// Slots withdrawn from the dead queue and reallocated.
    pub recycled: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    target: usize,
    allocated: AtomicUsize,
    allocations: AtomicU64,
    allocation_failures: AtomicU64,
    destroys: AtomicU64,
    destroy_failures: AtomicU64,
    recycled: AtomicU64,
}

impl StatsCounters {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Publish the inventory count. Called only at checkpoints, never
    /// between the destroy and reallocation of a recycled slot.
    pub fn set_allocated(&self, allocated: usize) {
        self.allocated.store(allocated, Ordering::Release);
    }

    pub fn record_allocation(&self, failed: bool) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.allocation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_destroy(&self, failed: bool) {
        self.destroys.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.destroy_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_recycle(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            target: self.target,
            allocated: self.allocated.load(Ordering::Acquire),
            allocations: self.allocations.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            destroys: self.destroys.load(Ordering::Relaxed),
            destroy_failures: self.destroy_failures.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}
