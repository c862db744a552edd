//! Free frame and free page-id tracking, per spec.md §3 ("Free lists").
//!
//! Frames are pooled the same way [`crate::storage::page_pool::PagePool`]
//! pools pages: partitioned `VecDeque`s, round-robin acquire/release, so
//! reclaiming a frame on one hash partition doesn't contend with another
//! thread allocating on a different one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::common::{FrameId, NodeId, PageId};

pub struct FreeFrames {
    partitions: Vec<Mutex<VecDeque<FrameId>>>,
    next_partition: AtomicUsize,
}

impl FreeFrames {
    /// All `total_frames` arena slots start free, spread round-robin
    /// across `partitions` shards.
    pub fn new(total_frames: usize, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut shards: Vec<Mutex<VecDeque<FrameId>>> =
            (0..partitions).map(|_| Mutex::new(VecDeque::new())).collect();
        for i in 0..total_frames {
            shards[i % partitions].lock().push_back(FrameId::new(i));
        }
        Self { partitions: shards, next_partition: AtomicUsize::new(0) }
    }

    pub fn free_count(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn acquire(&self) -> Option<FrameId> {
        let start = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        for offset in 0..self.partitions.len() {
            let idx = (start + offset) % self.partitions.len();
            if let Some(id) = self.partitions[idx].lock().pop_back() {
                return Some(id);
            }
        }
        None
    }

    pub fn release(&self, id: FrameId) {
        let idx = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.partitions[idx].lock().push_back(id);
    }
}

/// Hands out fresh page ids owned by this node. Slot 0 on node 0 is
/// reserved for the catalog root (spec.md §4.6), so node 0's allocator
/// starts at slot 1.
pub struct PidAllocator {
    owner: NodeId,
    next_slot: AtomicU64,
}

impl PidAllocator {
    pub fn new(owner: NodeId) -> Self {
        let start = if owner == NodeId::new(0) { 1 } else { 0 };
        Self { owner, next_slot: AtomicU64::new(start) }
    }

    pub fn allocate(&self) -> PageId {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        PageId::new(self.owner.0, slot)
    }
}
