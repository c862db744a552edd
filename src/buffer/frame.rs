//! `BufferFrame` — one slot of the DRAM page pool, per spec.md §3.
//!
//! Fields that must be read cheaply without holding any latch (`pid`,
//! `next`, `p_version`, `epoch`, `dirty`, `mh_waiting`) are plain atomics
//! directly on the frame. Everything the coherence protocol mutates as a
//! unit — possession, lifecycle state, and the page buffer itself — lives
//! behind [`HybridLatch`] so optimistic readers get a consistent
//! snapshot and writers serialize against each other (spec.md §4.2).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::buffer::latch::HybridLatch;
use crate::buffer::possession::Possession;
use crate::common::{FrameId, PageId};
use crate::storage::page_pool::PagePtr;

/// Lifecycle state of a frame, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Not holding any page; linked into a free list.
    Free,
    /// Holding a live page in DRAM.
    Hot,
    /// Content has been written to the SSD tier and the DRAM copy may be
    /// reclaimed; readers must fault it back in.
    Evicted,
    /// An async write-back to SSD is in flight.
    IoSsd,
    /// A remote-allocation or possession-transfer RDMA operation is in
    /// flight against this frame.
    IoRdma,
    /// The page provider has asked other possessors to drop a shared
    /// copy; the frame is not yet fully free of remote references.
    InvalidationExpected,
}

/// The mutable content of a frame that the coherence protocol and page
/// provider mutate as one unit.
pub struct FrameContent {
    pub possession: Possession,
    pub state: FrameState,
    pub page: Option<PagePtr>,
    /// SSD slot this page's content was last spilled to, if any.
    pub ssd_slot: Option<u64>,
}

impl FrameContent {
    fn free() -> Self {
        Self {
            possession: Possession::Nobody,
            state: FrameState::Free,
            page: None,
            ssd_slot: None,
        }
    }
}

/// One slot of the DRAM page pool.
pub struct BufferFrame {
    pid: AtomicU64,
    /// Arena-indexed hash-bucket chain link (spec.md §9 "Cyclic
    /// metadata"): `FrameId::NONE` terminates the chain. Using an index
    /// into the frame arena instead of a raw pointer sidesteps every
    /// self-referential-struct problem a real intrusive list would raise
    /// in safe Rust.
    next: AtomicU32,
    /// Monotonic page version, bumped on every committed mutation of the
    /// page's content (spec.md §3, §8 invariant "p_version only grows").
    p_version: AtomicU64,
    /// Logical clock stamped on every local access, read by the page
    /// provider's LRU-approximation sampling (spec.md §4.4 phase P2).
    epoch: AtomicU64,
    dirty: AtomicBool,
    /// Set by the coherence handler while a possession change targeting
    /// this frame is pending, so latch acquisition attempts back off
    /// instead of racing the handler (spec.md §4.2, §4.3).
    mh_waiting: AtomicBool,
    is_ht_bucket: bool,
    /// Protects only the chain link's *structural* membership (insert /
    /// remove in the hash table); `next` itself is read lock-free by
    /// optimistic chain walkers and validated against this latch's
    /// version at the end of a walk (spec.md §4.1).
    ht_bucket_latch: HybridLatch<()>,
    /// Protects possession, lifecycle state, and the page buffer.
    latch: HybridLatch<FrameContent>,
}

impl BufferFrame {
    pub fn new_free(is_ht_bucket: bool) -> Self {
        Self {
            pid: AtomicU64::new(PageId::EMPTY.raw()),
            next: AtomicU32::new(FrameId::NONE.as_u32()),
            p_version: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            mh_waiting: AtomicBool::new(false),
            is_ht_bucket,
            ht_bucket_latch: HybridLatch::new(()),
            latch: HybridLatch::new(FrameContent::free()),
        }
    }

    #[inline]
    pub fn pid(&self) -> PageId {
        PageId::from_raw(self.pid.load(Ordering::Acquire))
    }

    /// Only valid to call while holding the frame's content latch
    /// exclusively, proven by `witness` (spec.md §4.1 insert/remove).
    pub fn set_pid(&self, pid: PageId, _witness: &crate::buffer::latch::ExclusiveGuard<'_, FrameContent>) {
        self.pid.store(pid.raw(), Ordering::Release);
    }

    #[inline]
    pub fn next(&self) -> FrameId {
        FrameId::from_u32(self.next.load(Ordering::Acquire))
    }

    pub fn set_next(&self, next: FrameId, _witness: &crate::buffer::latch::ExclusiveGuard<'_, ()>) {
        self.next.store(next.as_u32(), Ordering::Release);
    }

    #[inline]
    pub fn p_version(&self) -> u64 {
        self.p_version.load(Ordering::Acquire)
    }

    pub fn bump_p_version(&self) -> u64 {
        self.p_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn stamp_epoch(&self, now: u64) {
        self.epoch.store(now, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn mark_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_ht_bucket(&self) -> bool {
        self.is_ht_bucket
    }

    #[inline]
    pub fn mh_waiting(&self) -> bool {
        self.mh_waiting.load(Ordering::Acquire)
    }

    pub fn set_mh_waiting(&self, waiting: bool) {
        self.mh_waiting.store(waiting, Ordering::Release);
    }

    pub fn ht_bucket_latch(&self) -> &HybridLatch<()> {
        &self.ht_bucket_latch
    }

    pub fn latch(&self) -> &HybridLatch<FrameContent> {
        &self.latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeId;

    #[test]
    fn new_frame_starts_free_with_empty_pid() {
        let frame = BufferFrame::new_free(false);
        assert!(frame.pid().is_empty());
        assert!(frame.next().is_none());
        assert_eq!(frame.p_version(), 0);
        assert!(!frame.is_dirty());
        let content = frame.latch().shared();
        assert_eq!(content.state, FrameState::Free);
        assert!(content.possession.is_nobody());
    }

    #[test]
    fn set_pid_requires_exclusive_witness() {
        let frame = BufferFrame::new_free(false);
        let guard = frame.latch().exclusive();
        frame.set_pid(PageId::new(0, 5), &guard);
        drop(guard);
        assert_eq!(frame.pid(), PageId::new(0, 5));
    }

    #[test]
    fn bump_p_version_is_monotonic() {
        let frame = BufferFrame::new_free(false);
        assert_eq!(frame.bump_p_version(), 1);
        assert_eq!(frame.bump_p_version(), 2);
        assert_eq!(frame.p_version(), 2);
    }

    #[test]
    fn content_mutation_under_exclusive_latch_is_visible_after_release() {
        let frame = BufferFrame::new_free(false);
        {
            let mut content = frame.latch().exclusive();
            content.possession = Possession::Exclusive(NodeId::new(2));
            content.state = FrameState::Hot;
        }
        let content = frame.latch().shared();
        assert_eq!(content.possession.exclusive_owner(), Some(NodeId::new(2)));
        assert_eq!(content.state, FrameState::Hot);
    }

    #[test]
    fn ht_bucket_latch_chain_link_round_trips() {
        let frame = BufferFrame::new_free(true);
        let guard = frame.ht_bucket_latch().exclusive();
        frame.set_next(FrameId::new(3), &guard);
        drop(guard);
        assert_eq!(frame.next(), FrameId::new(3));
    }

    #[test]
    fn mh_waiting_round_trips() {
        let frame = BufferFrame::new_free(false);
        assert!(!frame.mh_waiting());
        frame.set_mh_waiting(true);
        assert!(frame.mh_waiting());
    }
}
