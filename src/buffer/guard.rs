//! Page guards: the worker-facing RAII wrappers around a frame's hybrid
//! latch, per spec.md §4.2 and §4.5.
//!
//! These sit one layer above [`crate::buffer::latch`]'s generic guards:
//! they know about `BufferFrame` and `Page`, and encode the three access
//! modes a caller of [`crate::worker::BufferManager::fix`] can ask for.

use crate::buffer::frame::{BufferFrame, FrameContent};
use crate::buffer::latch::{ExclusiveGuard, LatchResult, SharedGuard};
use crate::common::FrameId;
use crate::storage::page::Page;

/// A page seen optimistically: the content was read without blocking and
/// must be revalidated by the caller before it commits to any decision
/// made from it (spec.md §4.2).
pub struct OptimisticPageGuard<'a> {
    frame: &'a BufferFrame,
    frame_id: FrameId,
    version: u64,
}

impl<'a> OptimisticPageGuard<'a> {
    pub fn try_acquire(frame: &'a BufferFrame, frame_id: FrameId) -> LatchResult<Self> {
        match frame.latch().try_optimistic(|_| ()) {
            LatchResult::Ok((version, ())) => LatchResult::Ok(Self { frame, frame_id, version }),
            LatchResult::Retry => LatchResult::Retry,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Still valid as of right now? Callers must check this immediately
    /// before acting on anything read while this guard was outstanding.
    pub fn is_valid(&self) -> bool {
        self.frame.latch().validate(self.version)
    }

    /// Upgrade to a blocking shared guard, revalidating across the
    /// transition. Returns `None` if another writer got in first.
    pub fn upgrade_to_shared(self) -> Option<SharedPageGuard<'a>> {
        if !self.is_valid() {
            return None;
        }
        let guard = self.frame.latch().shared();
        if self.frame.latch().version() != self.version {
            return None;
        }
        Some(SharedPageGuard { frame: self.frame, frame_id: self.frame_id, inner: guard })
    }

    /// Upgrade to a blocking exclusive guard via try-lock, so a stalled
    /// writer elsewhere can't wedge an upgrading reader indefinitely;
    /// callers loop on `Retry` per the restart idiom (spec.md §9).
    pub fn try_upgrade_to_exclusive(self) -> LatchResult<ExclusivePageGuard<'a>> {
        if !self.is_valid() {
            return LatchResult::Retry;
        }
        match self.frame.latch().try_exclusive() {
            LatchResult::Ok(guard) => LatchResult::Ok(ExclusivePageGuard { frame: self.frame, frame_id: self.frame_id, inner: guard }),
            LatchResult::Retry => LatchResult::Retry,
        }
    }
}

/// A page held with shared (read-only, possibly multi-node) rights.
pub struct SharedPageGuard<'a> {
    frame: &'a BufferFrame,
    frame_id: FrameId,
    inner: SharedGuard<'a, FrameContent>,
}

impl<'a> SharedPageGuard<'a> {
    pub fn try_acquire(frame: &'a BufferFrame, frame_id: FrameId) -> LatchResult<Self> {
        match frame.latch().try_shared() {
            LatchResult::Ok(inner) => LatchResult::Ok(Self { frame, frame_id, inner }),
            LatchResult::Retry => LatchResult::Retry,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page(&self) -> Option<&Page> {
        self.inner.page.as_deref()
    }

    pub fn content(&self) -> &FrameContent {
        &*self.inner
    }
}

/// A page held with exclusive (read/write, single-node) rights.
pub struct ExclusivePageGuard<'a> {
    frame: &'a BufferFrame,
    frame_id: FrameId,
    inner: ExclusiveGuard<'a, FrameContent>,
}

impl<'a> ExclusivePageGuard<'a> {
    pub fn acquire(frame: &'a BufferFrame, frame_id: FrameId) -> Self {
        Self { frame, frame_id, inner: frame.latch().exclusive() }
    }

    pub fn try_acquire(frame: &'a BufferFrame, frame_id: FrameId) -> LatchResult<Self> {
        match frame.latch().try_exclusive() {
            LatchResult::Ok(inner) => LatchResult::Ok(Self { frame, frame_id, inner }),
            LatchResult::Retry => LatchResult::Retry,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn frame(&self) -> &'a BufferFrame {
        self.frame
    }

    pub fn page(&self) -> Option<&Page> {
        self.inner.page.as_deref()
    }

    pub fn page_mut(&mut self) -> Option<&mut Page> {
        self.inner.page.as_deref_mut()
    }

    /// Record a write: bumps `p_version` and marks the frame dirty, per
    /// spec.md §8's "p_version only grows" invariant.
    pub fn mark_written(&mut self) {
        self.frame.bump_p_version();
        self.frame.mark_dirty(true);
    }

    pub fn content_mut(&mut self) -> &mut FrameContent {
        &mut *self.inner
    }

    pub fn downgrade_to_shared(self) -> SharedPageGuard<'a> {
        let frame = self.frame;
        let frame_id = self.frame_id;
        SharedPageGuard { frame, frame_id, inner: self.inner.downgrade_to_shared() }
    }
}
