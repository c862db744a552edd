//! The page provider — spec.md §4.4: keeps this node's free DRAM pool
//! above its configured threshold by evicting cold frames.
//!
//! One provider per `config.page_provider_threads`, each scanning a
//! disjoint, fixed slice of the frame arena so providers never contend on
//! the same frames (mirrors how [`crate::buffer::free_lists::FreeFrames`]
//! and [`crate::storage::page_pool::PagePool`] shard by partition rather
//! than by lock). Every sweep:
//!
//! 1. samples a handful of this slice's epochs to estimate the
//!    `evict_coolest_epochs` percentile cutoff (spec.md §4.4 P2)
//! 2. walks the slice in batches, picking Hot frames at or below that
//!    cutoff (spec.md §4.4 P3)
//! 3. for frames this node owns, writes dirty pages back to SSD and drops
//!    the DRAM copy directly — no coherence round trip needed, since the
//!    owner's own bookkeeping is authoritative
//! 4. for frames caching a foreign page, batches one eviction request per
//!    remote owner (spec.md §4.4 P4) and drops only the pids the owner
//!    actually confirmed ([`crate::coherence::handler::CoherenceHandler`]
//!    answers these on the owning side)
//!
//! Below `cooling_limit` but still above `free_limit` the provider only
//! tends the epoch counter ("begin preparing"); a full sweep only runs
//! once the pool has dropped below `free_limit` ("actively evict").

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::buffer::frame::{BufferFrame, FrameState};
use crate::buffer::latch::{ExclusiveGuard, LatchResult};
use crate::buffer::possession::Possession;
use crate::coherence::mailbox::{Envelope, EvictionEntry, ResponseSlot};
use crate::coherence::message::{Message, MessageKind};
use crate::common::{FrameId, NodeId, PageId};
use crate::worker::context::NodeContext;

/// Frames sampled per sweep to estimate the cold-epoch cutoff.
const SAMPLE_SIZE: usize = 600;
/// Frames inspected per sweep before re-checking whether enough DRAM has
/// been freed, per spec.md §4.4 P3's "scan in batches".
const EVICT_BATCH: usize = 128;

/// The epoch at the given `fraction` of sorted `epochs` — the cutoff a
/// sampled sweep treats as "cold enough". Factored out so the percentile
/// math can be tested independently of sampling a live frame arena.
fn percentile_cutoff(mut epochs: Vec<u64>, fraction: f64) -> u64 {
    if epochs.is_empty() {
        return 0;
    }
    epochs.sort_unstable();
    let rank = ((epochs.len() as f64) * fraction).floor() as usize;
    epochs[rank.min(epochs.len() - 1)]
}

pub struct PageProvider {
    ctx: Arc<NodeContext>,
    slice_start: usize,
    slice_len: usize,
    cursor: AtomicUsize,
    running: AtomicBool,
}

impl PageProvider {
    /// Build the `index`-th of `threads` providers, each owning a
    /// contiguous, non-overlapping slice of the frame arena; the last
    /// slice absorbs any remainder so the whole arena is covered.
    pub fn new(ctx: Arc<NodeContext>, index: usize, threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let arena_len = ctx.frame_table.arena_len();
        let base_len = arena_len / threads;
        let slice_start = index * base_len;
        let slice_len = if index + 1 == threads { arena_len - slice_start } else { base_len };

        Arc::new(Self {
            ctx,
            slice_start,
            slice_len: slice_len.max(1),
            cursor: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        })
    }

    /// Spawn the eviction loop on its own thread (spec.md §4.4: one
    /// thread per provider). Idles (cooperative yield, not a blocking
    /// wait) above `cooling_limit`; between `cooling_limit` and
    /// `free_limit` it only tends the epoch (the "begin preparing" phase
    /// spec.md §4.4 P3 describes); below `free_limit` it actively evicts.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        std::thread::spawn(move || {
            while provider.running.load(Ordering::Acquire) {
                let free_count = provider.ctx.page_pool.free_count();
                if free_count >= provider.ctx.config.cooling_limit() {
                    std::thread::yield_now();
                    continue;
                }

                provider.maybe_bump_epoch();

                if free_count >= provider.ctx.config.free_limit() {
                    std::thread::yield_now();
                    continue;
                }
                provider.sweep();
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// spec.md §4.4 P3: once more pages have been freed since the epoch
    /// was last bumped than 10% of `free_limit`, advance it. This is what
    /// actually ages `sample_epoch_cutoff`'s view of the arena — without
    /// it every frame would look equally (un)cold forever.
    fn maybe_bump_epoch(&self) {
        let threshold = (((self.ctx.config.free_limit() as f64) * 0.1).ceil() as u64).max(1);
        loop {
            let freed = self.ctx.pages_freed_since_bump.load(Ordering::Relaxed);
            if freed < threshold {
                return;
            }
            if self
                .ctx
                .pages_freed_since_bump
                .compare_exchange(freed, freed - threshold, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.ctx.bump_epoch();
                return;
            }
        }
    }

    /// One eviction sweep over this thread's arena slice.
    fn sweep(&self) {
        let cutoff = self.sample_epoch_cutoff();
        let free_limit = self.ctx.config.free_limit();

        let mut owned_evicted = 0u64;
        let mut by_owner: FxHashMap<NodeId, Vec<(FrameId, PageId)>> = FxHashMap::default();

        let mut scanned = 0;
        while scanned < EVICT_BATCH && self.ctx.page_pool.free_count() < free_limit {
            scanned += 1;
            let frame_id = self.next_candidate();
            let frame = self.ctx.frame_table.frame(frame_id);
            let pid = frame.pid();
            if pid.is_empty() || frame.mh_waiting() || frame.epoch() > cutoff {
                continue;
            }

            let mut guard = match frame.latch().try_exclusive() {
                LatchResult::Ok(guard) => guard,
                LatchResult::Retry => continue,
            };
            if guard.state != FrameState::Hot || guard.page.is_none() {
                continue;
            }

            if pid.owner() == self.ctx.node_id {
                self.evict_owned(frame, &mut guard, pid);
                owned_evicted += 1;
            } else {
                by_owner.entry(pid.owner()).or_default().push((frame_id, pid));
            }
        }

        if owned_evicted > 0 {
            debug!(node = self.ctx.node_id.0, owned_evicted, "page provider dropped owner-local DRAM copies");
        }

        for (owner, entries) in by_owner {
            self.request_foreign_eviction(owner, entries);
        }
    }

    fn next_candidate(&self) -> FrameId {
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slice_len;
        FrameId::new(self.slice_start + offset)
    }

    /// Sample up to [`SAMPLE_SIZE`] frames in this thread's slice and
    /// return the epoch at the `evict_coolest_epochs` percentile — the
    /// threshold below which a frame counts as cold enough to evict
    /// (spec.md §4.4 P2's epoch-based LRU approximation).
    fn sample_epoch_cutoff(&self) -> u64 {
        let mut rng = rand::thread_rng();
        let sample_count = SAMPLE_SIZE.min(self.slice_len);
        let epochs: Vec<u64> = (0..sample_count)
            .map(|_| {
                let idx = self.slice_start + rng.gen_range(0..self.slice_len);
                self.ctx.frame_table.frame(FrameId::new(idx)).epoch()
            })
            .collect();
        percentile_cutoff(epochs, self.ctx.config.evict_coolest_epochs)
    }

    /// Drop this node's own DRAM copy of a page it owns, spilling to SSD
    /// first when dirty or shared with another node (spec.md §4.4 P3). A
    /// clean page nobody else holds a copy of is spilled only with
    /// probability `config.prob_ssd` per mille, and otherwise just
    /// dropped — it can always be recreated as a fresh zero page is never
    /// claimed here, but losing the bytes of a page no other node has a
    /// copy of is exactly what `evict_to_ssd` exists to prevent, so the
    /// roll only ever skips the *write*, never the possession check.
    fn evict_owned(&self, frame: &BufferFrame, guard: &mut ExclusiveGuard<'_, crate::buffer::frame::FrameContent>, pid: PageId) {
        let solely_self = match guard.possession {
            Possession::Exclusive(owner) => owner == self.ctx.node_id,
            Possession::Shared(bm) => bm.count() <= 1 && bm.includes(self.ctx.node_id),
            Possession::Nobody => false,
        };
        let should_spill = self.ctx.config.evict_to_ssd && (frame.is_dirty() || !solely_self || self.spill_roll());

        if should_spill {
            let slot = match guard.ssd_slot {
                Some(slot) => Some(slot),
                None => self.ctx.ssd.lock().allocate_slot().ok(),
            };
            if let Some(slot) = slot {
                let page = guard.page.as_deref().expect("checked Hot+Some above");
                if self.ctx.ssd.lock().write_slot(slot, page, pid).is_ok() {
                    guard.ssd_slot = Some(slot);
                    self.ctx.stats.ssd_writes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if let Some(page) = guard.page.take() {
            self.ctx.page_pool.release(page);
        }
        guard.state = FrameState::Evicted;
        frame.mark_dirty(false);
        self.ctx.stats.evictions.fetch_add(1, Ordering::Relaxed);
        self.ctx.note_page_freed();
    }

    /// `config.prob_ssd` per-mille chance of spilling a clean,
    /// solely-self-possessed page rather than leaving it unwritten
    /// (spec.md §4.4 P3's probabilistic write-back).
    fn spill_roll(&self) -> bool {
        rand::thread_rng().gen_range(0..1000) < self.ctx.config.prob_ssd
    }

    /// Ask `owner` to let this node drop its cached copies of `entries`,
    /// then drop the ones it confirms (spec.md §4.4 P4). Entries the
    /// owner rejects stay cached exactly as they were; this node simply
    /// tries again on a later sweep.
    fn request_foreign_eviction(&self, owner: NodeId, entries: Vec<(FrameId, PageId)>) {
        let batch: Vec<EvictionEntry> = entries
            .iter()
            .map(|&(frame_id, pid)| EvictionEntry {
                pid,
                p_version: self.ctx.frame_table.frame(frame_id).p_version(),
            })
            .collect();
        let request = Message::request(MessageKind::Evr, self.ctx.node_id, PageId::EMPTY, 0);
        let slot = ResponseSlot::new();
        self.ctx.fabric.post(owner, Envelope::eviction_request(request, batch, slot.clone()));
        let response = slot.spin_wait();
        let accepted: std::collections::HashSet<PageId> = response.eviction_response.unwrap_or_default().into_iter().collect();

        for (frame_id, pid) in entries {
            if !accepted.contains(&pid) {
                continue;
            }
            let frame = self.ctx.frame_table.frame(frame_id);
            let mut guard = match frame.latch().try_exclusive() {
                LatchResult::Ok(guard) => guard,
                LatchResult::Retry => continue,
            };
            if let Some(page) = guard.page.take() {
                self.ctx.page_pool.release(page);
                self.ctx.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.ctx.note_page_freed();
            }
            guard.state = FrameState::Evicted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::possession::Bitmap64;
    use crate::coherence::handler::{get_or_create_frame, CoherenceHandler};
    use crate::coherence::transport::LoopbackFabric;
    use crate::common::Config;
    use crate::storage::page::Page;
    use crate::storage::ssd::SsdFile;
    use tempfile::tempdir;

    fn ctx_for(node: u8, dram_gb: u64, dir: &tempfile::TempDir, fabric: Arc<LoopbackFabric>) -> Arc<NodeContext> {
        let cfg = Config { dram_gb, nodes: 2, free_percentage: 50.0, ..Config::default() };
        let ssd_path = dir.path().join(format!("node{node}.ssd"));
        let ssd = SsdFile::create(&ssd_path, 0).unwrap();
        NodeContext::new(NodeId::new(node), cfg, fabric, ssd)
    }

    fn make_hot_owned(ctx: &Arc<NodeContext>, slot: u64, epoch: u64, dirty: bool) -> FrameId {
        let pid = PageId::new(ctx.node_id.0, slot);
        let frame_id = get_or_create_frame(ctx, pid);
        let frame = ctx.frame_table.frame(frame_id);
        {
            let mut guard = frame.latch().exclusive();
            guard.possession = Possession::Exclusive(ctx.node_id);
            guard.state = FrameState::Hot;
            guard.page = Some(ctx.page_pool.acquire().expect("pool should have capacity"));
        }
        frame.stamp_epoch(epoch);
        frame.mark_dirty(dirty);
        frame_id
    }

    #[test]
    fn sample_epoch_cutoff_picks_cold_end_of_sample() {
        let dir = tempdir().unwrap();
        let fabric = LoopbackFabric::new();
        let ctx = ctx_for(0, 1, &dir, fabric);
        for slot in 0..32 {
            make_hot_owned(&ctx, slot, slot, false);
        }
        let provider = PageProvider::new(ctx.clone(), 0, 1);
        let cutoff = provider.sample_epoch_cutoff();
        assert!(cutoff <= ctx.frame_table.arena_len() as u64);
    }

    #[test]
    fn sweep_evicts_cold_owned_dirty_page_to_ssd() {
        let dir = tempdir().unwrap();
        let fabric = LoopbackFabric::new();
        let ctx = ctx_for(0, 1, &dir, fabric);
        let frame_id = make_hot_owned(&ctx, 5, 0, true);
        // Starve the pool so the sweep's free-count gate fires.
        let mut held = Vec::new();
        while let Some(p) = ctx.page_pool.acquire() {
            held.push(p);
        }

        let provider = PageProvider::new(ctx.clone(), 0, 1);
        provider.sweep();

        let frame = ctx.frame_table.frame(frame_id);
        let guard = frame.latch().shared();
        assert_eq!(guard.state, FrameState::Evicted);
        assert!(guard.page.is_none());
        assert!(guard.ssd_slot.is_some());
        assert_eq!(ctx.stats.snapshot().ssd_writes, 1);
    }

    #[test]
    fn sweep_requests_eviction_of_cached_foreign_page() {
        let dir = tempdir().unwrap();
        let fabric = LoopbackFabric::new();
        let owner_ctx = ctx_for(0, 1, &dir, fabric.clone());
        let caching_ctx = ctx_for(1, 1, &dir, fabric);
        let owner_handler = CoherenceHandler::new(owner_ctx.clone());
        let _owner_thread = owner_handler.spawn();

        let pid = PageId::new(0, 9);
        // The owner thinks node 1 holds a shared copy.
        {
            let frame_id = get_or_create_frame(&owner_ctx, pid);
            let frame = owner_ctx.frame_table.frame(frame_id);
            let mut guard = frame.latch().exclusive();
            guard.possession = Possession::Shared(Bitmap64::singleton(NodeId::new(1)));
            guard.state = FrameState::Hot;
            guard.page = Some(Box::new(Page::new()));
        }

        // node 1 caches it locally too.
        let frame_id = get_or_create_frame(&caching_ctx, pid);
        {
            let frame = caching_ctx.frame_table.frame(frame_id);
            let mut guard = frame.latch().exclusive();
            guard.possession = Possession::Shared(Bitmap64::singleton(NodeId::new(1)));
            guard.state = FrameState::Hot;
            guard.page = Some(caching_ctx.page_pool.acquire().unwrap());
        }
        caching_ctx.frame_table.frame(frame_id).stamp_epoch(0);

        let mut held = Vec::new();
        while let Some(p) = caching_ctx.page_pool.acquire() {
            held.push(p);
        }

        let provider = PageProvider::new(caching_ctx.clone(), 0, 1);
        provider.sweep();
        owner_handler.stop();

        let guard = caching_ctx.frame_table.frame(frame_id).latch().shared();
        assert_eq!(guard.state, FrameState::Evicted);
        assert!(guard.page.is_none());
    }
}
