//! `NodeContext` — the shared state one node's worker API, coherence
//! handler, and page provider all operate against.
//!
//! Per spec.md §9 ("Global mutable state"): the original design reaches
//! every subsystem through a single static `BM::global` pointer; this
//! crate instead injects one `Arc<NodeContext>` into each subsystem's
//! constructor, exactly as §9 recommends ("inject a context handle into
//! guards"). Nothing here is a singleton — a test can construct as many
//! independent `NodeContext`s as it wants `LoopbackFabric`-connected
//! simulated nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferStats, FrameTable};
use crate::buffer::free_lists::{FreeFrames, PidAllocator};
use crate::coherence::mailbox::MailboxPartition;
use crate::coherence::transport::Fabric;
use crate::common::{Config, NodeId};
use crate::storage::page_pool::PagePool;
use crate::storage::ssd::SsdFile;

pub struct NodeContext {
    pub node_id: NodeId,
    pub config: Config,
    pub frame_table: FrameTable,
    pub page_pool: PagePool,
    pub free_frames: FreeFrames,
    pub pid_allocator: PidAllocator,
    pub ssd: Mutex<SsdFile>,
    pub stats: BufferStats,
    /// Global epoch counter driven by the page provider, sampled by every
    /// access to stamp a frame's last-touched time (spec.md §4.4).
    pub global_epoch: AtomicU64,
    /// Pages freed by this node's provider(s) since the epoch was last
    /// bumped; consulted against 10% of `free_limit` to decide when to
    /// bump again (spec.md §4.4 P3).
    pub pages_freed_since_bump: AtomicU64,
    pub fabric: Arc<dyn Fabric>,
    /// This node's own inbox; peers post coherence requests here.
    pub mailbox: Arc<MailboxPartition>,
}

impl NodeContext {
    pub fn new(node_id: NodeId, config: Config, fabric: Arc<dyn Fabric>, ssd: SsdFile) -> Arc<Self> {
        let frame_table = FrameTable::new(&config);
        let page_pool = PagePool::new(&config);
        let free_frames = FreeFrames::new(frame_table.arena_len(), config.page_pool_partitions);
        let pid_allocator = PidAllocator::new(node_id);
        let mailbox = MailboxPartition::new();

        let ctx = Arc::new(Self {
            node_id,
            config,
            frame_table,
            page_pool,
            free_frames,
            pid_allocator,
            ssd: Mutex::new(ssd),
            stats: BufferStats::new(),
            global_epoch: AtomicU64::new(0),
            pages_freed_since_bump: AtomicU64::new(0),
            fabric,
            mailbox,
        });
        ctx.fabric.register(ctx.node_id, ctx.mailbox.clone());
        ctx
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Relaxed)
    }

    pub fn bump_epoch(&self) -> u64 {
        self.global_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record that the provider just freed a page, for the epoch-bump
    /// threshold in [`crate::provider::PageProvider`].
    #[inline]
    pub fn note_page_freed(&self) {
        self.pages_freed_since_bump.fetch_add(1, Ordering::Relaxed);
    }
}
