//! `BufferManager` — the facade a layered collaborator actually calls,
//! per spec.md §4.5. It owns no state of its own beyond an
//! [`Arc<NodeContext>`]; every operation is a pure function of that
//! context, which is why tests can spin up several `BufferManager`s
//! sharing one [`crate::coherence::LoopbackFabric`] to simulate a
//! cluster in one process.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::buffer::access::{Access, AccessIntent};
use crate::buffer::frame::FrameState;
use crate::buffer::guard::ExclusivePageGuard;
use crate::buffer::latch::LatchResult;
use crate::buffer::possession::{Bitmap64, Possession};
use crate::coherence::handler::get_or_create_frame;
use crate::coherence::mailbox::{Envelope, ResponseSlot};
use crate::coherence::message::{Message, MessageKind, ResultCode};
use crate::common::{NodeId, PageId};
use crate::worker::context::NodeContext;

/// Outcome of one round trip against a remote node during [`BufferManager::fix`].
enum RequestOutcome {
    /// The frame now holds what the caller asked for; re-check locally.
    Installed,
    /// Possession moved under us or the remote side asked us to restart;
    /// the whole `fix` loop runs again from the top.
    Restart,
}

/// The facade a layered collaborator drives: `fix`, `new_page`,
/// `new_remote_page`, `reclaim_page`, plus the node-0 catalog root
/// (spec.md §4.6, the supplemental catalog pointer).
pub struct BufferManager {
    ctx: Arc<NodeContext>,
}

impl BufferManager {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    /// Establish the possession `access` needs, run it against the page,
    /// and return its result. Loops until possession is established
    /// locally; never returns a partial failure (spec.md §7: the only
    /// exits are success, an unbounded retry loop, or a fatal abort).
    #[instrument(skip(self, access), fields(node = self.ctx.node_id.0))]
    pub fn fix<R>(&self, pid: PageId, access: impl Access<R>) -> R {
        let ctx = &self.ctx;
        let intent = access.intent();
        let mut retries: u32 = 0;

        loop {
            let frame_id = get_or_create_frame(ctx, pid);
            let frame = ctx.frame_table.frame(frame_id);
            frame.stamp_epoch(ctx.epoch());

            if frame.mh_waiting() {
                std::hint::spin_loop();
                continue;
            }

            let mut guard = ExclusivePageGuard::acquire(frame, frame_id);

            // Fault bytes back in from the SSD tier if we own them but the
            // page provider already spilled them (spec.md §4.5).
            if guard.content_mut().state == FrameState::Evicted
                && guard.page().is_none()
                && guard.content_mut().ssd_slot.is_some()
                && guard.content_mut().possession.includes(ctx.node_id)
            {
                let slot = guard.content_mut().ssd_slot.unwrap();
                let page = {
                    let mut ssd = ctx.ssd.lock();
                    ssd.read_slot(slot, pid).expect("ssd read failed (spec.md §7 regime 3: operational failure)")
                };
                ctx.stats.ssd_reads.fetch_add(1, Ordering::Relaxed);
                let content = guard.content_mut();
                content.page = Some(Box::new(page));
                content.state = FrameState::Hot;
            }

            let satisfied = match intent {
                AccessIntent::Shared => guard.content_mut().possession.includes(ctx.node_id) && guard.page().is_some(),
                AccessIntent::Exclusive => {
                    guard.content_mut().possession == Possession::Exclusive(ctx.node_id) && guard.page().is_some()
                }
            };

            if satisfied {
                ctx.stats.local_hits.fetch_add(1, Ordering::Relaxed);
                let page = guard.page_mut().expect("checked above");
                let result = access.run(page);
                if intent == AccessIntent::Exclusive {
                    guard.mark_written();
                }
                return result;
            }

            ctx.stats.remote_fetches.fetch_add(1, Ordering::Relaxed);
            let local_version = frame.p_version();
            drop(guard);

            match self.request_possession(pid.owner(), pid, intent, local_version) {
                RequestOutcome::Installed => continue,
                RequestOutcome::Restart => {
                    retries += 1;
                    ctx.stats.restarts.fetch_add(1, Ordering::Relaxed);
                    if retries >= ctx.config.message_handler_max_retries {
                        panic!(
                            "fix({pid}) exceeded message_handler_max_retries ({}) — spec.md §7 regime 3 operational failure",
                            ctx.config.message_handler_max_retries
                        );
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn request_possession(&self, target: NodeId, pid: PageId, intent: AccessIntent, local_version: u64) -> RequestOutcome {
        let ctx = &self.ctx;
        let kind = match intent {
            AccessIntent::Shared => MessageKind::Prs,
            AccessIntent::Exclusive => MessageKind::Prx,
        };
        let request = Message::request(kind, ctx.node_id, pid, local_version);
        let slot = ResponseSlot::new();
        ctx.fabric.post(target, Envelope::request(request, slot.clone()));
        let response = slot.spin_wait();
        debug!(?target, ?pid, result = ?response.message.result, "possession response");
        self.apply_possession_response(pid, intent, response)
    }

    fn apply_possession_response(&self, pid: PageId, intent: AccessIntent, envelope: Envelope) -> RequestOutcome {
        let ctx = &self.ctx;
        match envelope.message.result {
            ResultCode::WithPage | ResultCode::WithPageSharedConflict => {
                let page = envelope.page.expect("WithPage* result must carry page bytes");
                self.install(pid, intent, page);
                RequestOutcome::Installed
            }
            ResultCode::NoPageEvicted => {
                // The owner's bytes are evicted but some node still has a
                // shared copy; fetch straight from that node via PCR.
                self.copy_from(envelope.message.aux_node, pid)
            }
            ResultCode::NoPageExclusiveConflict if intent == AccessIntent::Shared => {
                // Someone else holds exclusive rights; ask them directly
                // for a read-only copy instead of disturbing their
                // possession through the owner.
                self.copy_from(envelope.message.aux_node, pid)
            }
            ResultCode::NoPageSharedConflict | ResultCode::NoPageExclusiveConflict => {
                // The owner's metadata has already moved; retrying against
                // the owner still makes forward progress (spec.md §9 open
                // question on the bookkeeping-before-fetch-succeeds
                // window — see DESIGN.md).
                RequestOutcome::Restart
            }
            ResultCode::NoPage => {
                panic!("fix({pid}) against a pid nobody has ever possessed — spec.md §7 regime 2 fatal invariant violation");
            }
            ResultCode::CopyFailedWithRestart | ResultCode::CopyFailedWithInvalidation => RequestOutcome::Restart,
            other => panic!("unexpected possession response {other:?} for {pid}"),
        }
    }

    fn copy_from(&self, provider: NodeId, pid: PageId) -> RequestOutcome {
        let ctx = &self.ctx;
        let request = Message::request(MessageKind::Pcr, ctx.node_id, pid, 0);
        let slot = ResponseSlot::new();
        ctx.fabric.post(provider, Envelope::request(request, slot.clone()));
        let response = slot.spin_wait();
        match response.message.result {
            ResultCode::WithPage => {
                let page = response.page.expect("PCR WithPage result must carry page bytes");
                self.install(pid, AccessIntent::Shared, page);
                RequestOutcome::Installed
            }
            _ => RequestOutcome::Restart,
        }
    }

    fn install(&self, pid: PageId, intent: AccessIntent, page: Box<crate::storage::page::Page>) {
        let ctx = &self.ctx;
        let frame_id = get_or_create_frame(ctx, pid);
        let frame = ctx.frame_table.frame(frame_id);
        let mut guard = frame.latch().exclusive();
        let content = &mut *guard;
        content.page = Some(page);
        content.state = FrameState::Hot;
        content.possession = match intent {
            AccessIntent::Exclusive => Possession::Exclusive(ctx.node_id),
            AccessIntent::Shared => {
                let mut bitmap = match content.possession {
                    Possession::Shared(bm) => bm,
                    _ => Bitmap64::EMPTY,
                };
                bitmap.set(ctx.node_id);
                Possession::Shared(bitmap)
            }
        };
    }

    /// Allocate a fresh, locally owned page held exclusively by this
    /// node (spec.md §4.5). The returned guard is already positioned at
    /// slot 0 of a freshly zeroed page.
    pub fn new_page(&self) -> ExclusivePageGuard<'_> {
        let ctx = &self.ctx;
        let pid = ctx.pid_allocator.allocate();
        self.install_fresh_local_page(pid, ctx.epoch())
    }

    /// Ask `target` to allocate a pid it will own, then install a fresh
    /// local frame for it held exclusively by this node, stamped with a
    /// very low epoch so the page provider treats it as an eviction
    /// priority here (spec.md §4.5) — the page's *content* lives wherever
    /// this node keeps it until the owner later reclaims the pid.
    #[instrument(skip(self))]
    pub fn new_remote_page(&self, target: NodeId) -> PageId {
        let ctx = &self.ctx;
        let request = Message::request(MessageKind::Rar, ctx.node_id, PageId::EMPTY, 0);
        let slot = ResponseSlot::new();
        ctx.fabric.post(target, Envelope::request(request, slot.clone()));
        let response = slot.spin_wait();
        let pid = response.message.aux_pid;
        self.install_fresh_local_page(pid, 0);
        pid
    }

    fn install_fresh_local_page(&self, pid: PageId, epoch: u64) -> ExclusivePageGuard<'_> {
        let ctx = &self.ctx;
        let page = loop {
            match ctx.page_pool.acquire() {
                Some(p) => break p,
                None => std::hint::spin_loop(),
            }
        };
        let frame_id = loop {
            match ctx.free_frames.acquire() {
                Some(id) => break id,
                None => std::hint::spin_loop(),
            }
        };
        let frame = ctx.frame_table.frame(frame_id);
        {
            let witness = frame.latch().exclusive();
            frame.set_pid(pid, &witness);
        }
        match ctx.frame_table.find_frame_or_insert(pid, frame_id) {
            None => {}
            Some(_) => unreachable!("freshly allocated pid {pid} already had a local frame"),
        }

        let mut guard = ExclusivePageGuard::acquire(frame, frame_id);
        let content = guard.content_mut();
        content.possession = Possession::Exclusive(ctx.node_id);
        content.state = FrameState::Hot;
        content.page = Some(page);
        frame.stamp_epoch(epoch);
        guard
    }

    /// Release a locally resident frame. For a pid this node owns, the
    /// frame and its page return all the way to the free lists. For a
    /// foreign pid (cached possession only), this node simply drops its
    /// local bytes — the owner's own page provider will eventually learn
    /// the same way ordinary eviction does (spec.md §9's reclaim-page open
    /// question; see DESIGN.md for why this crate chose not to add a new
    /// RPC for it).
    pub fn reclaim_page(&self, frame_id: crate::common::FrameId, pid: PageId) {
        let ctx = &self.ctx;
        let frame = ctx.frame_table.frame(frame_id);
        let mut guard = frame.latch().exclusive();

        if pid.owner() == ctx.node_id {
            let page = guard.page.take();
            guard.possession = Possession::Nobody;
            guard.state = FrameState::Free;
            guard.ssd_slot = None;
            drop(guard);

            ctx.frame_table.remove_frame(pid, frame_id);
            {
                let witness = frame.latch().exclusive();
                frame.set_pid(PageId::EMPTY, &witness);
            }
            ctx.free_frames.release(frame_id);
            if let Some(page) = page {
                ctx.page_pool.release(page);
            }
        } else {
            if let Some(page) = guard.page.take() {
                ctx.page_pool.release(page);
                ctx.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            guard.state = FrameState::Evicted;
        }
    }

    /// The cluster's single root page (spec.md §4.6). Materializes it on
    /// node 0 the first time it is touched on a fresh store; every other
    /// node simply `fix`es `PageId::CATALOG` like any other foreign page.
    pub fn catalog<R>(&self, access: impl Access<R>) -> R {
        self.ensure_catalog_exists();
        self.fix(PageId::CATALOG, access)
    }

    fn ensure_catalog_exists(&self) {
        let ctx = &self.ctx;
        loop {
            match ctx.frame_table.find_frame(PageId::CATALOG) {
                LatchResult::Ok(Some(_)) => return,
                LatchResult::Retry => continue,
                LatchResult::Ok(None) => {
                    assert_eq!(
                        ctx.node_id,
                        NodeId::new(0),
                        "the catalog root can only be materialized by node 0"
                    );
                    let page = loop {
                        match ctx.page_pool.acquire() {
                            Some(p) => break p,
                            None => std::hint::spin_loop(),
                        }
                    };
                    let frame_id = loop {
                        match ctx.free_frames.acquire() {
                            Some(id) => break id,
                            None => std::hint::spin_loop(),
                        }
                    };
                    let frame = ctx.frame_table.frame(frame_id);
                    {
                        let witness = frame.latch().exclusive();
                        frame.set_pid(PageId::CATALOG, &witness);
                    }
                    match ctx.frame_table.find_frame_or_insert(PageId::CATALOG, frame_id) {
                        None => {
                            let mut guard = frame.latch().exclusive();
                            guard.possession = Possession::Exclusive(ctx.node_id);
                            guard.state = FrameState::Hot;
                            guard.page = Some(page);
                            return;
                        }
                        Some(_) => {
                            // Lost the race to another thread; give our
                            // spare frame and page back and retry the loop.
                            {
                                let witness = frame.latch().exclusive();
                                frame.set_pid(PageId::EMPTY, &witness);
                            }
                            ctx.free_frames.release(frame_id);
                            ctx.page_pool.release(page);
                        }
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> crate::buffer::StatsSnapshot {
        self.ctx.stats.snapshot()
    }
}
