//! The frame table: a fixed-size hashtable mapping [`PageId`] to the
//! frame currently holding it, per spec.md §4.1.
//!
//! Buckets are themselves [`BufferFrame`]s with `is_ht_bucket` set —
//! they hold no page, only a chain head pointer — so bucket latches and
//! frame latches share one implementation. Overflow frames hang off a
//! bucket through the arena-indexed `next` chain (spec.md §9 "Cyclic
//! metadata"). Lookups walk the chain optimistically: plain atomic
//! reads of `next`/`pid` with no latch held, validated against the
//! bucket's `ht_bucket_latch` version once the walk completes.

use crate::buffer::frame::BufferFrame;
use crate::buffer::latch::LatchResult;
use crate::common::{Config, FrameId, PageId};

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

pub struct FrameTable {
    buckets: Vec<BufferFrame>,
    arena: Vec<BufferFrame>,
    bucket_mask: u64,
}

impl FrameTable {
    /// Build a table sized for `config`'s DRAM capacity, with one arena
    /// frame per page plus one bucket frame per hash slot.
    pub fn new(config: &Config) -> Self {
        let bucket_count = config.bucket_count();
        let arena_size = config.dram_page_capacity();
        Self {
            buckets: (0..bucket_count).map(|_| BufferFrame::new_free(true)).collect(),
            arena: (0..arena_size).map(|_| BufferFrame::new_free(false)).collect(),
            bucket_mask: bucket_count as u64 - 1,
        }
    }

    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    pub fn frame(&self, id: FrameId) -> &BufferFrame {
        &self.arena[id.index()]
    }

    fn bucket_for(&self, pid: PageId) -> &BufferFrame {
        let idx = (mix64(pid.raw()) & self.bucket_mask) as usize;
        &self.buckets[idx]
    }

    /// Optimistically walk the chain for `pid`'s bucket. Returns
    /// `LatchResult::Retry` if a concurrent insert/remove raced the
    /// walk; the caller re-invokes per spec.md §9's restart-loop idiom.
    pub fn find_frame(&self, pid: PageId) -> LatchResult<Option<FrameId>> {
        let bucket = self.bucket_for(pid);
        let before = bucket.ht_bucket_latch().version();
        if crate::buffer::latch::HybridLatch::<()>::is_locked(before) {
            return LatchResult::Retry;
        }

        let mut cursor = bucket.next();
        let mut found = None;
        while !cursor.is_none() {
            let frame = self.frame(cursor);
            if frame.pid() == pid {
                found = Some(cursor);
                break;
            }
            cursor = frame.next();
        }

        if bucket.ht_bucket_latch().version() != before {
            return LatchResult::Retry;
        }
        LatchResult::Ok(found)
    }

    /// Link `frame_id` at the head of `pid`'s bucket chain. The caller
    /// must already have stamped `frame_id`'s own `pid` under its content
    /// latch before linking it in, so any concurrent walker that
    /// observes the new head always sees a consistent pid.
    pub fn insert_frame(&self, pid: PageId, frame_id: FrameId) {
        let bucket = self.bucket_for(pid);
        let guard = bucket.ht_bucket_latch().exclusive();
        let old_head = bucket.next();
        self.frame(frame_id).set_next(old_head, &guard);
        bucket.set_next(frame_id, &guard);
    }

    /// Unlink `frame_id` from `pid`'s bucket chain.
    pub fn remove_frame(&self, pid: PageId, frame_id: FrameId) {
        let bucket = self.bucket_for(pid);
        let guard = bucket.ht_bucket_latch().exclusive();

        let mut cursor = bucket.next();
        if cursor == frame_id {
            bucket.set_next(self.frame(frame_id).next(), &guard);
            return;
        }

        while !cursor.is_none() {
            let frame = self.frame(cursor);
            let next = frame.next();
            if next == frame_id {
                frame.set_next(self.frame(frame_id).next(), &guard);
                return;
            }
            cursor = next;
        }
    }

    /// Find `pid`'s frame, inserting `frame_id` under the bucket's
    /// exclusive latch if no frame is found — collapses the common
    /// "look up or materialize" sequence into one critical section so
    /// two racing fixes can't both decide to insert (spec.md §4.1).
    pub fn find_frame_or_insert(&self, pid: PageId, frame_id: FrameId) -> Option<FrameId> {
        let bucket = self.bucket_for(pid);
        let guard = bucket.ht_bucket_latch().exclusive();

        let mut cursor = bucket.next();
        while !cursor.is_none() {
            let frame = self.frame(cursor);
            if frame.pid() == pid {
                return Some(cursor);
            }
            cursor = frame.next();
        }

        let old_head = bucket.next();
        self.frame(frame_id).set_next(old_head, &guard);
        bucket.set_next(frame_id, &guard);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::latch::LatchResult;

    fn cfg() -> Config {
        Config { dram_gb: 1, ..Config::default() }
    }

    #[test]
    fn find_frame_on_empty_table_finds_nothing() {
        let table = FrameTable::new(&cfg());
        let pid = PageId::new(0, 1);
        match table.find_frame(pid) {
            LatchResult::Ok(None) => {}
            other => panic!("expected Ok(None), got retry/found: {:?}", matches!(other, LatchResult::Retry)),
        }
    }

    #[test]
    fn insert_then_find_round_trips() {
        let table = FrameTable::new(&cfg());
        let pid = PageId::new(0, 42);
        let frame_id = FrameId::new(0);
        {
            let guard = table.frame(frame_id).latch().exclusive();
            table.frame(frame_id).set_pid(pid, &guard);
        }
        table.insert_frame(pid, frame_id);

        match table.find_frame(pid) {
            LatchResult::Ok(Some(found)) => assert_eq!(found, frame_id),
            other => panic!("expected to find frame, got retry/none: {:?}", matches!(other, LatchResult::Retry)),
        }
    }

    #[test]
    fn remove_frame_unlinks_it() {
        let table = FrameTable::new(&cfg());
        let pid = PageId::new(0, 7);
        let frame_id = FrameId::new(1);
        {
            let guard = table.frame(frame_id).latch().exclusive();
            table.frame(frame_id).set_pid(pid, &guard);
        }
        table.insert_frame(pid, frame_id);
        table.remove_frame(pid, frame_id);

        match table.find_frame(pid) {
            LatchResult::Ok(None) => {}
            other => panic!("expected removal to take effect: {:?}", matches!(other, LatchResult::Retry)),
        }
    }

    #[test]
    fn chained_inserts_in_same_bucket_all_findable() {
        let table = FrameTable::new(&Config { dram_gb: 1, partition_bits: 1, ..Config::default() });
        // Force collisions by reusing slot 0 bucket math isn't directly
        // controllable, so just insert several pages and confirm each is
        // independently findable regardless of chain depth.
        let mut ids = Vec::new();
        for i in 0..8u64 {
            let pid = PageId::new(0, i);
            let frame_id = FrameId::new(i as usize);
            let guard = table.frame(frame_id).latch().exclusive();
            table.frame(frame_id).set_pid(pid, &guard);
            drop(guard);
            table.insert_frame(pid, frame_id);
            ids.push((pid, frame_id));
        }
        for (pid, frame_id) in ids {
            match table.find_frame(pid) {
                LatchResult::Ok(Some(found)) => assert_eq!(found, frame_id),
                other => panic!("lost frame in chain: {:?}", matches!(other, LatchResult::Retry)),
            }
        }
    }

    #[test]
    fn find_frame_or_insert_only_inserts_once() {
        let table = FrameTable::new(&cfg());
        let pid = PageId::new(0, 99);
        let frame_id = FrameId::new(2);
        {
            let guard = table.frame(frame_id).latch().exclusive();
            table.frame(frame_id).set_pid(pid, &guard);
        }

        assert_eq!(table.find_frame_or_insert(pid, frame_id), None);
        assert_eq!(table.find_frame_or_insert(pid, frame_id), Some(frame_id));
    }
}
