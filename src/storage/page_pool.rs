//! The DRAM page pool.
//!
//! Pages are pre-allocated up front and handed out through
//! `page_pool_partitions` independent shards so that producers and
//! consumers on different hash-table partitions don't contend on one
//! global lock, per spec.md §3 ("Free lists... partitioned"). In a real
//! deployment this pool would be huge-page backed; here each page is a
//! heap `Box<Page>`, which is the honest substitute since huge-page
//! `mmap` is a platform/ops concern outside what a reimplementation's
//! core logic needs to assume (spec.md §7 regime 3 already treats
//! allocation failure there as fatal, not something the core works
//! around).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::common::Config;
use crate::storage::page::Page;

/// An owned page, allocated on the heap and handed around by value as it
/// moves between the pool, a frame, and back.
pub type PagePtr = Box<Page>;

/// Partitioned pool of free [`Page`] buffers.
pub struct PagePool {
    partitions: Vec<Mutex<VecDeque<PagePtr>>>,
    next_partition: AtomicUsize,
    total_capacity: usize,
}

impl PagePool {
    /// Pre-allocate `config.dram_page_capacity()` pages, spread evenly
    /// across `config.page_pool_partitions` shards.
    pub fn new(config: &Config) -> Self {
        let partition_count = config.page_pool_partitions.max(1);
        let capacity = config.dram_page_capacity();

        let mut partitions: Vec<Mutex<VecDeque<PagePtr>>> =
            (0..partition_count).map(|_| Mutex::new(VecDeque::new())).collect();

        for i in 0..capacity {
            partitions[i % partition_count].lock().push_back(Box::new(Page::new()));
        }

        Self {
            partitions,
            next_partition: AtomicUsize::new(0),
            total_capacity: capacity,
        }
    }

    /// Total number of pages this pool was created with.
    pub fn capacity(&self) -> usize {
        self.total_capacity
    }

    /// Number of pages currently free across all partitions.
    pub fn free_count(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    /// Acquire one free page, trying partitions round-robin until one
    /// yields a page. Returns `None` if every partition is empty — the
    /// caller (the page provider, ultimately) is responsible for making
    /// more pages free via eviction.
    pub fn acquire(&self) -> Option<PagePtr> {
        let start = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        for offset in 0..self.partitions.len() {
            let idx = (start + offset) % self.partitions.len();
            if let Some(page) = self.partitions[idx].lock().pop_back() {
                return Some(page);
            }
        }
        None
    }

    /// Return a page to a partition, chosen round-robin to keep shards
    /// balanced.
    pub fn release(&self, mut page: PagePtr) {
        page.reset();
        let idx = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.partitions[idx].lock().push_back(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dram_gb: u64, partitions: usize) -> Config {
        Config {
            dram_gb,
            page_pool_partitions: partitions,
            ..Config::default()
        }
    }

    #[test]
    fn preallocates_full_capacity() {
        let pool = PagePool::new(&cfg(1, 4));
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let pool = PagePool::new(&cfg(1, 4));
        let before = pool.free_count();
        let page = pool.acquire().unwrap();
        assert_eq!(pool.free_count(), before - 1);
        pool.release(page);
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn exhausts_cleanly() {
        let pool = PagePool::new(&cfg(1, 2));
        let cap = pool.capacity();
        let mut pages = Vec::new();
        for _ in 0..cap {
            pages.push(pool.acquire().expect("pool should have capacity"));
        }
        assert!(pool.acquire().is_none());
        assert_eq!(pool.free_count(), 0);
    }
}
