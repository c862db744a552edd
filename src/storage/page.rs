//! Page — the fundamental 4KB unit of storage.
//!
//! A [`Page`] is a raw, fixed-size byte buffer that is the unit of I/O
//! between the DRAM page pool and the SSD spill tier, and the unit RDMA
//! writes move between nodes. Per spec.md §3 the first 8 bytes are a
//! debug magic; the remainder is opaque payload interpreted by whatever
//! layered structure owns the page.

use crate::common::config::{PAGE_ALIGN, PAGE_MAGIC, PAGE_SIZE};

/// A page of data (4KB, 512-byte aligned for O_DIRECT).
///
/// # Clone
/// `Page` does not implement `Clone` outside tests: copying 4KB is
/// expensive and every real copy in this crate (RDMA write, SSD
/// write/read) is explicit about when it happens.
#[repr(align(512))]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// Create a new zeroed page and stamp the debug magic.
    #[inline]
    pub fn new() -> Self {
        let mut page = Self {
            data: [0u8; PAGE_SIZE],
        };
        page.stamp_magic();
        page
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Opaque payload, i.e. everything after the debug magic.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[8..]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[8..]
    }

    /// Zero the payload and re-stamp the magic, leaving the page ready
    /// for reuse by a new owner.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.stamp_magic();
    }

    #[inline]
    pub const fn size() -> usize {
        PAGE_SIZE
    }

    fn stamp_magic(&mut self) {
        self.data[..8].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
    }

    /// Check the debug magic is intact; a failure indicates corruption
    /// (torn SSD write, stale RDMA buffer) and is a fatal condition for
    /// whoever notices it, not a retryable one.
    pub fn has_valid_magic(&self) -> bool {
        u64::from_le_bytes(self.data[..8].try_into().unwrap()) == PAGE_MAGIC
    }

    /// CRC32 over the payload, used by the SSD tier to detect torn writes.
    pub fn payload_checksum(&self) -> u32 {
        crc32fast::hash(self.payload())
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clone for Page {
    fn clone(&self) -> Self {
        let mut new_page = Page { data: [0u8; PAGE_SIZE] };
        new_page.data.copy_from_slice(&self.data);
        new_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_and_alignment() {
        assert_eq!(std::mem::size_of::<Page>(), PAGE_SIZE);
        assert_eq!(std::mem::align_of::<Page>(), PAGE_ALIGN);
    }

    #[test]
    fn new_page_has_valid_magic_and_zero_payload() {
        let page = Page::new();
        assert!(page.has_valid_magic());
        assert!(page.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn read_write_payload() {
        let mut page = Page::new();
        page.payload_mut()[0] = 0xFF;
        page.payload_mut()[100] = 0xAB;
        assert_eq!(page.payload()[0], 0xFF);
        assert_eq!(page.payload()[100], 0xAB);
    }

    #[test]
    fn reset_reinstates_magic() {
        let mut page = Page::new();
        page.payload_mut()[0] = 0xFF;
        page.reset();
        assert!(page.has_valid_magic());
        assert_eq!(page.payload()[0], 0);
    }

    #[test]
    fn checksum_changes_with_payload() {
        let mut page1 = Page::new();
        let mut page2 = Page::new();
        page1.payload_mut()[10] = 1;
        page2.payload_mut()[10] = 2;
        assert_ne!(page1.payload_checksum(), page2.payload_checksum());
    }

    #[test]
    fn corrupting_magic_is_detected() {
        let mut page = Page::new();
        page.as_mut_slice()[0] = !page.as_mut_slice()[0];
        assert!(!page.has_valid_magic());
    }
}
