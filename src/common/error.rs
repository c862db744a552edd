//! Error types for meshpool.
//!
//! Per the three-regime error model: retryable conditions never appear
//! here (they are encoded in guard/outcome return types so the caller is
//! forced to loop), fatal invariant violations `panic!` at the point of
//! discovery, and only operational failures (disk, allocation, the
//! transport layer) are represented as [`Error`].

use thiserror::Error;

use crate::common::{NodeId, PageId};

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Operational failures the buffer manager has no retry policy for.
///
/// These map directly onto spec.md §7 regime 3: SSD I/O short reads/writes,
/// RDMA `post_send` failures, `mmap`/huge-page allocation failure. None of
/// these are recoverable by the core; callers at the process boundary
/// decide whether to abort or restart the node.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from SSD spill-tier operations.
    #[error("ssd i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A `pread`/`pwrite` returned fewer bytes than requested.
    #[error("short {kind} on page {page_id}: expected {expected} bytes, got {actual}")]
    ShortIo {
        kind: &'static str,
        page_id: PageId,
        expected: usize,
        actual: usize,
    },

    /// The page does not exist on the SSD spill tier.
    #[error("page {0} not found on ssd")]
    PageNotFound(PageId),

    /// The DRAM page pool, frame pool, or pid pool is exhausted and no
    /// eviction made progress.
    #[error("buffer manager exhausted: {0}")]
    PoolExhausted(&'static str),

    /// A remote mailbox round-trip failed after exhausting
    /// `message_handler_max_retries`.
    #[error("possession request for {0} failed after max retries")]
    CopyFailedWithRestart(PageId),

    /// The fabric (RDMA verbs or loopback transport) rejected a post.
    #[error("fabric post to node {0} failed: {1}")]
    FabricPost(NodeId, &'static str),

    /// The target node is not present in the node table.
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
}
