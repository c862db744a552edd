//! Per-node buffer management: frames, latching, the frame table, and
//! the free lists the coherence and page-provider layers build on.
//!
//! # Components
//! - [`frame::BufferFrame`] — one DRAM slot holding possession + page state
//! - [`latch::HybridLatch`] — optimistic/shared/exclusive latching
//! - [`frame_table::FrameTable`] — the page-id-to-frame hashtable
//! - [`free_lists`] — partitioned free frame and page-id pools
//! - [`guard`] — worker-facing RAII page guards
//! - [`access`] — access functors passed to `fix`
//! - [`possession::Possession`] — shared/exclusive/nobody per page
//! - [`stats::BufferStats`] — runtime counters

pub mod access;
pub mod free_lists;
pub mod frame;
pub mod frame_table;
pub mod guard;
pub mod latch;
pub mod possession;
pub mod stats;

pub use access::{Access, AccessIntent};
pub use frame::{BufferFrame, FrameContent, FrameState};
pub use frame_table::FrameTable;
pub use guard::{ExclusivePageGuard, OptimisticPageGuard, SharedPageGuard};
pub use latch::{ExclusiveGuard, HybridLatch, LatchResult, SharedGuard};
pub use possession::{Bitmap64, Possession};
pub use stats::{BufferStats, StatsSnapshot};
