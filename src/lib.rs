//! meshpool - a distributed shared-memory buffer manager for an
//! RDMA-connected cluster.
//!
//! Every node in the cluster runs the same stack:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         node process                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │  worker::BufferManager   fix / new_page / new_remote_page /   │
//! │                          reclaim_page — the facade callers    │
//! │                          actually drive                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │  buffer::FrameTable      one hash-partitioned frame-table,    │
//! │  buffer::HybridLatch     latched per-frame, tracked via an    │
//! │  buffer::Possession      epoch + a possession bitmap/owner    │
//! ├───────────────────────────────────────────────────────────────┤
//! │  coherence::Handler      answers PRS/PRX/PMR/PCR/PUR/RAR/EVR  │
//! │  coherence::Fabric       messages from peers over the fabric  │
//! ├───────────────────────────────────────────────────────────────┤
//! │  provider::PageProvider  samples epochs, evicts cold frames,  │
//! │                          spills dirty owner-local pages       │
//! ├───────────────────────────────────────────────────────────────┤
//! │  storage::PagePool       DRAM page storage and the SSD spill  │
//! │  storage::SsdFile        tier pages fall back to under       │
//! │                          memory pressure                      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - shared primitives: ids, config, the error taxonomy
//! - [`buffer`] - frame table, hybrid latches, possession bookkeeping
//! - [`coherence`] - wire messages and the possession-request handler
//! - [`provider`] - background eviction / SSD spill
//! - [`storage`] - page layout, the DRAM page pool, the SSD file
//! - [`worker`] - the `BufferManager` facade and per-node context
//! - [`cluster`] - the static node-address table
//!
//! # Quick start
//! ```no_run
//! use meshpool::common::Config;
//! use meshpool::coherence::LoopbackFabric;
//! use meshpool::storage::SsdFile;
//! use meshpool::worker::{BufferManager, NodeContext};
//! use meshpool::NodeId;
//!
//! let config = Config::single_node("/tmp/meshpool.ssd");
//! let fabric = LoopbackFabric::new();
//! let ssd = SsdFile::open_or_create(&config.ssd_path, config.ssd_gib).unwrap();
//! let ctx = NodeContext::new(NodeId::new(0), config, fabric, ssd);
//! let bm = BufferManager::new(ctx);
//!
//! let mut guard = bm.new_page();
//! guard.page_mut().unwrap().payload_mut()[0] = 7;
//! ```

pub mod buffer;
pub mod cluster;
pub mod coherence;
pub mod common;
pub mod provider;
pub mod storage;
pub mod worker;

// Re-export commonly used items at crate root for convenience.
pub use common::config::PAGE_SIZE;
pub use common::{Config, Error, FrameId, NodeId, PageId, Result};

pub use buffer::{BufferStats, FrameTable, StatsSnapshot};
pub use coherence::{CoherenceHandler, Fabric, LoopbackFabric};
pub use storage::{Page, PagePool, SsdFile};
pub use worker::BufferManager;
