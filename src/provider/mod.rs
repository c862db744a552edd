//! The page provider — spec.md §4.4: the background loop that keeps a
//! node's free-frame count above its configured threshold by sampling
//! epochs, evicting owner-local pages (writing dirty ones to SSD first),
//! and asking remote owners to let this node drop cached foreign pages.
//!
//! - [`page_provider::PageProvider`] — one instance per
//!   `config.page_provider_threads`, each responsible for a disjoint
//!   slice of the frame arena

pub mod page_provider;

pub use page_provider::PageProvider;
