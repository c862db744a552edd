//! Configuration constants and the cluster [`Config`] struct.

/// Size of a page in bytes (4KB).
///
/// # Alignment
/// Pages are aligned to 512 bytes, the minimum required for `O_DIRECT`
/// writes to the SSD spill tier (spec.md §3).
pub const PAGE_SIZE: usize = 4096;

/// Alignment of a [`Page`](crate::storage::page::Page), matching the
/// minimum O_DIRECT sector size.
pub const PAGE_ALIGN: usize = 512;

/// Magic bytes written to the first 8 bytes of every page for debugging.
pub const PAGE_MAGIC: u64 = 0x4D45_5348_504F_4F4C; // "MESHPOOL" in ASCII hex-ish

/// Size of a buffer frame's metadata record, per spec.md §3 ("≤ 128
/// bytes, two cache lines"). Asserted against `size_of::<BufferFrame>()`
/// in `buffer::frame` tests.
pub const MAX_FRAME_BYTES: usize = 128;

/// Cluster- and node-wide tuning knobs, enumerated exactly as spec.md §6
/// lists them, with the documented defaults. Constructing this is an
/// external collaborator's job (e.g. a CLI harness parsing
/// `--flag=value` pairs) — that parsing is explicitly out of scope here;
/// `Config` is the typed surface the core consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // -- basic sizing --
    /// DRAM pool size, gibibytes.
    pub dram_gb: u64,
    /// Number of worker threads the layered collaborator runs (informational
    /// only; the core does not spawn these).
    pub worker: usize,
    /// Batch size used by the partitioned free lists.
    pub batch_size: usize,

    // -- eviction policy --
    /// Number of page-provider threads; must be a power of two.
    pub page_provider_threads: usize,
    /// Percentage of the DRAM pool below which the provider evicts actively.
    pub free_percentage: f64,
    /// Percentage of the DRAM pool below which the provider starts preparing.
    pub cooling_percentage: f64,
    /// Fraction (of sampled epochs) used as the eviction window percentile.
    pub evict_coolest_epochs: f64,

    // -- SSD tier --
    pub ssd_path: std::path::PathBuf,
    pub ssd_gib: u64,
    pub evict_to_ssd: bool,
    /// Per-mille probability of fully dropping a self-shared-only frame
    /// instead of writing it back, per spec.md §4.4 P3.
    pub prob_ssd: u32,
    /// GiB of zeroed preallocation to perform at startup; 0 disables it.
    pub falloc: u64,

    // -- cluster --
    pub nodes: usize,
    pub own_ip: std::net::IpAddr,
    pub port: u16,
    pub rdma_memory_factor: f64,

    // -- coherence handler --
    /// Writes between signaled RDMA completions; must be a power of two.
    pub polling_interval: usize,
    pub message_handler_threads: usize,
    pub message_handler_max_retries: u32,
    pub backoff: bool,

    // -- NUMA pinning (informational; this crate does not pin threads itself,
    // core pinning is explicitly out of scope per spec.md §1) --
    pub sockets: usize,
    pub socket: usize,
    pub pin_threads: bool,

    // -- hashtable / pool partitioning --
    pub partition_bits: u32,
    pub page_pool_partitions: usize,
}

impl Config {
    /// A single-node configuration suitable for local development and most
    /// unit tests: `nodes = 1`, tiny pool, SSD path left for the caller to
    /// fill in.
    pub fn single_node(ssd_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            ssd_path: ssd_path.into(),
            nodes: 1,
            ..Self::default()
        }
    }

    /// Number of hashtable buckets: the next power of two at or above the
    /// DRAM pool's page capacity, per spec.md §3.
    pub fn bucket_count(&self) -> usize {
        self.dram_page_capacity().next_power_of_two().max(1)
    }

    /// How many pages fit in the configured DRAM pool.
    pub fn dram_page_capacity(&self) -> usize {
        let bytes = self.dram_gb.saturating_mul(1024 * 1024 * 1024);
        (bytes / PAGE_SIZE as u64).max(1) as usize
    }

    /// Absolute free-frame threshold derived from `free_percentage`.
    pub fn free_limit(&self) -> usize {
        ((self.dram_page_capacity() as f64) * self.free_percentage / 100.0).ceil() as usize
    }

    /// Absolute cooling threshold derived from `cooling_percentage`.
    pub fn cooling_limit(&self) -> usize {
        ((self.dram_page_capacity() as f64) * self.cooling_percentage / 100.0).ceil() as usize
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dram_gb: 1,
            worker: 1,
            batch_size: 100,

            page_provider_threads: 2,
            free_percentage: 1.0,
            cooling_percentage: 10.0,
            evict_coolest_epochs: 0.1,

            ssd_path: std::path::PathBuf::from("meshpool.db"),
            ssd_gib: 100,
            evict_to_ssd: true,
            prob_ssd: 1000,
            falloc: 0,

            nodes: 1,
            own_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 7174,
            rdma_memory_factor: 1.1,

            polling_interval: 16,
            message_handler_threads: 4,
            message_handler_max_retries: 10,
            backoff: true,

            sockets: 2,
            socket: 0,
            pin_threads: true,

            partition_bits: 6,
            page_pool_partitions: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.dram_gb, 1);
        assert_eq!(cfg.page_provider_threads, 2);
        assert_eq!(cfg.polling_interval, 16);
        assert_eq!(cfg.message_handler_threads, 4);
        assert_eq!(cfg.prob_ssd, 1000);
        assert!(cfg.evict_to_ssd);
    }

    #[test]
    fn bucket_count_is_power_of_two() {
        let cfg = Config {
            dram_gb: 1,
            ..Config::default()
        };
        assert!(cfg.bucket_count().is_power_of_two());
        assert!(cfg.bucket_count() >= cfg.dram_page_capacity());
    }

    #[test]
    fn thresholds_scale_with_pool_size() {
        let small = Config {
            dram_gb: 1,
            ..Config::default()
        };
        let big = Config {
            dram_gb: 4,
            ..Config::default()
        };
        assert!(big.free_limit() >= small.free_limit());
        assert!(big.cooling_limit() > small.free_limit());
    }
}
