use std::path::PathBuf;
use std::sync::Arc;

use cadence::StatsdClient;
use derive_builder::Builder;

use crate::statsd;

/// Chunk size used when none (or zero) is configured: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Configuration for a [`Registry`](crate::Registry) and the buffers it hands
/// out.
///
/// Built once and passed to [`Registry::new`](crate::Registry::new), so that
/// independently configured caches can live in the same process.
#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct CacheConfig {
    /// Root directory of the chunk storage tree. Each object gets its own
    /// subdirectory named by its identifier.
    #[builder(setter(into))]
    pub dir: PathBuf,

    /// The size of chunks in bytes. Zero selects [`DEFAULT_CHUNK_SIZE`].
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    pub chunk_size: u64,

    /// Maximum total size of all files under `dir`. Zero disables quota
    /// enforcement.
    #[builder(default = "0")]
    pub max_size: u64,

    /// Chain a background fetch of the next chunk after every consumer miss.
    #[builder(default = "true")]
    pub prefetch: bool,

    /// StatsD client used to emit cache metrics.
    #[builder(default = "Arc::new(statsd::nop_client())")]
    pub metrics: Arc<StatsdClient>,
}

impl CacheConfig {
    /// Returns a builder with all defaults set except for the directory.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Whether a positive disk quota is configured.
    pub fn quota_enabled(&self) -> bool {
        self.max_size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheConfig, DEFAULT_CHUNK_SIZE};

    #[test]
    fn builder_defaults() {
        let config = CacheConfig::builder().dir("/tmp/chunks").build().unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.max_size, 0);
        assert!(config.prefetch);
        assert!(!config.quota_enabled());
    }

    #[test]
    fn builder_requires_dir() {
        assert!(CacheConfig::builder().chunk_size(1024).build().is_err());
    }
}
