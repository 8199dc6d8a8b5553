//! VFS layer
//!
//! - `path`: normalisation and the root-to-inode walk, including lazy repair
//!   of entries duplicated by an interrupted rename.
//! - `fs`: the path-based filesystem calls (`Vfs`) returning POSIX-style
//!   errors.
//! - `util`: byte range to block splitting.
pub mod fs;
pub mod path;
pub mod util;

pub use fs::{Caller, StatFs, Vfs};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::StoreConfig;
    use crate::meta::DEFAULT_BLOCK_SIZE;
    use crate::store::Store;
    use crate::store::memory::MemBackend;
    use crate::store::retry::RetryPolicy;

    /// A provisioned store over a fresh in-memory backend.
    pub(crate) async fn test_store(cache: bool) -> Arc<Store> {
        let backend = Arc::new(MemBackend::new());
        Store::provision(backend.as_ref(), "test", DEFAULT_BLOCK_SIZE)
            .await
            .unwrap();
        let config = StoreConfig {
            keyspace: "test".into(),
            cache_enabled: cache,
            cache_size: 4 << 20,
            cache_ttl: Duration::from_secs(30),
            page_size: 2,
            retry: RetryPolicy::no_retry(),
            ..StoreConfig::default()
        };
        Arc::new(Store::open(backend, &config).await.unwrap())
    }
}
