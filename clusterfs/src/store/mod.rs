//! Persistence layer: typed access to inode, directory-entry and block rows
//! kept in the backing cluster, fronted by the metadata cache.
//!
//! Every row lives under the tenant scope the store was opened with. Reads
//! go cache-aside; every successful mutation purges the cached objects it
//! affects before returning. Transient backend failures are retried here and
//! nowhere else.

pub mod backend;
pub mod etcd;
pub mod memory;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, TryStreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::{Cache, Lookup, Page};
use crate::config::{Consistency, StoreConfig};
use crate::error::StoreError;
use crate::meta::{
    BlockRow, DirEntry, EntryRow, FileType, Inode, InodeId, KeyLayout, SCHEMA_VERSION, SchemaMarker,
    Scope, decode, encode, key_after, prefix_end,
};
use backend::{KvBackend, Precondition};
use etcd::EtcdBackend;
use retry::RetryPolicy;

/// Guard for [`Store::put_dir_entry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCondition {
    /// Fail with `Conflict` if the name is taken.
    MustNotExist,
    /// Fail with `Conflict` if the name is free.
    MustExist,
    Overwrite,
}

fn corrupt(key: &[u8], reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: reason.to_string(),
    }
}

pub struct Store {
    backend: Arc<dyn KvBackend>,
    keys: KeyLayout,
    scope: Scope,
    cache: Cache,
    retry: RetryPolicy,
    consistency: Consistency,
    page_size: usize,
    block_size: u32,
}

impl Store {
    /// Connect to the cluster named by `config` and open the store.
    pub async fn init(config: &StoreConfig) -> Result<Self, StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        let backend = EtcdBackend::connect(config).await.map_err(|e| {
            StoreError::Fatal(format!("cannot reach cluster {:?}: {e}", config.endpoints))
        })?;
        Self::open(Arc::new(backend), config).await
    }

    /// Open a store over an existing backend session. The keyspace must have
    /// been provisioned; nothing is created implicitly.
    pub async fn open(backend: Arc<dyn KvBackend>, config: &StoreConfig) -> Result<Self, StoreError> {
        let marker_key = KeyLayout::schema_key(&config.keyspace);
        let row = config
            .retry
            .run("read_schema", || backend.get(&marker_key, Consistency::Strict))
            .await
            .map_err(|e| match e {
                StoreError::Unavailable { .. } => StoreError::Fatal(e.to_string()),
                other => other,
            })?
            .ok_or_else(|| {
                StoreError::Fatal(format!(
                    "keyspace `{}` is not provisioned, run `clusterfs init-schema` first",
                    config.keyspace
                ))
            })?;
        let marker: SchemaMarker = decode(&row.value).map_err(|e| corrupt(&marker_key, e))?;
        if marker.version != SCHEMA_VERSION {
            return Err(StoreError::Fatal(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                marker.version
            )));
        }
        if marker.block_size == 0 {
            return Err(corrupt(&marker_key, "block size is zero"));
        }

        let scope = config.scope();
        let cache = if config.cache_enabled && config.cache_size > 0 {
            Cache::new(config.cache_size, config.cache_ttl)
        } else {
            Cache::disabled()
        };
        info!(
            keyspace = %config.keyspace,
            environment = %scope.environment,
            owner = scope.owner_id,
            block_size = marker.block_size,
            cache = cache.is_enabled(),
            "store opened"
        );
        Ok(Self {
            backend,
            keys: KeyLayout::new(&config.keyspace, &scope),
            scope,
            cache,
            retry: config.retry.clone(),
            consistency: config.consistency,
            page_size: config.page_size.max(1),
            block_size: marker.block_size,
        })
    }

    /// Write the schema marker for `keyspace`. Returns `false` if the keyspace
    /// was already provisioned with the current schema version.
    pub async fn provision(
        backend: &dyn KvBackend,
        keyspace: &str,
        block_size: u32,
    ) -> Result<bool, StoreError> {
        if block_size == 0 {
            return Err(StoreError::Fatal("block size must be positive".into()));
        }
        let key = KeyLayout::schema_key(keyspace);
        let value = encode(&SchemaMarker {
            version: SCHEMA_VERSION,
            block_size,
        })?;
        let retry = RetryPolicy::default();
        match retry
            .run("provision", || backend.put(&key, value.clone(), Precondition::Absent))
            .await
        {
            Ok(_) => {
                info!(keyspace, block_size, "schema provisioned");
                Ok(true)
            }
            Err(StoreError::Conflict) => {
                let row = retry
                    .run("read_schema", || backend.get(&key, Consistency::Strict))
                    .await?
                    .ok_or(StoreError::Conflict)?;
                let existing: SchemaMarker = decode(&row.value).map_err(|e| corrupt(&key, e))?;
                if existing.version != SCHEMA_VERSION {
                    return Err(StoreError::Fatal(format!(
                        "keyspace `{keyspace}` carries schema version {}",
                        existing.version
                    )));
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Tear the store down. Dropping the backend handle closes the session.
    pub fn shutdown(self) {
        self.cache.clear();
        debug!(keyspace = self.keys.keyspace(), "store shut down");
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Drop expired cache objects every `every` in the background. Reads
    /// already skip them; this only returns their memory early. The task ends
    /// once the store is dropped. `None` when caching is off.
    pub fn spawn_cache_janitor(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        if !self.cache.is_enabled() {
            return None;
        }
        let store = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "dropped expired cache objects");
                }
            }
        }))
    }

    pub async fn get_inode(&self, id: InodeId) -> Result<Inode, StoreError> {
        if let Lookup::Hit(inode) = self.cache.get_inode(id) {
            return Ok(inode);
        }
        let key = self.keys.inode(id);
        let row = self
            .retry
            .run("get_inode", || self.backend.get(&key, self.consistency))
            .await?
            .ok_or(StoreError::NotFound)?;
        let mut inode: Inode = decode(&row.value).map_err(|e| corrupt(&key, e))?;
        if inode.id != id || inode.scope != self.scope {
            return Err(corrupt(&key, "row does not belong to this key"));
        }
        inode.generation = row.version;
        self.cache.observe(id, row.version);
        self.cache.put_inode(&inode);
        Ok(inode)
    }

    /// Persist `inode`. With `expected_generation` the write only lands if the
    /// stored row is still at that generation; `Some(0)` means the row must
    /// not exist yet. Returns the new generation.
    pub async fn put_inode(
        &self,
        inode: &Inode,
        expected_generation: Option<u64>,
    ) -> Result<u64, StoreError> {
        if inode.scope != self.scope {
            return Err(StoreError::Backend(format!(
                "inode {} belongs to another scope",
                inode.id
            )));
        }
        let condition = match expected_generation {
            Some(0) => Precondition::Absent,
            Some(generation) => Precondition::Version(generation),
            None => Precondition::None,
        };
        let key = self.keys.inode(inode.id);
        let value = encode(inode)?;
        let result = self
            .retry
            .run("put_inode", || {
                self.backend.put(&key, value.clone(), condition.clone())
            })
            .await;
        match result {
            Ok(outcome) => {
                self.cache.observe(inode.id, outcome.version);
                self.cache.invalidate_inode(inode.id);
                let mut cached = inode.clone();
                cached.generation = outcome.version;
                self.cache.put_inode(&cached);
                Ok(outcome.version)
            }
            Err(e) => {
                self.cache.invalidate_inode(inode.id);
                Err(e)
            }
        }
    }

    /// Insert a brand new inode row; `Conflict` if the id is taken.
    pub async fn create_inode(&self, inode: &Inode) -> Result<u64, StoreError> {
        self.put_inode(inode, Some(0)).await
    }

    pub async fn delete_inode(&self, id: InodeId) -> Result<(), StoreError> {
        let key = self.keys.inode(id);
        let deleted = self
            .retry
            .run("delete_inode", || self.backend.delete(&key, Precondition::None))
            .await;
        self.cache.forget(id);
        deleted.map(|_| ())
    }

    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<Option<DirEntry>, StoreError> {
        if let Lookup::Hit(entry) = self.cache.get_entry(parent, name) {
            return Ok(entry);
        }
        let epoch = self.cache.epoch(parent);
        let key = self.keys.entry(parent, name);
        let row = self
            .retry
            .run("lookup", || self.backend.get(&key, self.consistency))
            .await?;
        let entry = match row {
            Some(row) => {
                let row: EntryRow = decode(&row.value).map_err(|e| corrupt(&key, e))?;
                Some(DirEntry {
                    parent,
                    name: name.to_string(),
                    child: row.child,
                    kind: row.kind,
                })
            }
            None => None,
        };
        self.cache.put_entry(parent, name, entry.clone(), epoch);
        Ok(entry)
    }

    /// Point `(parent, name)` at `child`. For an overwrite, returns the child
    /// the entry referenced before.
    pub async fn put_dir_entry(
        &self,
        parent: InodeId,
        name: &str,
        child: InodeId,
        kind: FileType,
        condition: EntryCondition,
    ) -> Result<Option<InodeId>, StoreError> {
        let precondition = match condition {
            EntryCondition::MustNotExist => Precondition::Absent,
            EntryCondition::MustExist => Precondition::Present,
            EntryCondition::Overwrite => Precondition::None,
        };
        let key = self.keys.entry(parent, name);
        let value = encode(&EntryRow { child, kind })?;
        let result = self
            .retry
            .run("put_dir_entry", || {
                self.backend.put(&key, value.clone(), precondition.clone())
            })
            .await;
        self.cache.invalidate_entry(parent, name);
        let outcome = result?;
        debug!(%parent, name, %child, ?condition, "entry written");
        match outcome.previous {
            Some(bytes) => {
                let previous: EntryRow = decode(&bytes).map_err(|e| corrupt(&key, e))?;
                Ok(Some(previous.child))
            }
            None => Ok(None),
        }
    }

    /// Remove `(parent, name)`. With `expected_child` the delete only lands if
    /// the entry still references that child (`Conflict` otherwise).
    /// `NotFound` if there is no such entry.
    pub async fn delete_dir_entry(
        &self,
        parent: InodeId,
        name: &str,
        expected_child: Option<InodeId>,
    ) -> Result<(), StoreError> {
        let key = self.keys.entry(parent, name);
        let result = self.delete_entry_row(&key, expected_child).await;
        self.cache.invalidate_entry(parent, name);
        result
    }

    async fn delete_entry_row(
        &self,
        key: &[u8],
        expected_child: Option<InodeId>,
    ) -> Result<(), StoreError> {
        let condition = match expected_child {
            None => Precondition::Present,
            Some(child) => {
                let row = self
                    .retry
                    .run("delete_dir_entry", || self.backend.get(key, self.consistency))
                    .await?
                    .ok_or(StoreError::NotFound)?;
                let current: EntryRow = decode(&row.value).map_err(|e| corrupt(key, e))?;
                if current.child != child {
                    return Err(StoreError::Conflict);
                }
                // compare on the exact bytes read so a concurrent rewrite fails the delete
                Precondition::Value(row.value)
            }
        };
        let result = self
            .retry
            .run("delete_dir_entry", || {
                self.backend.delete(key, condition.clone())
            })
            .await;
        match (result, expected_child) {
            (Ok(_), _) => Ok(()),
            (Err(StoreError::Conflict), None) => Err(StoreError::NotFound),
            (Err(e), _) => Err(e),
        }
    }

    /// One page of `parent`'s entries in name order, starting after `token`.
    pub async fn list_children(
        &self,
        parent: InodeId,
        token: Option<&str>,
    ) -> Result<Page, StoreError> {
        if let Lookup::Hit(page) = self.cache.get_listing(parent, token) {
            return Ok(page);
        }
        let epoch = self.cache.epoch(parent);
        let prefix = self.keys.entry_prefix(parent);
        let end = prefix_end(&prefix);
        let start = match token {
            Some(name) => key_after(&self.keys.entry(parent, name)),
            None => prefix.clone(),
        };
        let rows = self
            .retry
            .run("list_children", || {
                self.backend
                    .scan(&start, &end, self.page_size + 1, self.consistency)
            })
            .await?;
        let more = rows.len() > self.page_size;
        let mut entries = Vec::with_capacity(rows.len().min(self.page_size));
        for (key, row) in rows.into_iter().take(self.page_size) {
            let name = self
                .keys
                .entry_name(parent, &key)
                .ok_or_else(|| corrupt(&key, "malformed entry key"))?;
            let row: EntryRow = decode(&row.value).map_err(|e| corrupt(&key, e))?;
            entries.push(DirEntry {
                parent,
                name: name.to_string(),
                child: row.child,
                kind: row.kind,
            });
        }
        let next = if more {
            entries.last().map(|e| e.name.clone())
        } else {
            None
        };
        let page = Page { entries, next };
        self.cache.put_listing(parent, token, &page, epoch);
        Ok(page)
    }

    /// Every entry of `parent`, fetched page by page as the stream is polled.
    pub fn children(
        &self,
        parent: InodeId,
    ) -> impl Stream<Item = Result<DirEntry, StoreError>> + Send + '_ {
        stream::try_unfold(Some(None::<String>), move |state| async move {
            let Some(token) = state else {
                return Ok::<_, StoreError>(None);
            };
            let page = self.list_children(parent, token.as_deref()).await?;
            let next = page.next.map(Some);
            let entries = stream::iter(page.entries.into_iter().map(Ok::<DirEntry, StoreError>));
            Ok(Some((entries, next)))
        })
        .try_flatten()
    }

    /// Uncached emptiness check used before removing a directory.
    pub async fn has_children(&self, parent: InodeId) -> Result<bool, StoreError> {
        let prefix = self.keys.entry_prefix(parent);
        let end = prefix_end(&prefix);
        let rows = self
            .retry
            .run("has_children", || {
                self.backend.scan(&prefix, &end, 1, self.consistency)
            })
            .await?;
        Ok(!rows.is_empty())
    }

    /// Payload of one block, or `None` for a hole. A checksum mismatch is
    /// reported as `Corrupt`.
    pub async fn get_block(&self, id: InodeId, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .get_block_versioned(id, index)
            .await?
            .map(|(payload, _)| payload))
    }

    /// Like [`Store::get_block`], with the row version to pass back to
    /// [`Store::put_block`] for a conditional rewrite.
    pub async fn get_block_versioned(
        &self,
        id: InodeId,
        index: u64,
    ) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        let key = self.keys.block(id, index);
        let Some(row) = self
            .retry
            .run("get_block", || self.backend.get(&key, self.consistency))
            .await?
        else {
            return Ok(None);
        };
        let block: BlockRow = decode(&row.value).map_err(|e| corrupt(&key, e))?;
        if !block.verify() {
            return Err(corrupt(&key, "checksum mismatch"));
        }
        Ok(Some((block.payload, row.version)))
    }

    /// Write one block. With `expected_version` the write only lands if the
    /// row is still at that version (`Some(0)`: still a hole), otherwise
    /// `Conflict`. Returns the new version.
    pub async fn put_block(
        &self,
        id: InodeId,
        index: u64,
        payload: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        if payload.len() > self.block_size as usize {
            return Err(StoreError::Backend(format!(
                "block payload of {} bytes exceeds block size {}",
                payload.len(),
                self.block_size
            )));
        }
        let condition = match expected_version {
            Some(0) => Precondition::Absent,
            Some(version) => Precondition::Version(version),
            None => Precondition::None,
        };
        let key = self.keys.block(id, index);
        let value = encode(&BlockRow::seal(payload))?;
        let outcome = self
            .retry
            .run("put_block", || {
                self.backend.put(&key, value.clone(), condition.clone())
            })
            .await?;
        Ok(outcome.version)
    }

    pub async fn delete_block(&self, id: InodeId, index: u64) -> Result<(), StoreError> {
        let key = self.keys.block(id, index);
        self.retry
            .run("delete_block", || self.backend.delete(&key, Precondition::None))
            .await?;
        Ok(())
    }

    /// Delete every block of `id` with an index of `from` or more. Returns the
    /// number of blocks removed.
    pub async fn purge_blocks(&self, id: InodeId, from: u64) -> Result<usize, StoreError> {
        let start = self.keys.block(id, from);
        let end = prefix_end(&self.keys.block_prefix(id));
        let mut removed = 0;
        loop {
            let rows = self
                .retry
                .run("purge_blocks", || {
                    self.backend
                        .scan(&start, &end, self.page_size, Consistency::Strict)
                })
                .await?;
            if rows.is_empty() {
                return Ok(removed);
            }
            for (key, _) in rows {
                self.retry
                    .run("purge_blocks", || self.backend.delete(&key, Precondition::None))
                    .await?;
                removed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DEFAULT_BLOCK_SIZE;
    use futures::StreamExt;
    use memory::MemBackend;
    use std::time::Duration;

    fn config(cache: bool) -> StoreConfig {
        StoreConfig {
            keyspace: "test".into(),
            environment: "unit".into(),
            cache_enabled: cache,
            cache_size: if cache { 1 << 20 } else { 0 },
            cache_ttl: Duration::from_secs(60),
            page_size: 2,
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..StoreConfig::default()
        }
    }

    async fn open(backend: &Arc<MemBackend>, cache: bool) -> Store {
        Store::provision(backend.as_ref(), "test", DEFAULT_BLOCK_SIZE)
            .await
            .unwrap();
        Store::open(backend.clone(), &config(cache)).await.unwrap()
    }

    fn file(store: &Store, name: &str) -> Inode {
        Inode::new(
            InodeId::generate(),
            FileType::File,
            0o644,
            1000,
            1000,
            InodeId::ROOT,
            name,
            store.scope().clone(),
        )
    }

    #[tokio::test]
    async fn test_open_requires_schema() {
        let backend = Arc::new(MemBackend::new());
        let err = Store::open(backend.clone(), &config(false)).await.err().unwrap();
        assert!(matches!(err, StoreError::Fatal(_)));

        assert!(Store::provision(backend.as_ref(), "test", 4096).await.unwrap());
        assert!(!Store::provision(backend.as_ref(), "test", 4096).await.unwrap());
        let store = Store::open(backend.clone(), &config(false)).await.unwrap();
        assert_eq!(store.block_size(), 4096);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_generation_cas() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, true).await;
        let mut inode = file(&store, "a");
        assert_eq!(store.create_inode(&inode).await.unwrap(), 1);
        assert!(matches!(
            store.create_inode(&inode).await,
            Err(StoreError::Conflict)
        ));

        inode.mode = 0o600;
        assert_eq!(store.put_inode(&inode, Some(1)).await.unwrap(), 2);
        assert!(matches!(
            store.put_inode(&inode, Some(1)).await,
            Err(StoreError::Conflict)
        ));
        let stored = store.get_inode(inode.id).await.unwrap();
        assert_eq!(stored.generation, 2);
        assert_eq!(stored.mode, 0o600);

        store.delete_inode(inode.id).await.unwrap();
        assert!(matches!(
            store.get_inode(inode.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cached_inode_goes_stale_on_remote_write() {
        let backend = Arc::new(MemBackend::new());
        let host_a = open(&backend, true).await;
        let host_b = open(&backend, true).await;
        let mut inode = file(&host_a, "shared");
        host_a.create_inode(&inode).await.unwrap();
        assert_eq!(host_a.get_inode(inode.id).await.unwrap().generation, 1);

        inode.size = 10;
        host_b.put_inode(&inode, Some(1)).await.unwrap();
        // host A still serves its cached copy until a newer generation is observed
        inode.size = 20;
        assert!(matches!(
            host_a.put_inode(&inode, Some(1)).await,
            Err(StoreError::Conflict)
        ));
        let fresh = host_a.get_inode(inode.id).await.unwrap();
        assert_eq!(fresh.size, 10);
        assert_eq!(fresh.generation, 2);
    }

    #[tokio::test]
    async fn test_dir_entries() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, true).await;
        let a = InodeId::generate();
        let b = InodeId::generate();

        assert_eq!(store.lookup(InodeId::ROOT, "x").await.unwrap(), None);
        let replaced = store
            .put_dir_entry(InodeId::ROOT, "x", a, FileType::File, EntryCondition::MustNotExist)
            .await
            .unwrap();
        assert_eq!(replaced, None);
        // the cached negative lookup was purged by the write
        assert_eq!(store.lookup(InodeId::ROOT, "x").await.unwrap().unwrap().child, a);

        assert!(matches!(
            store
                .put_dir_entry(InodeId::ROOT, "x", b, FileType::File, EntryCondition::MustNotExist)
                .await,
            Err(StoreError::Conflict)
        ));
        assert!(matches!(
            store
                .put_dir_entry(InodeId::ROOT, "y", b, FileType::File, EntryCondition::MustExist)
                .await,
            Err(StoreError::Conflict)
        ));
        let replaced = store
            .put_dir_entry(InodeId::ROOT, "x", b, FileType::File, EntryCondition::Overwrite)
            .await
            .unwrap();
        assert_eq!(replaced, Some(a));

        assert!(matches!(
            store.delete_dir_entry(InodeId::ROOT, "x", Some(a)).await,
            Err(StoreError::Conflict)
        ));
        store.delete_dir_entry(InodeId::ROOT, "x", Some(b)).await.unwrap();
        assert!(matches!(
            store.delete_dir_entry(InodeId::ROOT, "x", None).await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(store.lookup(InodeId::ROOT, "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_listing_pages_and_stream() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, false).await;
        let dir = InodeId::generate();
        for name in ["c", "a", "e", "b", "d"] {
            store
                .put_dir_entry(dir, name, InodeId::generate(), FileType::File, EntryCondition::MustNotExist)
                .await
                .unwrap();
        }
        // entries of another directory must not leak into the listing
        store
            .put_dir_entry(InodeId::ROOT, "zz", dir, FileType::Dir, EntryCondition::MustNotExist)
            .await
            .unwrap();

        let first = store.list_children(dir, None).await.unwrap();
        let names: Vec<_> = first.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(first.next.as_deref(), Some("b"));
        let second = store.list_children(dir, Some("b")).await.unwrap();
        let names: Vec<_> = second.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["c", "d"]);

        let all: Vec<String> = store
            .children(dir)
            .map(|e| e.unwrap().name)
            .collect()
            .await;
        assert_eq!(all, ["a", "b", "c", "d", "e"]);
        assert!(store.has_children(dir).await.unwrap());
        assert!(!store.has_children(InodeId::generate()).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocks_and_checksum() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, false).await;
        let id = InodeId::generate();
        for i in 0..4 {
            store.put_block(id, i, vec![i as u8; 16], None).await.unwrap();
        }
        assert_eq!(store.get_block(id, 2).await.unwrap(), Some(vec![2; 16]));
        assert_eq!(store.get_block(id, 9).await.unwrap(), None);
        assert_eq!(store.purge_blocks(id, 2).await.unwrap(), 2);
        assert_eq!(store.get_block(id, 3).await.unwrap(), None);
        assert!(store.get_block(id, 1).await.unwrap().is_some());

        let mut bad = BlockRow::seal(vec![1, 2, 3]);
        bad.payload[0] = 7;
        backend
            .put(&store.keys.block(id, 0), encode(&bad).unwrap(), Precondition::None)
            .await
            .unwrap();
        assert!(matches!(
            store.get_block(id, 0).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_conditional_block_rewrite() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, false).await;
        let id = InodeId::generate();
        assert_eq!(store.get_block_versioned(id, 0).await.unwrap(), None);

        let v1 = store.put_block(id, 0, vec![1; 8], Some(0)).await.unwrap();
        assert!(matches!(
            store.put_block(id, 0, vec![2; 8], Some(0)).await,
            Err(StoreError::Conflict)
        ));
        let v2 = store.put_block(id, 0, vec![3; 8], Some(v1)).await.unwrap();
        assert!(v2 > v1);
        // a writer still holding the first version loses
        assert!(matches!(
            store.put_block(id, 0, vec![4; 8], Some(v1)).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(
            store.get_block_versioned(id, 0).await.unwrap(),
            Some((vec![3; 8], v2))
        );
        assert!(store.put_block(id, 0, vec![0; 4097], None).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_janitor() {
        let backend = Arc::new(MemBackend::new());
        Store::provision(backend.as_ref(), "test", DEFAULT_BLOCK_SIZE)
            .await
            .unwrap();
        let mut cfg = config(true);
        cfg.cache_ttl = Duration::from_millis(10);
        let store = Arc::new(Store::open(backend.clone(), &cfg).await.unwrap());
        assert_eq!(store.lookup(InodeId::ROOT, "x").await.unwrap(), None);
        assert!(!store.cache().is_empty());

        let janitor = store.spawn_cache_janitor(Duration::from_millis(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.cache().is_empty());

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), janitor)
            .await
            .unwrap()
            .unwrap();

        let plain = Arc::new(open(&backend, false).await);
        assert!(plain.spawn_cache_janitor(Duration::from_millis(5)).is_none());
    }

    #[tokio::test]
    async fn test_stale_negative_lookup_is_not_cached() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, true).await;
        let epoch = store.cache().epoch(InodeId::ROOT);
        // a create finishing between a lookup's read and its cache insert
        let inode = file(&store, "x");
        store.create_inode(&inode).await.unwrap();
        store
            .put_dir_entry(InodeId::ROOT, "x", inode.id, FileType::File, EntryCondition::MustNotExist)
            .await
            .unwrap();
        store.cache().put_entry(InodeId::ROOT, "x", None, epoch);
        let found = store.lookup(InodeId::ROOT, "x").await.unwrap();
        assert_eq!(found.map(|e| e.child), Some(inode.id));
    }

    #[tokio::test]
    async fn test_transient_faults() {
        let backend = Arc::new(MemBackend::new());
        let store = open(&backend, false).await;
        backend.fail_next(3);
        assert_eq!(store.lookup(InodeId::ROOT, "x").await.unwrap(), None);
        backend.fail_next(10);
        assert!(matches!(
            store.lookup(InodeId::ROOT, "x").await,
            Err(StoreError::Unavailable { attempts: 4, .. })
        ));
        backend.fail_next(0);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let backend = Arc::new(MemBackend::new());
        let prod = open(&backend, false).await;
        let mut cfg = config(false);
        cfg.environment = "staging".into();
        let staging = Store::open(backend.clone(), &cfg).await.unwrap();

        let inode = file(&prod, "only-prod");
        prod.create_inode(&inode).await.unwrap();
        prod.put_dir_entry(InodeId::ROOT, "only-prod", inode.id, FileType::File, EntryCondition::MustNotExist)
            .await
            .unwrap();
        assert_eq!(staging.lookup(InodeId::ROOT, "only-prod").await.unwrap(), None);
        assert!(matches!(
            staging.get_inode(inode.id).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            staging.put_inode(&inode, None).await,
            Err(StoreError::Backend(_))
        ));
    }
}
