//! Local metadata cache
//!
//! Holds inode attributes, single `(parent, name)` lookups and directory
//! listing pages. It is an optimization only: every object is validated on
//! read against a TTL and against the newest generation this process has
//! observed for the owning inode (the inode itself, or the parent directory
//! for lookups and listings), and the store purges affected objects in the
//! same call as every successful mutation.
//!
//! Entry writes do not move the parent's generation, so lookups and listings
//! also carry the directory's invalidation epoch: callers take
//! [`Cache::epoch`] before reading the backend and hand it back on insert,
//! and the insert is dropped if an invalidation of that directory ran in
//! between.
//!
//! Nothing here performs I/O. One mutex guards the whole structure; eviction
//! runs synchronously inside `put` until the accounted size fits.

use std::collections::{HashMap, HashSet};
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::meta::{DirEntry, Inode, InodeId};

/// Result of a cache read. Stale objects are dropped and reported as misses.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Lookup::Hit(v) => Some(v),
            Lookup::Miss => None,
        }
    }
}

/// One page of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub entries: Vec<DirEntry>,
    /// Continuation token for the next page; `None` on the last page.
    pub next: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CacheKey {
    Inode(InodeId),
    Entry(InodeId, String),
    Listing(InodeId, Option<String>),
}

impl CacheKey {
    fn owner(&self) -> InodeId {
        match self {
            CacheKey::Inode(id) | CacheKey::Entry(id, _) | CacheKey::Listing(id, _) => *id,
        }
    }
}

#[derive(Clone, Debug)]
enum Cached {
    Inode(Inode),
    Entry(Option<DirEntry>),
    Listing(Page),
}

struct Slot {
    value: Cached,
    generation: u64,
    inserted_at: Instant,
    weight: usize,
}

fn entry_weight(e: &DirEntry) -> usize {
    size_of::<DirEntry>() + e.name.len()
}

fn weight(key: &CacheKey, value: &Cached) -> usize {
    let key_size = match key {
        CacheKey::Inode(_) => 0,
        CacheKey::Entry(_, name) => name.len(),
        CacheKey::Listing(_, token) => token.as_ref().map_or(0, String::len),
    };
    let value_size = match value {
        Cached::Inode(i) => {
            i.name.len() + i.scope.environment.len() + i.target.as_ref().map_or(0, String::len)
        }
        Cached::Entry(e) => e.as_ref().map_or(0, entry_weight),
        Cached::Listing(p) => {
            p.entries.iter().map(entry_weight).sum::<usize>()
                + p.next.as_ref().map_or(0, String::len)
        }
    };
    size_of::<CacheKey>() + size_of::<Slot>() + key_size + value_size
}

struct Inner {
    lru: LruCache<CacheKey, Slot>,
    used: usize,
    capacity: usize,
    // newest generation seen per inode; bounded, a forgotten id reads as 0
    observed: LruCache<InodeId, u64>,
    // listing tokens cached per directory, for invalidation
    listings: HashMap<InodeId, HashSet<Option<String>>>,
    // invalidation epoch per directory, values drawn from `clock`
    epochs: LruCache<InodeId, u64>,
    clock: u64,
    // highest epoch pushed out of `epochs`; an untracked directory reads as it
    epoch_floor: u64,
}

impl Inner {
    fn current(&self, id: &InodeId) -> u64 {
        self.observed.peek(id).copied().unwrap_or(0)
    }

    fn epoch(&self, dir: &InodeId) -> u64 {
        self.epochs.peek(dir).copied().unwrap_or(self.epoch_floor)
    }

    fn bump(&mut self, dir: InodeId) {
        self.clock += 1;
        if let Some((evicted, epoch)) = self.epochs.push(dir, self.clock)
            && evicted != dir
        {
            self.epoch_floor = self.epoch_floor.max(epoch);
        }
    }

    fn get(&mut self, key: &CacheKey, ttl: Duration) -> Option<Cached> {
        let current = self.current(&key.owner());
        let (fresh, value) = {
            let slot = self.lru.get(key)?;
            let fresh = slot.inserted_at.elapsed() < ttl && slot.generation == current;
            (fresh, slot.value.clone())
        };
        if fresh {
            Some(value)
        } else {
            self.remove(key);
            None
        }
    }

    fn put(&mut self, key: CacheKey, value: Cached, generation: u64) {
        if generation < self.current(&key.owner()) {
            // already older than what this process has seen
            return;
        }
        let weight = weight(&key, &value);
        if weight > self.capacity {
            return;
        }
        self.remove(&key);
        if let CacheKey::Listing(dir, token) = &key {
            self.listings.entry(*dir).or_default().insert(token.clone());
        }
        self.used += weight;
        self.lru.put(
            key,
            Slot {
                value,
                generation,
                inserted_at: Instant::now(),
                weight,
            },
        );
        while self.used > self.capacity {
            let Some((evicted, slot)) = self.lru.pop_lru() else {
                break;
            };
            self.used -= slot.weight;
            self.unindex(&evicted);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(slot) = self.lru.pop(key) {
            self.used -= slot.weight;
            self.unindex(key);
        }
    }

    fn unindex(&mut self, key: &CacheKey) {
        if let CacheKey::Listing(dir, token) = key
            && let Some(tokens) = self.listings.get_mut(dir)
        {
            tokens.remove(token);
            if tokens.is_empty() {
                self.listings.remove(dir);
            }
        }
    }

    fn remove_listings(&mut self, dir: InodeId) {
        if let Some(tokens) = self.listings.remove(&dir) {
            for token in tokens {
                if let Some(slot) = self.lru.pop(&CacheKey::Listing(dir, token)) {
                    self.used -= slot.weight;
                }
            }
        }
    }
}

pub struct Cache {
    // None when caching is disabled
    inner: Option<Mutex<Inner>>,
    ttl: Duration,
}

impl Cache {
    pub fn new(capacity_bytes: u64, ttl: Duration) -> Self {
        let capacity = usize::try_from(capacity_bytes).unwrap_or(usize::MAX);
        // roughly one tracked generation per 64 cached bytes
        let tracked = NonZeroUsize::new((capacity / 64).max(1024)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Some(Mutex::new(Inner {
                lru: LruCache::unbounded(),
                used: 0,
                capacity,
                observed: LruCache::new(tracked),
                listings: HashMap::new(),
                epochs: LruCache::new(tracked),
                clock: 0,
                epoch_floor: 0,
            })),
            ttl,
        }
    }

    /// A cache that stores nothing; every read misses.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            ttl: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        self.inner
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Record that `id` was seen at `generation`. Objects stored under an
    /// older generation of `id` stop being served.
    pub fn observe(&self, id: InodeId, generation: u64) {
        let Some(mut inner) = self.lock() else { return };
        match inner.observed.get_mut(&id) {
            Some(seen) => *seen = (*seen).max(generation),
            None => {
                inner.observed.put(id, generation);
            }
        }
    }

    pub fn get_inode(&self, id: InodeId) -> Lookup<Inode> {
        match self.lock().and_then(|mut i| i.get(&CacheKey::Inode(id), self.ttl)) {
            Some(Cached::Inode(inode)) => Lookup::Hit(inode),
            _ => Lookup::Miss,
        }
    }

    pub fn put_inode(&self, inode: &Inode) {
        if let Some(mut inner) = self.lock() {
            inner.put(
                CacheKey::Inode(inode.id),
                Cached::Inode(inode.clone()),
                inode.generation,
            );
        }
    }

    /// `Hit(None)` is a cached negative lookup.
    pub fn get_entry(&self, parent: InodeId, name: &str) -> Lookup<Option<DirEntry>> {
        let key = CacheKey::Entry(parent, name.to_string());
        match self.lock().and_then(|mut i| i.get(&key, self.ttl)) {
            Some(Cached::Entry(entry)) => Lookup::Hit(entry),
            _ => Lookup::Miss,
        }
    }

    /// Invalidation epoch of `dir`, to be taken before a backend read whose
    /// result will be cached with [`Cache::put_entry`] or [`Cache::put_listing`].
    pub fn epoch(&self, dir: InodeId) -> u64 {
        self.lock().map_or(0, |i| i.epoch(&dir))
    }

    pub fn put_entry(&self, parent: InodeId, name: &str, entry: Option<DirEntry>, epoch: u64) {
        if let Some(mut inner) = self.lock() {
            if inner.epoch(&parent) != epoch {
                return;
            }
            let generation = inner.current(&parent);
            inner.put(
                CacheKey::Entry(parent, name.to_string()),
                Cached::Entry(entry),
                generation,
            );
        }
    }

    pub fn get_listing(&self, dir: InodeId, token: Option<&str>) -> Lookup<Page> {
        let key = CacheKey::Listing(dir, token.map(str::to_string));
        match self.lock().and_then(|mut i| i.get(&key, self.ttl)) {
            Some(Cached::Listing(page)) => Lookup::Hit(page),
            _ => Lookup::Miss,
        }
    }

    pub fn put_listing(&self, dir: InodeId, token: Option<&str>, page: &Page, epoch: u64) {
        if let Some(mut inner) = self.lock() {
            if inner.epoch(&dir) != epoch {
                return;
            }
            let generation = inner.current(&dir);
            inner.put(
                CacheKey::Listing(dir, token.map(str::to_string)),
                Cached::Listing(page.clone()),
                generation,
            );
        }
    }

    pub fn invalidate_inode(&self, id: InodeId) {
        if let Some(mut inner) = self.lock() {
            inner.remove(&CacheKey::Inode(id));
        }
    }

    /// Drop the lookup for `(parent, name)` and every listing page of `parent`.
    pub fn invalidate_entry(&self, parent: InodeId, name: &str) {
        if let Some(mut inner) = self.lock() {
            inner.remove(&CacheKey::Entry(parent, name.to_string()));
            inner.remove_listings(parent);
            inner.bump(parent);
        }
    }

    /// Forget everything about a deleted inode.
    pub fn forget(&self, id: InodeId) {
        if let Some(mut inner) = self.lock() {
            inner.remove(&CacheKey::Inode(id));
            inner.remove_listings(id);
            inner.bump(id);
            inner.observed.pop(&id);
        }
    }

    /// Drop expired objects. Optional housekeeping: reads already ignore them.
    pub fn purge_expired(&self) -> usize {
        let Some(mut inner) = self.lock() else { return 0 };
        let expired: Vec<CacheKey> = inner
            .lru
            .iter()
            .filter(|(_, slot)| slot.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        if let Some(mut inner) = self.lock() {
            inner.lru.clear();
            inner.observed.clear();
            inner.listings.clear();
            inner.used = 0;
            // tickets handed out before the clear must not match again
            inner.epochs.clear();
            inner.clock += 1;
            inner.epoch_floor = inner.clock;
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.lock().map_or(0, |i| i.used)
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |i| i.lru.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
