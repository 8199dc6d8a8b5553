//! Schema model
//!
//! Rows persisted in the backing cluster and the key layout that maps them
//! onto one flat, byte-ordered key space:
//!
//! - `<ks>/schema`                                   schema marker
//! - `<ks>/<env>/<owner>/i/<inode>`                  inode rows
//! - `<ks>/<env>/<owner>/d/<parent>/<name>`          directory entries
//! - `<ks>/<env>/<owner>/b/<inode>/<index:016x>`     data blocks
//!
//! Every key except the marker embeds the tenant scope, so a store bound to
//! one `(environment, owner)` pair cannot address another tenant's rows.
//! Hierarchy lives only in directory entries: an inode never embeds a child
//! list, so create/unlink/rename touch single rows.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Inode identity. Allocated randomly on create so hosts never coordinate
/// id allocation and ids are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(Uuid);

impl InodeId {
    /// The root directory's well-known id.
    pub const ROOT: InodeId = InodeId(Uuid::nil());

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for InodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Tenant scope: lets many logical filesystems share one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub environment: String,
    pub owner_id: i64,
}

impl Scope {
    pub fn new(environment: impl Into<String>, owner_id: i64) -> Self {
        Self {
            environment: environment.into(),
            owner_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Dir,
    Symlink,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: InodeId,
    pub kind: FileType,
    /// Permission bits only (`0o7777`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Link target, for symlinks.
    pub target: Option<String>,
    /// Primary link: the one directory entry expected to reference this
    /// inode. Used to spot the duplicate left behind by an interrupted rename.
    pub parent: InodeId,
    pub name: String,
    /// Entry a rename is moving this inode away from. Set together with the
    /// new primary link before the new entry is written, cleared once the
    /// old entry is gone.
    pub renamed_from: Option<(InodeId, String)>,
    pub scope: Scope,
    /// Row version assigned by the store: 1 on create, +1 per write.
    #[serde(skip)]
    pub generation: u64,
}

impl Inode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: InodeId,
        kind: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        parent: InodeId,
        name: impl Into<String>,
        scope: Scope,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            kind,
            mode: mode & 0o7777,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            target: None,
            parent,
            name: name.into(),
            renamed_from: None,
            scope,
            generation: 0,
        }
    }

    /// Attributes of a root directory that has never been written. Its
    /// generation is 0, which the store treats as "row must not exist yet".
    pub fn synthetic_root(scope: Scope, uid: u32, gid: u32, mode: u32) -> Self {
        Self::new(InodeId::ROOT, FileType::Dir, mode, uid, gid, InodeId::ROOT, "", scope)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Dir
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub parent: InodeId,
    pub name: String,
    pub child: InodeId,
    pub kind: FileType,
}

/// Value stored under an entry key. The child's type is denormalised into the
/// entry so listings need no inode read per child.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryRow {
    pub child: InodeId,
    pub kind: FileType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct BlockRow {
    pub payload: Vec<u8>,
    pub checksum: [u8; 16],
}

impl BlockRow {
    pub fn seal(payload: Vec<u8>) -> Self {
        let checksum = md5::compute(&payload).0;
        Self { payload, checksum }
    }

    pub fn verify(&self) -> bool {
        md5::compute(&self.payload).0 == self.checksum
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMarker {
    pub version: u32,
    pub block_size: u32,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Builds the keys of one tenant scope inside one keyspace.
#[derive(Clone, Debug)]
pub struct KeyLayout {
    keyspace: String,
    prefix: String,
}

impl KeyLayout {
    pub fn new(keyspace: &str, scope: &Scope) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            prefix: format!("{keyspace}/{}/{}/", scope.environment, scope.owner_id),
        }
    }

    pub fn schema_key(keyspace: &str) -> Vec<u8> {
        format!("{keyspace}/schema").into_bytes()
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn inode(&self, id: InodeId) -> Vec<u8> {
        format!("{}i/{id}", self.prefix).into_bytes()
    }

    pub fn entry_prefix(&self, parent: InodeId) -> Vec<u8> {
        format!("{}d/{parent}/", self.prefix).into_bytes()
    }

    pub fn entry(&self, parent: InodeId, name: &str) -> Vec<u8> {
        let mut key = self.entry_prefix(parent);
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// Recover the entry name from a key produced by [`KeyLayout::entry`].
    pub fn entry_name<'k>(&self, parent: InodeId, key: &'k [u8]) -> Option<&'k str> {
        let prefix = self.entry_prefix(parent);
        key.strip_prefix(prefix.as_slice())
            .and_then(|rest| std::str::from_utf8(rest).ok())
    }

    pub fn block_prefix(&self, id: InodeId) -> Vec<u8> {
        format!("{}b/{id}/", self.prefix).into_bytes()
    }

    pub fn block(&self, id: InodeId, index: u64) -> Vec<u8> {
        let mut key = self.block_prefix(id);
        key.extend_from_slice(format!("{index:016x}").as_bytes());
        key
    }

    pub fn block_index(&self, id: InodeId, key: &[u8]) -> Option<u64> {
        let prefix = self.block_prefix(id);
        let rest = key.strip_prefix(prefix.as_slice())?;
        u64::from_str_radix(std::str::from_utf8(rest).ok()?, 16).ok()
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // all 0xff: scan to the end of the key space
    vec![0]
}

/// Smallest key strictly greater than `key`.
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}
