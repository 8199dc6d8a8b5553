//! Path-based filesystem calls on top of the resolver and the store.
//!
//! There are no in-process locks here. Entry creation relies on the store's
//! must-not-exist writes; inode attribute changes go through
//! [`Vfs::update_inode`], which re-reads and re-applies on a generation
//! conflict.

use std::sync::Arc;
use std::time::SystemTime;

use futures::future::try_join_all;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use super::path::{PathResolver, normalize};
use super::util::split_range_into_blocks;
use crate::cache::Page;
use crate::config::MountOptions;
use crate::error::{FsError, FsResult, StoreError};
use crate::meta::{DirEntry, FileType, Inode, InodeId};
use crate::store::{EntryCondition, Store};

/// Attempts of the read-modify-write loop before giving up.
const MAX_UPDATE_ATTEMPTS: usize = 8;
pub const MAX_NAME_LEN: usize = 255;

const MAY_READ: u32 = 0o4;
const MAY_WRITE: u32 = 0o2;
const MAY_EXEC: u32 = 0o1;

/// Identity the call is made on behalf of. uid 0 bypasses permission checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub const ROOT: Caller = Caller { uid: 0, gid: 0 };

    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

fn check_access(inode: &Inode, caller: Caller, mask: u32) -> FsResult<()> {
    if caller.is_root() {
        return Ok(());
    }
    let granted = if caller.uid == inode.uid {
        (inode.mode >> 6) & 0o7
    } else if caller.gid == inode.gid {
        (inode.mode >> 3) & 0o7
    } else {
        inode.mode & 0o7
    };
    if granted & mask == mask {
        Ok(())
    } else {
        Err(FsError::PermissionDenied)
    }
}

fn require_file(inode: &Inode) -> FsResult<()> {
    match inode.kind {
        FileType::File => Ok(()),
        FileType::Dir => Err(FsError::IsADirectory),
        FileType::Symlink => Err(FsError::InvalidArgument("not a regular file".into())),
    }
}

fn require_dir(inode: &Inode) -> FsResult<()> {
    if inode.is_dir() {
        Ok(())
    } else {
        Err(FsError::NotADirectory)
    }
}

/// Entry deletes guarded by the expected child report a concurrent
/// replacement as the name being gone.
fn gone(e: StoreError) -> FsError {
    match e {
        StoreError::Conflict => FsError::NotFound,
        other => other.into(),
    }
}

pub struct Vfs {
    resolver: PathResolver,
    store: Arc<Store>,
}

impl Vfs {
    pub fn new(store: Arc<Store>, mount: MountOptions) -> Self {
        Self {
            resolver: PathResolver::new(store.clone(), mount),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    async fn reload(&self, id: InodeId) -> FsResult<Inode> {
        if id.is_root() {
            self.resolver.root().await
        } else {
            Ok(self.store.get_inode(id).await?)
        }
    }

    /// Apply `change` to `inode` and write it back conditionally on the
    /// generation it was read at. On a conflict the inode is re-read and the
    /// change applied again; `change` may reject the fresh state.
    pub async fn update_inode<F>(&self, mut inode: Inode, mut change: F) -> FsResult<Inode>
    where
        F: FnMut(&mut Inode) -> FsResult<()>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let expected = inode.generation;
            change(&mut inode)?;
            match self.store.put_inode(&inode, Some(expected)).await {
                Ok(generation) => {
                    inode.generation = generation;
                    return Ok(inode);
                }
                Err(StoreError::Conflict) => {
                    debug!(id = %inode.id, attempt, "generation moved, retrying update");
                    inode = self.reload(inode.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FsError::Io(format!(
            "inode {} is updated too often to apply a change",
            inode.id
        )))
    }

    /// Read-modify-write of one block that only lands on the version it read,
    /// so a concurrent partial write to the same block is never overwritten.
    /// `change` returns false to leave the block untouched; a hole reads as
    /// an empty block.
    async fn modify_block<F>(&self, id: InodeId, index: u64, mut change: F) -> FsResult<()>
    where
        F: FnMut(&mut Vec<u8>) -> bool,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let (mut block, version) = self
                .store
                .get_block_versioned(id, index)
                .await?
                .unwrap_or_default();
            if !change(&mut block) {
                return Ok(());
            }
            match self.store.put_block(id, index, block, Some(version)).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => {
                    debug!(%id, index, attempt, "block changed underneath, retrying write");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FsError::Io(format!(
            "block {index} of {id} is written too often to apply a change"
        )))
    }

    /// Delete a detached inode and its data. Failures only leave garbage.
    async fn release(&self, id: InodeId) {
        if let Err(e) = self.store.purge_blocks(id, 0).await {
            warn!(%id, "failed to delete blocks of removed inode: {e}");
        }
        if let Err(e) = self.store.delete_inode(id).await {
            warn!(%id, "failed to delete removed inode: {e}");
        }
    }

    pub async fn get_attr(&self, path: &str) -> FsResult<Inode> {
        self.resolver.resolve(path).await
    }

    pub async fn open_dir(&self, caller: Caller, path: &str) -> FsResult<Inode> {
        let dir = self.resolver.resolve(path).await?;
        require_dir(&dir)?;
        check_access(&dir, caller, MAY_READ)?;
        Ok(dir)
    }

    /// Every entry of the directory at `path`, fetched page by page.
    pub async fn read_dir(
        &self,
        caller: Caller,
        path: &str,
    ) -> FsResult<BoxStream<'_, FsResult<DirEntry>>> {
        let dir = self.open_dir(caller, path).await?;
        Ok(self.store.children(dir.id).map_err(FsError::from).boxed())
    }

    /// One page of the listing at `path`; pass the returned `next` token to
    /// continue.
    pub async fn read_dir_page(
        &self,
        caller: Caller,
        path: &str,
        token: Option<&str>,
    ) -> FsResult<Page> {
        let dir = self.open_dir(caller, path).await?;
        Ok(self.store.list_children(dir.id, token).await?)
    }

    pub async fn read_dir_all(&self, caller: Caller, path: &str) -> FsResult<Vec<DirEntry>> {
        self.read_dir(caller, path).await?.try_collect().await
    }

    /// Check access for `flags` (`O_ACCMODE` bits plus `O_TRUNC`).
    pub async fn open(&self, caller: Caller, path: &str, flags: i32) -> FsResult<Inode> {
        let inode = self.resolver.resolve(path).await?;
        require_file(&inode)?;
        let truncate = flags & libc::O_TRUNC != 0;
        let mut mask = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => MAY_WRITE,
            libc::O_RDWR => MAY_READ | MAY_WRITE,
            _ => MAY_READ,
        };
        if truncate {
            mask |= MAY_WRITE;
        }
        check_access(&inode, caller, mask)?;
        if truncate && inode.size > 0 {
            return self.truncate_inode(inode, 0).await;
        }
        Ok(inode)
    }

    pub async fn read(
        &self,
        caller: Caller,
        path: &str,
        offset: u64,
        len: usize,
    ) -> FsResult<Vec<u8>> {
        let inode = self.resolver.resolve(path).await?;
        require_file(&inode)?;
        check_access(&inode, caller, MAY_READ)?;
        if offset >= inode.size || len == 0 {
            return Ok(Vec::new());
        }
        let len = (inode.size - offset).min(len as u64) as usize;
        let spans = split_range_into_blocks(self.store.block_size(), offset, len);
        let blocks = try_join_all(
            spans
                .iter()
                .map(|span| self.store.get_block(inode.id, span.index)),
        )
        .await?;

        let mut out = Vec::with_capacity(len);
        for (span, block) in spans.iter().zip(blocks) {
            let start = out.len();
            // holes and short blocks read as zeros
            out.resize(start + span.len, 0);
            if let Some(block) = block
                && block.len() > span.offset
            {
                let avail = (block.len() - span.offset).min(span.len);
                out[start..start + avail]
                    .copy_from_slice(&block[span.offset..span.offset + avail]);
            }
        }
        Ok(out)
    }

    pub async fn write(
        &self,
        caller: Caller,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        let inode = self.resolver.resolve(path).await?;
        require_file(&inode)?;
        check_access(&inode, caller, MAY_WRITE)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidArgument("write past the maximum file size".into()))?;

        let block_size = self.store.block_size() as usize;
        let mut cursor = 0;
        for span in split_range_into_blocks(self.store.block_size(), offset, data.len()) {
            let bytes = &data[cursor..cursor + span.len];
            if span.offset == 0 && span.len == block_size {
                self.store
                    .put_block(inode.id, span.index, bytes.to_vec(), None)
                    .await?;
            } else {
                let stop = span.offset + span.len;
                self.modify_block(inode.id, span.index, |block| {
                    if block.len() < stop {
                        block.resize(stop, 0);
                    }
                    block[span.offset..stop].copy_from_slice(bytes);
                    true
                })
                .await?;
            }
            cursor += span.len;
        }

        self.update_inode(inode, |i| {
            let now = SystemTime::now();
            i.size = i.size.max(end);
            i.mtime = now;
            i.ctime = now;
            Ok(())
        })
        .await?;
        Ok(data.len())
    }

    async fn make_node(
        &self,
        caller: Caller,
        path: &str,
        kind: FileType,
        mode: u32,
        target: Option<String>,
    ) -> FsResult<Inode> {
        if normalize(path)?.is_empty() {
            return Err(FsError::AlreadyExists);
        }
        let (parent, name) = self.resolver.resolve_parent(path).await?;
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidArgument(format!(
                "name longer than {MAX_NAME_LEN} bytes"
            )));
        }
        check_access(&parent, caller, MAY_WRITE | MAY_EXEC)?;

        let mut inode = Inode::new(
            InodeId::generate(),
            kind,
            mode,
            caller.uid,
            caller.gid,
            parent.id,
            name.clone(),
            self.store.scope().clone(),
        );
        if let Some(target) = target {
            inode.size = target.len() as u64;
            inode.target = Some(target);
        }
        inode.generation = match self.store.create_inode(&inode).await {
            Ok(generation) => generation,
            // a retried commit whose first reply was lost finds its own row
            Err(StoreError::Conflict) => self.own_row(&inode).await?,
            Err(e) => return Err(e.into()),
        };

        match self
            .store
            .put_dir_entry(parent.id, &name, inode.id, kind, EntryCondition::MustNotExist)
            .await
        {
            Ok(_) => {
                debug!(path, id = %inode.id, ?kind, "created");
                Ok(inode)
            }
            Err(StoreError::Conflict) => {
                if self
                    .store
                    .lookup(parent.id, &name)
                    .await?
                    .is_some_and(|entry| entry.child == inode.id)
                {
                    debug!(path, id = %inode.id, ?kind, "created, entry commit was retried");
                    return Ok(inode);
                }
                if let Err(e) = self.store.delete_inode(inode.id).await {
                    warn!(id = %inode.id, "failed to delete orphaned inode: {e}");
                }
                Err(FsError::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Generation of the row `inode` was just inserted as, if the stored row is
    /// exactly that inode.
    async fn own_row(&self, inode: &Inode) -> FsResult<u64> {
        let stored = self.store.get_inode(inode.id).await?;
        let mut expected = inode.clone();
        expected.generation = stored.generation;
        if stored != expected {
            return Err(FsError::Io(format!("inode id {} already in use", inode.id)));
        }
        Ok(stored.generation)
    }

    pub async fn create(&self, caller: Caller, path: &str, mode: u32) -> FsResult<Inode> {
        self.make_node(caller, path, FileType::File, mode, None).await
    }

    pub async fn mkdir(&self, caller: Caller, path: &str, mode: u32) -> FsResult<Inode> {
        self.make_node(caller, path, FileType::Dir, mode, None).await
    }

    pub async fn symlink(&self, caller: Caller, target: &str, path: &str) -> FsResult<Inode> {
        self.make_node(caller, path, FileType::Symlink, 0o777, Some(target.to_string()))
            .await
    }

    pub async fn readlink(&self, path: &str) -> FsResult<String> {
        let inode = self.resolver.resolve(path).await?;
        match (inode.kind, inode.target) {
            (FileType::Symlink, Some(target)) => Ok(target),
            _ => Err(FsError::InvalidArgument("not a symbolic link".into())),
        }
    }

    pub async fn unlink(&self, caller: Caller, path: &str) -> FsResult<()> {
        if normalize(path)?.is_empty() {
            return Err(FsError::IsADirectory);
        }
        let (parent, name) = self.resolver.resolve_parent(path).await?;
        let child = self
            .resolver
            .follow(&parent, &name)
            .await?
            .ok_or(FsError::NotFound)?;
        if child.is_dir() {
            return Err(FsError::IsADirectory);
        }
        check_access(&parent, caller, MAY_WRITE | MAY_EXEC)?;
        self.store
            .delete_dir_entry(parent.id, &name, Some(child.id))
            .await
            .map_err(gone)?;
        debug!(path, id = %child.id, "unlinked");
        self.release(child.id).await;
        Ok(())
    }

    pub async fn rmdir(&self, caller: Caller, path: &str) -> FsResult<()> {
        if normalize(path)?.is_empty() {
            return Err(FsError::InvalidArgument("cannot remove the root".into()));
        }
        let (parent, name) = self.resolver.resolve_parent(path).await?;
        let child = self
            .resolver
            .follow(&parent, &name)
            .await?
            .ok_or(FsError::NotFound)?;
        require_dir(&child)?;
        check_access(&parent, caller, MAY_WRITE | MAY_EXEC)?;
        if self.store.has_children(child.id).await? {
            return Err(FsError::NotEmpty);
        }
        self.store
            .delete_dir_entry(parent.id, &name, Some(child.id))
            .await
            .map_err(gone)?;
        debug!(path, id = %child.id, "removed directory");
        self.release(child.id).await;
        Ok(())
    }

    /// Move `from` to `to`, replacing a compatible target.
    ///
    /// Steps: point the new entry at the source, move the source's primary
    /// link, drop the old entry. A crash between steps leaves a duplicate
    /// entry that the resolver removes on the next access.
    pub async fn rename(&self, caller: Caller, from: &str, to: &str) -> FsResult<()> {
        let from_parts = normalize(from)?;
        let to_parts = normalize(to)?;
        if from_parts.is_empty() || to_parts.is_empty() {
            return Err(FsError::InvalidArgument("cannot rename the root".into()));
        }
        if to_parts.len() > from_parts.len() && to_parts.starts_with(&from_parts) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move `{from}` into its own subtree"
            )));
        }

        let (src_parent, src_name) = self.resolver.resolve_parent(from).await?;
        let source = self
            .resolver
            .follow(&src_parent, &src_name)
            .await?
            .ok_or(FsError::NotFound)?;
        let (dst_parent, dst_name) = self.resolver.resolve_parent(to).await?;
        if dst_name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidArgument(format!(
                "name longer than {MAX_NAME_LEN} bytes"
            )));
        }
        check_access(&src_parent, caller, MAY_WRITE | MAY_EXEC)?;
        check_access(&dst_parent, caller, MAY_WRITE | MAY_EXEC)?;
        if from_parts == to_parts {
            return Ok(());
        }

        if let Some(target) = self.resolver.follow(&dst_parent, &dst_name).await? {
            if target.id == source.id {
                return Ok(());
            }
            match (source.is_dir(), target.is_dir()) {
                (true, false) => return Err(FsError::NotADirectory),
                (false, true) => return Err(FsError::IsADirectory),
                (true, true) if self.store.has_children(target.id).await? => {
                    return Err(FsError::NotEmpty);
                }
                _ => {}
            }
        }

        // Move the primary link first and remember the old entry, so a lookup
        // of the old name in the meantime leaves both entries alone.
        let from_entry = (src_parent.id, src_name.clone());
        let (parent_id, name) = (dst_parent.id, dst_name.clone());
        let source = self
            .update_inode(source, |i| {
                let linked_here = i.parent == from_entry.0 && i.name == from_entry.1;
                if !linked_here && i.renamed_from.as_ref() != Some(&from_entry) {
                    // moved away by someone else since it was resolved
                    return Err(FsError::NotFound);
                }
                i.parent = parent_id;
                i.name = name.clone();
                i.renamed_from = Some(from_entry.clone());
                i.ctime = SystemTime::now();
                Ok(())
            })
            .await?;

        let replaced = match self
            .store
            .put_dir_entry(
                dst_parent.id,
                &dst_name,
                source.id,
                source.kind,
                EntryCondition::Overwrite,
            )
            .await
        {
            Ok(replaced) => replaced,
            Err(e) => {
                self.revert_link(source, &from_entry).await;
                return Err(e.into());
            }
        };

        match self
            .store
            .delete_dir_entry(src_parent.id, &src_name, Some(source.id))
            .await
        {
            // already reconciled by someone else
            Ok(()) | Err(StoreError::NotFound) | Err(StoreError::Conflict) => {}
            Err(e) => return Err(e.into()),
        }
        let id = source.id;
        let cleared = self
            .update_inode(source, |i| {
                if i.renamed_from.as_ref() == Some(&from_entry) {
                    i.renamed_from = None;
                }
                Ok(())
            })
            .await;
        if let Err(e) = cleared {
            warn!(%id, "failed to clear rename marker: {e}");
        }
        debug!(from, to, %id, "renamed");

        if let Some(replaced) = replaced.filter(|r| *r != id) {
            self.release(replaced).await;
        }
        Ok(())
    }

    /// Point the link back at the entry a failed rename started from.
    async fn revert_link(&self, moved: Inode, from_entry: &(InodeId, String)) {
        let id = moved.id;
        let (parent, name) = from_entry.clone();
        let reverted = self
            .update_inode(moved, |i| {
                if i.renamed_from.as_ref() == Some(from_entry) {
                    i.parent = parent;
                    i.name = name.clone();
                    i.renamed_from = None;
                }
                Ok(())
            })
            .await;
        if let Err(e) = reverted {
            warn!(%id, "failed to restore link after aborted rename: {e}");
        }
    }

    pub async fn chmod(&self, caller: Caller, path: &str, mode: u32) -> FsResult<Inode> {
        let inode = self.resolver.resolve(path).await?;
        self.update_inode(inode, |i| {
            if !caller.is_root() && caller.uid != i.uid {
                return Err(FsError::PermissionDenied);
            }
            i.mode = mode & 0o7777;
            i.ctime = SystemTime::now();
            Ok(())
        })
        .await
    }

    /// Root may change both ids; the owner may only change the group.
    pub async fn chown(
        &self,
        caller: Caller,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<Inode> {
        let inode = self.resolver.resolve(path).await?;
        self.update_inode(inode, |i| {
            if !caller.is_root() {
                if caller.uid != i.uid || uid.is_some_and(|u| u != i.uid) {
                    return Err(FsError::PermissionDenied);
                }
            } else if let Some(uid) = uid {
                i.uid = uid;
            }
            if let Some(gid) = gid {
                i.gid = gid;
            }
            i.ctime = SystemTime::now();
            Ok(())
        })
        .await
    }

    pub async fn truncate(&self, caller: Caller, path: &str, size: u64) -> FsResult<Inode> {
        let inode = self.resolver.resolve(path).await?;
        require_file(&inode)?;
        check_access(&inode, caller, MAY_WRITE)?;
        self.truncate_inode(inode, size).await
    }

    async fn truncate_inode(&self, inode: Inode, size: u64) -> FsResult<Inode> {
        let old_size = inode.size;
        let updated = self
            .update_inode(inode, |i| {
                let now = SystemTime::now();
                i.size = size;
                i.mtime = now;
                i.ctime = now;
                Ok(())
            })
            .await?;
        if size >= old_size {
            return Ok(updated);
        }

        let block_size = u64::from(self.store.block_size());
        let tail = (size % block_size) as usize;
        if tail != 0 {
            let index = size / block_size;
            self.modify_block(updated.id, index, |block| {
                if block.len() <= tail {
                    return false;
                }
                block.truncate(tail);
                true
            })
            .await?;
        }
        match self.store.purge_blocks(updated.id, size.div_ceil(block_size)).await {
            Ok(n) if n > 0 => debug!(id = %updated.id, blocks = n, "dropped blocks past the end"),
            Ok(_) => {}
            Err(e) => warn!(id = %updated.id, "failed to drop blocks past the end: {e}"),
        }
        Ok(updated)
    }

    /// Set access and modification times; `None` leaves a time unchanged.
    pub async fn utimens(
        &self,
        caller: Caller,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<Inode> {
        let inode = self.resolver.resolve(path).await?;
        self.update_inode(inode, |i| {
            if !caller.is_root() && caller.uid != i.uid {
                return Err(FsError::PermissionDenied);
            }
            if let Some(atime) = atime {
                i.atime = atime;
            }
            if let Some(mtime) = mtime {
                i.mtime = mtime;
            }
            i.ctime = SystemTime::now();
            Ok(())
        })
        .await
    }

    /// Capacity is not tracked; report a large fixed volume.
    pub fn statfs(&self) -> StatFs {
        let bsize = self.store.block_size();
        let blocks = (1u64 << 50) / u64::from(bsize);
        StatFs {
            blocks,
            bfree: blocks,
            bavail: blocks,
            files: 1 << 32,
            ffree: 1 << 32,
            bsize,
            namelen: MAX_NAME_LEN as u32,
            frsize: bsize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::tests::test_store;

    const ALICE: Caller = Caller { uid: 1000, gid: 1000 };
    const BOB: Caller = Caller { uid: 1001, gid: 1001 };

    async fn vfs() -> Vfs {
        Vfs::new(test_store(true).await, MountOptions::default())
    }

    #[tokio::test]
    async fn test_mkdir_create_write_read_readdir() {
        let fs = vfs().await;
        fs.mkdir(Caller::ROOT, "/a", 0o755).await.unwrap();
        fs.mkdir(Caller::ROOT, "/a/b", 0o755).await.unwrap();
        fs.create(Caller::ROOT, "/a/b/hello.txt", 0o644).await.unwrap();

        let bs = fs.store().block_size() as usize;
        let data: Vec<u8> = (0..bs + bs / 2).map(|i| (i % 251) as u8).collect();
        let n = fs
            .write(Caller::ROOT, "/a/b/hello.txt", (bs / 2) as u64, &data)
            .await
            .unwrap();
        assert_eq!(n, data.len());
        let out = fs
            .read(Caller::ROOT, "/a/b/hello.txt", (bs / 2) as u64, data.len())
            .await
            .unwrap();
        assert_eq!(out, data);

        // the unwritten head reads as zeros
        let head = fs.read(Caller::ROOT, "/a/b/hello.txt", 0, 8).await.unwrap();
        assert_eq!(head, vec![0; 8]);

        let entries = fs.read_dir_all(Caller::ROOT, "/a/b").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "hello.txt" && e.kind == FileType::File));

        let stat = fs.get_attr("/a/b/hello.txt").await.unwrap();
        assert_eq!(stat.size, (bs / 2 + data.len()) as u64);
    }

    #[tokio::test]
    async fn test_type_errors() {
        let fs = vfs().await;
        fs.mkdir(Caller::ROOT, "/d", 0o755).await.unwrap();
        fs.create(Caller::ROOT, "/f", 0o644).await.unwrap();

        assert_eq!(fs.create(Caller::ROOT, "/f", 0o644).await.unwrap_err(), FsError::AlreadyExists);
        assert_eq!(fs.mkdir(Caller::ROOT, "/", 0o755).await.unwrap_err(), FsError::AlreadyExists);
        assert_eq!(fs.create(Caller::ROOT, "/f/x", 0o644).await.unwrap_err(), FsError::NotADirectory);
        assert_eq!(fs.create(Caller::ROOT, "/nope/x", 0o644).await.unwrap_err(), FsError::NotFound);
        assert_eq!(fs.open(Caller::ROOT, "/d", libc::O_RDONLY).await.unwrap_err(), FsError::IsADirectory);
        assert_eq!(fs.open_dir(Caller::ROOT, "/f").await.unwrap_err(), FsError::NotADirectory);
        assert_eq!(fs.unlink(Caller::ROOT, "/d").await.unwrap_err(), FsError::IsADirectory);
        assert_eq!(fs.rmdir(Caller::ROOT, "/f").await.unwrap_err(), FsError::NotADirectory);
        assert!(matches!(fs.rmdir(Caller::ROOT, "/").await, Err(FsError::InvalidArgument(_))));
        assert!(matches!(fs.readlink("/f").await, Err(FsError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rmdir_requires_empty() {
        let fs = vfs().await;
        fs.mkdir(Caller::ROOT, "/d", 0o755).await.unwrap();
        fs.create(Caller::ROOT, "/d/f", 0o644).await.unwrap();
        assert_eq!(fs.rmdir(Caller::ROOT, "/d").await.unwrap_err(), FsError::NotEmpty);
        fs.unlink(Caller::ROOT, "/d/f").await.unwrap();
        assert!(fs.read_dir_all(Caller::ROOT, "/d").await.unwrap().is_empty());
        fs.rmdir(Caller::ROOT, "/d").await.unwrap();
        assert_eq!(fs.get_attr("/d").await.unwrap_err(), FsError::NotFound);
    }

    #[tokio::test]
    async fn test_unlink_releases_inode_and_blocks() {
        let fs = vfs().await;
        let f = fs.create(Caller::ROOT, "/f", 0o644).await.unwrap();
        fs.write(Caller::ROOT, "/f", 0, b"payload").await.unwrap();
        fs.unlink(Caller::ROOT, "/f").await.unwrap();
        assert_eq!(fs.get_attr("/f").await.unwrap_err(), FsError::NotFound);
        assert!(matches!(fs.store().get_inode(f.id).await, Err(StoreError::NotFound)));
        assert_eq!(fs.store().get_block(f.id, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rename_semantics() {
        let fs = vfs().await;
        let a = fs.create(Caller::ROOT, "/a", 0o644).await.unwrap();
        fs.mkdir(Caller::ROOT, "/dir", 0o755).await.unwrap();
        fs.mkdir(Caller::ROOT, "/full", 0o755).await.unwrap();
        fs.create(Caller::ROOT, "/full/x", 0o644).await.unwrap();

        fs.rename(Caller::ROOT, "/a", "/dir/b").await.unwrap();
        assert_eq!(fs.get_attr("/a").await.unwrap_err(), FsError::NotFound);
        let moved = fs.get_attr("/dir/b").await.unwrap();
        assert_eq!(moved.id, a.id);
        assert_eq!(moved.name, "b");

        assert!(matches!(
            fs.rename(Caller::ROOT, "/dir", "/dir/sub").await,
            Err(FsError::InvalidArgument(_))
        ));
        assert_eq!(fs.rename(Caller::ROOT, "/dir", "/full/x").await.unwrap_err(), FsError::NotADirectory);
        assert_eq!(fs.rename(Caller::ROOT, "/dir/b", "/full").await.unwrap_err(), FsError::IsADirectory);
        assert_eq!(fs.rename(Caller::ROOT, "/dir", "/full").await.unwrap_err(), FsError::NotEmpty);
        assert_eq!(fs.rename(Caller::ROOT, "/missing", "/m").await.unwrap_err(), FsError::NotFound);

        // replacing a file releases the old target
        let x = fs.get_attr("/full/x").await.unwrap();
        fs.rename(Caller::ROOT, "/dir/b", "/full/x").await.unwrap();
        assert_eq!(fs.get_attr("/full/x").await.unwrap().id, a.id);
        assert!(matches!(fs.store().get_inode(x.id).await, Err(StoreError::NotFound)));

        // an empty directory can be replaced by a directory
        fs.mkdir(Caller::ROOT, "/empty", 0o755).await.unwrap();
        fs.rename(Caller::ROOT, "/dir", "/empty").await.unwrap();
        assert_eq!(fs.get_attr("/dir").await.unwrap_err(), FsError::NotFound);
    }

    #[tokio::test]
    async fn test_permissions() {
        let fs = vfs().await;
        fs.mkdir(Caller::ROOT, "/home", 0o777).await.unwrap();
        fs.create(ALICE, "/home/notes", 0o640).await.unwrap();
        assert_eq!(fs.get_attr("/home/notes").await.unwrap().uid, 1000);

        assert_eq!(fs.read(BOB, "/home/notes", 0, 1).await.unwrap_err(), FsError::PermissionDenied);
        assert_eq!(fs.write(BOB, "/home/notes", 0, b"x").await.unwrap_err(), FsError::PermissionDenied);
        assert_eq!(fs.chmod(BOB, "/home/notes", 0o777).await.unwrap_err(), FsError::PermissionDenied);
        assert_eq!(fs.create(BOB, "/x", 0o644).await.unwrap_err(), FsError::PermissionDenied);

        let changed = fs.chmod(ALICE, "/home/notes", 0o100604).await.unwrap();
        assert_eq!(changed.mode, 0o604);
        fs.read(BOB, "/home/notes", 0, 1).await.unwrap();

        // the owner may change the group but not the owner
        let changed = fs.chown(ALICE, "/home/notes", None, Some(50)).await.unwrap();
        assert_eq!(changed.gid, 50);
        assert_eq!(
            fs.chown(ALICE, "/home/notes", Some(1001), None).await.unwrap_err(),
            FsError::PermissionDenied
        );
        let changed = fs.chown(Caller::ROOT, "/home/notes", Some(1001), Some(1001)).await.unwrap();
        assert_eq!((changed.uid, changed.gid), (1001, 1001));
    }

    #[tokio::test]
    async fn test_root_is_materialised_by_chmod() {
        let fs = vfs().await;
        let root = fs.get_attr("/").await.unwrap();
        assert_eq!(root.generation, 0);
        let root = fs.chmod(Caller::ROOT, "/", 0o700).await.unwrap();
        assert_eq!(root.generation, 1);
        assert_eq!(fs.get_attr("/").await.unwrap().mode, 0o700);
    }

    #[tokio::test]
    async fn test_truncate_and_open_trunc() {
        let fs = vfs().await;
        fs.create(Caller::ROOT, "/f", 0o644).await.unwrap();
        let bs = fs.store().block_size() as u64;
        fs.write(Caller::ROOT, "/f", 0, &vec![7u8; (bs * 3) as usize]).await.unwrap();

        fs.truncate(Caller::ROOT, "/f", bs + 10).await.unwrap();
        assert_eq!(fs.get_attr("/f").await.unwrap().size, bs + 10);
        // growing again exposes zeros, not the old bytes
        fs.truncate(Caller::ROOT, "/f", bs * 2).await.unwrap();
        let out = fs.read(Caller::ROOT, "/f", bs, bs as usize).await.unwrap();
        assert_eq!(&out[..10], &[7u8; 10]);
        assert!(out[10..].iter().all(|b| *b == 0));

        let id = fs.get_attr("/f").await.unwrap().id;
        fs.open(Caller::ROOT, "/f", libc::O_WRONLY | libc::O_TRUNC).await.unwrap();
        assert_eq!(fs.get_attr("/f").await.unwrap().size, 0);
        assert_eq!(fs.store().get_block(id, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_symlink_and_utimens() {
        let fs = vfs().await;
        fs.mkdir(Caller::ROOT, "/tmp", 0o777).await.unwrap();
        let link = fs.symlink(ALICE, "/etc/hosts", "/tmp/hosts").await.unwrap();
        assert_eq!(link.kind, FileType::Symlink);
        assert_eq!(link.size, 10);
        assert_eq!(fs.readlink("/tmp/hosts").await.unwrap(), "/etc/hosts");

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let updated = fs.utimens(ALICE, "/tmp/hosts", None, Some(when)).await.unwrap();
        assert_eq!(updated.mtime, when);
        assert_eq!(
            fs.utimens(BOB, "/tmp/hosts", Some(when), None).await.unwrap_err(),
            FsError::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_read_dir_pages() {
        let fs = vfs().await;
        for name in ["e", "d", "c", "b", "a"] {
            fs.create(Caller::ROOT, &format!("/{name}"), 0o644).await.unwrap();
        }
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = fs.read_dir_page(Caller::ROOT, "/", token.as_deref()).await.unwrap();
            names.extend(page.entries.into_iter().map(|e| e.name));
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(names, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_statfs() {
        let fs = vfs().await;
        let st = fs.statfs();
        assert_eq!(st.bsize, fs.store().block_size());
        assert_eq!(st.namelen, 255);
        assert!(st.bfree > 0);
    }
}
