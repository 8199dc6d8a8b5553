//! FUSE adapter
//!
//! Translates kernel requests (inode numbers plus names) into the path-based
//! calls of [`Vfs`]. File handles are stateless: every open returns fh 0 and
//! data calls resolve the path again. Directory handles only carry where the
//! last listing batch ended, so each readdir reads one page from the store.
//!
//! - `inode_table`: kernel inode numbers <-> (inode id, path)
//! - `dir_handle`: resume points of open directory listings
//! - `mount`: session helpers
pub mod dir_handle;
pub mod inode_table;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};
use tracing::debug;

use crate::cache::Page;
use crate::config::MountOptions;
use crate::error::FsError;
use crate::meta::{DirEntry, FileType, Inode};
use crate::vfs::path::join;
use crate::vfs::{Caller, Vfs};
use dir_handle::DirHandles;
use inode_table::{InodeTable, ROOT_INO};

impl From<FsError> for Errno {
    fn from(e: FsError) -> Self {
        e.errno().into()
    }
}

pub struct FuseAdapter {
    vfs: Vfs,
    inodes: InodeTable,
    dirs: DirHandles,
    mount: MountOptions,
}

impl FuseAdapter {
    pub fn new(vfs: Vfs, mount: MountOptions) -> Self {
        Self {
            vfs,
            inodes: InodeTable::new(),
            dirs: DirHandles::new(),
            mount,
        }
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path_of(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        Ok(join(&self.path_of(parent)?, name))
    }

    fn parent_ino(&self, path: &str) -> u64 {
        let parent = match path.rfind('/') {
            Some(0) | None => "/",
            Some(n) => &path[..n],
        };
        self.inodes.ino_of_path(parent).unwrap_or(ROOT_INO)
    }

    fn attr(&self, ino: u64, inode: &Inode) -> FileAttr {
        to_fuse_attr(ino, inode, self.vfs.store().block_size())
    }

    /// The next page of entries after kernel offset `offset`, numbered from
    /// `offset + 1`. Offsets 1 and 2 belong to `.` and `..`.
    async fn dir_page(
        &self,
        caller: Caller,
        fh: u64,
        path: &str,
        offset: i64,
    ) -> FuseResult<Vec<(i64, DirEntry)>> {
        let base = offset.max(2);
        let page = if base == 2 {
            self.vfs.read_dir_page(caller, path, None).await?
        } else if let Some(name) = self.dirs.resume(fh, base) {
            self.vfs.read_dir_page(caller, path, Some(&name)).await?
        } else {
            debug!(path, fh, offset, "no resume point, skipping from the start");
            self.page_after(caller, path, (base - 2) as usize).await?
        };
        let batch: Vec<(i64, DirEntry)> = (base + 1..).zip(page.entries).collect();
        self.dirs
            .record(fh, batch.iter().map(|(offset, e)| (*offset, e.name.clone())));
        Ok(batch)
    }

    /// The page that starts after the first `skip` entries of the listing.
    async fn page_after(&self, caller: Caller, path: &str, mut skip: usize) -> FuseResult<Page> {
        let mut token: Option<String> = None;
        loop {
            let mut page = self.vfs.read_dir_page(caller, path, token.as_deref()).await?;
            if skip < page.entries.len() {
                page.entries.drain(..skip);
                return Ok(page);
            }
            skip -= page.entries.len();
            match page.next.take() {
                Some(next) => token = Some(next),
                None => {
                    return Ok(Page {
                        entries: Vec::new(),
                        next: None,
                    });
                }
            }
        }
    }

    fn entry(&self, path: &str, inode: &Inode) -> ReplyEntry {
        let ino = self.inodes.intern(inode.id, path);
        ReplyEntry {
            ttl: self.mount.entry_ttl,
            attr: self.attr(ino, inode),
            generation: 0,
        }
    }

    async fn stat(&self, ino: u64) -> FuseResult<(String, Inode)> {
        let path = self.path_of(ino)?;
        let inode = self.vfs.get_attr(&path).await?;
        Ok((path, inode))
    }
}

impl Filesystem for FuseAdapter {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        match self.vfs.get_attr(&path).await {
            Ok(inode) => Ok(self.entry(&path, &inode)),
            // ino 0 lets the kernel cache the miss for the negative TTL
            Err(FsError::NotFound) if !self.mount.negative_ttl.is_zero() => Ok(ReplyEntry {
                ttl: self.mount.negative_ttl,
                attr: negative_attr(),
                generation: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let (_, inode) = self.stat(ino).await?;
        Ok(ReplyAttr {
            ttl: self.mount.entry_ttl,
            attr: self.attr(ino, &inode),
        })
    }

    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let caller = Caller::new(req.uid, req.gid);
        let path = self.path_of(ino)?;
        if let Some(mode) = set_attr.mode {
            self.vfs.chmod(caller, &path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.vfs
                .chown(caller, &path, set_attr.uid, set_attr.gid)
                .await?;
        }
        if let Some(size) = set_attr.size {
            self.vfs.truncate(caller, &path, size).await?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.vfs
                .utimens(
                    caller,
                    &path,
                    set_attr.atime.map(to_system_time),
                    set_attr.mtime.map(to_system_time),
                )
                .await?;
        }
        let inode = self.vfs.get_attr(&path).await?;
        Ok(ReplyAttr {
            ttl: self.mount.entry_ttl,
            attr: self.attr(ino, &inode),
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let target = self.vfs.readlink(&path).await?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn symlink(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        let target = link.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
        let inode = self
            .vfs
            .symlink(Caller::new(req.uid, req.gid), target, &path)
            .await?;
        Ok(self.entry(&path, &inode))
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        let inode = self
            .vfs
            .mkdir(Caller::new(req.uid, req.gid), &path, mode & !umask)
            .await?;
        Ok(self.entry(&path, &inode))
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        let inode = self
            .vfs
            .create(Caller::new(req.uid, req.gid), &path, mode)
            .await?;
        let ino = self.inodes.intern(inode.id, &path);
        Ok(ReplyCreated {
            ttl: self.mount.entry_ttl,
            attr: self.attr(ino, &inode),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn unlink(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        let id = self.vfs.get_attr(&path).await.ok().map(|i| i.id);
        self.vfs.unlink(Caller::new(req.uid, req.gid), &path).await?;
        if let Some(id) = id {
            self.inodes.remove(id);
        }
        Ok(())
    }

    async fn rmdir(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        let id = self.vfs.get_attr(&path).await.ok().map(|i| i.id);
        self.vfs.rmdir(Caller::new(req.uid, req.gid), &path).await?;
        if let Some(id) = id {
            self.inodes.remove(id);
        }
        Ok(())
    }

    async fn rename(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(new_parent, new_name)?;
        let replaced = self.vfs.get_attr(&to).await.ok().map(|i| i.id);
        self.vfs
            .rename(Caller::new(req.uid, req.gid), &from, &to)
            .await?;
        if let Some(id) = replaced {
            self.inodes.remove(id);
        }
        self.inodes.rename(&from, &to);
        Ok(())
    }

    async fn open(&self, req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        self.vfs
            .open(Caller::new(req.uid, req.gid), &path, flags as i32)
            .await?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        self.vfs
            .open_dir(Caller::new(req.uid, req.gid), &path)
            .await?;
        Ok(ReplyOpen {
            fh: self.dirs.open(),
            flags: 0,
        })
    }

    // access was checked when the handle was opened
    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let data = self
            .vfs
            .read(Caller::ROOT, &path, offset, size as usize)
            .await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.path_of(ino)?;
        let n = self.vfs.write(Caller::ROOT, &path, offset, data).await?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn readdir<'a>(
        &'a self,
        req: Request,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path_of(ino)?;
        let batch = self
            .dir_page(Caller::new(req.uid, req.gid), fh, &path, offset)
            .await?;

        // offset is that of the last entry already returned
        let mut out = Vec::with_capacity(batch.len() + 2);
        if offset < 1 {
            out.push(DirectoryEntry {
                inode: ino,
                kind: FuseFileType::Directory,
                name: OsString::from("."),
                offset: 1,
            });
        }
        if offset < 2 {
            out.push(DirectoryEntry {
                inode: self.parent_ino(&path),
                kind: FuseFileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            });
        }
        for (offset, e) in batch {
            out.push(DirectoryEntry {
                inode: self.inodes.intern(e.child, &join(&path, &e.name)),
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset,
            });
        }
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(out.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let (path, dir) = self.stat(ino).await?;
        let offset = i64::try_from(offset).map_err(|_| Errno::from(libc::EINVAL))?;
        let batch = self
            .dir_page(Caller::new(req.uid, req.gid), fh, &path, offset)
            .await?;
        let ttl = self.mount.entry_ttl;

        let mut out = Vec::with_capacity(batch.len() + 2);
        if offset < 1 {
            out.push(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind: FuseFileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: self.attr(ino, &dir),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }
        if offset < 2 {
            let parent_ino = self.parent_ino(&path);
            if let Ok((_, parent)) = self.stat(parent_ino).await {
                out.push(DirectoryEntryPlus {
                    inode: parent_ino,
                    generation: 0,
                    kind: FuseFileType::Directory,
                    name: OsString::from(".."),
                    offset: 2,
                    attr: self.attr(parent_ino, &parent),
                    entry_ttl: ttl,
                    attr_ttl: ttl,
                });
            }
        }
        for (offset, e) in batch {
            let child_path = join(&path, &e.name);
            // entries removed since the page was read are skipped
            let Ok(child) = self.vfs.get_attr(&child_path).await else {
                debug!(path = %child_path, "entry vanished during readdirplus");
                continue;
            };
            let child_ino = self.inodes.intern(child.id, &child_path);
            out.push(DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: to_fuse_kind(child.kind),
                name: OsString::from(e.name),
                offset,
                attr: self.attr(child_ino, &child),
                entry_ttl: ttl,
                attr_ttl: ttl,
            });
        }
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(out.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.vfs.statfs();
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    // writes reach the cluster before they are acknowledged
    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        self.dirs.close(fh);
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    // numbers are kept for the lifetime of the mount
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_fuse_kind(kind: FileType) -> FuseFileType {
    match kind {
        FileType::Dir => FuseFileType::Directory,
        FileType::File => FuseFileType::RegularFile,
        FileType::Symlink => FuseFileType::Symlink,
    }
}

fn to_system_time(ts: Timestamp) -> SystemTime {
    let nanos = Duration::from_nanos(u64::from(ts.nsec));
    if ts.sec >= 0 {
        UNIX_EPOCH + Duration::from_secs(ts.sec as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs()) + nanos
    }
}

fn to_fuse_attr(ino: u64, inode: &Inode, block_size: u32) -> FileAttr {
    FileAttr {
        ino,
        size: inode.size,
        // st_blocks counts 512-byte units
        blocks: inode.size.div_ceil(512),
        atime: Timestamp::from(inode.atime),
        mtime: Timestamp::from(inode.mtime),
        ctime: Timestamp::from(inode.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(inode.ctime),
        kind: to_fuse_kind(inode.kind),
        perm: (inode.mode & 0o7777) as u16,
        nlink: if inode.is_dir() { 2 } else { 1 },
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: block_size,
    }
}

fn negative_attr() -> FileAttr {
    let epoch = Timestamp::from(UNIX_EPOCH);
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: epoch,
        mtime: epoch,
        ctime: epoch,
        #[cfg(target_os = "macos")]
        crtime: epoch,
        kind: FuseFileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 0,
    }
}


#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use std::fs;
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::fuse::mount::mount_unprivileged;
    use crate::vfs::tests::test_store;

    // gated: needs /dev/fuse and fusermount3
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("CLUSTERFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set CLUSTERFS_FUSE_TEST=1 to enable");
            return;
        }

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mount = MountOptions::from_mount_point(mnt.path()).expect("stat mount point");
        let store: Arc<_> = test_store(true).await;
        let adapter = FuseAdapter::new(Vfs::new(store, mount), mount);

        let handle = match mount_unprivileged(adapter, mnt.path()).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let dir = mnt.path().join("a");
        fs::create_dir(&dir).expect("mkdir");
        let file_path = dir.join("hello.txt");
        {
            let mut f = fs::File::create(&file_path).expect("create file");
            f.write_all(b"abc").expect("write");
            f.flush().expect("flush");
        }
        assert_eq!(fs::read(&file_path).expect("read back"), b"abc");

        let renamed = dir.join("moved.txt");
        fs::rename(&file_path, &renamed).expect("rename");
        let names = fs::read_dir(&dir)
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["moved.txt".to_string()]);

        fs::remove_file(&renamed).expect("unlink");
        fs::remove_dir(&dir).expect("rmdir");

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
