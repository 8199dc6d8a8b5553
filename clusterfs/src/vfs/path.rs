//! Path normalisation and the component walk from the root to an inode.
//!
//! Nothing is memoised here: every resolution walks the entries again, and
//! only the store's cache (bounded by TTL and generation) can short-circuit
//! a step.
//!
//! The walk also repairs what an interrupted rename leaves behind. A rename
//! first moves the inode's primary link to the new name and records the old
//! one in `renamed_from`, then writes the new entry, then deletes the old
//! entry. Following an entry that disagrees with the primary link:
//!
//! - if it is the `renamed_from` entry and the new entry is not written yet,
//!   the rename is still in flight (or died early) and the old name keeps
//!   working;
//! - if the entry named by the primary link exists, the followed entry is a
//!   leftover duplicate and is deleted;
//! - otherwise the link is moved to the followed entry.
//!
//! An entry is only ever deleted while the primary link entry exists, so
//! reconciliation never takes the last name of an inode.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::MountOptions;
use crate::error::{FsError, FsResult, StoreError};
use crate::meta::{DirEntry, Inode, InodeId};
use crate::store::Store;

const MAX_LINK_REPAIRS: usize = 8;

/// Split `path` into its components, resolving `.` and `..`. Empty
/// components are ignored; climbing above the root is rejected.
pub fn normalize(path: &str) -> FsResult<Vec<&str>> {
    let mut out = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    return Err(FsError::InvalidArgument(format!(
                        "`{path}` escapes the root"
                    )));
                }
            }
            name => out.push(name),
        }
    }
    Ok(out)
}

/// Canonical absolute form of `path`.
pub fn canonical(path: &str) -> FsResult<String> {
    Ok(format!("/{}", normalize(path)?.join("/")))
}

/// Append `name` to the canonical directory path `dir`.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub struct PathResolver {
    store: Arc<Store>,
    mount: MountOptions,
}

impl PathResolver {
    pub fn new(store: Arc<Store>, mount: MountOptions) -> Self {
        Self { store, mount }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The root inode; synthesised from the mount options until its row is
    /// first written.
    pub async fn root(&self) -> FsResult<Inode> {
        match self.store.get_inode(InodeId::ROOT).await {
            Ok(root) => Ok(root),
            Err(StoreError::NotFound) => Ok(Inode::synthetic_root(
                self.store.scope().clone(),
                self.mount.uid,
                self.mount.gid,
                self.mount.mode,
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn resolve(&self, path: &str) -> FsResult<Inode> {
        let components = normalize(path)?;
        self.resolve_components(&components).await
    }

    pub async fn resolve_components(&self, components: &[&str]) -> FsResult<Inode> {
        let mut current = self.root().await?;
        for name in components {
            if !current.is_dir() {
                return Err(FsError::NotADirectory);
            }
            current = self
                .follow(&current, name)
                .await?
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    /// Resolve the directory that holds the last component of `path`.
    pub async fn resolve_parent(&self, path: &str) -> FsResult<(Inode, String)> {
        let components = normalize(path)?;
        let Some((name, dirs)) = components.split_last() else {
            return Err(FsError::InvalidArgument("the root has no parent".into()));
        };
        let parent = self.resolve_components(dirs).await?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok((parent, name.to_string()))
    }

    /// Look `name` up in `parent` and load the child it references.
    pub async fn follow(&self, parent: &Inode, name: &str) -> FsResult<Option<Inode>> {
        let Some(entry) = self.store.lookup(parent.id, name).await? else {
            return Ok(None);
        };
        let child = match self.store.get_inode(entry.child).await {
            Ok(child) => child,
            Err(StoreError::NotFound) => {
                debug!(parent = %parent.id, name, child = %entry.child, "dangling entry");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if child.parent == entry.parent && child.name == entry.name {
            return Ok(Some(child));
        }
        self.reconcile(&entry, child).await
    }

    async fn reconcile(&self, followed: &DirEntry, mut child: Inode) -> FsResult<Option<Inode>> {
        for _ in 0..MAX_LINK_REPAIRS {
            let recorded = self.store.lookup(child.parent, &child.name).await?;
            let link_holds = recorded.is_some_and(|r| r.child == child.id);
            let leaving = child
                .renamed_from
                .as_ref()
                .is_some_and(|(parent, name)| *parent == followed.parent && *name == followed.name);
            if leaving && !link_holds {
                debug!(
                    parent = %followed.parent,
                    name = %followed.name,
                    child = %child.id,
                    "rename in progress, old name still served"
                );
                return Ok(Some(child));
            }
            if link_holds {
                match self
                    .store
                    .delete_dir_entry(followed.parent, &followed.name, Some(child.id))
                    .await
                {
                    Ok(()) | Err(StoreError::NotFound) | Err(StoreError::Conflict) => {}
                    Err(e) => return Err(e.into()),
                }
                info!(
                    parent = %followed.parent,
                    name = %followed.name,
                    child = %child.id,
                    "removed stale duplicate entry"
                );
                return Ok(None);
            }

            let expected = child.generation;
            child.parent = followed.parent;
            child.name = followed.name.clone();
            child.renamed_from = None;
            match self.store.put_inode(&child, Some(expected)).await {
                Ok(generation) => {
                    child.generation = generation;
                    info!(child = %child.id, parent = %followed.parent, name = %followed.name, "repaired primary link");
                    return Ok(Some(child));
                }
                Err(StoreError::Conflict) => {}
                Err(e) => return Err(e.into()),
            }

            child = match self.store.get_inode(followed.child).await {
                Ok(child) => child,
                Err(StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if child.parent == followed.parent && child.name == followed.name {
                return Ok(Some(child));
            }
        }
        Err(FsError::Io(format!(
            "primary link of {} kept changing",
            followed.child
        )))
    }
}
