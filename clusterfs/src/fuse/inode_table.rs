//! Kernel inode numbers.
//!
//! The kernel addresses files by 64-bit numbers while the filesystem works on
//! paths and 128-bit ids. Numbers are handed out on first sight of an id and
//! stay stable for the lifetime of the mount; the path recorded for a number
//! follows local renames.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::meta::InodeId;

pub const ROOT_INO: u64 = 1;

struct Tables {
    next: u64,
    /// ino -> current path
    by_ino: HashMap<u64, String>,
    by_id: HashMap<InodeId, u64>,
}

pub struct InodeTable {
    inner: Mutex<Tables>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || (dir == "/" && path.starts_with('/'))
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(ROOT_INO, "/".to_string());
        let mut by_id = HashMap::new();
        by_id.insert(InodeId::ROOT, ROOT_INO);
        Self {
            inner: Mutex::new(Tables {
                next: ROOT_INO + 1,
                by_ino,
                by_id,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number for `id`, allocating one if needed, and record `path` as its
    /// current location.
    pub fn intern(&self, id: InodeId, path: &str) -> u64 {
        let mut t = self.lock();
        if let Some(&ino) = t.by_id.get(&id) {
            if let Some(current) = t.by_ino.get_mut(&ino) {
                *current = path.to_string();
            }
            return ino;
        }
        let ino = t.next;
        t.next += 1;
        t.by_id.insert(id, ino);
        t.by_ino.insert(ino, path.to_string());
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.lock().by_ino.get(&ino).cloned()
    }

    pub fn ino_of_path(&self, path: &str) -> Option<u64> {
        self.lock()
            .by_ino
            .iter()
            .find(|(_, p)| p.as_str() == path)
            .map(|(ino, _)| *ino)
    }

    /// Rewrite the recorded paths of `from` and everything below it.
    pub fn rename(&self, from: &str, to: &str) {
        let mut t = self.lock();
        for current in t.by_ino.values_mut() {
            if is_within(current, from) {
                *current = format!("{to}{}", &current[from.len()..]);
            }
        }
    }

    /// Drop the number of a removed file.
    pub fn remove(&self, id: InodeId) {
        if id.is_root() {
            return;
        }
        let mut t = self.lock();
        if let Some(ino) = t.by_id.remove(&id) {
            t.by_ino.remove(&ino);
        }
    }
}
