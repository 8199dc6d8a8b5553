//! Open directory handles.
//!
//! The kernel continues a listing from the offset of the last entry it kept.
//! Each handle remembers which name it handed out at which offset in its most
//! recent batch, so the next call resumes the store listing right after that
//! name instead of reading the directory from the start.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

struct Handles {
    next: u64,
    /// fh -> (offset -> name) of the last batch returned on that handle.
    open: HashMap<u64, HashMap<i64, String>>,
}

pub struct DirHandles {
    inner: Mutex<Handles>,
}

impl Default for DirHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl DirHandles {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Handles {
                // fh 0 stays unused so a handle-less call never resumes
                next: 1,
                open: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Handles> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open(&self) -> u64 {
        let mut handles = self.lock();
        let fh = handles.next;
        handles.next += 1;
        handles.open.insert(fh, HashMap::new());
        fh
    }

    /// Remember the batch just returned on `fh`, replacing the previous one.
    /// Unknown handles are ignored.
    pub fn record(&self, fh: u64, batch: impl IntoIterator<Item = (i64, String)>) {
        if let Some(names) = self.lock().open.get_mut(&fh) {
            names.clear();
            names.extend(batch);
        }
    }

    /// Name of the entry handed out at `offset` in the last batch on `fh`.
    pub fn resume(&self, fh: u64, offset: i64) -> Option<String> {
        self.lock().open.get(&fh)?.get(&offset).cloned()
    }

    pub fn close(&self, fh: u64) {
        self.lock().open.remove(&fh);
    }
}
