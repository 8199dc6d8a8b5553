//! In-process backend: one ordered map guarded by a mutex. Used by tests and
//! single-host setups; several `Store`s sharing one `MemBackend` behave like
//! several hosts sharing one cluster.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::backend::{BackendError, KvBackend, Precondition, PutOutcome, Versioned};
use crate::config::Consistency;

#[derive(Default)]
pub struct MemBackend {
    rows: Mutex<BTreeMap<Vec<u8>, Versioned>>,
    // transient failures still to inject
    faults: AtomicU32,
    // mutations to apply and then report as failed
    lost_replies: AtomicU32,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.faults.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` puts or deletes but answer them with
    /// `Unavailable`, as when a commit lands and its response times out.
    pub fn lose_next_replies(&self, n: u32) {
        self.lost_replies.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Versioned>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inject_fault(&self) -> Result<(), BackendError> {
        Self::take(&self.faults, "injected fault")
    }

    fn lose_reply(&self) -> Result<(), BackendError> {
        Self::take(&self.lost_replies, "reply lost after commit")
    }

    fn take(counter: &AtomicU32, message: &str) -> Result<(), BackendError> {
        let took = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(BackendError::Unavailable(message.into())),
            Err(_) => Ok(()),
        }
    }

    fn check(current: Option<&Versioned>, condition: &Precondition) -> Result<(), BackendError> {
        let ok = match condition {
            Precondition::None => true,
            Precondition::Absent => current.is_none(),
            Precondition::Present => current.is_some(),
            Precondition::Version(v) => current.is_some_and(|row| row.version == *v),
            Precondition::Value(bytes) => current.is_some_and(|row| &row.value == bytes),
        };
        if ok {
            Ok(())
        } else {
            Err(BackendError::ConditionFailed)
        }
    }
}

#[async_trait]
impl KvBackend for MemBackend {
    async fn get(
        &self,
        key: &[u8],
        _consistency: Consistency,
    ) -> Result<Option<Versioned>, BackendError> {
        self.inject_fault()?;
        Ok(self.rows().get(key).cloned())
    }

    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        condition: Precondition,
    ) -> Result<PutOutcome, BackendError> {
        self.inject_fault()?;
        let outcome = {
            let mut rows = self.rows();
            let current = rows.get(key);
            Self::check(current, &condition)?;
            let version = current.map_or(1, |row| row.version + 1);
            let previous = rows
                .insert(key.to_vec(), Versioned { value, version })
                .map(|row| row.value);
            PutOutcome { version, previous }
        };
        self.lose_reply()?;
        Ok(outcome)
    }

    async fn delete(&self, key: &[u8], condition: Precondition) -> Result<bool, BackendError> {
        self.inject_fault()?;
        let removed = {
            let mut rows = self.rows();
            Self::check(rows.get(key), &condition)?;
            rows.remove(key).is_some()
        };
        self.lose_reply()?;
        Ok(removed)
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
        _consistency: Consistency,
    ) -> Result<Vec<(Vec<u8>, Versioned)>, BackendError> {
        self.inject_fault()?;
        let upper = if end == [0] {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let rows = self.rows();
        Ok(rows
            .range((Bound::Included(start.to_vec()), upper))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_put() {
        let kv = MemBackend::new();
        let first = kv.put(b"k", b"a".to_vec(), Precondition::Absent).await.unwrap();
        assert_eq!(first.version, 1);
        assert!(first.previous.is_none());

        let dup = kv.put(b"k", b"b".to_vec(), Precondition::Absent).await;
        assert!(matches!(dup, Err(BackendError::ConditionFailed)));

        let stale = kv.put(b"k", b"b".to_vec(), Precondition::Version(7)).await;
        assert!(matches!(stale, Err(BackendError::ConditionFailed)));

        let second = kv.put(b"k", b"b".to_vec(), Precondition::Version(1)).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.previous.as_deref(), Some(&b"a"[..]));

        let row = kv.get(b"k", Consistency::Strict).await.unwrap().unwrap();
        assert_eq!(row.value, b"b");
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let kv = MemBackend::new();
        assert!(!kv.delete(b"k", Precondition::None).await.unwrap());
        assert!(matches!(
            kv.delete(b"k", Precondition::Present).await,
            Err(BackendError::ConditionFailed)
        ));
        kv.put(b"k", b"v".to_vec(), Precondition::None).await.unwrap();
        assert!(matches!(
            kv.delete(b"k", Precondition::Value(b"other".to_vec())).await,
            Err(BackendError::ConditionFailed)
        ));
        assert!(kv.delete(b"k", Precondition::Value(b"v".to_vec())).await.unwrap());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_bounded() {
        let kv = MemBackend::new();
        for k in ["p/c", "p/a", "q/a", "p/b"] {
            kv.put(k.as_bytes(), vec![], Precondition::None).await.unwrap();
        }
        let rows = kv.scan(b"p/", b"p0", 10, Consistency::Relaxed).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"p/a"[..], b"p/b", b"p/c"]);

        let rows = kv.scan(b"p/b", b"p0", 1, Consistency::Strict).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, b"p/b");

        let all = kv.scan(b"", &[0], 100, Consistency::Strict).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let kv = MemBackend::new();
        kv.fail_next(2);
        assert!(kv.get(b"k", Consistency::Strict).await.unwrap_err().is_transient());
        assert!(kv.get(b"k", Consistency::Strict).await.unwrap_err().is_transient());
        assert!(kv.get(b"k", Consistency::Strict).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_reply_still_commits() {
        let kv = MemBackend::new();
        kv.lose_next_replies(1);
        let err = kv.put(b"k", b"v".to_vec(), Precondition::Absent).await.unwrap_err();
        assert!(err.is_transient());
        let row = kv.get(b"k", Consistency::Strict).await.unwrap().unwrap();
        assert_eq!((row.value.as_slice(), row.version), (&b"v"[..], 1));
        assert!(matches!(
            kv.put(b"k", b"v".to_vec(), Precondition::Absent).await,
            Err(BackendError::ConditionFailed)
        ));
    }
}
