//! Backing database contract.
//!
//! The store only needs a flat, byte-ordered key space with per-row versions
//! and single-row conditional writes. Those conditional writes are the only
//! cross-host exclusion mechanism the filesystem has.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Consistency;

/// Guard evaluated atomically with a put or delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional.
    None,
    /// The key must not exist.
    Absent,
    /// The key must exist.
    Present,
    /// The row's current version must equal this value.
    Version(u64),
    /// The row's current value must equal these bytes.
    Value(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    /// Modification count of the row since it was created; starts at 1.
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    /// Version of the row after the write.
    pub version: u64,
    /// Value that was overwritten, if any.
    pub previous: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("precondition failed")]
    ConditionFailed,
    /// Partition, timeout or overloaded member; safe to retry.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(
        &self,
        key: &[u8],
        consistency: Consistency,
    ) -> Result<Option<Versioned>, BackendError>;

    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        condition: Precondition,
    ) -> Result<PutOutcome, BackendError>;

    /// Returns whether a row was removed. A failed precondition is
    /// `ConditionFailed`; deleting a missing key unconditionally is `Ok(false)`.
    async fn delete(&self, key: &[u8], condition: Precondition) -> Result<bool, BackendError>;

    /// Rows with `start <= key < end` in ascending key order, at most `limit`.
    /// An `end` of `[0]` means "to the end of the key space".
    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
        consistency: Consistency,
    ) -> Result<Vec<(Vec<u8>, Versioned)>, BackendError>;
}
