//! etcd v3 (and Xline) backend.
//!
//! Conditional writes are single-key transactions: the precondition becomes a
//! `Compare` clause and the mutation runs in the success branch, so the check
//! and the write are atomic on the cluster.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, KvClient, PutOptions,
    SortOrder, SortTarget, Txn, TxnOp, TxnOpResponse,
};
use tonic::Code;
use tracing::debug;

use super::backend::{BackendError, KvBackend, Precondition, PutOutcome, Versioned};
use crate::config::{Consistency, StoreConfig};

pub struct EtcdBackend {
    kv: KvClient,
}

impl EtcdBackend {
    pub async fn connect(config: &StoreConfig) -> Result<Self, BackendError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_timeout(config.request_timeout);
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(classify)?;
        debug!(endpoints = ?config.endpoints, "connected to cluster");
        Ok(Self {
            kv: client.kv_client(),
        })
    }

    fn compare(key: &[u8], condition: &Precondition) -> Option<Compare> {
        let key = key.to_vec();
        match condition {
            Precondition::None => None,
            Precondition::Absent => Some(Compare::version(key, CompareOp::Equal, 0)),
            Precondition::Present => Some(Compare::version(key, CompareOp::Greater, 0)),
            Precondition::Version(v) => Some(Compare::version(key, CompareOp::Equal, *v as i64)),
            Precondition::Value(bytes) => {
                Some(Compare::value(key, CompareOp::Equal, bytes.clone()))
            }
        }
    }

    fn read_options(consistency: Consistency) -> GetOptions {
        match consistency {
            Consistency::Strict => GetOptions::new(),
            Consistency::Relaxed => GetOptions::new().with_serializable(),
        }
    }
}

/// Map client errors onto retryable and permanent failures.
fn classify(e: etcd_client::Error) -> BackendError {
    match e {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Cancelled => BackendError::Unavailable(status.message().to_string()),
            _ => BackendError::Other(status.to_string()),
        },
        etcd_client::Error::TransportError(e) => BackendError::Unavailable(e.to_string()),
        etcd_client::Error::IoError(e) => BackendError::Unavailable(e.to_string()),
        other => BackendError::Other(other.to_string()),
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn get(
        &self,
        key: &[u8],
        consistency: Consistency,
    ) -> Result<Option<Versioned>, BackendError> {
        let mut kv = self.kv.clone();
        let resp = kv
            .get(key, Some(Self::read_options(consistency)))
            .await
            .map_err(classify)?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            version: kv.version() as u64,
        }))
    }

    async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        condition: Precondition,
    ) -> Result<PutOutcome, BackendError> {
        let op = TxnOp::put(key, value, Some(PutOptions::new().with_prev_key()));
        let txn = match Self::compare(key, &condition) {
            Some(cmp) => Txn::new().when([cmp]).and_then([op]),
            None => Txn::new().and_then([op]),
        };
        let mut kv = self.kv.clone();
        let resp = kv.txn(txn).await.map_err(classify)?;
        if !resp.succeeded() {
            return Err(BackendError::ConditionFailed);
        }
        let previous = resp
            .op_responses()
            .into_iter()
            .find_map(|r| match r {
                TxnOpResponse::Put(put) => put
                    .prev_key()
                    .map(|kv| (kv.value().to_vec(), kv.version())),
                _ => None,
            });
        Ok(PutOutcome {
            version: previous.as_ref().map_or(1, |(_, v)| *v as u64 + 1),
            previous: previous.map(|(value, _)| value),
        })
    }

    async fn delete(&self, key: &[u8], condition: Precondition) -> Result<bool, BackendError> {
        let op = TxnOp::delete(key, None::<DeleteOptions>);
        let txn = match Self::compare(key, &condition) {
            Some(cmp) => Txn::new().when([cmp]).and_then([op]),
            None => Txn::new().and_then([op]),
        };
        let mut kv = self.kv.clone();
        let resp = kv.txn(txn).await.map_err(classify)?;
        if !resp.succeeded() {
            return Err(BackendError::ConditionFailed);
        }
        let deleted = resp.op_responses().into_iter().any(|r| match r {
            TxnOpResponse::Delete(del) => del.deleted() > 0,
            _ => false,
        });
        Ok(deleted)
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
        consistency: Consistency,
    ) -> Result<Vec<(Vec<u8>, Versioned)>, BackendError> {
        let options = Self::read_options(consistency)
            .with_range(end)
            .with_limit(limit as i64)
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let mut kv = self.kv.clone();
        let resp = kv.get(start, Some(options)).await.map_err(classify)?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    kv.key().to_vec(),
                    Versioned {
                        value: kv.value().to_vec(),
                        version: kv.version() as u64,
                    },
                )
            })
            .collect())
    }
}
