//! Store client interface consumed by sessions, elections and mutexes.
//!
//! The store itself (replication, txn execution, watch dispatch, lease
//! manager) lives behind these traits. `MemoryStore` implements them for
//! tests and single-process use.

use crate::error::Result;
use crate::types::{
    DeleteResponse, GetResponse, KeyValue, LeaseGrantResponse, LeaseId,
    LeaseKeepAliveResponse, PutResponse, ResponseHeader, Revision, WatchResponse,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// Field a range read is sorted by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortTarget {
    #[default]
    Key,
    CreateRevision,
    ModRevision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

/// Range read options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    pub sort_target: SortTarget,
    pub sort_order: SortOrder,
    /// Maximum number of keys returned, 0 for no limit
    pub limit: usize,
    /// Only keys created at or before this revision, 0 for no bound
    pub max_create_revision: Revision,
}

impl GetOptions {
    /// Exact key lookup
    pub fn key() -> Self {
        Self::default()
    }

    /// Every key starting with the given key
    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Self::default()
        }
    }

    /// Oldest key by creation revision
    pub fn first_create(self) -> Self {
        self.sorted(SortTarget::CreateRevision, SortOrder::Ascend)
            .with_limit(1)
    }

    /// Newest key by creation revision
    pub fn last_create(self) -> Self {
        self.sorted(SortTarget::CreateRevision, SortOrder::Descend)
            .with_limit(1)
    }

    pub fn sorted(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort_target = target;
        self.sort_order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_max_create_revision(mut self, rev: Revision) -> Self {
        self.max_create_revision = rev;
        self
    }
}

/// Watch options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub prefix: bool,
    /// First revision to deliver, 0 for "changes after now"
    pub start_revision: Revision,
}

impl WatchOptions {
    pub fn key() -> Self {
        Self::default()
    }

    pub fn prefix() -> Self {
        Self {
            prefix: true,
            start_revision: 0,
        }
    }

    pub fn from_revision(mut self, rev: Revision) -> Self {
        self.start_revision = rev;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    Greater,
}

impl CompareOp {
    fn holds<T: Ord + ?Sized>(self, actual: &T, expected: &T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Less => actual < expected,
            CompareOp::Greater => actual > expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
    Value(Vec<u8>),
}

/// One guard of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, op: CompareOp, rev: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::CreateRevision(rev),
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CompareOp, rev: Revision) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(rev),
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<String>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::Value(value.into()),
        }
    }

    /// Evaluate against the current state of `key`.
    ///
    /// A missing key has create/mod revision and version 0; value
    /// comparisons against a missing key never hold.
    pub fn evaluate(&self, kv: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::CreateRevision(rev) => {
                self.op.holds(&kv.map_or(0, |kv| kv.create_revision), rev)
            }
            CompareTarget::ModRevision(rev) => {
                self.op.holds(&kv.map_or(0, |kv| kv.mod_revision), rev)
            }
            CompareTarget::Version(version) => {
                self.op.holds(&kv.map_or(0, |kv| kv.version), version)
            }
            CompareTarget::Value(value) => match kv {
                Some(kv) => self.op.holds(kv.value.as_slice(), value.as_slice()),
                None => false,
            },
        }
    }
}

/// Operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put {
        key: String,
        value: Vec<u8>,
        lease: LeaseId,
        /// Keep whatever lease the key already has
        ignore_lease: bool,
    },
    Get {
        key: String,
        options: GetOptions,
    },
    Delete {
        key: String,
        prefix: bool,
    },
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease,
            ignore_lease: false,
        }
    }

    /// Update the value without touching the key's lease
    pub fn put_keep_lease(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: crate::types::NO_LEASE,
            ignore_lease: true,
        }
    }

    pub fn get(key: impl Into<String>, options: GetOptions) -> Self {
        Op::Get {
            key: key.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete {
            key: key.into(),
            prefix: false,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Op::Get { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Put(PutResponse),
    Get(GetResponse),
    Delete(DeleteResponse),
}

impl OpResponse {
    pub fn as_get(&self) -> Option<&GetResponse> {
        match self {
            OpResponse::Get(resp) => Some(resp),
            _ => None,
        }
    }
}

/// Compare-then-apply unit executed atomically by the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    /// Whether every compare held (and the success branch ran)
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
}

impl TxnResponse {
    /// Range result at `index` in the executed branch
    pub fn range(&self, index: usize) -> Option<&GetResponse> {
        self.responses.get(index).and_then(OpResponse::as_get)
    }
}

/// Ordered stream of watch batches.
///
/// A compacted start revision shows up as an `Error::Compacted` item,
/// after which the stream ends. Dropping it cancels the watch.
pub type WatchStream = BoxStream<'static, Result<WatchResponse>>;

#[async_trait]
pub trait Kv: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<PutResponse>;

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse>;

    async fn delete(&self, key: &str, prefix: bool) -> Result<DeleteResponse>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;
}

#[async_trait]
pub trait Watcher: Send + Sync {
    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream>;
}

#[async_trait]
pub trait Lease: Send + Sync {
    async fn grant(&self, ttl: Duration) -> Result<LeaseGrantResponse>;

    /// Send one keep-alive ping for `id`
    async fn keep_alive_once(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse>;

    async fn revoke(&self, id: LeaseId) -> Result<ResponseHeader>;
}

/// Everything a session needs from the store
pub trait Client: Kv + Watcher + Lease {}

impl<T: Kv + Watcher + Lease + ?Sized> Client for T {}
