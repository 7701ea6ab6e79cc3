//! Coordination Store
//!
//! The linearizable key-value service the registry is built on: prefix range
//! reads, atomic conditional writes, server-side expiring leases and a
//! monotonic revision counter with change notification.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   CoordinationStore                        │
//! │  get / range / put / delete      txn(ConditionalWrite)     │
//! │  grant / revoke / keep_alive     watch -> WatchSubscription│
//! └──────────────┬──────────────────────────────┬─────────────┘
//!                │                              │
//!        ┌───────┴────────┐            ┌────────┴─────────┐
//!        │  MemoryStore   │            │  (other stores)  │
//!        └────────────────┘            └──────────────────┘
//! ```

pub mod memory;
pub mod watch;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use watch::{KeyFilter, WatchSubscription};

/// Store-assigned lease identifier; 0 means "no lease"
pub type LeaseId = i64;

/// Store-wide monotonic revision
pub type Revision = i64;

// =============================================================================
// Store Errors
// =============================================================================

/// Transport-level status reported by a coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    NotFound,
    DeadlineExceeded,
    Canceled,
    /// Requested revision is older than the retained history
    Compacted,
    Unavailable,
    Other,
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreStatus::NotFound => write!(f, "not-found"),
            StoreStatus::DeadlineExceeded => write!(f, "deadline-exceeded"),
            StoreStatus::Canceled => write!(f, "canceled"),
            StoreStatus::Compacted => write!(f, "compacted"),
            StoreStatus::Unavailable => write!(f, "unavailable"),
            StoreStatus::Other => write!(f, "other"),
        }
    }
}

/// Error returned by a coordination store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("store {status}: {detail}")]
pub struct StoreError {
    pub status: StoreStatus,
    pub detail: String,
}

impl StoreError {
    pub fn new(status: StoreStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    /// Whether a retry may succeed without caller intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self.status,
            StoreStatus::Unavailable | StoreStatus::DeadlineExceeded
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// =============================================================================
// Key-Value Records
// =============================================================================

/// A key with its value and revision metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision at which the key was created
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Number of writes since creation
    pub version: i64,
    pub lease: LeaseId,
}

impl KeyValue {
    /// Value as UTF-8, if it is valid
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Field used to order a range read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortTarget {
    #[default]
    Key,
    Version,
    CreateRevision,
    ModRevision,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

/// Range read over `[key, end)`, or a single key when `end` is `None`
#[derive(Debug, Clone, Default)]
pub struct RangeRequest {
    pub key: String,
    pub end: Option<String>,
    /// 0 means unlimited
    pub limit: usize,
    pub sort: Option<(SortTarget, SortOrder)>,
    pub keys_only: bool,
}

impl RangeRequest {
    /// Every key starting with `prefix`
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let key = prefix.into();
        let end = prefix_end(&key);
        Self {
            key,
            end: Some(end),
            ..Default::default()
        }
    }

    /// Keys in `[from, end)`
    pub fn between(from: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            key: from.into(),
            end: Some(end.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_sort(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort = Some((target, order));
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// More keys matched than `limit` allowed
    pub more: bool,
    pub revision: Revision,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub kv: Option<KeyValue>,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteResponse {
    pub deleted: u64,
    pub revision: Revision,
}

/// Upper bound for a prefix scan: the smallest string above every key that
/// starts with `prefix`, in byte order. The last character steps to the next
/// scalar value across the surrogate gap, and a trailing `char::MAX` carries
/// left. An empty prefix yields `"\0"`, which callers treat as "whole
/// keyspace".
pub fn prefix_end(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{D7FF}' => Some('\u{E000}'),
            _ => char::from_u32(last as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return chars.into_iter().collect();
        }
    }
    "\0".to_string()
}

// =============================================================================
// Conditional Writes
// =============================================================================

/// How a put treats the lease attached to the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseBinding {
    /// Keep whatever lease the key currently has
    Keep,
    Attach(LeaseId),
    Detach,
}

impl LeaseBinding {
    /// `Attach` for a real lease id, `Detach` for 0
    pub fn from_lease(lease: LeaseId) -> Self {
        if lease > 0 {
            LeaseBinding::Attach(lease)
        } else {
            LeaseBinding::Detach
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        key: String,
        value: Bytes,
        lease: LeaseBinding,
    },
    Delete {
        key: String,
    },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>, lease: LeaseBinding) -> Self {
        WriteOp::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }
}

/// Expectation about a key's current state.
///
/// A missing key has revision 0 and lease 0; value comparisons against a
/// missing key never hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    ValueEquals { key: String, value: Bytes },
    ValueNotEquals { key: String, value: Bytes },
    ModRevisionEquals { key: String, revision: Revision },
    /// Key has version > 0
    Exists { key: String },
    LeaseEquals { key: String, lease: LeaseId },
}

/// Atomic compare-then-write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalWrite {
    pub conditions: Vec<Condition>,
    pub on_success: Vec<WriteOp>,
    pub on_failure: Vec<WriteOp>,
}

impl ConditionalWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, op: WriteOp) -> Self {
        self.on_success.push(op);
        self
    }

    pub fn otherwise(mut self, op: WriteOp) -> Self {
        self.on_failure.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    /// All conditions held and `on_success` was applied
    pub succeeded: bool,
    pub revision: Revision,
}

// =============================================================================
// Leases & Watches
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    /// Granted ttl in seconds; <= 0 never expires
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => write!(f, "put"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single change; delete events carry the key and the deletion revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// All events committed at one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub filter: KeyFilter,
    /// Deliver events with `mod_revision >= start_revision`; 0 means from now
    pub start_revision: Revision,
}

// =============================================================================
// Store Port
// =============================================================================

/// Coordination store contract used by every component
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<GetResponse>;

    async fn range(&self, request: RangeRequest) -> StoreResult<RangeResponse>;

    async fn put(&self, key: &str, value: Bytes, lease: LeaseBinding) -> StoreResult<Revision>;

    async fn delete(&self, key: &str) -> StoreResult<DeleteResponse>;

    /// Apply `on_success` if every condition holds, otherwise `on_failure`
    async fn txn(&self, write: ConditionalWrite) -> StoreResult<TxnResponse>;

    async fn grant(&self, ttl: i64) -> StoreResult<LeaseGrant>;

    /// Revoke a lease and delete every key attached to it
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Renew a lease once; returns the renewed ttl
    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<i64>;

    async fn watch(&self, request: WatchRequest) -> StoreResult<WatchSubscription>;
}

/// Shared store handle
pub type CoordinationStoreRef = Arc<dyn CoordinationStore>;
