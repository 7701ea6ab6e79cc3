//! In-Memory Coordination Store
//!
//! Single-process implementation of [`CoordinationStore`]. All state lives
//! behind one mutex so every call is linearizable; each mutating call commits
//! at most one revision. Expired leases are swept before every call and,
//! optionally, by a background reaper.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Condition, ConditionalWrite, CoordinationStore, DeleteResponse, EventBatch, EventKind,
    GetResponse, KeyFilter, KeyValue, LeaseBinding, LeaseGrant, LeaseId, RangeRequest,
    RangeResponse, Revision, SortOrder, SortTarget, StoreError, StoreResult, StoreStatus,
    TxnResponse, WatchEvent, WatchRequest, WatchSubscription, WriteOp,
};

// =============================================================================
// Memory Store Configuration
// =============================================================================

/// Configuration for the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Committed batches kept for revision-gated watches
    pub history_limit: usize,
    /// Live notification buffer per subscriber
    pub channel_capacity: usize,
    /// Background lease sweep period
    pub reap_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 4096,
            channel_capacity: 1024,
            reap_interval: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    create_revision: Revision,
    mod_revision: Revision,
    version: i64,
    lease: LeaseId,
}

#[derive(Debug)]
struct LeaseState {
    ttl: i64,
    deadline: Option<Instant>,
    keys: BTreeSet<String>,
}

struct State {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    revision: Revision,
    next_lease: LeaseId,
    history: VecDeque<Arc<EventBatch>>,
    /// Oldest revision a watch may still start from
    first_retained: Revision,
    history_limit: usize,
    /// Batches committed during the current call, published on unlock
    pending: Vec<Arc<EventBatch>>,
}

fn lease_not_found(lease: LeaseId) -> StoreError {
    StoreError::new(
        StoreStatus::NotFound,
        format!("requested lease not found: {}", lease),
    )
}

/// Expiry instant for a ttl; `None` for leases that never expire
fn lease_deadline(ttl: i64) -> StoreResult<Option<Instant>> {
    if ttl <= 0 {
        return Ok(None);
    }
    Instant::now()
        .checked_add(Duration::from_secs(ttl as u64))
        .map(Some)
        .ok_or_else(|| StoreError::new(StoreStatus::Other, format!("lease ttl out of range: {}", ttl)))
}

impl State {
    fn new(history_limit: usize) -> Self {
        Self {
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            revision: 1,
            next_lease: 1,
            history: VecDeque::new(),
            first_retained: 1,
            history_limit,
            pending: Vec::new(),
        }
    }

    fn kv(&self, key: &str) -> Option<KeyValue> {
        self.kvs.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            create_revision: e.create_revision,
            mod_revision: e.mod_revision,
            version: e.version,
            lease: e.lease,
        })
    }

    fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::ValueEquals { key, value } => {
                self.kvs.get(key).map_or(false, |e| e.value == *value)
            }
            Condition::ValueNotEquals { key, value } => {
                self.kvs.get(key).map_or(false, |e| e.value != *value)
            }
            Condition::ModRevisionEquals { key, revision } => {
                self.kvs.get(key).map_or(0, |e| e.mod_revision) == *revision
            }
            Condition::Exists { key } => self.kvs.contains_key(key),
            Condition::LeaseEquals { key, lease } => {
                self.kvs.get(key).map_or(0, |e| e.lease) == *lease
            }
        }
    }

    /// Apply ops at the next revision. Nothing is mutated if any op names
    /// an unknown lease.
    fn apply(&mut self, ops: &[WriteOp]) -> StoreResult<()> {
        for op in ops {
            if let WriteOp::Put {
                lease: LeaseBinding::Attach(lease),
                ..
            } = op
            {
                if !self.leases.contains_key(lease) {
                    return Err(lease_not_found(*lease));
                }
            }
        }

        let revision = self.revision + 1;
        let mut events = Vec::new();
        for op in ops {
            match op {
                WriteOp::Put { key, value, lease } => {
                    events.push(self.put_entry(key, value.clone(), *lease, revision));
                }
                WriteOp::Delete { key } => {
                    if let Some(event) = self.delete_entry(key, revision) {
                        events.push(event);
                    }
                }
            }
        }
        self.commit(revision, events);
        Ok(())
    }

    fn put_entry(
        &mut self,
        key: &str,
        value: Bytes,
        binding: LeaseBinding,
        revision: Revision,
    ) -> WatchEvent {
        let previous = self.kvs.get(key).cloned();
        let old_lease = previous.as_ref().map_or(0, |e| e.lease);
        let lease = match binding {
            LeaseBinding::Keep => old_lease,
            LeaseBinding::Attach(id) => id,
            LeaseBinding::Detach => 0,
        };
        if old_lease != lease {
            if let Some(state) = self.leases.get_mut(&old_lease) {
                state.keys.remove(key);
            }
        }
        if let Some(state) = self.leases.get_mut(&lease) {
            state.keys.insert(key.to_string());
        }

        let entry = Entry {
            value,
            create_revision: previous.as_ref().map_or(revision, |e| e.create_revision),
            mod_revision: revision,
            version: previous.as_ref().map_or(1, |e| e.version + 1),
            lease,
        };
        self.kvs.insert(key.to_string(), entry);
        WatchEvent {
            kind: EventKind::Put,
            kv: self.kv(key).unwrap_or_else(|| tombstone(key, revision)),
        }
    }

    fn delete_entry(&mut self, key: &str, revision: Revision) -> Option<WatchEvent> {
        let entry = self.kvs.remove(key)?;
        if let Some(state) = self.leases.get_mut(&entry.lease) {
            state.keys.remove(key);
        }
        Some(WatchEvent {
            kind: EventKind::Delete,
            kv: tombstone(key, revision),
        })
    }

    fn commit(&mut self, revision: Revision, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision = revision;
        let batch = Arc::new(EventBatch { revision, events });
        self.history.push_back(batch.clone());
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.first_retained = dropped.revision + 1;
            }
        }
        self.pending.push(batch);
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        if let Some(state) = self.leases.remove(&lease) {
            let revision = self.revision + 1;
            let events = state
                .keys
                .iter()
                .filter_map(|key| self.delete_entry(key, revision))
                .collect();
            self.commit(revision, events);
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let mut expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline.map_or(false, |d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for lease in expired {
            debug!(lease, "lease expired");
            self.drop_lease(lease);
        }
    }

    fn range(&self, request: &RangeRequest) -> RangeResponse {
        let mut kvs: Vec<KeyValue> = match request.end.as_deref() {
            None => self.kv(&request.key).into_iter().collect(),
            Some(end) => {
                let upper = if end == "\0" {
                    Bound::Unbounded
                } else if end <= request.key.as_str() {
                    return RangeResponse {
                        kvs: Vec::new(),
                        more: false,
                        revision: self.revision,
                    };
                } else {
                    Bound::Excluded(end.to_string())
                };
                self.kvs
                    .range((Bound::Included(request.key.clone()), upper))
                    .filter_map(|(k, _)| self.kv(k))
                    .collect()
            }
        };

        if let Some((target, order)) = request.sort {
            kvs.sort_by(|a, b| {
                let ordering = match target {
                    SortTarget::Key => a.key.cmp(&b.key),
                    SortTarget::Version => a.version.cmp(&b.version),
                    SortTarget::CreateRevision => a.create_revision.cmp(&b.create_revision),
                    SortTarget::ModRevision => a.mod_revision.cmp(&b.mod_revision),
                    SortTarget::Value => a.value.cmp(&b.value),
                };
                match order {
                    SortOrder::Ascend => ordering,
                    SortOrder::Descend => ordering.reverse(),
                }
            });
        }

        let more = request.limit > 0 && kvs.len() > request.limit;
        if more {
            kvs.truncate(request.limit);
        }
        if request.keys_only {
            for kv in kvs.iter_mut() {
                kv.value = Bytes::new();
            }
        }
        RangeResponse {
            kvs,
            more,
            revision: self.revision,
        }
    }
}

fn tombstone(key: &str, revision: Revision) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Bytes::new(),
        create_revision: 0,
        mod_revision: revision,
        version: 0,
        lease: 0,
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory coordination store
pub struct MemoryStore {
    config: MemoryStoreConfig,
    state: Mutex<State>,
    events: broadcast::Sender<Arc<EventBatch>>,
    shutdown: CancellationToken,
}

impl MemoryStore {
    /// Create a store with default config
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with full config
    pub fn with_config(config: MemoryStoreConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.channel_capacity.max(1));
        Arc::new(Self {
            state: Mutex::new(State::new(config.history_limit.max(1))),
            config,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run `f` against swept state, then publish whatever it committed.
    ///
    /// Publishing happens under the lock so subscribers registered by
    /// `watch` never miss or duplicate a batch.
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> StoreResult<R>) -> StoreResult<R> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        let result = f(&mut state);
        for batch in state.pending.drain(..) {
            let _ = self.events.send(batch);
        }
        result
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.state.lock().kvs.len()
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Number of open watch subscriptions
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Sweep expired leases now
    pub fn reap(&self) {
        let _ = self.with_state(|_| Ok(()));
    }

    /// Discard history before `revision`; older watches fail as compacted
    pub fn compact(&self, revision: Revision) {
        let mut state = self.state.lock();
        while state
            .history
            .front()
            .map_or(false, |b| b.revision < revision)
        {
            state.history.pop_front();
        }
        state.first_retained = state.first_retained.max(revision);
    }

    /// Spawn the background lease sweeper; it stops on [`MemoryStore::shutdown`]
    /// or once the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match store.upgrade() {
                        Some(store) => store.reap(),
                        None => break,
                    },
                }
            }
            info!("lease reaper stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<GetResponse> {
        self.with_state(|state| {
            Ok(GetResponse {
                kv: state.kv(key),
                revision: state.revision,
            })
        })
    }

    async fn range(&self, request: RangeRequest) -> StoreResult<RangeResponse> {
        self.with_state(|state| Ok(state.range(&request)))
    }

    async fn put(&self, key: &str, value: Bytes, lease: LeaseBinding) -> StoreResult<Revision> {
        self.with_state(|state| {
            state.apply(&[WriteOp::Put {
                key: key.to_string(),
                value,
                lease,
            }])?;
            Ok(state.revision)
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<DeleteResponse> {
        self.with_state(|state| {
            let existed = state.kvs.contains_key(key);
            state.apply(&[WriteOp::delete(key)])?;
            Ok(DeleteResponse {
                deleted: u64::from(existed),
                revision: state.revision,
            })
        })
    }

    async fn txn(&self, write: ConditionalWrite) -> StoreResult<TxnResponse> {
        self.with_state(|state| {
            let succeeded = write.conditions.iter().all(|c| state.holds(c));
            let ops = if succeeded {
                &write.on_success
            } else {
                &write.on_failure
            };
            state.apply(ops)?;
            Ok(TxnResponse {
                succeeded,
                revision: state.revision,
            })
        })
    }

    async fn grant(&self, ttl: i64) -> StoreResult<LeaseGrant> {
        self.with_state(|state| {
            let deadline = lease_deadline(ttl)?;
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                LeaseState {
                    ttl,
                    deadline,
                    keys: BTreeSet::new(),
                },
            );
            debug!(lease = id, ttl, "lease granted");
            Ok(LeaseGrant { id, ttl })
        })
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.with_state(|state| {
            if !state.leases.contains_key(&lease) {
                return Err(lease_not_found(lease));
            }
            state.drop_lease(lease);
            Ok(())
        })
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<i64> {
        self.with_state(|state| {
            let entry = state
                .leases
                .get_mut(&lease)
                .ok_or_else(|| lease_not_found(lease))?;
            entry.deadline = lease_deadline(entry.ttl)?;
            Ok(entry.ttl)
        })
    }

    async fn watch(&self, request: WatchRequest) -> StoreResult<WatchSubscription> {
        self.with_state(|state| {
            let receiver = self.events.subscribe();
            let filter: KeyFilter = request.filter;
            if request.start_revision <= 0 {
                return Ok(WatchSubscription::new(
                    filter,
                    state.revision + 1,
                    Vec::new(),
                    receiver,
                ));
            }
            if request.start_revision < state.first_retained {
                return Ok(WatchSubscription::compacted(
                    filter,
                    request.start_revision,
                    receiver,
                ));
            }
            let backlog = state
                .history
                .iter()
                .filter(|b| b.revision >= request.start_revision)
                .flat_map(|b| b.events.iter())
                .filter(|e| filter.matches(&e.kv.key))
                .cloned()
                .collect();
            Ok(WatchSubscription::new(
                filter,
                request.start_revision,
                backlog,
                receiver,
            ))
        })
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[tokio::test]
    async fn test_put_get_revisions() {
        let store = MemoryStore::new();
        let r1 = store.put("/a", value("1"), LeaseBinding::Detach).await.unwrap();
        let r2 = store.put("/a", value("2"), LeaseBinding::Keep).await.unwrap();
        assert!(r2 > r1);

        let kv = store.get("/a").await.unwrap().kv.unwrap();
        assert_eq!(kv.value_str(), Some("2"));
        assert_eq!(kv.create_revision, r1);
        assert_eq!(kv.mod_revision, r2);
        assert_eq!(kv.version, 2);
    }

    #[test]
    fn test_missing_key_reads_empty() {
        let store = MemoryStore::new();
        let resp = tokio_test::block_on(store.get("/missing")).unwrap();
        assert!(resp.kv.is_none());
        assert_eq!(resp.revision, 1);

        let deleted = tokio_test::block_on(store.delete("/missing")).unwrap();
        assert_eq!(deleted.deleted, 0);
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn test_range_prefix_limit_sort() {
        let store = MemoryStore::new();
        for key in ["/c/1", "/c/2", "/c/3", "/d/1"] {
            store.put(key, value(key), LeaseBinding::Detach).await.unwrap();
        }
        let resp = store.range(RangeRequest::prefix("/c/")).await.unwrap();
        assert_eq!(resp.kvs.len(), 3);
        assert!(!resp.more);

        let resp = store
            .range(
                RangeRequest::prefix("/c/")
                    .with_limit(2)
                    .with_sort(SortTarget::Key, SortOrder::Descend)
                    .keys_only(),
            )
            .await
            .unwrap();
        assert!(resp.more);
        assert_eq!(resp.kvs[0].key, "/c/3");
        assert!(resp.kvs[0].value.is_empty());

        let resp = store
            .range(RangeRequest::between("/z", "/a"))
            .await
            .unwrap();
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_txn_conditions() {
        let store = MemoryStore::new();
        let create = ConditionalWrite::new()
            .when(Condition::ModRevisionEquals {
                key: "/k".into(),
                revision: 0,
            })
            .then(WriteOp::put("/k", "v1", LeaseBinding::Detach));
        assert!(store.txn(create.clone()).await.unwrap().succeeded);
        assert!(!store.txn(create).await.unwrap().succeeded);

        let before = store.revision();
        let noop = ConditionalWrite::new()
            .when(Condition::ValueEquals {
                key: "/k".into(),
                value: value("v1"),
            })
            .otherwise(WriteOp::put("/k", "v2", LeaseBinding::Detach));
        let resp = store.txn(noop).await.unwrap();
        assert!(resp.succeeded);
        assert_eq!(resp.revision, before);

        let missing = ConditionalWrite::new().when(Condition::ValueNotEquals {
            key: "/missing".into(),
            value: value("x"),
        });
        assert!(!store.txn(missing).await.unwrap().succeeded);
    }

    #[tokio::test]
    async fn test_txn_unknown_lease_has_no_effect() {
        let store = MemoryStore::new();
        let write = ConditionalWrite::new()
            .then(WriteOp::put("/a", "1", LeaseBinding::Detach))
            .then(WriteOp::put("/b", "1", LeaseBinding::Attach(99)));
        let err = store.txn(write).await.unwrap_err();
        assert_eq!(err.status, StoreStatus::NotFound);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_revoke_cascades() {
        let store = MemoryStore::new();
        let lease = store.grant(30).await.unwrap();
        store.put("/n/1", value("a"), LeaseBinding::Attach(lease.id)).await.unwrap();
        store.put("/n/2", value("b"), LeaseBinding::Attach(lease.id)).await.unwrap();
        store.put("/n/3", value("c"), LeaseBinding::Detach).await.unwrap();

        store.revoke(lease.id).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert_eq!(
            store.revoke(lease.id).await.unwrap_err().status,
            StoreStatus::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_and_keepalive() {
        let store = MemoryStore::new();
        let lease = store.grant(10).await.unwrap();
        store.put("/n/1", value("a"), LeaseBinding::Attach(lease.id)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.keep_alive_once(lease.id).await.unwrap(), 10);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("/n/1").await.unwrap().kv.is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("/n/1").await.unwrap().kv.is_none());
        assert_eq!(
            store.keep_alive_once(lease.id).await.unwrap_err().status,
            StoreStatus::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_lease_never_expires() {
        let store = MemoryStore::new();
        let lease = store.grant(0).await.unwrap();
        store.put("/n/1", value("a"), LeaseBinding::Attach(lease.id)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(store.get("/n/1").await.unwrap().kv.is_some());
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_rejected() {
        let store = MemoryStore::new();
        let err = store.grant(i64::MAX).await.unwrap_err();
        assert_eq!(err.status, StoreStatus::Other);
        assert_eq!(store.lease_count(), 0);

        let lease = store.grant(10).await.unwrap();
        assert_eq!(store.keep_alive_once(lease.id).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_watch_from_revision_replays_history() {
        let store = MemoryStore::new();
        let r1 = store.put("/w/a", value("1"), LeaseBinding::Detach).await.unwrap();
        store.put("/x/a", value("1"), LeaseBinding::Detach).await.unwrap();
        store.put("/w/b", value("1"), LeaseBinding::Detach).await.unwrap();

        let mut sub = store
            .watch(WatchRequest {
                filter: KeyFilter::Prefix("/w/".into()),
                start_revision: r1,
            })
            .await
            .unwrap();
        let events = sub.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kv.mod_revision >= r1));
    }

    #[tokio::test]
    async fn test_watch_live_and_release() {
        let store = MemoryStore::new();
        let mut sub = store
            .watch(WatchRequest {
                filter: KeyFilter::Exact("/w".into()),
                start_revision: 0,
            })
            .await
            .unwrap();
        assert_eq!(store.watcher_count(), 1);

        let writer = store.clone();
        tokio::spawn(async move {
            writer.put("/w", Bytes::from_static(b"x"), LeaseBinding::Detach).await.unwrap();
        });
        let events = sub.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(events[0].kind, EventKind::Put);

        drop(sub);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_compacted() {
        let store = MemoryStore::new();
        store.put("/w", value("1"), LeaseBinding::Detach).await.unwrap();
        let r = store.put("/w", value("2"), LeaseBinding::Detach).await.unwrap();
        store.compact(r);

        let mut sub = store
            .watch(WatchRequest {
                filter: KeyFilter::Exact("/w".into()),
                start_revision: 1,
            })
            .await
            .unwrap();
        let err = sub.recv(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.status, StoreStatus::Compacted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_without_calls() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            reap_interval: Duration::from_millis(500),
            ..Default::default()
        });
        let handle = store.spawn_reaper();
        let lease = store.grant(10).await.unwrap();
        store.put("/n", value("a"), LeaseBinding::Attach(lease.id)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.lease_count(), 0);

        store.shutdown();
        handle.await.unwrap();
    }
}
