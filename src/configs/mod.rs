//! Dynamic Configuration
//!
//! Named config values in the coordination store, versioned by the store
//! revision of their last write. Writers pass that version back for an
//! optimistic conditional put; every successful write is mirrored into the
//! relational ledger with an append-only history entry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{ConfigChange, ConfigHistoryEntry, ConfigInfo, ConfigItem, ConfigLedgerRef};
use crate::error::{Error, Result};
use crate::keyspace::{check_name, check_name_prefix, KeySpace};
use crate::metrics::{Operation, RegistryMetrics};
use crate::store::{
    Condition, ConditionalWrite, CoordinationStoreRef, EventKind, KeyFilter, KeyValue,
    LeaseBinding, RangeRequest, Revision, SortOrder, SortTarget, StoreStatus, WatchRequest,
    WriteOp,
};

/// Most items a single range read returns
pub const CONFIG_RANGE_LIMIT: usize = 20;

/// Config engine shared by every request handler
pub struct ConfigStore {
    store: CoordinationStoreRef,
    ledger: ConfigLedgerRef,
    keyspace: KeySpace,
    metrics: Arc<RegistryMetrics>,
}

impl ConfigStore {
    pub fn new(
        store: CoordinationStoreRef,
        ledger: ConfigLedgerRef,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        Self {
            store,
            ledger,
            keyspace: KeySpace::default(),
            metrics,
        }
    }

    pub fn with_keyspace(mut self, keyspace: KeySpace) -> Self {
        self.keyspace = keyspace;
        self
    }

    fn item(&self, name: &str, kv: &KeyValue) -> ConfigItem {
        ConfigItem {
            name: name.to_string(),
            value: String::from_utf8_lossy(&kv.value).into_owned(),
            version: kv.mod_revision,
        }
    }

    /// Read one config and remember which version the caller observed
    pub async fn get(&self, app_id: i64, node: &str, name: &str) -> Result<(ConfigItem, Revision)> {
        let result = self.get_inner(app_id, node, name).await;
        self.metrics.record(Operation::ConfigGet, &result);
        result
    }

    async fn get_inner(&self, app_id: i64, node: &str, name: &str) -> Result<(ConfigItem, Revision)> {
        check_name(name)?;
        let resp = self
            .store
            .get(&self.keyspace.config_key(name))
            .await
            .map_err(|e| Error::from_store(e, "get config fail"))?;
        let kv = resp.kv.ok_or_else(|| Error::NotFound(name.to_string()))?;
        let item = self.item(name, &kv);
        self.ledger
            .record_observed(app_id, node, name, item.version)
            .await?;
        Ok((item, resp.revision))
    }

    /// Write a config value.
    ///
    /// `version < 0` writes unconditionally; otherwise the write only lands
    /// if `version` is still the revision of the last write, and fails with
    /// `InvalidVersion` leaving the stored value untouched.
    pub async fn put(
        &self,
        tag: &str,
        name: &str,
        app_id: i64,
        remark: &str,
        value: &str,
        version: i64,
    ) -> Result<Revision> {
        let result = self.put_inner(tag, name, app_id, remark, value, version).await;
        self.metrics.record(Operation::ConfigPut, &result);
        result
    }

    async fn put_inner(
        &self,
        tag: &str,
        name: &str,
        app_id: i64,
        remark: &str,
        value: &str,
        version: i64,
    ) -> Result<Revision> {
        check_name(name)?;
        let key = self.keyspace.config_key(name);

        let revision = if version < 0 {
            self.store
                .put(&key, value.to_string().into(), LeaseBinding::Detach)
                .await
                .map_err(|e| Error::from_store(e, "put config fail"))?
        } else {
            let write = ConditionalWrite::new()
                .when(Condition::ModRevisionEquals {
                    key: key.clone(),
                    revision: version,
                })
                .then(WriteOp::put(key, value.to_string(), LeaseBinding::Detach));
            let resp = self
                .store
                .txn(write)
                .await
                .map_err(|e| Error::from_store(e, "put config fail"))?;
            if !resp.succeeded {
                return Err(Error::InvalidVersion(format!("{}@{}", name, version)));
            }
            resp.revision
        };

        self.ledger
            .record_put(&ConfigChange {
                tag: tag.to_string(),
                name: name.to_string(),
                app_id,
                remark: remark.to_string(),
                value: value.to_string(),
            })
            .await?;
        debug!(name, revision, "config written");
        Ok(revision)
    }

    /// Block until the config changes at or after `revision`.
    ///
    /// A put returns the new item, a delete fails with `Deleted`. When the
    /// requested revision was compacted away the current value is returned.
    pub async fn watch(
        &self,
        app_id: i64,
        node: &str,
        name: &str,
        revision: Revision,
        timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<(ConfigItem, Revision)> {
        let result = self
            .watch_inner(app_id, node, name, revision, timeout, cancel)
            .await;
        self.metrics.record(Operation::ConfigWatch, &result);
        result
    }

    async fn watch_inner(
        &self,
        app_id: i64,
        node: &str,
        name: &str,
        revision: Revision,
        timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<(ConfigItem, Revision)> {
        check_name(name)?;
        let key = self.keyspace.config_key(name);
        let mut subscription = self
            .store
            .watch(WatchRequest {
                filter: KeyFilter::Exact(key.clone()),
                start_revision: revision,
            })
            .await
            .map_err(|e| Error::from_store(e, "watch config fail"))?;

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(Error::Canceled("watch canceled".into())),
                    outcome = subscription.recv(timeout) => outcome,
                }
            }
            None => subscription.recv(timeout).await,
        };
        drop(subscription);

        let events = match outcome {
            Ok(events) => events,
            Err(err) if err.status == StoreStatus::Compacted => {
                warn!(%key, revision, "config revision compacted, call get instead");
                return self.get_inner(app_id, node, name).await;
            }
            Err(err) => return Err(Error::from_store(err, "watch config fail")),
        };

        match events.into_iter().next() {
            Some(event) if event.kind == EventKind::Put => {
                let item = self.item(name, &event.kv);
                self.ledger
                    .record_observed(app_id, node, name, item.version)
                    .await?;
                Ok((item, event.kv.mod_revision))
            }
            Some(_) => Err(Error::Deleted(name.to_string())),
            None => Err(Error::SystemError("unexpected event".into())),
        }
    }

    /// Configs with names in `[from, end)`, at most [`CONFIG_RANGE_LIMIT`],
    /// plus whether more matched. An empty `end` runs to the end of the
    /// namespace.
    pub async fn range(
        &self,
        from: &str,
        end: &str,
        sort: Option<(SortTarget, SortOrder)>,
    ) -> Result<(Vec<ConfigItem>, bool)> {
        let result = self.range_inner(from, end, sort).await;
        self.metrics.record(Operation::ConfigRange, &result);
        result
    }

    async fn range_inner(
        &self,
        from: &str,
        end: &str,
        sort: Option<(SortTarget, SortOrder)>,
    ) -> Result<(Vec<ConfigItem>, bool)> {
        check_name_prefix(from)?;
        check_name_prefix(end)?;
        let end_key = if end.is_empty() {
            self.keyspace.config_range_end()
        } else {
            self.keyspace.config_key(end)
        };

        let mut request = RangeRequest::between(self.keyspace.config_key(from), end_key)
            .with_limit(CONFIG_RANGE_LIMIT);
        if let Some((target, order)) = sort {
            request = request.with_sort(target, order);
        }
        let resp = self
            .store
            .range(request)
            .await
            .map_err(|e| Error::from_store(e, "range config fail"))?;

        let mut items = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            match self.keyspace.config_name(&kv.key) {
                Some(name) => items.push(self.item(name, kv)),
                None => warn!(key = %kv.key, from, end, "invalid key from config range"),
            }
        }
        Ok((items, resp.more))
    }

    /// Flag the ledger row deleted, then remove the key
    pub async fn delete(&self, name: &str) -> Result<()> {
        let result = self.delete_inner(name).await;
        self.metrics.record(Operation::ConfigDelete, &result);
        result
    }

    async fn delete_inner(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.ledger.mark_deleted(name).await?;
        self.store
            .delete(&self.keyspace.config_key(name))
            .await
            .map_err(|e| Error::from_store(e, "delete config fail"))?;
        info!(name, "config deleted");
        Ok(())
    }

    /// Active configs from the ledger, newest first, with the total count
    pub async fn list_db_configs(
        &self,
        tag: &str,
        prefix: &str,
        skip: i64,
        limit: i64,
    ) -> Result<(i64, Vec<ConfigInfo>)> {
        if skip < 0 || limit < 0 {
            return Err(Error::InvalidParam("negative skip or limit".into()));
        }
        self.ledger.list(tag, prefix, skip, limit).await
    }

    pub async fn history(&self, name: &str) -> Result<Vec<ConfigHistoryEntry>> {
        check_name(name)?;
        self.ledger.history(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConfigLedger;
    use crate::index::SqlIndex;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<SqlIndex>,
        configs: Arc<ConfigStore>,
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        let ledger = Arc::new(SqlIndex::in_memory().await.unwrap());
        let configs = Arc::new(ConfigStore::new(
            store.clone(),
            ledger.clone(),
            Arc::new(RegistryMetrics::new()),
        ));
        Harness {
            store,
            ledger,
            configs,
        }
    }

    #[tokio::test]
    async fn test_put_with_version_cas() {
        let h = harness().await;
        let r = h
            .configs
            .put("", "db.max_conns", 0, "init", "50", -1)
            .await
            .unwrap();
        let (item, _) = h.configs.get(0, "", "db.max_conns").await.unwrap();
        assert_eq!(item.version, r);

        let r2 = h
            .configs
            .put("", "db.max_conns", 0, "raise", "60", r)
            .await
            .unwrap();
        assert_eq!(r2, r + 1);

        assert_matches!(
            h.configs.put("", "db.max_conns", 0, "stale", "70", r).await,
            Err(Error::InvalidVersion(_))
        );
        let (item, _) = h.configs.get(0, "", "db.max_conns").await.unwrap();
        assert_eq!(item.value, "60");
        assert_eq!(item.version, r2);
        assert_eq!(h.store.revision(), r2);

        let history = h.configs.history("db.max_conns").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].remark, "raise");
    }

    #[tokio::test]
    async fn test_put_version_zero_creates_only() {
        let h = harness().await;
        h.configs.put("", "feature.flag", 0, "", "on", 0).await.unwrap();
        assert_matches!(
            h.configs.put("", "feature.flag", 0, "", "off", 0).await,
            Err(Error::InvalidVersion(_))
        );
    }

    #[tokio::test]
    async fn test_get_records_observed_version() {
        let h = harness().await;
        let r = h.configs.put("", "db.max_conns", 7, "", "50", -1).await.unwrap();
        h.configs.get(42, "node-a", "db.max_conns").await.unwrap();
        assert_eq!(
            h.ledger.observed_version(42, "node-a", "db.max_conns").await.unwrap(),
            Some(r)
        );

        h.configs.get(0, "node-a", "db.max_conns").await.unwrap();
        assert_eq!(
            h.ledger.observed_version(0, "node-a", "db.max_conns").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_get_validation_and_missing() {
        let h = harness().await;
        assert_matches!(h.configs.get(0, "", "db").await, Err(Error::InvalidName(_)));
        assert_matches!(
            h.configs.get(0, "", "db.missing").await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_watch_put_and_delete() {
        let h = harness().await;
        let r = h.configs.put("", "db.max_conns", 0, "", "50", -1).await.unwrap();

        let configs = h.configs.clone();
        let watcher = tokio::spawn(async move {
            configs
                .watch(0, "", "db.max_conns", r + 1, Duration::from_secs(10), None)
                .await
        });
        tokio::task::yield_now().await;
        h.configs.put("", "db.max_conns", 0, "", "60", r).await.unwrap();

        let (item, revision) = watcher.await.unwrap().unwrap();
        assert_eq!(item.value, "60");
        assert!(revision > r);

        h.configs.delete("db.max_conns").await.unwrap();
        assert_matches!(
            h.configs
                .watch(0, "", "db.max_conns", revision + 1, Duration::from_secs(1), None)
                .await,
            Err(Error::Deleted(_))
        );
    }

    #[tokio::test]
    async fn test_watch_timeout() {
        let h = harness().await;
        h.configs.put("", "db.max_conns", 0, "", "50", -1).await.unwrap();
        assert_matches!(
            h.configs
                .watch(0, "", "db.max_conns", 0, Duration::from_millis(100), None)
                .await,
            Err(Error::DeadlineExceeded(_))
        );
        assert_eq!(h.store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_compacted_falls_back_to_get() {
        let h = harness().await;
        h.configs.put("", "db.max_conns", 0, "", "50", -1).await.unwrap();
        let r = h.configs.put("", "db.max_conns", 0, "", "60", -1).await.unwrap();
        h.store.compact(r);

        let (item, _) = h
            .configs
            .watch(0, "", "db.max_conns", 1, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(item.value, "60");
        assert_eq!(item.version, r);
    }

    #[tokio::test]
    async fn test_range_limit_and_more() {
        let h = harness().await;
        for i in 0..25 {
            h.configs
                .put("", &format!("app.key{:02}", i), 0, "", "v", -1)
                .await
                .unwrap();
        }
        let (items, more) = h.configs.range("", "", None).await.unwrap();
        assert_eq!(items.len(), CONFIG_RANGE_LIMIT);
        assert!(more);
        assert_eq!(items[0].name, "app.key00");

        let (items, _) = h
            .configs
            .range("", "", Some((SortTarget::Key, SortOrder::Descend)))
            .await
            .unwrap();
        assert_eq!(items[0].name, "app.key24");

        let (items, more) = h.configs.range("b", "", None).await.unwrap();
        assert!(items.is_empty());
        assert!(!more);

        assert_matches!(h.configs.range("app.", "", None).await, Err(Error::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let h = harness().await;
        h.configs.put("db", "db.max_conns", 0, "", "50", -1).await.unwrap();
        h.configs.put("db", "db.timeout", 0, "", "5s", -1).await.unwrap();
        h.configs.put("", "feature.flag", 0, "", "on", -1).await.unwrap();

        let (total, items) = h.configs.list_db_configs("db", "", 0, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(items.len(), 2);

        h.configs.delete("db.timeout").await.unwrap();
        assert_matches!(
            h.configs.get(0, "", "db.timeout").await,
            Err(Error::NotFound(_))
        );
        let (total, items) = h.configs.list_db_configs("", "db.", 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].name, "db.max_conns");
        assert_eq!(items[0].tag.as_deref(), Some("db"));
    }

    struct OfflineLedger;

    #[async_trait::async_trait]
    impl ConfigLedger for OfflineLedger {
        async fn record_put(&self, _: &ConfigChange) -> Result<()> {
            Err(Error::SystemError("update db config fail".into()))
        }
        async fn mark_deleted(&self, _: &str) -> Result<()> {
            Err(Error::SystemError("delete config fail".into()))
        }
        async fn record_observed(&self, _: i64, _: &str, _: &str, _: i64) -> Result<()> {
            Err(Error::SystemError("change app config state fail".into()))
        }
        async fn observed_version(&self, _: i64, _: &str, _: &str) -> Result<Option<i64>> {
            Err(Error::SystemError("query app config state fail".into()))
        }
        async fn list(&self, _: &str, _: &str, _: i64, _: i64) -> Result<(i64, Vec<ConfigInfo>)> {
            Err(Error::SystemError("get configs fail".into()))
        }
        async fn history(&self, _: &str) -> Result<Vec<ConfigHistoryEntry>> {
            Err(Error::SystemError("get config histories fail".into()))
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_fails_put() {
        let configs = ConfigStore::new(
            MemoryStore::new(),
            Arc::new(OfflineLedger),
            Arc::new(RegistryMetrics::new()),
        );
        assert_matches!(
            configs.put("db", "db.max_conns", 0, "init", "50", -1).await,
            Err(Error::SystemError(_))
        );
    }
}
