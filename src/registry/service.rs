//! Service Registry Core
//!
//! Orchestrates endpoint registration and discovery on top of the
//! coordination store. Every shared mutation goes through a conditional
//! write; the search index is written through on each successful plug.
//!
//! ```text
//!  producer ── plug ──► validate ──► lease ──► ensure desc ──► index(pending)
//!                                                  │
//!                                                  ▼
//!                                   node txn (value+lease equal? no-op : put)
//!                                                  │
//!                                                  ▼
//!                                            index(verified)
//!
//!  consumer ── query/watch ──► prefix scan ──► route by zone ──► resolve addr
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lease::{check_ttl, LeaseManager};
use super::resolver::EndpointResolver;
use crate::domain::{
    SearchIndexRef, SearchPage, ServiceDescriptor, ServiceEndpoint, ServiceSnapshot, ServiceZone,
    ServiceZones,
};
use crate::error::{Error, Result};
use crate::keyspace::{
    check_service, check_service_zone, check_zone, AddressPolicy, KeySpace, KeySuffix,
    DEFAULT_ZONE,
};
use crate::metrics::{Operation, RegistryMetrics};
use crate::store::{
    Condition, ConditionalWrite, CoordinationStoreRef, KeyFilter, LeaseBinding, LeaseGrant,
    LeaseId, RangeRequest, Revision, StoreStatus, WatchRequest, WriteOp,
};

/// Retries for conditional writes that lose a race with a concurrent delete
pub const MAX_CAS_ATTEMPTS: usize = 5;

fn zone_or_default(zone: &str) -> &str {
    if zone.is_empty() {
        DEFAULT_ZONE
    } else {
        zone
    }
}

/// Registry engine shared by every request handler
pub struct ServiceRegistry {
    store: CoordinationStoreRef,
    index: SearchIndexRef,
    keyspace: KeySpace,
    policy: AddressPolicy,
    resolver: EndpointResolver,
    leases: LeaseManager,
    metrics: Arc<RegistryMetrics>,
}

impl ServiceRegistry {
    pub fn new(
        store: CoordinationStoreRef,
        index: SearchIndexRef,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        let leases = LeaseManager::new(store.clone(), metrics.clone());
        Self {
            store,
            index,
            keyspace: KeySpace::default(),
            policy: AddressPolicy::default(),
            resolver: EndpointResolver::default(),
            leases,
            metrics,
        }
    }

    pub fn with_keyspace(mut self, keyspace: KeySpace) -> Self {
        self.keyspace = keyspace;
        self
    }

    pub fn with_address_policy(mut self, policy: AddressPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register one endpoint of one service zone
    pub async fn plug(
        &self,
        descriptor: ServiceDescriptor,
        endpoint: ServiceEndpoint,
        ttl: i64,
        lease: LeaseId,
    ) -> Result<LeaseGrant> {
        self.plug_all(vec![descriptor], endpoint, ttl, lease).await
    }

    /// Register one endpoint under several service zones, sharing one lease.
    ///
    /// With `ttl > 0` and no lease, a lease is granted and released again if
    /// any later step fails. Repeating an identical call is a no-op for the
    /// store, so it doubles as a content refresh.
    pub async fn plug_all(
        &self,
        descriptors: Vec<ServiceDescriptor>,
        endpoint: ServiceEndpoint,
        ttl: i64,
        lease: LeaseId,
    ) -> Result<LeaseGrant> {
        let result = self.plug_all_inner(descriptors, endpoint, ttl, lease).await;
        self.metrics.record(Operation::Plug, &result);
        result
    }

    async fn plug_all_inner(
        &self,
        descriptors: Vec<ServiceDescriptor>,
        endpoint: ServiceEndpoint,
        ttl: i64,
        lease: LeaseId,
    ) -> Result<LeaseGrant> {
        self.policy.check(&endpoint.address)?;
        if descriptors.is_empty() {
            return Err(Error::MissingParam("desc".into()));
        }
        check_ttl(ttl)?;
        let descriptors = descriptors
            .into_iter()
            .map(prepare_descriptor)
            .collect::<Result<Vec<_>>>()?;
        let value = endpoint.to_json()?;

        // A reused lease is renewed and reports its own ttl
        let (grant, fresh) = if lease != 0 {
            let remaining = self.leases.keep_alive_once(lease).await?;
            (LeaseGrant { id: lease, ttl: remaining }, false)
        } else if ttl > 0 {
            (self.leases.grant(ttl).await?, true)
        } else {
            (LeaseGrant { id: 0, ttl }, false)
        };
        let lease = grant.id;

        match self.write_registration(&descriptors, &endpoint.address, &value, lease).await {
            Ok(()) => {
                debug!(
                    address = %endpoint.address,
                    services = descriptors.len(),
                    lease,
                    "endpoint plugged"
                );
                Ok(grant)
            }
            Err(err) => {
                if fresh {
                    self.leases.release(lease).await;
                }
                Err(err)
            }
        }
    }

    async fn write_registration(
        &self,
        descriptors: &[ServiceDescriptor],
        address: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<()> {
        for desc in descriptors {
            self.ensure_descriptor(desc).await?;
        }
        self.index.upsert_pending(descriptors).await?;

        for desc in descriptors {
            let key = self.keyspace.node_key(&desc.service, &desc.zone, address);
            let write = ConditionalWrite::new()
                .when(Condition::ValueEquals {
                    key: key.clone(),
                    value: value.to_string().into(),
                })
                .when(Condition::LeaseEquals {
                    key: key.clone(),
                    lease,
                })
                .otherwise(WriteOp::put(
                    key,
                    value.to_string(),
                    LeaseBinding::from_lease(lease),
                ));
            self.store
                .txn(write)
                .await
                .map_err(|e| Error::from_store(e, "plug service fail"))?;
        }

        self.index.mark_verified(descriptors).await
    }

    /// Create the descriptor if absent, otherwise require identical content
    async fn ensure_descriptor(&self, desc: &ServiceDescriptor) -> Result<()> {
        let key = self.keyspace.descriptor_key(&desc.service, &desc.zone);
        let value = desc.to_json()?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let create = ConditionalWrite::new()
                .when(Condition::ModRevisionEquals {
                    key: key.clone(),
                    revision: 0,
                })
                .then(WriteOp::put(key.clone(), value.clone(), LeaseBinding::Detach));
            let resp = self
                .store
                .txn(create)
                .await
                .map_err(|e| Error::from_store(e, "plug service fail"))?;
            if resp.succeeded {
                info!(service = %desc.service, zone = %desc.zone, "service descriptor created");
                return Ok(());
            }

            let current = self
                .store
                .get(&key)
                .await
                .map_err(|e| Error::from_store(e, "plug service fail"))?;
            let Some(kv) = current.kv else {
                continue;
            };
            let stored: ServiceDescriptor = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::from_json(e, "damaged service descriptor"))?;
            if stored.compute_hash() == desc.content_hash {
                return Ok(());
            }
            return Err(Error::ChangedServiceDesc(format!(
                "{}/{} differs from the registered descriptor",
                desc.service, desc.zone
            )));
        }
        Err(Error::TooManyAttempts(format!(
            "ensure descriptor {}/{}",
            desc.service, desc.zone
        )))
    }

    /// Remove one endpoint; an absent endpoint is not an error
    pub async fn unplug(&self, service: &str, zone: &str, address: &str) -> Result<()> {
        let result = self.unplug_inner(service, zone_or_default(zone), address).await;
        self.metrics.record(Operation::Unplug, &result);
        result
    }

    async fn unplug_inner(&self, service: &str, zone: &str, address: &str) -> Result<()> {
        check_service_zone(service, zone)?;
        self.policy.check(address)?;

        let key = self.keyspace.node_key(service, zone, address);
        let resp = self
            .store
            .delete(&key)
            .await
            .map_err(|e| Error::from_store(e, "delete key fail"))?;
        if resp.deleted == 0 {
            debug!(%key, "unplug of absent endpoint");
            return Ok(());
        }

        let remaining = self
            .store
            .range(
                RangeRequest::prefix(self.keyspace.node_scan_prefix(service, zone))
                    .with_limit(1)
                    .keys_only(),
            )
            .await
            .map_err(|e| Error::from_store(e, "query fail"))?;
        if remaining.kvs.is_empty() {
            self.index.soft_delete(service, Some(zone)).await?;
            debug!(service, zone, "last endpoint unplugged");
        }
        Ok(())
    }

    /// Rewrite an existing endpoint's value; never creates one
    pub async fn update(
        &self,
        service: &str,
        zone: &str,
        address: &str,
        endpoint: ServiceEndpoint,
    ) -> Result<Revision> {
        let result = self
            .update_inner(service, zone_or_default(zone), address, endpoint)
            .await;
        self.metrics.record(Operation::Update, &result);
        result
    }

    async fn update_inner(
        &self,
        service: &str,
        zone: &str,
        address: &str,
        mut endpoint: ServiceEndpoint,
    ) -> Result<Revision> {
        check_service_zone(service, zone)?;
        self.policy.check(address)?;
        if endpoint.address.is_empty() {
            endpoint.address = address.to_string();
        } else if endpoint.address != address {
            return Err(Error::InvalidParam("can't modify address".into()));
        }
        let value = endpoint.to_json()?;

        let key = self.keyspace.node_key(service, zone, address);
        let write = ConditionalWrite::new()
            .when(Condition::Exists { key: key.clone() })
            .then(WriteOp::put(key.clone(), value, LeaseBinding::Keep));
        let resp = self
            .store
            .txn(write)
            .await
            .map_err(|e| Error::from_store(e, "update service fail"))?;
        if !resp.succeeded {
            return Err(Error::NotFound(format!("no such endpoint: {}", address)));
        }
        Ok(resp.revision)
    }

    pub async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        let result = self.leases.keep_alive_once(lease).await;
        self.metrics.record(Operation::KeepAlive, &result);
        result
    }

    /// Delete the descriptors of a service, or of one zone, once no
    /// endpoint is plugged on them
    pub async fn delete_service(&self, service: &str, zone: Option<&str>) -> Result<()> {
        let result = self.delete_service_inner(service, zone).await;
        self.metrics.record(Operation::DeleteService, &result);
        result
    }

    async fn delete_service_inner(&self, service: &str, zone: Option<&str>) -> Result<()> {
        check_service(service)?;
        if let Some(zone) = zone {
            check_zone(zone)?;
        }
        let prefix = match zone {
            Some(zone) => self.keyspace.zone_scan_prefix(service, zone),
            None => self.keyspace.service_scan_prefix(service),
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let resp = self
                .store
                .range(RangeRequest::prefix(prefix.clone()))
                .await
                .map_err(|e| Error::from_store(e, "get service keys fail"))?;

            let mut write = ConditionalWrite::new();
            for kv in &resp.kvs {
                match self.keyspace.decode(&kv.key).map(|k| k.suffix) {
                    Some(KeySuffix::Descriptor) => {
                        write = write
                            .when(Condition::ModRevisionEquals {
                                key: kv.key.clone(),
                                revision: kv.mod_revision,
                            })
                            .then(WriteOp::delete(kv.key.clone()));
                    }
                    _ => return Err(Error::InvalidParam("has endpoints plugged on".into())),
                }
            }
            if write.on_success.is_empty() {
                debug!(service, zone = zone.unwrap_or("*"), "no descriptors in store");
                self.index.soft_delete(service, zone).await?;
                return Ok(());
            }
            let txn = self
                .store
                .txn(write)
                .await
                .map_err(|e| Error::from_store(e, "delete service keys fail"))?;
            if txn.succeeded {
                info!(service, zone = zone.unwrap_or("*"), "service descriptors deleted");
                self.index.soft_delete(service, zone).await?;
                return Ok(());
            }
        }
        Err(Error::TooManyAttempts(format!("delete service {}", service)))
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Current endpoints of a service, grouped by zone, with the read revision
    pub async fn query(
        &self,
        service: &str,
        zone: Option<&str>,
        client: Option<IpAddr>,
    ) -> Result<(ServiceSnapshot, Revision)> {
        let result = self.snapshot(service, zone, client).await;
        self.metrics.record(Operation::Query, &result);
        result
    }

    async fn snapshot(
        &self,
        service: &str,
        zone: Option<&str>,
        client: Option<IpAddr>,
    ) -> Result<(ServiceSnapshot, Revision)> {
        let prefix = self.scan_prefix(service, zone)?;
        let resp = self
            .store
            .range(RangeRequest::prefix(prefix))
            .await
            .map_err(|e| Error::from_store(e, "query fail"))?;
        if resp.kvs.is_empty() {
            return Err(Error::NotFound(format!("no such service: {}", service)));
        }

        let mut zones: BTreeMap<String, ServiceZone> = BTreeMap::new();
        let mut descriptors: HashMap<String, ServiceDescriptor> = HashMap::new();
        for kv in &resp.kvs {
            let Some(key) = self.keyspace.decode(&kv.key).filter(|k| k.service == service) else {
                warn!(key = %kv.key, "got unexpected service key");
                continue;
            };
            match key.suffix {
                KeySuffix::Descriptor => {
                    let desc: ServiceDescriptor = serde_json::from_slice(&kv.value)
                        .map_err(|e| Error::from_json(e, "damaged service descriptor"))?;
                    descriptors.insert(key.zone, desc);
                }
                KeySuffix::Node(_) => {
                    let endpoint = self.resolver.resolve(kv, client)?;
                    zones.entry(key.zone).or_default().endpoints.push(endpoint);
                }
            }
        }

        for (zone, entry) in zones.iter_mut() {
            entry.descriptor = descriptors.remove(zone).unwrap_or_else(|| ServiceDescriptor {
                service: service.to_string(),
                zone: zone.clone(),
                ..Default::default()
            });
        }
        Ok((
            ServiceSnapshot {
                service: service.to_string(),
                zones,
            },
            resp.revision,
        ))
    }

    /// Zones holding any key of the service
    pub async fn query_zones(&self, service: &str) -> Result<(ServiceZones, Revision)> {
        let result = self.query_zones_inner(service).await;
        self.metrics.record(Operation::Query, &result);
        result
    }

    async fn query_zones_inner(&self, service: &str) -> Result<(ServiceZones, Revision)> {
        let prefix = self.scan_prefix(service, None)?;
        let resp = self
            .store
            .range(RangeRequest::prefix(prefix).keys_only())
            .await
            .map_err(|e| Error::from_store(e, "query fail"))?;
        if resp.kvs.is_empty() {
            return Err(Error::NotFound(format!("no such service: {}", service)));
        }
        let zones: BTreeSet<String> = resp
            .kvs
            .iter()
            .filter_map(|kv| self.keyspace.decode(&kv.key))
            .filter(|k| k.service == service)
            .map(|k| k.zone)
            .collect();
        Ok((
            ServiceZones {
                service: service.to_string(),
                zones: zones.into_iter().collect(),
            },
            resp.revision,
        ))
    }

    /// Block until the service changes at or after `revision`, then return a
    /// fresh snapshot.
    ///
    /// `revision <= 0` waits for the next change. Several writes may be
    /// folded into one snapshot. The subscription is dropped on every exit
    /// path.
    pub async fn watch(
        &self,
        service: &str,
        zone: Option<&str>,
        revision: Revision,
        timeout: Duration,
        client: Option<IpAddr>,
        cancel: Option<CancellationToken>,
    ) -> Result<(ServiceSnapshot, Revision)> {
        let result = self
            .watch_inner(service, zone, revision, timeout, client, cancel)
            .await;
        self.metrics.record(Operation::Watch, &result);
        result
    }

    async fn watch_inner(
        &self,
        service: &str,
        zone: Option<&str>,
        revision: Revision,
        timeout: Duration,
        client: Option<IpAddr>,
        cancel: Option<CancellationToken>,
    ) -> Result<(ServiceSnapshot, Revision)> {
        let prefix = self.scan_prefix(service, zone)?;
        let mut subscription = self
            .store
            .watch(WatchRequest {
                filter: KeyFilter::Prefix(prefix),
                start_revision: revision,
            })
            .await
            .map_err(|e| Error::from_store(e, "watch fail"))?;

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

        match outcome {
            Ok(events) => {
                debug!(service, events = events.len(), "watch fired");
            }
            Err(err) if err.status == StoreStatus::Compacted => {
                warn!(service, revision, "watch revision compacted, falling back to query");
            }
            Err(err) => return Err(Error::from_store(err, "watch fail")),
        }

        match self.snapshot(service, zone, client).await {
            Err(Error::NotFound(_)) => Err(Error::Deleted(format!("service {} deleted", service))),
            other => other,
        }
    }

    /// Substring search over registered services
    pub async fn search_service(&self, query: &str, skip: i64, limit: i64) -> Result<SearchPage> {
        let result = self.index.search(query, skip, limit).await;
        self.metrics.record(Operation::Search, &result);
        result
    }

    fn scan_prefix(&self, service: &str, zone: Option<&str>) -> Result<String> {
        check_service(service)?;
        match zone {
            Some(zone) => {
                check_zone(zone)?;
                Ok(self.keyspace.zone_scan_prefix(service, zone))
            }
            None => Ok(self.keyspace.service_scan_prefix(service)),
        }
    }
}

/// Fill the default zone, validate and hash one descriptor
fn prepare_descriptor(mut desc: ServiceDescriptor) -> Result<ServiceDescriptor> {
    if desc.zone.is_empty() {
        desc.zone = DEFAULT_ZONE.to_string();
    }
    check_service_zone(&desc.service, &desc.zone)?;
    if desc.typ.is_empty() {
        return Err(Error::InvalidEndpoint(format!(
            "{}:{} missing type",
            desc.service, desc.zone
        )));
    }
    Ok(desc.hashed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SearchIndex;
    use crate::index::SqlIndex;
    use crate::registry::resolver::NetMappingRule;
    use crate::store::{CoordinationStore, MemoryStore};
    use assert_matches::assert_matches;

    const SERVICE: &str = "orderSvc:1.0";

    struct Harness {
        store: Arc<MemoryStore>,
        index: Arc<SqlIndex>,
        metrics: Arc<RegistryMetrics>,
        registry: Arc<ServiceRegistry>,
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        let index = Arc::new(SqlIndex::in_memory().await.unwrap());
        let metrics = Arc::new(RegistryMetrics::new());
        let registry = Arc::new(ServiceRegistry::new(store.clone(), index.clone(), metrics.clone()));
        Harness {
            store,
            index,
            metrics,
            registry,
        }
    }

    fn descriptor(zone: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            service: SERVICE.into(),
            zone: zone.into(),
            typ: "grpc".into(),
            proto: "service Order {}".into(),
            description: "order service".into(),
            content_hash: String::new(),
        }
    }

    fn endpoint(address: &str) -> ServiceEndpoint {
        ServiceEndpoint::new("grpc", address)
    }

    #[tokio::test]
    async fn test_plug_then_query() {
        let h = harness().await;
        let grant = h
            .registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 30, 0)
            .await
            .unwrap();
        assert!(grant.id > 0);
        assert_eq!(grant.ttl, 30);

        let (snapshot, revision) = h
            .registry
            .query(SERVICE, Some("default"), None)
            .await
            .unwrap();
        assert_eq!(revision, h.store.revision());
        let zone = &snapshot.zones["default"];
        assert_eq!(zone.endpoints, vec![endpoint("10.0.0.5:9000")]);
        assert_eq!(zone.descriptor.typ, "grpc");
        assert_eq!(zone.descriptor.content_hash, descriptor("default").compute_hash());

        let row = h.index.find(SERVICE, "default").await.unwrap().unwrap();
        assert!(row.hash_verified);
        assert_eq!(h.metrics.op(Operation::Plug).calls, 1);
    }

    #[tokio::test]
    async fn test_plug_validation_touches_nothing() {
        let h = harness().await;
        let mut bad = descriptor("default");
        bad.service = "order".into();
        assert_matches!(
            h.registry.plug(bad, endpoint("10.0.0.5:9000"), 30, 0).await,
            Err(Error::InvalidService(_))
        );
        assert_matches!(
            h.registry.plug(descriptor("bad zone"), endpoint("10.0.0.5:9000"), 30, 0).await,
            Err(Error::InvalidZone(_))
        );
        let mut untyped = descriptor("default");
        untyped.typ.clear();
        assert_matches!(
            h.registry.plug(untyped, endpoint("10.0.0.5:9000"), 30, 0).await,
            Err(Error::InvalidEndpoint(_))
        );
        assert_matches!(
            h.registry.plug(descriptor("default"), endpoint("10.0.0.5/9000"), 30, 0).await,
            Err(Error::InvalidAddress(_))
        );
        assert_matches!(
            h.registry.plug(descriptor("default"), endpoint("10.0.0.5:9000"), 5, 0).await,
            Err(Error::InvalidParam(_))
        );
        assert_matches!(
            h.registry.plug_all(vec![], endpoint("10.0.0.5:9000"), 30, 0).await,
            Err(Error::MissingParam(_))
        );
        assert_eq!(h.store.revision(), 1);
        assert_eq!(h.store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_zone_defaults() {
        let h = harness().await;
        h.registry
            .plug(descriptor(""), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        let (snapshot, _) = h.registry.query(SERVICE, None, None).await.unwrap();
        assert!(snapshot.zones.contains_key(DEFAULT_ZONE));
    }

    #[tokio::test]
    async fn test_repeated_plug_is_noop() {
        let h = harness().await;
        let grant = h
            .registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 30, 0)
            .await
            .unwrap();
        let revision = h.store.revision();

        let again = h
            .registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 30, grant.id)
            .await
            .unwrap();
        assert_eq!(again.id, grant.id);
        assert_eq!(h.store.revision(), revision);
    }

    #[tokio::test]
    async fn test_concurrent_identical_plugs() {
        let h = harness().await;
        let (a, b) = tokio::join!(
            h.registry.plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0),
            h.registry.plug(descriptor("default"), endpoint("10.0.0.6:9000"), 0, 0),
        );
        a.unwrap();
        b.unwrap();

        let key = h.registry.keyspace().descriptor_key(SERVICE, "default");
        let kv = h.store.get(&key).await.unwrap().kv.unwrap();
        assert_eq!(kv.version, 1);

        let (snapshot, _) = h.registry.query(SERVICE, None, None).await.unwrap();
        assert_eq!(snapshot.addresses().len(), 2);
    }

    #[tokio::test]
    async fn test_changed_descriptor_rejected_and_lease_released() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();

        let mut changed = descriptor("default");
        changed.proto = "service Order { rpc Get() }".into();
        assert_matches!(
            h.registry.plug(changed, endpoint("10.0.0.6:9000"), 30, 0).await,
            Err(Error::ChangedServiceDesc(_))
        );
        assert_eq!(h.store.lease_count(), 0);
        let (snapshot, _) = h.registry.query(SERVICE, None, None).await.unwrap();
        assert_eq!(snapshot.addresses(), vec!["10.0.0.5:9000"]);
        assert_eq!(h.metrics.snapshot().cas_conflicts, 1);
    }

    #[tokio::test]
    async fn test_plug_all_shares_lease() {
        let h = harness().await;
        let mut other = descriptor("default");
        other.service = "billing:2.0".into();
        let grant = h
            .registry
            .plug_all(
                vec![descriptor("default"), other],
                endpoint("10.0.0.5:9000"),
                30,
                0,
            )
            .await
            .unwrap();
        assert_eq!(h.store.lease_count(), 1);

        h.registry.leases().revoke(grant.id).await.unwrap();
        assert_matches!(
            h.registry.query("billing:2.0", Some("default"), None).await,
            Ok((snapshot, _)) if snapshot.zones.is_empty()
        );
    }

    #[tokio::test]
    async fn test_unplug_is_idempotent() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();

        h.registry.unplug(SERVICE, "default", "10.0.0.5:9000").await.unwrap();
        h.registry.unplug(SERVICE, "default", "10.0.0.5:9000").await.unwrap();

        let (snapshot, _) = h.registry.query(SERVICE, None, None).await.unwrap();
        assert!(snapshot.addresses().is_empty());
        let row = h.index.find(SERVICE, "default").await.unwrap().unwrap();
        assert_eq!(row.status, crate::domain::RowStatus::Deleted);
    }

    #[tokio::test]
    async fn test_update_missing_node() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        let revision = h.store.revision();

        assert_matches!(
            h.registry
                .update(SERVICE, "default", "10.0.0.9:9000", endpoint(""))
                .await,
            Err(Error::NotFound(_))
        );
        assert_eq!(h.store.revision(), revision);
    }

    #[tokio::test]
    async fn test_update_existing_node_keeps_lease() {
        let h = harness().await;
        let grant = h
            .registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 30, 0)
            .await
            .unwrap();

        let mut changed = endpoint("10.0.0.5:9000");
        changed.config = "weight=5".into();
        h.registry
            .update(SERVICE, "default", "10.0.0.5:9000", changed.clone())
            .await
            .unwrap();
        assert_matches!(
            h.registry
                .update(SERVICE, "default", "10.0.0.5:9000", endpoint("10.0.0.6:9000"))
                .await,
            Err(Error::InvalidParam(_))
        );

        let key = h
            .registry
            .keyspace()
            .node_key(SERVICE, "default", "10.0.0.5:9000");
        let kv = h.store.get(&key).await.unwrap().kv.unwrap();
        assert_eq!(kv.lease, grant.id);
        let (snapshot, _) = h.registry.query(SERVICE, None, None).await.unwrap();
        assert_eq!(snapshot.zones["default"].endpoints, vec![changed]);
    }

    #[tokio::test]
    async fn test_keep_alive_unknown_lease() {
        let h = harness().await;
        assert_matches!(h.registry.keep_alive(99).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_unknown_service() {
        let h = harness().await;
        assert_matches!(
            h.registry.query(SERVICE, None, None).await,
            Err(Error::NotFound(_))
        );
        assert_matches!(h.registry.query_zones(SERVICE).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_zones_and_zone_filter() {
        let h = harness().await;
        for zone in ["dc-1", "dc-2"] {
            h.registry
                .plug(descriptor(zone), endpoint("10.0.0.5:9000"), 0, 0)
                .await
                .unwrap();
        }
        let (zones, _) = h.registry.query_zones(SERVICE).await.unwrap();
        assert_eq!(zones.zones, vec!["dc-1".to_string(), "dc-2".to_string()]);

        let (snapshot, _) = h.registry.query(SERVICE, Some("dc-2"), None).await.unwrap();
        assert_eq!(snapshot.zones.keys().collect::<Vec<_>>(), vec!["dc-2"]);
    }

    #[tokio::test]
    async fn test_query_skips_unknown_keys() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        h.store
            .put("/services/orderSvc:1.0/default/md5", "x".into(), LeaseBinding::Detach)
            .await
            .unwrap();
        let (snapshot, _) = h.registry.query(SERVICE, None, None).await.unwrap();
        assert_eq!(snapshot.addresses(), vec!["10.0.0.5:9000"]);
    }

    #[tokio::test]
    async fn test_damaged_endpoint_value() {
        let h = harness().await;
        let key = h
            .registry
            .keyspace()
            .node_key(SERVICE, "default", "10.0.0.5:9000");
        h.store
            .put(&key, "{not json".into(), LeaseBinding::Detach)
            .await
            .unwrap();
        assert_matches!(
            h.registry.query(SERVICE, None, None).await,
            Err(Error::DamagedEndpointValue(_))
        );
    }

    #[tokio::test]
    async fn test_query_maps_addresses_for_client() {
        let store = MemoryStore::new();
        let index = Arc::new(SqlIndex::in_memory().await.unwrap());
        let resolver = EndpointResolver::from_rules(&[NetMappingRule {
            src_net: "192.168.0.0/16".into(),
            dest_ip: "203.0.113.7".into(),
            endpoint_net: None,
        }])
        .unwrap();
        let registry = ServiceRegistry::new(store, index, Arc::new(RegistryMetrics::new()))
            .with_resolver(resolver);
        registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();

        let inside: IpAddr = "192.168.3.3".parse().unwrap();
        let outside: IpAddr = "10.9.9.9".parse().unwrap();
        let (mapped, _) = registry.query(SERVICE, None, Some(inside)).await.unwrap();
        assert_eq!(mapped.addresses(), vec!["203.0.113.7:9000"]);
        let (raw, _) = registry.query(SERVICE, None, Some(outside)).await.unwrap();
        assert_eq!(raw.addresses(), vec!["10.0.0.5:9000"]);
    }

    #[tokio::test]
    async fn test_banned_address() {
        let store = MemoryStore::new();
        let index = Arc::new(SqlIndex::in_memory().await.unwrap());
        let registry = ServiceRegistry::new(store, index, Arc::new(RegistryMetrics::new()))
            .with_address_policy(AddressPolicy::new(&["^127\\."]).unwrap());
        assert_matches!(
            registry
                .plug(descriptor("default"), endpoint("127.0.0.1:9000"), 0, 0)
                .await,
            Err(Error::InvalidAddress(_))
        );
    }

    #[tokio::test]
    async fn test_delete_service() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        assert_matches!(
            h.registry.delete_service(SERVICE, None).await,
            Err(Error::InvalidParam(_))
        );

        h.registry.unplug(SERVICE, "default", "10.0.0.5:9000").await.unwrap();
        h.registry.delete_service(SERVICE, None).await.unwrap();
        assert_matches!(
            h.registry.query(SERVICE, None, None).await,
            Err(Error::NotFound(_))
        );
        let row = h.index.find(SERVICE, "default").await.unwrap().unwrap();
        assert_eq!(row.status, crate::domain::RowStatus::Deleted);
    }

    #[tokio::test]
    async fn test_watch_times_out() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = h
            .registry
            .watch(SERVICE, Some("default"), 0, Duration::from_millis(300), None, None)
            .await;
        assert_matches!(result, Err(Error::DeadlineExceeded(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.store.watcher_count(), 0);
        assert_eq!(h.metrics.snapshot().watch_timeouts, 1);
    }

    #[tokio::test]
    async fn test_watch_returns_at_or_after_revision() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        let from = h.store.revision() + 1;

        let registry = h.registry.clone();
        let watcher = tokio::spawn(async move {
            registry
                .watch(SERVICE, None, from, Duration::from_secs(10), None, None)
                .await
        });
        tokio::task::yield_now().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.6:9000"), 0, 0)
            .await
            .unwrap();

        let (snapshot, revision) = watcher.await.unwrap().unwrap();
        assert!(revision >= from);
        assert_eq!(snapshot.addresses().len(), 2);
    }

    #[tokio::test]
    async fn test_watch_replays_past_revision() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        let (snapshot, revision) = h
            .registry
            .watch(SERVICE, None, 1, Duration::from_secs(1), None, None)
            .await
            .unwrap();
        assert!(revision >= 1);
        assert_eq!(snapshot.addresses(), vec!["10.0.0.5:9000"]);
    }

    #[tokio::test]
    async fn test_watch_reports_deleted() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        h.registry.unplug(SERVICE, "default", "10.0.0.5:9000").await.unwrap();
        h.registry.delete_service(SERVICE, None).await.unwrap();

        assert_matches!(
            h.registry
                .watch(SERVICE, None, 1, Duration::from_secs(1), None, None)
                .await,
            Err(Error::Deleted(_))
        );
    }

    #[tokio::test]
    async fn test_watch_cancel() {
        let h = harness().await;
        let token = CancellationToken::new();
        token.cancel();
        assert_matches!(
            h.registry
                .watch(SERVICE, None, 0, Duration::from_secs(10), None, Some(token))
                .await,
            Err(Error::Canceled(_))
        );
        assert_eq!(h.store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_search_after_plug() {
        let h = harness().await;
        h.registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 0, 0)
            .await
            .unwrap();
        let page = h.registry.search_service("order", 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.services[0].service, SERVICE);
        assert_matches!(
            h.registry.search_service("order", 0, 10_000).await,
            Err(Error::InvalidParam(_))
        );
    }

    #[tokio::test]
    async fn test_plug_rejects_oversized_ttl() {
        let h = harness().await;
        assert_matches!(
            h.registry
                .plug(descriptor("default"), endpoint("10.0.0.5:9000"), i64::MAX, 0)
                .await,
            Err(Error::InvalidParam(_))
        );
        assert_eq!(h.store.lease_count(), 0);
        assert_eq!(h.store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_plug_with_reused_lease_reports_its_ttl() {
        let h = harness().await;
        let grant = h
            .registry
            .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 30, 0)
            .await
            .unwrap();
        let again = h
            .registry
            .plug(descriptor("default"), endpoint("10.0.0.6:9000"), 0, grant.id)
            .await
            .unwrap();
        assert_eq!(again.id, grant.id);
        assert_eq!(again.ttl, 30);
        assert_eq!(h.store.lease_count(), 1);

        assert_matches!(
            h.registry
                .plug(descriptor("default"), endpoint("10.0.0.7:9000"), 0, 4242)
                .await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_delete_service_without_store_keys() {
        let h = harness().await;
        h.registry.delete_service(SERVICE, None).await.unwrap();

        h.index.upsert_verified(&descriptor("dc-2").hashed()).await.unwrap();
        h.registry.delete_service(SERVICE, Some("dc-2")).await.unwrap();
        let row = h.index.find(SERVICE, "dc-2").await.unwrap().unwrap();
        assert_eq!(row.status, crate::domain::RowStatus::Deleted);
        assert_eq!(h.registry.search_service("order", 0, 10).await.unwrap().total, 0);
    }

    struct OfflineIndex;

    #[async_trait::async_trait]
    impl SearchIndex for OfflineIndex {
        async fn upsert_pending(&self, _: &[ServiceDescriptor]) -> Result<()> {
            Err(Error::SystemError("update db fail".into()))
        }
        async fn mark_verified(&self, _: &[ServiceDescriptor]) -> Result<()> {
            Err(Error::SystemError("update db fail".into()))
        }
        async fn upsert_verified(&self, _: &ServiceDescriptor) -> Result<()> {
            Err(Error::SystemError("update db fail".into()))
        }
        async fn soft_delete(&self, _: &str, _: Option<&str>) -> Result<u64> {
            Err(Error::SystemError("delete service db items fail".into()))
        }
        async fn search(&self, _: &str, _: i64, _: i64) -> Result<SearchPage> {
            Err(Error::SystemError("query db services fail".into()))
        }
        async fn find(&self, _: &str, _: &str) -> Result<Option<crate::domain::IndexRow>> {
            Err(Error::SystemError("query db services fail".into()))
        }
        async fn page_after(&self, _: i64, _: i64) -> Result<Vec<crate::domain::IndexRow>> {
            Err(Error::SystemError("query db services fail".into()))
        }
    }

    #[tokio::test]
    async fn test_index_failure_fails_plug_and_releases_lease() {
        let store = MemoryStore::new();
        let registry = ServiceRegistry::new(
            store.clone(),
            Arc::new(OfflineIndex),
            Arc::new(RegistryMetrics::new()),
        );
        assert_matches!(
            registry
                .plug(descriptor("default"), endpoint("10.0.0.5:9000"), 30, 0)
                .await,
            Err(Error::SystemError(_))
        );
        assert_eq!(store.lease_count(), 0);
        let node = registry.keyspace().node_key(SERVICE, "default", "10.0.0.5:9000");
        assert!(store.get(&node).await.unwrap().kv.is_none());
    }
}
