//! Lease Manager
//!
//! Grants, renews and revokes the TTL leases that back endpoint nodes. One
//! lease may carry any number of nodes; revoking it removes all of them.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::RegistryMetrics;
use crate::store::{CoordinationStoreRef, LeaseGrant, LeaseId};

/// Shortest ttl accepted for an expiring lease, in seconds
pub const MIN_SERVICE_TTL: i64 = 10;

/// Lease ttl used when a caller does not pass one, in seconds
pub const DEFAULT_SERVICE_TTL: i64 = 60;

/// Longest ttl accepted for an expiring lease, in seconds
pub const MAX_SERVICE_TTL: i64 = 9_000_000_000;

/// Bound the ttl of expiring leases; `ttl <= 0` means no expiry
pub fn check_ttl(ttl: i64) -> Result<()> {
    if ttl > 0 && !(MIN_SERVICE_TTL..=MAX_SERVICE_TTL).contains(&ttl) {
        return Err(Error::InvalidParam(format!("invalid ttl: {}", ttl)));
    }
    Ok(())
}

/// Lease operations with store errors translated to the taxonomy
#[derive(Clone)]
pub struct LeaseManager {
    store: CoordinationStoreRef,
    metrics: Arc<RegistryMetrics>,
}

impl LeaseManager {
    pub fn new(store: CoordinationStoreRef, metrics: Arc<RegistryMetrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn grant(&self, ttl: i64) -> Result<LeaseGrant> {
        check_ttl(ttl)?;
        let grant = self
            .store
            .grant(ttl)
            .await
            .map_err(|e| Error::from_store(e, "create lease fail"))?;
        self.metrics.record_lease_granted();
        debug!(lease = grant.id, ttl = grant.ttl, "lease granted");
        Ok(grant)
    }

    pub async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.store
            .revoke(lease)
            .await
            .map_err(|e| Error::from_store(e, "revoke fail"))?;
        self.metrics.record_lease_revoked();
        debug!(lease, "lease revoked");
        Ok(())
    }

    /// Renew once; an expired or unknown lease is `NotFound`
    pub async fn keep_alive_once(&self, lease: LeaseId) -> Result<i64> {
        self.store
            .keep_alive_once(lease)
            .await
            .map_err(|e| Error::from_store(e, "keepalive fail"))
    }

    /// Revoke a lease on a failure path; the caller keeps its own error
    pub(crate) async fn release(&self, lease: LeaseId) {
        if let Err(err) = self.revoke(lease).await {
            warn!(lease, error = %err, "release of freshly granted lease failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn manager() -> (Arc<MemoryStore>, LeaseManager) {
        let store = MemoryStore::new();
        let manager = LeaseManager::new(store.clone(), Arc::new(RegistryMetrics::new()));
        (store, manager)
    }

    #[test]
    fn test_check_ttl() {
        assert!(check_ttl(0).is_ok());
        assert!(check_ttl(-1).is_ok());
        assert!(check_ttl(MIN_SERVICE_TTL).is_ok());
        assert!(check_ttl(MAX_SERVICE_TTL).is_ok());
        assert_matches!(check_ttl(5), Err(Error::InvalidParam(_)));
        assert_matches!(check_ttl(MAX_SERVICE_TTL + 1), Err(Error::InvalidParam(_)));
        assert_matches!(check_ttl(i64::MAX), Err(Error::InvalidParam(_)));
    }

    #[tokio::test]
    async fn test_grant_rejects_short_ttl() {
        let (store, manager) = manager();
        assert_matches!(manager.grant(3).await, Err(Error::InvalidParam(_)));
        assert_eq!(store.lease_count(), 0);

        let grant = manager.grant(DEFAULT_SERVICE_TTL).await.unwrap();
        assert_eq!(grant.ttl, DEFAULT_SERVICE_TTL);
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_lease_is_not_found() {
        let (_store, manager) = manager();
        assert_matches!(manager.keep_alive_once(4242).await, Err(Error::NotFound(_)));
        assert_matches!(manager.revoke(4242).await, Err(Error::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_not_found() {
        let (_store, manager) = manager();
        let grant = manager.grant(MIN_SERVICE_TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_matches!(manager.keep_alive_once(grant.id).await, Err(Error::NotFound(_)));
    }
}
