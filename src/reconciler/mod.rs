//! Consistency Reconciler
//!
//! Compares the descriptor keys held by the coordination store with the
//! rows of the search index and, on request, repairs the index from the
//! store. The store is always authoritative; index rows are never removed.
//!
//! ```text
//!   store: keys-only scan of <prefix>/        index: page_after(id, 1000)...
//!            │                                          │
//!            └──────────► {service, zone} diff ◄────────┘
//!                               │
//!        print: log missing   fix: get + hash + upsert   reverse: log orphans
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{RowStatus, SearchIndexRef, ServiceDescriptor};
use crate::error::{Error, Result};
use crate::keyspace::{KeySpace, KeySuffix};
use crate::metrics::{Operation, RegistryMetrics};
use crate::store::{CoordinationStoreRef, RangeRequest};

// =============================================================================
// Modes & Reports
// =============================================================================

/// What a reconcile run does with the differences it finds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// Report store descriptors the index is missing
    Print,
    /// Repair those rows from the store
    Fix,
    /// Report index rows without a store descriptor
    Reverse,
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileMode::Print => write!(f, "print"),
            ReconcileMode::Fix => write!(f, "fix"),
            ReconcileMode::Reverse => write!(f, "reverse"),
        }
    }
}

impl FromStr for ReconcileMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "print" => Ok(ReconcileMode::Print),
            "fix" => Ok(ReconcileMode::Fix),
            "reverse" => Ok(ReconcileMode::Reverse),
            other => Err(Error::InvalidParam(format!("unknown reconcile mode: {}", other))),
        }
    }
}

/// `(service, zone)`
pub type ServiceZoneKey = (String, String);

/// Outcome of one reconcile run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub mode: ReconcileMode,
    /// Descriptor keys found in the store
    pub store_keys: usize,
    /// Rows read from the index
    pub index_rows: usize,
    /// Store descriptors with no usable index row
    pub missing: Vec<ServiceZoneKey>,
    /// Rows repaired in fix mode
    pub fixed: usize,
    /// Index rows with no store descriptor, reverse mode only
    pub orphaned: Vec<ServiceZoneKey>,
}

impl ReconcileReport {
    fn new(mode: ReconcileMode) -> Self {
        Self {
            mode,
            store_keys: 0,
            index_rows: 0,
            missing: Vec::new(),
            fixed: 0,
            orphaned: Vec::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.missing.len() == self.fixed && self.orphaned.is_empty()
    }
}

// =============================================================================
// Reconciler
// =============================================================================

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Index rows read per page
    pub page_size: i64,
    /// First retry delay for transient store errors
    pub retry_initial: Duration,
    /// Give up retrying after this long
    pub retry_max_elapsed: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            retry_initial: Duration::from_millis(100),
            retry_max_elapsed: Duration::from_secs(30),
        }
    }
}

struct IndexState {
    status: RowStatus,
    hash_verified: bool,
}

pub struct ConsistencyReconciler {
    config: ReconcilerConfig,
    store: CoordinationStoreRef,
    index: SearchIndexRef,
    keyspace: KeySpace,
    metrics: Arc<RegistryMetrics>,
}

impl ConsistencyReconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: CoordinationStoreRef,
        index: SearchIndexRef,
        metrics: Arc<RegistryMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            index,
            keyspace: KeySpace::default(),
            metrics,
        }
    }

    pub fn with_keyspace(mut self, keyspace: KeySpace) -> Self {
        self.keyspace = keyspace;
        self
    }

    pub async fn run(&self, mode: ReconcileMode) -> Result<ReconcileReport> {
        let result = self.run_inner(mode).await;
        self.metrics.record(Operation::Reconcile, &result);
        if let Ok(report) = &result {
            self.metrics.record_reconcile_fixed(report.fixed as u64);
        }
        result
    }

    async fn run_inner(&self, mode: ReconcileMode) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(mode);
        let rows = self.load_index().await?;
        report.index_rows = rows.len();
        let descriptors = self.scan_descriptors().await?;
        report.store_keys = descriptors.len();

        for key in &descriptors {
            let usable = rows
                .get(key)
                .map_or(false, |r| r.status == RowStatus::Deleted || r.hash_verified);
            if usable {
                continue;
            }
            report.missing.push(key.clone());
            match mode {
                ReconcileMode::Fix => {
                    info!(service = %key.0, zone = %key.1, "index row missing, fixing");
                    if self.fix(&key.0, &key.1).await? {
                        report.fixed += 1;
                    }
                }
                _ => info!(service = %key.0, zone = %key.1, "index row missing"),
            }
        }

        if mode == ReconcileMode::Reverse {
            let mut orphaned: Vec<ServiceZoneKey> = rows
                .iter()
                .filter(|(key, _)| !descriptors.contains(*key))
                .map(|(key, row)| {
                    info!(
                        service = %key.0,
                        zone = %key.1,
                        status = %row.status,
                        hash_verified = row.hash_verified,
                        "store descriptor missing"
                    );
                    key.clone()
                })
                .collect();
            orphaned.sort();
            report.orphaned = orphaned;
        }

        info!(
            %mode,
            store_keys = report.store_keys,
            index_rows = report.index_rows,
            missing = report.missing.len(),
            fixed = report.fixed,
            orphaned = report.orphaned.len(),
            "reconcile finished"
        );
        Ok(report)
    }

    /// Every index row, read in id order one page at a time
    async fn load_index(&self) -> Result<HashMap<ServiceZoneKey, IndexState>> {
        let mut rows = HashMap::new();
        let mut after = 0;
        loop {
            let page = self.index.page_after(after, self.config.page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;
            let full = page.len() as i64 >= self.config.page_size;
            for row in page {
                rows.insert(
                    (row.service, row.zone),
                    IndexState {
                        status: row.status,
                        hash_verified: row.hash_verified,
                    },
                );
            }
            if !full {
                break;
            }
        }
        debug!(rows = rows.len(), "index loaded");
        Ok(rows)
    }

    /// `(service, zone)` of every descriptor key in the store
    async fn scan_descriptors(&self) -> Result<BTreeSet<ServiceZoneKey>> {
        let resp = self
            .store
            .range(RangeRequest::prefix(self.keyspace.all_services_prefix()).keys_only())
            .await
            .map_err(|e| Error::from_store(e, "get services fail"))?;
        Ok(resp
            .kvs
            .iter()
            .filter_map(|kv| self.keyspace.decode(&kv.key))
            .filter(|key| key.suffix == KeySuffix::Descriptor)
            .map(|key| (key.service, key.zone))
            .collect())
    }

    /// Re-project one descriptor; false when it vanished or is unreadable
    async fn fix(&self, service: &str, zone: &str) -> Result<bool> {
        let key = self.keyspace.descriptor_key(service, zone);
        let policy = ExponentialBackoff {
            initial_interval: self.config.retry_initial,
            max_elapsed_time: Some(self.config.retry_max_elapsed),
            ..ExponentialBackoff::default()
        };
        let store = &self.store;
        let key = key.as_str();
        let resp = backoff::future::retry(policy, || async move {
            store.get(key).await.map_err(|e| {
                if e.is_transient() {
                    warn!(%key, error = %e, "transient store error, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
        .map_err(|e| Error::from_store(e, "get service desc fail"))?;

        let Some(kv) = resp.kv else {
            debug!(%key, "descriptor deleted before fix");
            return Ok(false);
        };
        let mut desc: ServiceDescriptor = match serde_json::from_slice(&kv.value) {
            Ok(desc) => desc,
            Err(e) => {
                warn!(%key, error = %e, "damaged service descriptor, skipped");
                return Ok(false);
            }
        };
        desc.service = service.to_string();
        desc.zone = zone.to_string();
        self.index.upsert_verified(&desc.hashed()).await?;
        Ok(true)
    }

    /// Run print-mode passes every `period` until `shutdown` fires
    pub async fn run_periodic(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run(ReconcileMode::Print).await {
                        warn!(error = %e, "periodic reconcile failed");
                    }
                }
            }
        }
        info!("reconcile loop stopped");
    }
}
