//! Registry Metrics
//!
//! Per-operation counters kept in cache-line aligned atomics, with a
//! point-in-time snapshot and Prometheus text exposition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Operations
// =============================================================================

/// Operations exposed by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Plug,
    Unplug,
    Update,
    KeepAlive,
    Query,
    Watch,
    DeleteService,
    Search,
    ConfigGet,
    ConfigPut,
    ConfigWatch,
    ConfigRange,
    ConfigDelete,
    Reconcile,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::Plug,
        Operation::Unplug,
        Operation::Update,
        Operation::KeepAlive,
        Operation::Query,
        Operation::Watch,
        Operation::DeleteService,
        Operation::Search,
        Operation::ConfigGet,
        Operation::ConfigPut,
        Operation::ConfigWatch,
        Operation::ConfigRange,
        Operation::ConfigDelete,
        Operation::Reconcile,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Plug => "plug",
            Operation::Unplug => "unplug",
            Operation::Update => "update",
            Operation::KeepAlive => "keepalive",
            Operation::Query => "query",
            Operation::Watch => "watch",
            Operation::DeleteService => "delete_service",
            Operation::Search => "search",
            Operation::ConfigGet => "config_get",
            Operation::ConfigPut => "config_put",
            Operation::ConfigWatch => "config_watch",
            Operation::ConfigRange => "config_range",
            Operation::ConfigDelete => "config_delete",
            Operation::Reconcile => "reconcile",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Per-Operation Counters (Cache-Line Aligned)
// =============================================================================

/// Counters for one operation, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct OpCounters {
    pub calls: AtomicU64,
    /// Domain-level failures (validation, not-found, conflicts)
    pub errors: AtomicU64,
    pub system_errors: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<OpCounters>() <= CACHE_LINE_SIZE);

/// Point-in-time copy of one operation's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSnapshot {
    pub calls: u64,
    pub errors: u64,
    pub system_errors: u64,
}

// =============================================================================
// Registry Metrics
// =============================================================================

/// Metrics container shared by every component
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    ops: [OpCounters; 14],
    watch_timeouts: AtomicU64,
    cas_conflicts: AtomicU64,
    leases_granted: AtomicU64,
    leases_revoked: AtomicU64,
    reconcile_fixed: AtomicU64,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call and classify its outcome
    pub fn record<T>(&self, op: Operation, result: &Result<T>) {
        let counters = &self.ops[op.slot()];
        counters.calls.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = result {
            if err.is_system() {
                counters.system_errors.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            match err {
                Error::DeadlineExceeded(_)
                    if matches!(op, Operation::Watch | Operation::ConfigWatch) =>
                {
                    self.watch_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Error::InvalidVersion(_) | Error::ChangedServiceDesc(_) => {
                    self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }

    #[inline]
    pub fn record_lease_granted(&self) {
        self.leases_granted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lease_revoked(&self) {
        self.leases_revoked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconcile_fixed(&self, count: u64) {
        self.reconcile_fixed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn op(&self, op: Operation) -> OpSnapshot {
        let counters = &self.ops[op.slot()];
        OpSnapshot {
            calls: counters.calls.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            system_errors: counters.system_errors.load(Ordering::Relaxed),
        }
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops: Operation::ALL.iter().map(|op| (*op, self.op(*op))).collect(),
            watch_timeouts: self.watch_timeouts.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
            leases_granted: self.leases_granted.load(Ordering::Relaxed),
            leases_revoked: self.leases_revoked.load(Ordering::Relaxed),
            reconcile_fixed: self.reconcile_fixed.load(Ordering::Relaxed),
        }
    }

    /// Render the current values in Prometheus text format
    pub fn encode_prometheus(&self) -> Result<String> {
        self.snapshot().encode_prometheus()
    }
}

// =============================================================================
// Metrics Snapshot
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub ops: Vec<(Operation, OpSnapshot)>,
    pub watch_timeouts: u64,
    pub cas_conflicts: u64,
    pub leases_granted: u64,
    pub leases_revoked: u64,
    pub reconcile_fixed: u64,
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::SystemError(format!("metrics encoding fail: {}", e))
}

impl MetricsSnapshot {
    pub fn total_calls(&self) -> u64 {
        self.ops.iter().map(|(_, s)| s.calls).sum()
    }

    pub fn encode_prometheus(&self) -> Result<String> {
        let registry = Registry::new();

        let calls = IntCounterVec::new(
            Opts::new("svc_registry_operations_total", "Operations handled"),
            &["op", "outcome"],
        )
        .map_err(prom_err)?;
        registry.register(Box::new(calls.clone())).map_err(prom_err)?;
        for (op, snap) in &self.ops {
            let ok = snap.calls.saturating_sub(snap.errors + snap.system_errors);
            let op = op.to_string();
            calls.with_label_values(&[op.as_str(), "ok"]).inc_by(ok);
            calls.with_label_values(&[op.as_str(), "error"]).inc_by(snap.errors);
            calls
                .with_label_values(&[op.as_str(), "system_error"])
                .inc_by(snap.system_errors);
        }

        let singles = [
            ("svc_registry_watch_timeouts_total", "Watches that hit their deadline", self.watch_timeouts),
            ("svc_registry_cas_conflicts_total", "Rejected conditional writes", self.cas_conflicts),
            ("svc_registry_leases_granted_total", "Leases granted", self.leases_granted),
            ("svc_registry_leases_revoked_total", "Leases revoked", self.leases_revoked),
            ("svc_registry_reconcile_fixed_total", "Index rows repaired", self.reconcile_fixed),
        ];
        for (name, help, value) in singles {
            let counter = IntCounter::new(name, help).map_err(prom_err)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(prom_err)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::SystemError(format!("metrics encoding fail: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_counters_alignment() {
        assert_eq!(std::mem::align_of::<OpCounters>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_operation_slots_cover_all() {
        for (i, op) in Operation::ALL.iter().enumerate() {
            assert_eq!(op.slot(), i);
        }
    }

    #[test]
    fn test_record_outcomes() {
        let metrics = RegistryMetrics::new();
        metrics.record::<()>(Operation::Query, &Ok(()));
        metrics.record::<()>(Operation::Query, &Err(Error::NotFound("x".into())));
        metrics.record::<()>(Operation::Query, &Err(Error::SystemError("x".into())));
        metrics.record::<()>(Operation::Watch, &Err(Error::DeadlineExceeded("w".into())));
        metrics.record::<()>(Operation::ConfigPut, &Err(Error::InvalidVersion("v".into())));
        metrics.record::<()>(Operation::Plug, &Err(Error::DeadlineExceeded("p".into())));
        metrics.record::<()>(Operation::ConfigWatch, &Err(Error::DeadlineExceeded("c".into())));

        let query = metrics.op(Operation::Query);
        assert_eq!(query.calls, 3);
        assert_eq!(query.errors, 1);
        assert_eq!(query.system_errors, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.watch_timeouts, 2);
        assert_eq!(snapshot.cas_conflicts, 1);
        assert_eq!(snapshot.total_calls(), 7);
    }

    #[test]
    fn test_prometheus_encoding() {
        let metrics = RegistryMetrics::new();
        metrics.record::<()>(Operation::Plug, &Ok(()));
        metrics.record_lease_granted();

        let text = metrics.encode_prometheus().unwrap();
        assert!(text.contains("svc_registry_operations_total{op=\"plug\",outcome=\"ok\"} 1"));
        assert!(text.contains("svc_registry_leases_granted_total 1"));
    }
}
