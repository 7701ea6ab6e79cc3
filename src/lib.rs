//! Service Registry - Discovery and Dynamic Config Control Plane
//!
//! Services plug versioned endpoints into zones under a lease, clients query
//! and long-poll for changes, and applications read and CAS-write named
//! config values. A coordination store holds the authoritative state; a
//! relational index mirrors service descriptors for search.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Response Envelope                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────┐        ┌──────────────────────────────┐   │
//! │  │       Service Registry       │        │         Config Store         │   │
//! │  │ plug/unplug/update/keepalive │        │   get/put/watch/range/del    │   │
//! │  │   query/watch/search/delete  │        │                              │   │
//! │  └───────┬─────────────┬────────┘        └──────────────┬───────────────┘   │
//! │          │             │                                │                   │
//! │   ┌──────┴──────┐ ┌────┴──────────┐                     │                   │
//! │   │   Lease     │ │   Endpoint    │                     │                   │
//! │   │   Manager   │ │   Resolver    │                     │                   │
//! │   └──────┬──────┘ └───────────────┘                     │                   │
//! │          │                                              │                   │
//! │  ┌───────┴──────────────────────────────────────────────┴───────────────┐   │
//! │  │                KeySpace (service and config key codec)               │   │
//! │  └───────┬──────────────────────────────────────────────┬───────────────┘   │
//! ├──────────┼──────────────────────────────────────────────┼───────────────────┤
//! │  ┌───────┴──────────────┐   Consistency    ┌────────────┴───────────────┐   │
//! │  │  Coordination Store  │◄──Reconciler────►│  Search Index / Ledger     │   │
//! │  │  (revisions, leases, │                  │  (SQLite via sqlx)         │   │
//! │  │   txn, watch)        │                  │                            │   │
//! │  └──────────────────────┘                  └────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: Coordination store port and the in-process store
//! - [`keyspace`]: Key layout and input validation
//! - [`registry`]: Leases, endpoint resolution and service operations
//! - [`configs`]: Versioned config values
//! - [`index`]: Relational search index and config ledger
//! - [`reconciler`]: Store/index consistency checks and repair
//! - [`api`]: Result payloads and the response envelope
//! - [`config`]: Application configuration
//! - [`domain`]: Core records and index ports
//! - [`error`]: Error types and handling

pub mod api;
pub mod config;
pub mod configs;
pub mod domain;
pub mod error;
pub mod index;
pub mod keyspace;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use api::{respond, Envelope, ErrorBody, DEFAULT_WATCH_TIMEOUT};

pub use config::AppConfig;

pub use configs::{ConfigStore, CONFIG_RANGE_LIMIT};

pub use domain::ports::{
    ConfigItem, ConfigLedger, ConfigLedgerRef, SearchIndex, SearchIndexRef, SearchPage,
    ServiceDescriptor, ServiceEndpoint, ServiceSnapshot, ServiceZone, ServiceZones,
};

pub use error::{Error, Result};

pub use index::{SqlIndex, SqlIndexConfig};

pub use keyspace::{AddressPolicy, KeySpace, ServiceKey, DEFAULT_ZONE};

pub use metrics::{Operation, RegistryMetrics};

pub use reconciler::{ConsistencyReconciler, ReconcileMode, ReconcileReport, ReconcilerConfig};

pub use registry::{
    EndpointResolver, LeaseManager, NetMappingRule, ServiceRegistry, DEFAULT_SERVICE_TTL,
    MAX_SERVICE_TTL, MIN_SERVICE_TTL,
};

pub use store::{
    CoordinationStore, CoordinationStoreRef, LeaseId, MemoryStore, MemoryStoreConfig, Revision,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
