//! Service Registry
//!
//! Endpoint lifecycle and discovery:
//! - Lease Manager: TTL leases backing endpoint nodes
//! - Endpoint Resolver: value decoding and client-relative address mapping
//! - Registry Core: plug, unplug, update, keepalive, query and watch

pub mod lease;
pub mod resolver;
pub mod service;

pub use lease::{check_ttl, LeaseManager, DEFAULT_SERVICE_TTL, MAX_SERVICE_TTL, MIN_SERVICE_TTL};
pub use resolver::{EndpointResolver, NetMapping, NetMappingRule};
pub use service::{ServiceRegistry, MAX_CAS_ATTEMPTS};
