//! Key Space
//!
//! Layout of every key the control plane writes:
//!
//! ```text
//! <service-prefix>/<name>:<version>/<zone>/desc         descriptor JSON
//! <service-prefix>/<name>:<version>/<zone>/node_<addr>  endpoint JSON
//! <config-prefix>/<name>                                raw config value
//! ```
//!
//! Service keys go through [`ServiceKey`] and a single encode/decode pair;
//! nothing else builds or parses them.

pub mod validation;

use std::fmt;

use crate::store::prefix_end;

pub use validation::{
    check_name, check_name_prefix, check_service, check_service_zone, check_zone, AddressPolicy,
};

/// Zone used when a caller does not name one
pub const DEFAULT_ZONE: &str = "default";

const DESCRIPTOR_LEAF: &str = "desc";
const NODE_LEAF_PREFIX: &str = "node_";

// =============================================================================
// Structured Keys
// =============================================================================

/// What a service key points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySuffix {
    Descriptor,
    Node(String),
}

/// A decoded service key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    /// `name:version`
    pub service: String,
    pub zone: String,
    pub suffix: KeySuffix,
}

impl ServiceKey {
    pub fn descriptor(service: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            zone: zone.into(),
            suffix: KeySuffix::Descriptor,
        }
    }

    pub fn node(
        service: impl Into<String>,
        zone: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            zone: zone.into(),
            suffix: KeySuffix::Node(address.into()),
        }
    }

    /// Split `name:version`
    pub fn name_and_version(&self) -> (&str, &str) {
        self.service
            .split_once(':')
            .unwrap_or((self.service.as_str(), ""))
    }

    pub fn is_descriptor(&self) -> bool {
        matches!(self.suffix, KeySuffix::Descriptor)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            KeySuffix::Descriptor => write!(f, "{}/{}/{}", self.service, self.zone, DESCRIPTOR_LEAF),
            KeySuffix::Node(addr) => {
                write!(f, "{}/{}/{}{}", self.service, self.zone, NODE_LEAF_PREFIX, addr)
            }
        }
    }
}

// =============================================================================
// Key Space
// =============================================================================

/// Prefixes for the service and config namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    services: String,
    configs: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("/services", "/configs")
    }
}

impl KeySpace {
    /// Trailing `/` on either prefix is dropped
    pub fn new(service_prefix: &str, config_prefix: &str) -> Self {
        Self {
            services: service_prefix.trim_end_matches('/').to_string(),
            configs: config_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn service_prefix(&self) -> &str {
        &self.services
    }

    pub fn config_prefix(&self) -> &str {
        &self.configs
    }

    pub fn encode(&self, key: &ServiceKey) -> String {
        format!("{}/{}", self.services, key)
    }

    /// Parse a raw service key; `None` for anything outside the layout
    pub fn decode(&self, raw: &str) -> Option<ServiceKey> {
        let rest = raw.strip_prefix(&self.services)?.strip_prefix('/')?;
        let mut parts = rest.splitn(3, '/');
        let service = parts.next().filter(|s| !s.is_empty())?;
        let zone = parts.next().filter(|s| !s.is_empty())?;
        let leaf = parts.next()?;

        let suffix = if leaf == DESCRIPTOR_LEAF {
            KeySuffix::Descriptor
        } else {
            let address = leaf.strip_prefix(NODE_LEAF_PREFIX)?;
            if address.is_empty() || address.contains('/') {
                return None;
            }
            KeySuffix::Node(address.to_string())
        };
        Some(ServiceKey {
            service: service.to_string(),
            zone: zone.to_string(),
            suffix,
        })
    }

    pub fn descriptor_key(&self, service: &str, zone: &str) -> String {
        self.encode(&ServiceKey::descriptor(service, zone))
    }

    pub fn node_key(&self, service: &str, zone: &str, address: &str) -> String {
        self.encode(&ServiceKey::node(service, zone, address))
    }

    /// Every key of every service
    pub fn all_services_prefix(&self) -> String {
        format!("{}/", self.services)
    }

    /// Every key of one service, across zones
    pub fn service_scan_prefix(&self, service: &str) -> String {
        format!("{}/{}/", self.services, service)
    }

    /// Every key of one service zone
    pub fn zone_scan_prefix(&self, service: &str, zone: &str) -> String {
        format!("{}/{}/{}/", self.services, service, zone)
    }

    /// Endpoint keys of one service zone
    pub fn node_scan_prefix(&self, service: &str, zone: &str) -> String {
        format!("{}/{}/{}/{}", self.services, service, zone, NODE_LEAF_PREFIX)
    }

    pub fn config_key(&self, name: &str) -> String {
        format!("{}/{}", self.configs, name)
    }

    /// Strip the config prefix back off
    pub fn config_name<'a>(&self, raw: &'a str) -> Option<&'a str> {
        raw.strip_prefix(&self.configs)?.strip_prefix('/')
    }

    /// Exclusive upper bound of the config namespace
    pub fn config_range_end(&self) -> String {
        prefix_end(&format!("{}/", self.configs))
    }
}
