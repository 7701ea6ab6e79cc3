//! Application Configuration
//!
//! YAML file with one section per component. Every field has a default, so
//! an empty file is a valid configuration:
//!
//! ```yaml
//! services:
//!   key_prefix: /services
//!   net_mappings:
//!     - { src_net: 192.168.0.0/16, dest_ip: 203.0.113.7 }
//!   banned_endpoint_addresses: ["^127\\."]
//! configs:
//!   key_prefix: /configs
//! database:
//!   url: sqlite://registry.db
//! reconcile:
//!   interval_secs: 600
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::SqlIndexConfig;
use crate::keyspace::{AddressPolicy, KeySpace};
use crate::reconciler::ReconcilerConfig;
use crate::registry::{EndpointResolver, NetMappingRule};
use crate::store::MemoryStoreConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesSection {
    pub key_prefix: String,
    pub net_mappings: Vec<NetMappingRule>,
    pub banned_endpoint_addresses: Vec<String>,
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            key_prefix: "/services".to_string(),
            net_mappings: Vec::new(),
            banned_endpoint_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigsSection {
    pub key_prefix: String,
}

impl Default for ConfigsSection {
    fn default() -> Self {
        Self {
            key_prefix: "/configs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 4,
            acquire_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub history_limit: usize,
    pub channel_capacity: usize,
    pub reap_interval_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = MemoryStoreConfig::default();
        Self {
            history_limit: defaults.history_limit,
            channel_capacity: defaults.channel_capacity,
            reap_interval_secs: defaults.reap_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// Seconds between print-mode passes; 0 disables the loop
    pub interval_secs: u64,
    pub page_size: i64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            page_size: 1000,
        }
    }
}

/// Root of the YAML configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub services: ServicesSection,
    pub configs: ConfigsSection,
    pub database: DatabaseSection,
    pub store: StoreSection,
    pub reconcile: ReconcileSection,
}

impl AppConfig {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidParam(format!("read config {} fail: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: AppConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::InvalidParam(format!("parse config fail: {}", e)))?;
        config.prepare()?;
        Ok(config)
    }

    /// Normalize prefixes and reject rules that cannot be compiled
    pub fn prepare(&mut self) -> Result<()> {
        for prefix in [&mut self.services.key_prefix, &mut self.configs.key_prefix] {
            let trimmed = prefix.trim_end_matches('/');
            if trimmed.is_empty() {
                return Err(Error::InvalidParam("empty key prefix".into()));
            }
            *prefix = trimmed.to_string();
        }
        if self.services.key_prefix == self.configs.key_prefix {
            return Err(Error::InvalidParam(
                "service and config key prefixes overlap".into(),
            ));
        }
        self.address_policy()?;
        self.resolver()?;
        if self.reconcile.page_size <= 0 {
            return Err(Error::InvalidParam("reconcile page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn keyspace(&self) -> KeySpace {
        KeySpace::new(&self.services.key_prefix, &self.configs.key_prefix)
    }

    pub fn address_policy(&self) -> Result<AddressPolicy> {
        AddressPolicy::new(&self.services.banned_endpoint_addresses)
    }

    pub fn resolver(&self) -> Result<EndpointResolver> {
        EndpointResolver::from_rules(&self.services.net_mappings)
    }

    pub fn index_config(&self) -> SqlIndexConfig {
        SqlIndexConfig {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
        }
    }

    pub fn store_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            history_limit: self.store.history_limit,
            channel_capacity: self.store.channel_capacity,
            reap_interval: Duration::from_secs(self.store.reap_interval_secs.max(1)),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            page_size: self.reconcile.page_size,
            ..Default::default()
        }
    }
}
