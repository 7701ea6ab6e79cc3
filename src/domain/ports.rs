//! Domain Ports - Core records and trait definitions for the registry
//!
//! The coordination store holds the authoritative records; the relational
//! index is a secondary projection reached only through the ports below.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Service Records
// =============================================================================

/// Schema and metadata of one service version in one zone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// `name:version`
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proto: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
}

#[derive(Serialize)]
struct HashedContent<'a> {
    service: &'a str,
    zone: &'a str,
    #[serde(rename = "type")]
    typ: &'a str,
    proto: &'a str,
    description: &'a str,
}

impl ServiceDescriptor {
    /// Hex SHA-256 of the descriptor content, excluding the stored hash
    pub fn compute_hash(&self) -> String {
        let content = HashedContent {
            service: &self.service,
            zone: &self.zone,
            typ: &self.typ,
            proto: &self.proto,
            description: &self.description,
        };
        // Serializing borrowed strings cannot fail.
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Copy with `content_hash` filled in
    pub fn hashed(mut self) -> Self {
        self.content_hash = self.compute_hash();
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::from_json(e, "marshal service-desc fail"))
    }
}

/// One live instance of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub typ: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proto: String,
}

impl ServiceEndpoint {
    pub fn new(typ: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::from_json(e, "marshal endpoint fail"))
    }
}

/// Descriptor plus live endpoints of one zone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceZone {
    #[serde(flatten)]
    pub descriptor: ServiceDescriptor,
    pub endpoints: Vec<ServiceEndpoint>,
}

/// Aggregated view of a service across zones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub zones: BTreeMap<String, ServiceZone>,
}

impl ServiceSnapshot {
    /// Every endpoint address, across zones
    pub fn addresses(&self) -> Vec<&str> {
        self.zones
            .values()
            .flat_map(|z| z.endpoints.iter().map(|e| e.address.as_str()))
            .collect()
    }
}

/// Zone names present for a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceZones {
    pub service: String,
    pub zones: Vec<String>,
}

// =============================================================================
// Config Records
// =============================================================================

/// A config value with its CAS token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub name: String,
    pub value: String,
    /// Store revision of the last write; the token for the next conditional put
    pub version: i64,
}

/// A config write as recorded in the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChange {
    pub tag: String,
    pub name: String,
    pub app_id: i64,
    pub remark: String,
    pub value: String,
}

/// Listing row for active configs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub tag: Option<String>,
    pub name: String,
    pub modify_time: DateTime<Utc>,
}

/// Append-only record of a config write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigHistoryEntry {
    pub id: i64,
    pub tag: String,
    pub name: String,
    #[serde(rename = "modified_by")]
    pub app_id: i64,
    pub remark: String,
    pub value: String,
    pub create_time: DateTime<Utc>,
}

// =============================================================================
// Search Index Records
// =============================================================================

/// Soft-delete flag of an index row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Active,
    Deleted,
}

impl RowStatus {
    pub fn as_db(self) -> i64 {
        match self {
            RowStatus::Active => 0,
            RowStatus::Deleted => -1,
        }
    }

    pub fn from_db(value: i64) -> Self {
        if value < 0 {
            RowStatus::Deleted
        } else {
            RowStatus::Active
        }
    }
}

impl std::fmt::Display for RowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowStatus::Active => write!(f, "active"),
            RowStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Relational projection of a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub id: i64,
    pub service: String,
    pub zone: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub proto: String,
    pub description: String,
    pub content_hash: String,
    pub status: RowStatus,
    pub hash_verified: bool,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

/// Search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub service: String,
    pub zone: String,
    #[serde(rename = "type")]
    pub typ: String,
}

/// One page of search hits plus the independent total
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub services: Vec<ServiceSummary>,
    pub total: i64,
}

// =============================================================================
// Search Index Port
// =============================================================================

/// Secondary, searchable projection of service descriptors
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upsert rows as active but not yet hash-verified
    async fn upsert_pending(&self, descriptors: &[ServiceDescriptor]) -> Result<()>;

    /// Mark rows verified when their stored hash matches
    async fn mark_verified(&self, descriptors: &[ServiceDescriptor]) -> Result<()>;

    /// Upsert rows as active and verified in one step
    async fn upsert_verified(&self, descriptor: &ServiceDescriptor) -> Result<()>;

    /// Soft-delete one zone, or every zone when `zone` is `None`
    async fn soft_delete(&self, service: &str, zone: Option<&str>) -> Result<u64>;

    /// Substring search over active, verified rows
    async fn search(&self, query: &str, skip: i64, limit: i64) -> Result<SearchPage>;

    async fn find(&self, service: &str, zone: &str) -> Result<Option<IndexRow>>;

    /// Rows with `id > after_id`, ordered by id
    async fn page_after(&self, after_id: i64, limit: i64) -> Result<Vec<IndexRow>>;
}

// =============================================================================
// Config Ledger Port
// =============================================================================

/// Relational bookkeeping for config writes and reads
#[async_trait]
pub trait ConfigLedger: Send + Sync {
    /// Upsert the current row and append a history entry atomically
    async fn record_put(&self, change: &ConfigChange) -> Result<()>;

    async fn mark_deleted(&self, name: &str) -> Result<()>;

    /// Remember which version an application node last observed
    async fn record_observed(&self, app_id: i64, node: &str, name: &str, version: i64) -> Result<()>;

    async fn observed_version(&self, app_id: i64, node: &str, name: &str) -> Result<Option<i64>>;

    /// Active configs, newest modification first, with the total count
    async fn list(&self, tag: &str, prefix: &str, skip: i64, limit: i64)
        -> Result<(i64, Vec<ConfigInfo>)>;

    async fn history(&self, name: &str) -> Result<Vec<ConfigHistoryEntry>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type SearchIndexRef = Arc<dyn SearchIndex>;
pub type ConfigLedgerRef = Arc<dyn ConfigLedger>;
