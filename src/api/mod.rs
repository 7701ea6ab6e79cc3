//! Response Envelope
//!
//! Result payloads and the uniform `{ok, result?, error?}` envelope an HTTP
//! adapter wraps every operation in. Domain failures travel with status 200;
//! system errors get a 5xx status.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigItem, SearchPage, ServiceSnapshot, ServiceSummary, ServiceZones};
use crate::error::{Error, Result};
use crate::store::{LeaseGrant, LeaseId, Revision};

pub use crate::registry::{DEFAULT_SERVICE_TTL, MIN_SERVICE_TTL};

/// Watch timeout when a caller does not pass one
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> Envelope<T> {
    pub fn ok(result: T) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// The message is already caller-safe; store detail never reaches it
    pub fn from_error(err: &Error) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.message().to_string(),
            }),
        }
    }
}

/// HTTP status plus envelope for an operation result
pub fn respond<T>(result: Result<T>) -> (u16, Envelope<T>) {
    match result {
        Ok(value) => (200, Envelope::ok(value)),
        Err(err) => (err.http_status(), Envelope::from_error(&err)),
    }
}

// =============================================================================
// Result Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugResult {
    pub lease_id: LeaseId,
    pub ttl: i64,
}

impl From<LeaseGrant> for PlugResult {
    fn from(grant: LeaseGrant) -> Self {
        Self {
            lease_id: grant.id,
            ttl: grant.ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResult {
    pub service: ServiceSnapshot,
    pub revision: Revision,
}

impl From<(ServiceSnapshot, Revision)> for ServiceResult {
    fn from((service, revision): (ServiceSnapshot, Revision)) -> Self {
        Self { service, revision }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceZonesResult {
    pub service: ServiceZones,
    pub revision: Revision,
}

impl From<(ServiceZones, Revision)> for ServiceZonesResult {
    fn from((service, revision): (ServiceZones, Revision)) -> Self {
        Self { service, revision }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResult {
    pub config: ConfigItem,
    pub revision: Revision,
}

impl From<(ConfigItem, Revision)> for ConfigResult {
    fn from((config, revision): (ConfigItem, Revision)) -> Self {
        Self { config, revision }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPutResult {
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRangeResult {
    pub configs: Vec<ConfigItem>,
    pub more: bool,
}

impl From<(Vec<ConfigItem>, bool)> for ConfigRangeResult {
    fn from((configs, more): (Vec<ConfigItem>, bool)) -> Self {
        Self { configs, more }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub services: Vec<ServiceSummary>,
    pub total: i64,
}

impl From<SearchPage> for SearchResult {
    fn from(page: SearchPage) -> Self {
        Self {
            services: page.services,
            total: page.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreError, StoreStatus};

    #[test]
    fn test_ok_envelope_shape() {
        let (status, envelope) = respond(Ok(PlugResult::from(LeaseGrant { id: 7, ttl: 60 })));
        assert_eq!(status, 200);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["result"]["lease_id"], 7);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_domain_error_envelope() {
        let (status, envelope) =
            respond::<ConfigPutResult>(Err(Error::InvalidVersion("db.max_conns@3".into())));
        assert_eq!(status, 200);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "INVALID_VERSION");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_system_error_status() {
        let err = Error::from_store(
            StoreError::new(StoreStatus::Unavailable, "dial tcp 10.1.1.1:2379"),
            "put config fail",
        );
        let (status, envelope) = respond::<ConfigPutResult>(Err(err));
        assert_eq!(status, 503);
        let error = envelope.error.unwrap();
        assert_eq!(error.code, "SYSTEM_ERROR");
        assert_eq!(error.message, "put config fail");
    }

    #[test]
    fn test_range_result_from_tuple() {
        let item = ConfigItem {
            name: "db.max_conns".into(),
            value: "50".into(),
            version: 3,
        };
        let result = ConfigRangeResult::from((vec![item], true));
        assert!(result.more);
        assert_eq!(result.configs[0].version, 3);
    }
}
