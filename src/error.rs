//! Error types for the service registry
//!
//! Every operation returns one of a fixed set of error kinds. Callers see a
//! stable wire code plus a safe message; store and database failures are
//! translated here and nowhere else.

use thiserror::Error;
use tracing::error;

use crate::store::{StoreError, StoreStatus};

/// Unified error type for the registry and config engines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Input Validation
    // =========================================================================
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid service: {0}")]
    InvalidService(String),

    #[error("invalid zone: {0}")]
    InvalidZone(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid param: {0}")]
    InvalidParam(String),

    #[error("missing param: {0}")]
    MissingParam(String),

    // =========================================================================
    // Conditional Write Outcomes
    // =========================================================================
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("changed service descriptor: {0}")]
    ChangedServiceDesc(String),

    #[error("name duplicated: {0}")]
    NameDuplicated(String),

    #[error("too many attempts: {0}")]
    TooManyAttempts(String),

    // =========================================================================
    // Lookup & Watch Outcomes
    // =========================================================================
    #[error("not found: {0}")]
    NotFound(String),

    #[error("deleted: {0}")]
    Deleted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("canceled: {0}")]
    Canceled(String),

    // =========================================================================
    // Data & System
    // =========================================================================
    #[error("damaged endpoint value: {0}")]
    DamagedEndpointValue(String),

    #[error("system error: {0}")]
    SystemError(String),
}

impl Error {
    /// Wire code carried in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidName(_) => "INVALID_NAME",
            Error::InvalidService(_) => "INVALID_SERVICE",
            Error::InvalidZone(_) => "INVALID_ZONE",
            Error::InvalidAddress(_) => "INVALID_ADDRESS",
            Error::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            Error::InvalidParam(_) => "INVALID_PARAM",
            Error::MissingParam(_) => "MISSING_PARAM",
            Error::InvalidVersion(_) => "INVALID_VERSION",
            Error::ChangedServiceDesc(_) => "CHANGED_SERVICE_DESC",
            Error::NameDuplicated(_) => "NAME_DUPLICATED",
            Error::TooManyAttempts(_) => "TOO_MANY_ATTEMPTS",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Deleted(_) => "DELETED",
            Error::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            Error::Canceled(_) => "CANCELED",
            Error::DamagedEndpointValue(_) => "DAMAGED_ENDPOINT_VALUE",
            Error::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Caller-facing message, without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidName(m)
            | Error::InvalidService(m)
            | Error::InvalidZone(m)
            | Error::InvalidAddress(m)
            | Error::InvalidEndpoint(m)
            | Error::InvalidParam(m)
            | Error::MissingParam(m)
            | Error::InvalidVersion(m)
            | Error::ChangedServiceDesc(m)
            | Error::NameDuplicated(m)
            | Error::TooManyAttempts(m)
            | Error::NotFound(m)
            | Error::Deleted(m)
            | Error::DeadlineExceeded(m)
            | Error::Canceled(m)
            | Error::DamagedEndpointValue(m)
            | Error::SystemError(m) => m,
        }
    }

    /// Unrecoverable failure whose detail stays server-side
    pub fn is_system(&self) -> bool {
        matches!(self, Error::SystemError(_))
    }

    /// Input was rejected before touching the store
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidName(_)
                | Error::InvalidService(_)
                | Error::InvalidZone(_)
                | Error::InvalidAddress(_)
                | Error::InvalidEndpoint(_)
                | Error::InvalidParam(_)
                | Error::MissingParam(_)
        )
    }

    /// Check if the same call may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DeadlineExceeded(_) | Error::TooManyAttempts(_) | Error::SystemError(_)
        )
    }

    /// HTTP status an adapter should use for this error
    pub fn http_status(&self) -> u16 {
        if self.is_system() {
            503
        } else {
            200
        }
    }

    // =========================================================================
    // Translation Points
    // =========================================================================

    /// Map a coordination store failure onto the taxonomy.
    ///
    /// `context` becomes the caller-visible message for system errors; the
    /// store detail is only logged.
    pub fn from_store(err: StoreError, context: &str) -> Self {
        match err.status {
            StoreStatus::NotFound => Error::NotFound(context.to_string()),
            StoreStatus::DeadlineExceeded => Error::DeadlineExceeded(context.to_string()),
            StoreStatus::Canceled => Error::Canceled(context.to_string()),
            StoreStatus::Compacted | StoreStatus::Unavailable | StoreStatus::Other => {
                error!(status = ?err.status, detail = %err.detail, "{}", context);
                Error::SystemError(context.to_string())
            }
        }
    }

    /// Map a relational index failure onto the taxonomy
    pub fn from_db(err: sqlx::Error, context: &str) -> Self {
        error!(error = %err, "{}", context);
        Error::SystemError(context.to_string())
    }

    /// Serialization failures are never the caller's fault
    pub fn from_json(err: serde_json::Error, context: &str) -> Self {
        error!(error = %err, "{}", context);
        Error::SystemError(context.to_string())
    }
}

/// Result type alias for the registry
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidName(String::new()).code(), "INVALID_NAME");
        assert_eq!(
            Error::ChangedServiceDesc("x".into()).code(),
            "CHANGED_SERVICE_DESC"
        );
        assert_eq!(Error::SystemError("x".into()).code(), "SYSTEM_ERROR");
        assert_eq!(Error::NotFound("svc".into()).message(), "svc");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(Error::NotFound("x".into()).http_status(), 200);
        assert_eq!(Error::InvalidVersion("x".into()).http_status(), 200);
        assert_eq!(Error::SystemError("x".into()).http_status(), 503);
    }

    #[test]
    fn test_store_translation() {
        let err = Error::from_store(
            StoreError::new(StoreStatus::NotFound, "lease 7 not found"),
            "keepalive fail",
        );
        assert_eq!(err, Error::NotFound("keepalive fail".into()));

        let err = Error::from_store(
            StoreError::new(StoreStatus::DeadlineExceeded, "slow"),
            "query fail",
        );
        assert_eq!(err.code(), "DEADLINE_EXCEEDED");

        let err = Error::from_store(
            StoreError::new(StoreStatus::Unavailable, "connection refused 10.0.0.1"),
            "put fail",
        );
        assert!(err.is_system());
        assert!(!err.message().contains("10.0.0.1"));
    }

    #[test]
    fn test_classification() {
        assert!(Error::InvalidZone("z".into()).is_validation());
        assert!(!Error::NotFound("z".into()).is_validation());
        assert!(Error::DeadlineExceeded("w".into()).is_retryable());
        assert!(!Error::InvalidVersion("v".into()).is_retryable());
    }
}
