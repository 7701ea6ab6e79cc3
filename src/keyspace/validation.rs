//! Input validation for names, services, zones and endpoint addresses

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z][a-z0-9_.-]{5,}$").unwrap());

static VALID_SERVICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z][a-z0-9_.-]{5,}:[a-z0-9][a-z0-9_.-]*$").unwrap());

static VALID_ZONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[a-z0-9][a-z0-9_-]*$").unwrap());

static VALID_ADDRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[a-z0-9:_.-]+$").unwrap());

static VALID_NAME_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-z][a-z0-9_.-]?$").unwrap());

/// Config item or bare service name
pub fn check_name(name: &str) -> Result<()> {
    if VALID_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Range bound for config names; empty means unbounded
pub fn check_name_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || VALID_NAME_PREFIX.is_match(prefix) {
        Ok(())
    } else {
        Err(Error::InvalidName(prefix.to_string()))
    }
}

/// `name:version`
pub fn check_service(service: &str) -> Result<()> {
    if VALID_SERVICE.is_match(service) {
        Ok(())
    } else {
        Err(Error::InvalidService(service.to_string()))
    }
}

pub fn check_zone(zone: &str) -> Result<()> {
    if VALID_ZONE.is_match(zone) {
        Ok(())
    } else {
        Err(Error::InvalidZone(zone.to_string()))
    }
}

pub fn check_service_zone(service: &str, zone: &str) -> Result<()> {
    check_service(service)?;
    check_zone(zone)
}

// =============================================================================
// Address Policy
// =============================================================================

/// Address charset check plus an operator-supplied ban-list
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    banned: Vec<Regex>,
}

impl AddressPolicy {
    /// Compile ban-list patterns; a bad pattern is a startup error
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let banned = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    Error::InvalidParam(format!("invalid banned address {}: {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { banned })
    }

    pub fn is_banned(&self, address: &str) -> bool {
        self.banned.iter().any(|r| r.is_match(address))
    }

    pub fn check(&self, address: &str) -> Result<()> {
        if address.is_empty() {
            return Err(Error::InvalidEndpoint("missing address".into()));
        }
        if !VALID_ADDRESS.is_match(address) {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        if self.is_banned(address) {
            return Err(Error::InvalidAddress("banned".into()));
        }
        Ok(())
    }
}
