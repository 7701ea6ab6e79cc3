//! Endpoint Resolver
//!
//! Decodes stored endpoint values and rewrites their addresses for the
//! requesting client, so callers on different networks can reach the same
//! logical endpoint through different addresses.

use std::net::{IpAddr, SocketAddr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::ServiceEndpoint;
use crate::error::{Error, Result};
use crate::store::KeyValue;

/// Address mapping rule as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetMappingRule {
    /// Clients inside this network see the rewritten address
    pub src_net: String,
    /// Replacement host; the endpoint port is kept
    pub dest_ip: String,
    /// Only rewrite endpoints inside this network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_net: Option<String>,
}

/// Parsed mapping rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMapping {
    pub src_net: IpNetwork,
    pub dest_ip: IpAddr,
    pub endpoint_net: Option<IpNetwork>,
}

impl NetMapping {
    pub fn parse(rule: &NetMappingRule) -> Result<Self> {
        let src_net = rule
            .src_net
            .parse::<IpNetwork>()
            .map_err(|_| Error::InvalidParam(format!("invalid src_net: {}", rule.src_net)))?;
        let dest_ip = rule
            .dest_ip
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidParam(format!("invalid dest_ip: {}", rule.dest_ip)))?;
        let endpoint_net = rule
            .endpoint_net
            .as_deref()
            .map(|net| {
                net.parse::<IpNetwork>()
                    .map_err(|_| Error::InvalidParam(format!("invalid endpoint_net: {}", net)))
            })
            .transpose()?;
        Ok(Self {
            src_net,
            dest_ip,
            endpoint_net,
        })
    }

    fn applies(&self, client: IpAddr, endpoint: IpAddr) -> bool {
        self.src_net.contains(client)
            && self.endpoint_net.map_or(true, |net| net.contains(endpoint))
    }
}

/// Decodes endpoint values and applies the mapping table
#[derive(Debug, Clone, Default)]
pub struct EndpointResolver {
    mappings: Vec<NetMapping>,
}

impl EndpointResolver {
    pub fn new(mappings: Vec<NetMapping>) -> Self {
        Self { mappings }
    }

    pub fn from_rules(rules: &[NetMappingRule]) -> Result<Self> {
        let mappings = rules.iter().map(NetMapping::parse).collect::<Result<Vec<_>>>()?;
        Ok(Self::new(mappings))
    }

    /// First matching rule wins. Addresses that are not `ip:port`, and
    /// requests without a client IP, pass through unchanged.
    pub fn map_address(&self, address: &str, client: Option<IpAddr>) -> String {
        let (Some(client), Ok(endpoint)) = (client, address.parse::<SocketAddr>()) else {
            return address.to_string();
        };
        self.mappings
            .iter()
            .find(|m| m.applies(client, endpoint.ip()))
            .map(|m| SocketAddr::new(m.dest_ip, endpoint.port()).to_string())
            .unwrap_or_else(|| address.to_string())
    }

    /// Parse one stored endpoint value
    pub fn decode(&self, kv: &KeyValue) -> Result<ServiceEndpoint> {
        serde_json::from_slice(&kv.value).map_err(|e| {
            error!(key = %kv.key, error = %e, "unmarshal endpoint fail");
            Error::DamagedEndpointValue(kv.key.clone())
        })
    }

    /// Decode and rewrite for `client`
    pub fn resolve(&self, kv: &KeyValue, client: Option<IpAddr>) -> Result<ServiceEndpoint> {
        let mut endpoint = self.decode(kv)?;
        endpoint.address = self.map_address(&endpoint.address, client);
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn rule(src: &str, dest: &str, endpoint: Option<&str>) -> NetMappingRule {
        NetMappingRule {
            src_net: src.into(),
            dest_ip: dest.into(),
            endpoint_net: endpoint.map(str::to_string),
        }
    }

    fn kv(value: &str) -> KeyValue {
        KeyValue {
            key: "/services/orderSvc:1.0/default/node_10.0.0.5:9000".into(),
            value: Bytes::from(value.to_string()),
            create_revision: 2,
            mod_revision: 2,
            version: 1,
            lease: 0,
        }
    }

    #[test]
    fn test_mapping_for_client_inside_subnet() {
        let resolver =
            EndpointResolver::from_rules(&[rule("192.168.0.0/16", "203.0.113.7", None)]).unwrap();
        let client: IpAddr = "192.168.4.20".parse().unwrap();
        assert_eq!(
            resolver.map_address("10.0.0.5:9000", Some(client)),
            "203.0.113.7:9000"
        );
    }

    #[test]
    fn test_non_matching_passes_through() {
        let resolver =
            EndpointResolver::from_rules(&[rule("192.168.0.0/16", "203.0.113.7", None)]).unwrap();
        let outside: IpAddr = "172.16.0.1".parse().unwrap();
        assert_eq!(resolver.map_address("10.0.0.5:9000", Some(outside)), "10.0.0.5:9000");
        assert_eq!(resolver.map_address("10.0.0.5:9000", None), "10.0.0.5:9000");
        let inside: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(resolver.map_address("orders.local:9000", Some(inside)), "orders.local:9000");
    }

    #[test]
    fn test_endpoint_net_restriction() {
        let resolver = EndpointResolver::from_rules(&[rule(
            "192.168.0.0/16",
            "203.0.113.7",
            Some("10.0.0.0/8"),
        )])
        .unwrap();
        let client: IpAddr = "192.168.4.20".parse().unwrap();
        assert_eq!(resolver.map_address("10.1.2.3:80", Some(client)), "203.0.113.7:80");
        assert_eq!(resolver.map_address("172.20.0.9:80", Some(client)), "172.20.0.9:80");
    }

    #[test]
    fn test_invalid_rules() {
        assert_matches!(
            EndpointResolver::from_rules(&[rule("not-a-net", "1.2.3.4", None)]),
            Err(Error::InvalidParam(_))
        );
        assert_matches!(
            EndpointResolver::from_rules(&[rule("10.0.0.0/8", "nope", None)]),
            Err(Error::InvalidParam(_))
        );
    }

    #[test]
    fn test_decode() {
        let resolver = EndpointResolver::default();
        let endpoint = resolver
            .decode(&kv(r#"{"type":"grpc","address":"10.0.0.5:9000"}"#))
            .unwrap();
        assert_eq!(endpoint.typ, "grpc");
        assert_matches!(resolver.decode(&kv("{broken")), Err(Error::DamagedEndpointValue(_)));
    }
}
