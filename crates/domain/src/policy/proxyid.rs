use crate::common::entity::{EndpointId, Protocol};
use crate::common::error::DomainError;

use super::key::Key;

/// Unique string identifying a proxy redirect:
/// `"<endpointID>:<ingress|egress>:<protocol>:<port>:<listener>"`.
pub fn proxy_id(
    endpoint_id: EndpointId,
    ingress: bool,
    protocol: &str,
    port: u16,
    listener: &str,
) -> String {
    let direction = if ingress { "ingress" } else { "egress" };
    format!("{endpoint_id}:{direction}:{protocol}:{port}:{listener}")
}

/// Proxy ID for a policy map key's redirect.
pub fn proxy_id_from_key(endpoint_id: EndpointId, key: &Key, listener: &str) -> String {
    proxy_id(
        endpoint_id,
        key.direction().is_ingress(),
        Protocol::from_u8(key.protocol()).as_str(),
        key.dest_port(),
        listener,
    )
}

/// Key for an endpoint's proxy statistics, which may aggregate stats from
/// multiple redirects on the same port:
/// `"<ingress|egress>:<protocol>:<port>:<proxyPort>"`.
pub fn proxy_stats_key(ingress: bool, protocol: &str, port: u16, proxy_port: u16) -> String {
    let direction = if ingress { "ingress" } else { "egress" };
    format!("{direction}:{protocol}:{port}:{proxy_port}")
}

/// Components of a parsed proxy ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProxyId {
    pub endpoint_id: EndpointId,
    pub ingress: bool,
    pub protocol: String,
    pub port: u16,
    pub listener: String,
}

/// Parse a proxy ID produced by [`proxy_id`]. The structure is strict:
/// exactly five colon-separated fields.
pub fn parse_proxy_id(id: &str) -> Result<ParsedProxyId, DomainError> {
    let comps: Vec<&str> = id.split(':').collect();
    if comps.len() != 5 {
        return Err(DomainError::InvalidProxyId(id.to_string()));
    }
    let endpoint_id = comps[0]
        .parse::<u16>()
        .map_err(|_| DomainError::InvalidProxyId(id.to_string()))?;
    let port = comps[3]
        .parse::<u16>()
        .map_err(|_| DomainError::InvalidProxyId(id.to_string()))?;
    Ok(ParsedProxyId {
        endpoint_id: EndpointId(endpoint_id),
        ingress: comps[1] == "ingress",
        protocol: comps[2].to_string(),
        port,
        listener: comps[4].to_string(),
    })
}
