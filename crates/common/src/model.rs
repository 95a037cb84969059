//! Row types for the four replicated tables described in the data model:
//! `server`, `container`, `service`, `cluster_metadata`. Every row is owned
//! by exactly one host; CRDT merge is last-writer-wins per column using the
//! store's logical timestamp, which is why none of these carry a version
//! field of their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `host:port` a WireGuard peer may be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint {s:?} missing port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("endpoint {s:?} has invalid port"))?;
        Ok(Endpoint {
            host: host.to_owned(),
            port,
        })
    }
}

/// Ordered, non-empty list of endpoint candidates: public first, then
/// private. Supports the rotation rule used by peer health monitoring
/// (spec §4.5 step 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointList(Vec<Endpoint>);

impl EndpointList {
    pub fn new(endpoints: Vec<Endpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            None
        } else {
            Some(Self(endpoints))
        }
    }

    pub fn as_slice(&self) -> &[Endpoint] {
        &self.0
    }

    pub fn first(&self) -> &Endpoint {
        &self.0[0]
    }

    /// Rotate past `current`, returning the next candidate modularly. A
    /// one-element list is a no-op: it returns `current` back unchanged.
    pub fn rotate_past(&self, current: &Endpoint) -> Endpoint {
        if self.0.len() <= 1 {
            return current.clone();
        }
        match self.0.iter().position(|e| e == current) {
            Some(idx) => self.0[(idx + 1) % self.0.len()].clone(),
            // current isn't a member of this list (e.g. it was never
            // written back after a prior rotation); fall back to the
            // first candidate rather than guessing a position.
            None => self.0[0].clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// One row per host in the fabric (spec §3 `server`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub hostname: String,
    pub subnet: ipnet::Ipv4Net,
    pub wireguard_ip: std::net::Ipv4Addr,
    pub wireguard_public_key: String,
    pub management_ip: std::net::Ipv6Addr,
    pub endpoints: EndpointList,
    pub last_seen_ms: u64,
}

/// One row per deployed container instance (spec §3 `container`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub service: String,
    pub server_id: String,
    pub ip: Option<std::net::IpAddr>,
    pub started_at_ms: u64,
    pub instance_id: Option<String>,
    pub health_status: HealthStatus,
    pub last_health_check_ms: u64,
    pub consecutive_failures: u32,
    pub health_port: Option<u16>,
}

/// Logical service metadata, written by the deployment engine only (spec §3
/// `service`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub project: String,
}

/// Free-form cluster bootstrap metadata (spec §3 `cluster_metadata`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub cluster_cidr: ipnet::Ipv4Net,
    pub service_domain: String,
    pub discovery: String,
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn rotation_wraps_modularly() {
        let list = EndpointList::new(vec![ep("a:1"), ep("b:1"), ep("c:1")]).unwrap();
        assert_eq!(list.rotate_past(&ep("b:1")), ep("c:1"));
        assert_eq!(list.rotate_past(&ep("c:1")), ep("a:1"));
    }

    #[test]
    fn rotation_is_noop_for_single_element() {
        let list = EndpointList::new(vec![ep("a:1")]).unwrap();
        assert_eq!(list.rotate_past(&ep("a:1")), ep("a:1"));
    }
}
