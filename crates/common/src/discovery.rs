//! Endpoint discovery (spec §4.4): public IP via IP-echo services, private
//! IPs via interface enumeration, ordered `[public, private...]` list each
//! suffixed with the WireGuard listen port.

use crate::error::DiscoveryError;
use crate::model::{Endpoint, EndpointList};
use crate::wireguard::LISTEN_PORT;
use regex::Regex;
use std::net::Ipv4Addr;
use std::time::Duration;

const IP_ECHO_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

const INTERFACE_EXCLUDE_PREFIXES: &[&str] = &["docker", "br-", "wg"];

fn ipv4_regex() -> Regex {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap()
}

async fn query_public_ip() -> Option<Ipv4Addr> {
    let re = ipv4_regex();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;
    for url in IP_ECHO_SERVICES {
        let Ok(resp) = client.get(*url).send().await else {
            continue;
        };
        let Ok(text) = resp.text().await else {
            continue;
        };
        if let Some(m) = re.find(text.trim()) {
            if let Ok(ip) = m.as_str().parse::<Ipv4Addr>() {
                return Some(ip);
            }
        }
    }
    None
}

fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
}

/// Names of interfaces currently in state UP. `if-addrs` has no concept of
/// link state, so this is sourced separately from `pnet_datalink`, whose
/// `NetworkInterface::is_up()` reports the kernel's IFF_UP flag.
fn up_interface_names() -> std::collections::HashSet<String> {
    pnet_datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up())
        .map(|iface| iface.name)
        .collect()
}

fn private_ips(fabric_iface_prefix: &str) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let up = up_interface_names();
    let mut out = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let name = iface.name.to_lowercase();
        if INTERFACE_EXCLUDE_PREFIXES
            .iter()
            .any(|p| name.starts_with(p))
            || name.starts_with(&fabric_iface_prefix.to_lowercase())
        {
            continue;
        }
        if !up.contains(&iface.name) {
            continue;
        }
        if let std::net::IpAddr::V4(ip) = iface.ip() {
            if is_rfc1918(ip) {
                out.push(ip);
            }
        }
    }
    Ok(out)
}

/// Discovers this host's endpoint list: public IP first (via up to three
/// IP-echo services), then any private IPs on non-excluded, up interfaces
/// in RFC 1918 ranges. Falls back to `fallback_hostname` if both discovery
/// paths turn up nothing.
pub async fn discover_endpoints(
    fabric_iface_prefix: &str,
    fallback_hostname: &str,
) -> Result<EndpointList, DiscoveryError> {
    let mut endpoints = Vec::new();

    if let Some(public_ip) = query_public_ip().await {
        endpoints.push(Endpoint {
            host: public_ip.to_string(),
            port: LISTEN_PORT,
        });
    }

    for ip in private_ips(fabric_iface_prefix)? {
        endpoints.push(Endpoint {
            host: ip.to_string(),
            port: LISTEN_PORT,
        });
    }

    if endpoints.is_empty() {
        endpoints.push(Endpoint {
            host: fallback_hostname.to_owned(),
            port: LISTEN_PORT,
        });
    }

    EndpointList::new(endpoints).ok_or(DiscoveryError::NoEndpointsDiscovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1918_ranges() {
        assert!(is_rfc1918("10.0.0.1".parse().unwrap()));
        assert!(is_rfc1918("172.16.0.1".parse().unwrap()));
        assert!(!is_rfc1918("172.32.0.1".parse().unwrap()));
        assert!(is_rfc1918("192.168.1.1".parse().unwrap()));
        assert!(!is_rfc1918("8.8.8.8".parse().unwrap()));
    }
}
