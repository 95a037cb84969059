//! Port-mapping parsing shared between configuration validation and the
//! deployment engine's container creation step (spec §8 scenario S6):
//! extracts the set of host-exposed ports that firewall rules must open,
//! excluding loopback-bound mappings and container-only (unmapped) ports.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

/// Parses one `docker run`-style port mapping string. Accepted shapes:
/// `"host:container"`, `"host:container/proto"`,
/// `"bind_ip:host:container[/proto]"`, and container-only `"container[/proto]"`
/// (no host exposure at all).
fn parse_mapping(raw: &str) -> Option<(Option<String>, u16, Protocol)> {
    let (spec, proto) = match raw.rsplit_once('/') {
        Some((s, p)) if p.eq_ignore_ascii_case("udp") => (s, Protocol::Udp),
        Some((s, p)) if p.eq_ignore_ascii_case("tcp") => (s, Protocol::Tcp),
        _ => (raw, Protocol::Tcp),
    };

    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [container] => {
            let _ = container.parse::<u16>().ok()?;
            None // container-only: no host exposure
        }
        [host, _container] => {
            let host_port = host.parse::<u16>().ok()?;
            Some((None, host_port, proto))
        }
        [bind_ip, host, _container] => {
            let host_port = host.parse::<u16>().ok()?;
            Some((Some((*bind_ip).to_owned()), host_port, proto))
        }
        _ => None,
    }
}

/// Returns the set of ports that should be opened on the host firewall:
/// every mapping that exposes a host port, except those explicitly bound
/// to loopback (`127.0.0.1:...`) and container-only mappings with no host
/// exposure at all.
pub fn extract_firewall_ports(mappings: &[&str]) -> Vec<ExposedPort> {
    let mut out = Vec::new();
    for raw in mappings {
        let Some((bind_ip, port, protocol)) = parse_mapping(raw) else {
            continue;
        };
        if let Some(ip) = &bind_ip {
            if ip == "127.0.0.1" || ip == "::1" {
                continue;
            }
        }
        out.push(ExposedPort { port, protocol });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s6() {
        let mappings = ["127.0.0.1:3000:3000", "80:8080/tcp", "5432/tcp"];
        let result = extract_firewall_ports(&mappings);
        assert_eq!(
            result,
            vec![ExposedPort {
                port: 80,
                protocol: Protocol::Tcp
            }]
        );
    }
}
