//! Pure function from a server row plus its peer set to a WireGuard config
//! text plus the set of routing/firewall commands needed to install it
//! (spec §4.3), and the key-material + management-IP derivation the spec
//! depends on (spec §6 "Derived identifiers").

use crate::model::{EndpointList, Server};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::net::Ipv6Addr;

pub const LISTEN_PORT: u16 = 51820;
pub const MTU: u16 = 1420;
pub const PERSISTENT_KEEPALIVE_SECS: u32 = 25;

/// Curve25519 keypair for a host's WireGuard interface. The private key is
/// generated once on the host and never written to the replicated store;
/// only the base64 public key travels in a `server` row.
pub struct WireguardKeypair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl WireguardKeypair {
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_private_key_bytes(bytes: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(bytes);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn private_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.secret.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.public.as_bytes())
    }
}

/// Derives the /128 management IPv6 address in `fdcc::/16` from the
/// SHA-256 digest of a base64-encoded WireGuard public key (spec §6,
/// testable property 2, scenario S2).
pub fn derive_management_ip(public_key_b64: &str) -> Ipv6Addr {
    let digest = Sha256::digest(public_key_b64.as_bytes());
    // bytes 0..14 of the digest become the 7 groups after the `fdcc`
    // prefix group (8 groups total, 16 bits each).
    let mut groups = [0u16; 8];
    groups[0] = 0xfdcc;
    for i in 0..7 {
        groups[i + 1] = u16::from_be_bytes([digest[2 * i], digest[2 * i + 1]]);
    }
    Ipv6Addr::new(
        groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6], groups[7],
    )
}

/// One idempotent `ip`/`iptables`/`sysctl` invocation needed to install the
/// routing/firewall rules a WireGuard config requires (spec §4.3). Kept as
/// data rather than shelling out directly so this module stays pure and
/// testable; only `meridian-daemon` executes these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl RoutingCommand {
    fn new(program: &'static str, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

fn args(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_owned).collect()
}

/// Builds the routing/firewall command set for one host given its own
/// server row, its container subnet, and the cluster CIDR. Order matters:
/// both RETURN rules must precede any MASQUERADE rule that could match
/// them, and the container RETURN rule is inserted (`-I 1`) rather than
/// appended.
pub fn build_routing_commands(
    iface: &str,
    local_container_subnet: ipnet::Ipv4Net,
    local_wireguard_subnet: ipnet::Ipv4Net,
    cluster_cidr: ipnet::Ipv4Net,
    peer_container_subnets: &[ipnet::Ipv4Net],
) -> Vec<RoutingCommand> {
    let mut cmds = Vec::new();

    cmds.push(RoutingCommand::new(
        "sysctl",
        args("-w net.ipv4.ip_forward=1"),
    ));

    for peer_subnet in peer_container_subnets {
        cmds.push(RoutingCommand::new(
            "ip",
            args(&format!("route add {peer_subnet} dev {iface}")),
        ));
    }

    cmds.push(RoutingCommand::new(
        "iptables",
        args(&format!(
            "-A FORWARD -i {iface} -o br-meridian -j ACCEPT"
        )),
    ));
    cmds.push(RoutingCommand::new(
        "iptables",
        args(&format!(
            "-A FORWARD -i br-meridian -o {iface} -j ACCEPT"
        )),
    ));

    // Container-source RETURN rule: bypass masquerade for cross-host
    // container traffic. Inserted at position 1, not appended, so it
    // precedes any MASQUERADE rule already in the chain.
    cmds.push(RoutingCommand::new(
        "iptables",
        args(&format!(
            "-t nat -I POSTROUTING 1 -s {local_container_subnet} -d {cluster_cidr} -j RETURN"
        )),
    ));

    // WireGuard-source RETURN rule precedes the MASQUERADE rule below for
    // the same reason.
    cmds.push(RoutingCommand::new(
        "iptables",
        args(&format!(
            "-t nat -I POSTROUTING 1 -s {local_wireguard_subnet} -d {cluster_cidr} -j RETURN"
        )),
    ));

    cmds.push(RoutingCommand::new(
        "iptables",
        args(&format!(
            "-t nat -A POSTROUTING -s {local_wireguard_subnet} ! -o {iface} -j MASQUERADE"
        )),
    ));

    cmds.push(RoutingCommand::new(
        "iptables",
        args("-A FORWARD -m state --state ESTABLISHED,RELATED -j ACCEPT"),
    ));

    cmds
}

/// Renders the `[Interface]`/`[Peer]` sections of `<iface>.conf` for
/// `self_server` given its private key and the set of active peers. The
/// private key never lives in a `Server` row; it's passed in separately.
pub fn build_interface_config(
    self_server: &Server,
    self_container_subnet: ipnet::Ipv4Net,
    private_key_b64: &str,
    peers: &[(Server, ipnet::Ipv4Net, Option<std::net::IpAddr>)],
) -> String {
    let mut out = String::new();

    let _ = self_container_subnet; // address list derives from self_server.subnet only
    writeln!(out, "[Interface]").unwrap();
    writeln!(out, "PrivateKey = {private_key_b64}").unwrap();
    writeln!(
        out,
        "Address = {}/24, {}/128",
        self_server.wireguard_ip, self_server.management_ip
    )
    .unwrap();
    writeln!(out, "ListenPort = {LISTEN_PORT}").unwrap();
    writeln!(out, "MTU = {MTU}").unwrap();
    writeln!(out).unwrap();

    for (peer, peer_container_subnet, endpoint_override) in peers {
        let wg_subnet = ipnet::Ipv4Net::new(peer.wireguard_ip, 24).unwrap();
        let endpoint = endpoint_override
            .map(|ip| crate::model::Endpoint {
                host: ip.to_string(),
                port: LISTEN_PORT,
            })
            .unwrap_or_else(|| peer.endpoints.first().clone());

        writeln!(out, "[Peer]").unwrap();
        writeln!(out, "PublicKey = {}", peer.wireguard_public_key).unwrap();
        writeln!(
            out,
            "AllowedIPs = {}, {}, {}/128",
            wg_subnet, peer_container_subnet, peer.management_ip
        )
        .unwrap();
        writeln!(out, "Endpoint = {endpoint}").unwrap();
        writeln!(out, "PersistentKeepalive = {PERSISTENT_KEEPALIVE_SECS}").unwrap();
        writeln!(out).unwrap();
    }

    out
}

/// Picks the best endpoint at peering time: when both sides have private
/// IPs on a shared /24, the private IP wins; otherwise fall back to the
/// public (first) endpoint. This is computed fresh each time, never
/// stored (spec §4.4).
pub fn preferred_endpoint(local: &EndpointList, remote: &EndpointList) -> crate::model::Endpoint {
    for local_ep in local.as_slice().iter().skip(1) {
        for remote_ep in remote.as_slice().iter().skip(1) {
            if let (Ok(a), Ok(b)) = (
                local_ep.host.parse::<std::net::Ipv4Addr>(),
                remote_ep.host.parse::<std::net::Ipv4Addr>(),
            ) {
                let a_net = ipnet::Ipv4Net::new(a, 24).unwrap().trunc();
                if a_net.contains(&b) {
                    return remote_ep.clone();
                }
            }
        }
    }
    remote.first().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_ip_is_in_fdcc_block_and_deterministic() {
        let ip1 = derive_management_ip("abc123==");
        let ip2 = derive_management_ip("abc123==");
        assert_eq!(ip1, ip2);
        assert_eq!(ip1.segments()[0], 0xfdcc);
    }

    #[test]
    fn management_ip_differs_for_distinct_keys() {
        let ip1 = derive_management_ip("key-one");
        let ip2 = derive_management_ip("key-two");
        assert_ne!(ip1, ip2);
    }

    #[test]
    fn routing_commands_order_return_before_masquerade() {
        let cluster: ipnet::Ipv4Net = "10.210.0.0/16".parse().unwrap();
        let cmds = build_routing_commands(
            "wg0",
            "10.210.128.0/24".parse().unwrap(),
            "10.210.0.0/24".parse().unwrap(),
            cluster,
            &["10.210.129.0/24".parse().unwrap()],
        );
        let masquerade_idx = cmds
            .iter()
            .position(|c| c.args.iter().any(|a| a == "MASQUERADE"))
            .unwrap();
        let return_idxs: Vec<_> = cmds
            .iter()
            .enumerate()
            .filter(|(_, c)| c.args.iter().any(|a| a == "RETURN"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(return_idxs.len(), 2);
        assert!(return_idxs.iter().all(|&i| i < masquerade_idx));
    }
}
