//! Peer reconciliation and peer health monitoring (spec §4.5 steps 2–3).
//!
//! Parses `wg show <iface> dump` by the *authoritative* column order, not
//! the positional indices the shell-script source used (spec §9 Open
//! Question): `pubkey, psk, endpoint, allowed-ips,
//! last-handshake-unix-time, rx-bytes, tx-bytes, keepalive`, with
//! last-handshake treated as an integer unix time.

use meridian_common::model::{Endpoint, EndpointList, Server};
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    pub public_key: String,
    pub endpoint: Option<Endpoint>,
    pub allowed_ips: Vec<String>,
    pub last_handshake_unix: i64,
}

fn parse_endpoint(raw: &str) -> Option<Endpoint> {
    if raw == "(none)" {
        return None;
    }
    raw.parse().ok()
}

/// Parses the peer lines of `wg show <iface> dump` output. The first line
/// (interface's own private key/public key/listen port/fwmark) is skipped.
pub fn parse_dump(output: &str) -> Vec<PeerDump> {
    output
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 8 {
                return None;
            }
            Some(PeerDump {
                public_key: cols[0].to_owned(),
                endpoint: parse_endpoint(cols[2]),
                allowed_ips: cols[3].split(',').map(str::to_owned).collect(),
                last_handshake_unix: cols[4].parse().unwrap_or(0),
            })
        })
        .collect()
}

pub async fn show_dump(wg_bin: &str, iface: &str) -> std::io::Result<Vec<PeerDump>> {
    let output = Command::new(wg_bin)
        .arg("show")
        .arg(iface)
        .arg("dump")
        .stdout(Stdio::piped())
        .output()
        .await?;
    Ok(parse_dump(&String::from_utf8_lossy(&output.stdout)))
}

/// Result of diffing the active server set against the currently
/// configured peer set: who needs adding, who needs removing (testable
/// property 3: running this once produces a peer set equal to the active
/// set intersected with "not self").
pub struct PeerDiff<'a> {
    pub to_add: Vec<&'a Server>,
    pub to_remove: Vec<String>,
}

pub fn diff_peers<'a>(active: &'a [Server], configured: &[PeerDump]) -> PeerDiff<'a> {
    let configured_keys: HashSet<&str> =
        configured.iter().map(|p| p.public_key.as_str()).collect();
    let active_keys: HashSet<&str> = active
        .iter()
        .map(|s| s.wireguard_public_key.as_str())
        .collect();

    let to_add = active
        .iter()
        .filter(|s| !configured_keys.contains(s.wireguard_public_key.as_str()))
        .collect();
    let to_remove = configured
        .iter()
        .filter(|p| !active_keys.contains(p.public_key.as_str()))
        .map(|p| p.public_key.clone())
        .collect();

    PeerDiff { to_add, to_remove }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Healthy,
    TentativelyUp,
    Unknown,
    Down,
}

const HANDSHAKE_HEALTHY_SECS: i64 = 15;
const HANDSHAKE_DOWN_SECS: i64 = 275;

/// Classifies a peer's health from its handshake age (spec §4.5 step 3).
/// `endpoint_rotated_recently` covers the "unless endpoint was rotated
/// within this window" carve-out in the tentatively-up band.
pub fn classify_handshake_age(
    handshake_age_secs: i64,
    endpoint_rotated_recently: bool,
) -> PeerHealth {
    if handshake_age_secs < HANDSHAKE_HEALTHY_SECS {
        PeerHealth::Healthy
    } else if handshake_age_secs <= HANDSHAKE_DOWN_SECS {
        if endpoint_rotated_recently {
            PeerHealth::Unknown
        } else {
            PeerHealth::TentativelyUp
        }
    } else {
        PeerHealth::Down
    }
}

/// Rotates a down peer's endpoint to the next candidate in its ordered
/// endpoint list (testable property 4). Returns `None` if rotation would
/// be a no-op (single-element list, or the new candidate equals current).
pub fn rotate_endpoint(current: &Endpoint, candidates: &EndpointList) -> Option<Endpoint> {
    let next = candidates.rotate_past(current);
    if &next == current {
        None
    } else {
        Some(next)
    }
}

pub async fn set_peer_endpoint(
    wg_bin: &str,
    iface: &str,
    public_key: &str,
    endpoint: &Endpoint,
) -> std::io::Result<()> {
    Command::new(wg_bin)
        .arg("set")
        .arg(iface)
        .arg("peer")
        .arg(public_key)
        .arg("endpoint")
        .arg(endpoint.to_string())
        .status()
        .await?;
    Ok(())
}

pub async fn add_peer(
    wg_bin: &str,
    iface: &str,
    public_key: &str,
    allowed_ips: &str,
    endpoint: &Endpoint,
) -> std::io::Result<()> {
    Command::new(wg_bin)
        .arg("set")
        .arg(iface)
        .arg("peer")
        .arg(public_key)
        .arg("allowed-ips")
        .arg(allowed_ips)
        .arg("endpoint")
        .arg(endpoint.to_string())
        .arg("persistent-keepalive")
        .arg(meridian_common::wireguard::PERSISTENT_KEEPALIVE_SECS.to_string())
        .status()
        .await?;
    Ok(())
}

pub async fn remove_peer(wg_bin: &str, iface: &str, public_key: &str) -> std::io::Result<()> {
    Command::new(wg_bin)
        .arg("set")
        .arg(iface)
        .arg("peer")
        .arg(public_key)
        .arg("remove")
        .status()
        .await?;
    Ok(())
}

pub fn handshake_age_secs(last_handshake_unix: i64, now_unix: i64) -> i64 {
    if last_handshake_unix == 0 {
        // never handshaked: treat as maximally stale, not as "just now".
        Duration::from_secs(u64::MAX.min(i64::MAX as u64)).as_secs() as i64
    } else {
        now_unix - last_handshake_unix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authoritative_column_order() {
        let dump = "privkey\tpubkey0\t51820\t0\n\
                     peerkey1\t\t10.0.0.5:51820\t10.210.1.0/24,10.210.129.0/24\t1700000000\t100\t200\t25\n";
        let peers = parse_dump(dump);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "peerkey1");
        assert_eq!(peers[0].endpoint.as_ref().unwrap().host, "10.0.0.5");
        assert_eq!(peers[0].last_handshake_unix, 1700000000);
    }

    #[test]
    fn health_state_machine_bands() {
        assert_eq!(classify_handshake_age(5, false), PeerHealth::Healthy);
        assert_eq!(classify_handshake_age(100, false), PeerHealth::TentativelyUp);
        assert_eq!(classify_handshake_age(100, true), PeerHealth::Unknown);
        assert_eq!(classify_handshake_age(300, false), PeerHealth::Down);
    }

    #[test]
    fn endpoint_rotation_for_three_candidates() {
        let list = EndpointList::new(vec![
            "a:1".parse().unwrap(),
            "b:1".parse().unwrap(),
            "c:1".parse().unwrap(),
        ])
        .unwrap();
        let b: Endpoint = "b:1".parse().unwrap();
        let c: Endpoint = "c:1".parse().unwrap();
        let a: Endpoint = "a:1".parse().unwrap();
        assert_eq!(rotate_endpoint(&b, &list), Some(c.clone()));
        assert_eq!(rotate_endpoint(&c, &list), Some(a));
    }

    #[test]
    fn single_element_rotation_is_noop() {
        let list = EndpointList::new(vec!["a:1".parse().unwrap()]).unwrap();
        let a: Endpoint = "a:1".parse().unwrap();
        assert_eq!(rotate_endpoint(&a, &list), None);
    }

    #[test]
    fn peer_diff_converges_to_active_minus_self() {
        fn server(id: &str, pubkey: &str) -> Server {
            Server {
                id: id.to_owned(),
                hostname: format!("{id}.example.com"),
                subnet: "10.210.0.0/24".parse().unwrap(),
                wireguard_ip: "10.210.0.1".parse().unwrap(),
                wireguard_public_key: pubkey.to_owned(),
                management_ip: "fdcc::1".parse().unwrap(),
                endpoints: EndpointList::new(vec!["1.2.3.4:51820".parse().unwrap()]).unwrap(),
                last_seen_ms: 0,
            }
        }

        let active = vec![server("b", "keyb"), server("c", "keyc")];
        let configured = vec![
            PeerDump {
                public_key: "keya".into(),
                endpoint: None,
                allowed_ips: vec![],
                last_handshake_unix: 0,
            },
            PeerDump {
                public_key: "keyb".into(),
                endpoint: None,
                allowed_ips: vec![],
                last_handshake_unix: 0,
            },
        ];

        let diff = diff_peers(&active, &configured);
        assert_eq!(diff.to_remove, vec!["keya".to_owned()]);
        assert_eq!(diff.to_add.len(), 1);
        assert_eq!(diff.to_add[0].id, "c");
    }
}
