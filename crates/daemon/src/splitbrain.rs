//! Split-brain detector (spec §4.5 step 8): detection only, no automated
//! remediation. Flags when fewer than half the known server rows have
//! heartbeated within the last 5 minutes, which only carries meaning once
//! more than one server row exists at all.

use meridian_store::reads::ServerRow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitBrainObservation {
    pub total: usize,
    pub active: usize,
    pub unreachable_hostnames: Vec<String>,
}

const ACTIVE_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Evaluates the split-brain condition over every known server row
/// (including self). Returns `None` when the cluster isn't partitioned
/// (single server, or active fraction at/above half).
pub fn detect(all_servers: &[ServerRow], now_ms: u64) -> Option<SplitBrainObservation> {
    let total = all_servers.len();
    if total <= 1 {
        return None;
    }
    let active: Vec<&ServerRow> = all_servers
        .iter()
        .filter(|s| now_ms.saturating_sub(s.last_seen_ms) <= ACTIVE_WINDOW_MS)
        .collect();
    if active.len() * 2 >= total {
        return None;
    }
    let unreachable_hostnames = all_servers
        .iter()
        .filter(|s| now_ms.saturating_sub(s.last_seen_ms) > ACTIVE_WINDOW_MS)
        .map(|s| s.hostname.clone())
        .collect();
    Some(SplitBrainObservation {
        total,
        active: active.len(),
        unreachable_hostnames,
    })
}

pub fn log_observation(obs: &SplitBrainObservation) {
    log::error!(
        "split-brain suspected: {}/{} servers active, unreachable: {}",
        obs.active,
        obs.total,
        obs.unreachable_hostnames.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(hostname: &str, last_seen_ms: u64) -> ServerRow {
        ServerRow {
            id: hostname.into(),
            hostname: hostname.into(),
            subnet: "10.0.0.0/24".into(),
            wireguard_ip: "10.0.0.1".into(),
            wireguard_public_key: "k".into(),
            management_ip: "fdcc::1".into(),
            endpoints_raw: "".into(),
            last_seen_ms,
        }
    }

    #[test]
    fn single_server_never_split_brain() {
        let now = 1_000_000;
        assert!(detect(&[server("a", now)], now).is_none());
    }

    #[test]
    fn majority_active_is_fine() {
        let now = 1_000_000;
        let servers = vec![server("a", now), server("b", now), server("c", now - 6 * 60_000)];
        assert!(detect(&servers, now).is_none());
    }

    #[test]
    fn minority_active_flags_unreachable_hosts() {
        let now = 1_000_000;
        let stale = now - 6 * 60_000;
        let servers = vec![
            server("a", now),
            server("b", stale),
            server("c", stale),
        ];
        let obs = detect(&servers, now).unwrap();
        assert_eq!(obs.total, 3);
        assert_eq!(obs.active, 1);
        assert_eq!(obs.unreachable_hostnames, vec!["b".to_string(), "c".to_string()]);
    }
}
