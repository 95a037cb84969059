//! The per-iteration orchestrator (spec §4.5): runs the eight-step task
//! list in order, on every iteration or on its periodic cadence, and
//! never lets one task's error abort the rest ("Uncaught per-task errors
//! are logged and the loop continues").

use crate::config::DaemonConfig;
use crate::{gc, health, heartbeat, splitbrain, store_health, wg};
use meridian_common::model::{Endpoint, EndpointList, Server};
use meridian_store::reads::ServerRow;
use meridian_store::StoreClient;
use std::net::Ipv6Addr;

const WG_BIN: &str = "wg";

pub struct Reconciler {
    pub store: StoreClient,
    pub cfg: DaemonConfig,
    pub iteration: u64,
}

fn server_row_to_model(row: &ServerRow) -> Option<Server> {
    let endpoints: Vec<Endpoint> = serde_json::from_str(&row.endpoints_raw).ok()?;
    Some(Server {
        id: row.id.clone(),
        hostname: row.hostname.clone(),
        subnet: row.subnet.parse().ok()?,
        wireguard_ip: row.wireguard_ip.parse().ok()?,
        wireguard_public_key: row.wireguard_public_key.clone(),
        management_ip: row.management_ip.parse().unwrap_or(Ipv6Addr::UNSPECIFIED),
        endpoints: EndpointList::new(endpoints)?,
        last_seen_ms: row.last_seen_ms,
    })
}

/// Catches and logs an error from one task without propagating it — the
/// loop-continues-on-per-task-failure rule (spec §4.5).
macro_rules! run_task {
    ($name:expr, $body:expr) => {
        match $body.await {
            Ok(()) => {}
            Err(e) => log::error!("task {} failed: {}", $name, e),
        }
    };
}

impl Reconciler {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub async fn run_once(&mut self) {
        let now_ms = self.now_ms();
        let self_id = self.cfg.self_id.clone();

        run_task!("heartbeat", heartbeat::beat(&self.store, &self_id, now_ms));

        self.reconcile_peers(now_ms).await;
        self.sync_container_health().await;

        if self.iteration % self.cfg.gc_every as u64 == 0 {
            self.garbage_collect(now_ms).await;
        }
        if self.iteration % self.cfg.refresh_every as u64 == 0 {
            self.refresh_public_ip(&self_id).await;
        }
        if self.iteration % self.cfg.store_check_every as u64 == 0 {
            match store_health::check(&self.cfg.store_systemd_unit, &self.store).await {
                Ok(_) => {}
                Err(e) => log::error!("task store health check failed: {e}"),
            }
            match meridian_store::reads::self_server(&self.store, &self_id).await {
                Ok(Some(row)) => store_health::warn_if_heartbeat_stale(row.last_seen_ms, now_ms),
                Ok(None) => {}
                Err(e) => log::error!("task store health check failed to read own server row: {e}"),
            }
        }
        if self.iteration % self.cfg.split_brain_every as u64 == 0 {
            self.detect_split_brain(now_ms).await;
        }

        self.iteration += 1;
    }

    async fn reconcile_peers(&self, now_ms: u64) {
        let active = match meridian_store::reads::active_servers(&self.store, &self.cfg.self_id, now_ms).await {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("task peer reconciliation failed to read active servers: {e}");
                return;
            }
        };
        let active_models: Vec<Server> = active.iter().filter_map(server_row_to_model).collect();

        let configured = match wg::show_dump(WG_BIN, &self.cfg.iface).await {
            Ok(d) => d,
            Err(e) => {
                log::error!("task peer reconciliation failed to read wg dump: {e}");
                return;
            }
        };

        let diff = wg::diff_peers(&active_models, &configured);
        for server in diff.to_add {
            let allowed_ips = self.peer_allowed_ips(server);
            let endpoint = server.endpoints.first();
            if let Err(e) = wg::add_peer(
                WG_BIN,
                &self.cfg.iface,
                &server.wireguard_public_key,
                &allowed_ips,
                endpoint,
            )
            .await
            {
                log::error!("failed to add peer {}: {e}", server.id);
            }
        }
        for key in diff.to_remove {
            if let Err(e) = wg::remove_peer(WG_BIN, &self.cfg.iface, &key).await {
                log::error!("failed to remove peer {key}: {e}");
            }
        }

        self.monitor_peer_health(&active_models, &configured, now_ms).await;
    }

    /// `allowed-ips = peer_subnet ∪ peer_container_subnet ∪ peer_management/128`
    /// (spec §4.5 step 2). The peer's container subnet is derived from its
    /// WireGuard /24 index within the cluster CIDR, since only the
    /// resulting subnet (not the raw index) is a replicated column.
    fn peer_allowed_ips(&self, server: &Server) -> String {
        let cluster_base: u32 = self.cfg.cluster_cidr.network().into();
        let server_base: u32 = server.subnet.network().into();
        let index = server_base.wrapping_sub(cluster_base) / 256;
        let container_subnet = meridian_common::subnet::container_subnet(self.cfg.cluster_cidr, index)
            .map(|n| n.to_string())
            .unwrap_or_else(|_| format!("{}/32", server.wireguard_ip));
        format!(
            "{},{container_subnet},{}/128",
            server.subnet, server.management_ip
        )
    }

    async fn monitor_peer_health(&self, active: &[Server], configured: &[wg::PeerDump], now_ms: u64) {
        for peer in configured {
            let age = wg::handshake_age_secs(peer.last_handshake_unix, now_ms as i64 / 1000);
            let classification = wg::classify_handshake_age(age, false);
            if classification != wg::PeerHealth::Down {
                continue;
            }
            let Some(current) = &peer.endpoint else { continue };
            let Some(server) = active.iter().find(|s| s.wireguard_public_key == peer.public_key) else {
                continue;
            };
            if let Some(next) = wg::rotate_endpoint(current, &server.endpoints) {
                log::warn!(
                    "peer {} down for {age}s, rotating endpoint {current} -> {next}",
                    peer.public_key
                );
                if let Err(e) =
                    wg::set_peer_endpoint(WG_BIN, &self.cfg.iface, &peer.public_key, &next).await
                {
                    log::error!("failed to rotate endpoint for peer {}: {e}", peer.public_key);
                }
            }
        }
    }

    async fn sync_container_health(&self) {
        let containers = match meridian_store::reads::containers_for_server(&self.store, &self.cfg.self_id).await {
            Ok(c) => c,
            Err(e) => {
                log::error!("task container health sync failed to read containers: {e}");
                return;
            }
        };
        for c in containers {
            let observation = if !health::is_process_running(&self.cfg.engine_bin, &c.id).await {
                health::Observation::ProcessNotRunning
            } else if c.health_port.is_none() {
                health::Observation::NoHealthPortConfigured
            } else {
                let ip = match c.ip.as_ref().and_then(|s| s.parse().ok()) {
                    Some(ip) => ip,
                    None => continue,
                };
                if health::probe_tcp(ip, c.health_port.unwrap()).await {
                    health::Observation::ProbeSucceeded
                } else {
                    health::Observation::ProbeFailed
                }
            };
            let outcome = health::advance(c.consecutive_failures, observation);
            if outcome.status != c.health_status || outcome.consecutive_failures != c.consecutive_failures {
                let status_str = format!("{:?}", outcome.status).to_lowercase();
                let sql = format!(
                    "UPDATE container SET health_status = '{status_str}', consecutive_failures = {} WHERE id = '{}'",
                    outcome.consecutive_failures, c.id
                );
                let stmt = meridian_store::OwnedStatement::own(sql, &self.cfg.self_id);
                if let Err(e) = self.store.exec_owned(&self.cfg.self_id, vec![stmt]).await {
                    log::error!("failed to write container health for {}: {e}", c.id);
                }
            }
        }
    }

    async fn garbage_collect(&self, now_ms: u64) {
        if let Ok(stale) = meridian_store::reads::stale_containers(&self.store, now_ms).await {
            run_task!("gc stale containers", gc::gc_stale_containers(&self.store, &self.cfg.self_id, &stale));
        }
        if let Ok(offline) = meridian_store::reads::offline_servers(&self.store, now_ms).await {
            for server in offline {
                if server.id == self.cfg.self_id {
                    continue;
                }
                run_task!(
                    "gc offline server containers",
                    gc::gc_offline_server_containers(&self.store, &self.cfg.self_id, &server.id)
                );
            }
        }
    }

    async fn refresh_public_ip(&self, self_id: &str) {
        let current = match meridian_store::reads::active_servers(&self.store, self_id, self.now_ms()).await {
            Ok(rows) => rows.iter().find(|r| r.id == self_id).and_then(server_row_to_model),
            Err(_) => None,
        };
        let Some(current) = current else { return };
        match crate::refresh::refreshed_endpoints(&self.cfg.iface, &current.hostname, &current.endpoints).await {
            Ok(Some(new_list)) => {
                if let Err(e) = crate::refresh::persist_endpoints(&self.store, self_id, &new_list).await {
                    log::error!("failed to persist refreshed endpoints: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("endpoint refresh failed: {e}"),
        }
    }

    async fn detect_split_brain(&self, now_ms: u64) {
        match meridian_store::reads::all_servers(&self.store).await {
            Ok(all) => {
                if let Some(obs) = splitbrain::detect(&all, now_ms) {
                    splitbrain::log_observation(&obs);
                }
            }
            Err(e) => log::error!("task split-brain detector failed to read servers: {e}"),
        }
    }
}
