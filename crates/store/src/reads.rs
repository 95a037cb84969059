//! Typed read-path queries the reconciler issues every iteration (spec
//! §4.2.2): active servers, this host's containers, stale containers,
//! offline servers.

use crate::client::StoreClient;
use crate::error::{Result, StoreError};
use meridian_common::model::HealthStatus;

const ACTIVE_WINDOW_MS: u64 = 5 * 60 * 1000;
const OFFLINE_WINDOW_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct ServerRow {
    pub id: String,
    pub hostname: String,
    pub subnet: String,
    pub wireguard_ip: String,
    pub wireguard_public_key: String,
    pub management_ip: String,
    pub endpoints_raw: String,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ContainerRow {
    pub id: String,
    pub service: String,
    pub server_id: String,
    pub ip: Option<String>,
    pub started_at_ms: u64,
    pub instance_id: Option<String>,
    pub health_status: HealthStatus,
    pub last_health_check_ms: u64,
    pub consecutive_failures: u32,
    pub health_port: Option<u16>,
}

fn field<'a>(row: &'a [String], idx: usize, ctx: &str) -> Result<&'a str> {
    row.get(idx)
        .map(String::as_str)
        .ok_or_else(|| StoreError::MalformedRow(format!("{ctx}: missing field {idx}")))
}

fn parse_server_row(row: &[String]) -> Result<ServerRow> {
    Ok(ServerRow {
        id: field(row, 0, "server")?.to_owned(),
        hostname: field(row, 1, "server")?.to_owned(),
        subnet: field(row, 2, "server")?.to_owned(),
        wireguard_ip: field(row, 3, "server")?.to_owned(),
        wireguard_public_key: field(row, 4, "server")?.to_owned(),
        management_ip: field(row, 5, "server")?.to_owned(),
        endpoints_raw: field(row, 6, "server")?.to_owned(),
        last_seen_ms: field(row, 7, "server")?
            .parse()
            .map_err(|_| StoreError::MalformedRow("server.last_seen not an integer".into()))?,
    })
}

fn parse_health_status(s: &str) -> HealthStatus {
    match s {
        "healthy" => HealthStatus::Healthy,
        "degraded" => HealthStatus::Degraded,
        "unhealthy" => HealthStatus::Unhealthy,
        _ => HealthStatus::Unknown,
    }
}

fn parse_container_row(row: &[String]) -> Result<ContainerRow> {
    Ok(ContainerRow {
        id: field(row, 0, "container")?.to_owned(),
        service: field(row, 1, "container")?.to_owned(),
        server_id: field(row, 2, "container")?.to_owned(),
        ip: {
            let v = field(row, 3, "container")?;
            if v.is_empty() { None } else { Some(v.to_owned()) }
        },
        started_at_ms: field(row, 4, "container")?
            .parse()
            .map_err(|_| StoreError::MalformedRow("container.started_at not an integer".into()))?,
        instance_id: {
            let v = field(row, 5, "container")?;
            if v.is_empty() { None } else { Some(v.to_owned()) }
        },
        health_status: parse_health_status(field(row, 6, "container")?),
        last_health_check_ms: field(row, 7, "container")?.parse().unwrap_or(0),
        consecutive_failures: field(row, 8, "container")?.parse().unwrap_or(0),
        health_port: field(row, 9, "container")?.parse().ok(),
    })
}

const SERVER_COLUMNS: &str = "id, hostname, subnet, wireguard_ip, wireguard_public_key, management_ip, endpoints, last_seen";
const CONTAINER_COLUMNS: &str = "id, service, server_id, ip, started_at, instance_id, health_status, last_health_check, consecutive_failures, health_port";

/// Servers heartbeating within the last 5 minutes, excluding self.
pub async fn active_servers(
    store: &StoreClient,
    self_id: &str,
    now_ms: u64,
) -> Result<Vec<ServerRow>> {
    let cutoff = now_ms.saturating_sub(ACTIVE_WINDOW_MS);
    let sql = format!(
        "SELECT {SERVER_COLUMNS} FROM server WHERE last_seen > {cutoff} AND id != '{self_id}'"
    );
    store
        .query(&sql)
        .await?
        .iter()
        .map(|r| parse_server_row(r))
        .collect()
}

/// This host's own server row, as last written to the store — lets the
/// reconciler confirm its own heartbeat writes are actually landing
/// (spec §4.5 step 7), not just held in the local `now_ms` it sent.
pub async fn self_server(store: &StoreClient, self_id: &str) -> Result<Option<ServerRow>> {
    let sql = format!("SELECT {SERVER_COLUMNS} FROM server WHERE id = '{self_id}'");
    let rows = store.query(&sql).await?;
    rows.first().map(|r| parse_server_row(r)).transpose()
}

/// Every known server row, active or not — the split-brain detector's
/// denominator (spec §4.5 step 8).
pub async fn all_servers(store: &StoreClient) -> Result<Vec<ServerRow>> {
    let sql = format!("SELECT {SERVER_COLUMNS} FROM server");
    store
        .query(&sql)
        .await?
        .iter()
        .map(|r| parse_server_row(r))
        .collect()
}

/// Servers whose heartbeat is older than 10 minutes — GC candidates for
/// their containers (spec §4.5 step 5, testable property 6).
pub async fn offline_servers(store: &StoreClient, now_ms: u64) -> Result<Vec<ServerRow>> {
    let cutoff = now_ms.saturating_sub(OFFLINE_WINDOW_MS);
    let sql = format!("SELECT {SERVER_COLUMNS} FROM server WHERE last_seen < {cutoff}");
    store
        .query(&sql)
        .await?
        .iter()
        .map(|r| parse_server_row(r))
        .collect()
}

/// Every container row owned by this host.
pub async fn containers_for_server(
    store: &StoreClient,
    self_id: &str,
) -> Result<Vec<ContainerRow>> {
    let sql = format!("SELECT {CONTAINER_COLUMNS} FROM container WHERE server_id = '{self_id}'");
    store
        .query(&sql)
        .await?
        .iter()
        .map(|r| parse_container_row(r))
        .collect()
}

/// Containers unhealthy and older than 3 minutes — GC candidates (spec
/// §4.5 step 5, testable property 6).
pub async fn stale_containers(store: &StoreClient, now_ms: u64) -> Result<Vec<ContainerRow>> {
    let cutoff_secs = now_ms.saturating_sub(180 * 1000) / 1000;
    let sql = format!(
        "SELECT {CONTAINER_COLUMNS} FROM container WHERE health_status != 'healthy' AND started_at / 1000 < {cutoff_secs}"
    );
    store
        .query(&sql)
        .await?
        .iter()
        .map(|r| parse_container_row(r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipe_delimited_container_row() {
        let row: Vec<String> = "c1|web|host-a|10.0.0.2|1000|inst1|healthy|2000|0|8080"
            .split('|')
            .map(str::to_owned)
            .collect();
        let parsed = parse_container_row(&row).unwrap();
        assert_eq!(parsed.id, "c1");
        assert_eq!(parsed.health_status, HealthStatus::Healthy);
        assert_eq!(parsed.health_port, Some(8080));
    }
}
