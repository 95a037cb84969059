//! Garbage collection (spec §4.5 step 5, testable property 6): deletes
//! unhealthy containers past their grace period, and all containers
//! belonging to servers that have been offline for 10+ minutes. Runs
//! every 10 iterations (5 minutes at the 30s base period) and writes
//! through the HTTP transaction endpoint so DNS subscribers observe the
//! removals.

use meridian_store::reads::{ContainerRow, ServerRow};
use meridian_store::{OwnedStatement, StoreClient};

const STALE_GRACE_SECS: u64 = 180;
const OFFLINE_WINDOW_MS: u64 = 10 * 60 * 1000;

/// True if `row` is eligible for deletion as a stale (unhealthy past
/// grace) container. Idempotent: repeated calls on an already-deleted row
/// are a GC no-op at the caller, not re-evaluated here.
pub fn is_stale_container(row: &ContainerRow, now_ms: u64) -> bool {
    let unhealthy = !matches!(
        row.health_status,
        meridian_common::model::HealthStatus::Healthy
    );
    let age_secs = now_ms.saturating_sub(row.started_at_ms) / 1000;
    unhealthy && age_secs > STALE_GRACE_SECS
}

/// A row belonging to `server_id` is only GC-eligible if that server has
/// been offline (no heartbeat) for at least 10 minutes (testable property
/// 6: "No row is deleted if its owning server's last_seen is within 10
/// minutes").
pub fn is_server_offline(server: &ServerRow, now_ms: u64) -> bool {
    now_ms.saturating_sub(server.last_seen_ms) >= OFFLINE_WINDOW_MS
}

pub async fn gc_stale_containers(
    store: &StoreClient,
    self_id: &str,
    stale: &[ContainerRow],
) -> meridian_store::Result<()> {
    if stale.is_empty() {
        return Ok(());
    }
    let stmts = stale
        .iter()
        .map(|c| {
            let sql = format!("DELETE FROM container WHERE id = '{}'", c.id);
            if c.server_id == self_id {
                OwnedStatement::own(sql, self_id)
            } else {
                // A row owned by someone else only reaches this path if
                // the caller already filtered by is_server_offline.
                OwnedStatement::gc_exception(sql)
            }
        })
        .collect();
    store.exec_owned(self_id, stmts).await?;
    Ok(())
}

pub async fn gc_offline_server_containers(
    store: &StoreClient,
    self_id: &str,
    offline_server_id: &str,
) -> meridian_store::Result<()> {
    let sql = format!("DELETE FROM container WHERE server_id = '{offline_server_id}'");
    store
        .exec_owned(self_id, vec![OwnedStatement::gc_exception(sql)])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::model::HealthStatus;

    fn container(status: HealthStatus, started_at_ms: u64) -> ContainerRow {
        ContainerRow {
            id: "c1".into(),
            service: "web".into(),
            server_id: "host-a".into(),
            ip: None,
            started_at_ms,
            instance_id: None,
            health_status: status,
            last_health_check_ms: 0,
            consecutive_failures: 0,
            health_port: None,
        }
    }

    #[test]
    fn healthy_container_never_gced_regardless_of_age() {
        assert!(!is_stale_container(&container(HealthStatus::Healthy, 0), 10_000_000));
    }

    #[test]
    fn unhealthy_container_gced_only_after_grace_period() {
        let now = 1_000_000;
        let young = container(HealthStatus::Unhealthy, now - 60_000);
        let old = container(HealthStatus::Unhealthy, now - 200_000);
        assert!(!is_stale_container(&young, now));
        assert!(is_stale_container(&old, now));
    }

    #[test]
    fn server_within_window_is_not_offline() {
        let row = ServerRow {
            id: "b".into(),
            hostname: "b".into(),
            subnet: "10.0.1.0/24".into(),
            wireguard_ip: "10.0.1.1".into(),
            wireguard_public_key: "key".into(),
            management_ip: "fdcc::1".into(),
            endpoints_raw: "".into(),
            last_seen_ms: 1_000_000 - (9 * 60 * 1000),
        };
        assert!(!is_server_offline(&row, 1_000_000));
    }
}
