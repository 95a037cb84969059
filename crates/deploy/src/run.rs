//! Fleet-wide rolling deploy orchestration (spec §4.6/§5): deployments to
//! different `(service, host)` pairs run concurrently, bounded by the SSH
//! pool semaphore; there is no distributed lock, correctness relies on
//! the single-writer-per-row ownership invariant (spec §3).

use crate::config::{DeployEngineConfig, ServiceContainerSpec};
use crate::engine::Engine;
use crate::report::DeployReport;
use crate::ssh::{SshPool, SshSession};
use meridian_store::StoreClient;
use std::path::Path;
use std::sync::Arc;

pub struct RollingDeployRequest<'a> {
    pub service_name: String,
    pub hosts: Vec<String>,
    pub ssh_username: String,
    pub ssh_key_path: &'a Path,
    pub spec: &'a ServiceContainerSpec,
}

/// Deploys `req.service_name` to every host in `req.hosts`, concurrently
/// up to `cfg.ssh_pool_size` in flight, and returns the aggregate report
/// (spec §7 "Propagation policy": every service/host pair reports its own
/// result, nothing is silently swallowed).
pub async fn run_rolling_deploy(
    cfg: &DeployEngineConfig,
    store: Arc<StoreClient>,
    pool: &SshPool,
    req: RollingDeployRequest<'_>,
) -> DeployReport {
    let mut handles = Vec::new();

    for host in req.hosts.clone() {
        let pool = pool.clone();
        let store = store.clone();
        let service_name = req.service_name.clone();
        let ssh_username = req.ssh_username.clone();
        let ssh_key_path = req.ssh_key_path.to_path_buf();
        let spec = req.spec.clone();
        let slot_cfg = cfg.clone();

        handles.push(tokio::spawn(async move {
            let _permit = pool.acquire().await;
            let result = deploy_one_host(&store, &slot_cfg, &service_name, &host, &ssh_username, &ssh_key_path, &spec).await;
            (service_name, host, result)
        }));
    }

    let mut report = DeployReport::default();
    for handle in handles {
        match handle.await {
            Ok((service, host, result)) => report.record(&service, &host, &result),
            Err(e) => log::error!("deployment task panicked: {e}"),
        }
    }
    report
}

async fn deploy_one_host(
    store: &StoreClient,
    cfg: &DeployEngineConfig,
    service_name: &str,
    host: &str,
    ssh_username: &str,
    ssh_key_path: &Path,
    spec: &ServiceContainerSpec,
) -> Result<(), crate::error::DeployError> {
    let session = Arc::new(SshSession::connect(host, 22, ssh_username, ssh_key_path).await?);
    let engine = Engine::new(session.clone(), &cfg.engine_bin);
    let req = crate::deploy::DeploySlotRequest {
        service_name: service_name.to_owned(),
        host: host.to_owned(),
        server_id: host.to_owned(),
        spec,
    };
    let outcome = crate::deploy::run_deployment_slot(engine, store, cfg, req).await;
    let _ = session.close().await;
    outcome.map(|_| ())
}
