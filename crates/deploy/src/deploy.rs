//! The zero-downtime rename-then-replace deployment sequence for one
//! `(service, host)` slot (spec §4.6), directly grounded in the teacher's
//! `deployer-server/src/deploy.rs::deploy_challenge`: same rename/pull/run/
//! inspect/proxy-exec sequence, same `DockerGuard`-style rollback-on-drop
//! for the partially-started new container, generalized from "one CTF
//! challenge container" to "one service container on one fleet host".

use crate::config::{DeployEngineConfig, ServiceContainerSpec};
use crate::engine::Engine;
use crate::error::{DeployError, Result};
use crate::state::DeploymentState;
use crate::target;
use meridian_store::StoreClient;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const START_POLL_ATTEMPTS: u32 = 10;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn unix_ts() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Ported from the teacher's `DockerGuard`: undoes this deploy attempt's
/// effects if it never reaches `commit()` — removes the partially-started
/// new container (if any) and, if the previous running container was
/// renamed out of the way, renames it back to `N` (testable property 7 /
/// scenario S4: exactly one container named `N` survives a failed
/// attempt, and it is the old one).
struct RollbackGuard {
    engine: Engine,
    new_container: Option<String>,
    renamed: Option<(String, String)>,
    committed: bool,
}

impl RollbackGuard {
    fn new(engine: Engine) -> Self {
        Self { engine, new_container: None, renamed: None, committed: false }
    }

    fn track_new_container(&mut self, name: &str) {
        self.new_container = Some(name.to_owned());
    }

    fn track_rename(&mut self, old_name: &str, container_name: &str) {
        self.renamed = Some((old_name.to_owned(), container_name.to_owned()));
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let engine = self.engine.clone();
        let new_container = self.new_container.take();
        let renamed = self.renamed.take();
        tokio::spawn(async move {
            if let Some(name) = new_container
                && let Err(e) = engine.stop_and_remove(&name).await
            {
                log::error!("rollback cleanup of {name} failed: {e}");
            }
            if let Some((old_name, container_name)) = renamed
                && let Err(e) = engine.rename(&old_name, &container_name).await
            {
                log::error!("rollback rename of {old_name} back to {container_name} failed: {e}");
            }
        });
    }
}

pub struct DeploySlotRequest<'a> {
    pub service_name: String,
    pub host: String,
    pub server_id: String,
    pub spec: &'a ServiceContainerSpec,
}

async fn run_step<T>(
    state: &mut DeploymentState,
    next: DeploymentState,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    *state = next;
    log::debug!("deployment slot -> {:?}", state);
    fut.await.inspect_err(|e| {
        *state = DeploymentState::Failed(e.to_string());
        log::debug!("deployment slot -> {:?}", state);
    })
}

/// Runs the spec §4.6 sequence for one deployment slot, driving the
/// `DeploymentState` machine through `Idle -> Preparing -> Starting ->
/// HealthChecking -> SwitchingProxy -> Cleanup -> Idle`, falling to
/// `Failed` on any error (spec §4.6 "State machine for a deployment
/// slot"). On failure, the new container is removed and, if the
/// existing container was renamed out of the way, the rename is undone
/// so exactly one container named `N` survives — the old one.
pub async fn run_deployment_slot(
    engine: Engine,
    store: &StoreClient,
    cfg: &DeployEngineConfig,
    req: DeploySlotRequest<'_>,
) -> Result<DeploymentState> {
    let mut state = DeploymentState::Idle;
    let spec = req.spec;
    spec.validate()?;

    let container_name = req.service_name.clone();
    let image = target::qualify_image(&spec.image, &cfg.registry_namespace);

    let mut guard = RollbackGuard::new(engine.clone());

    // Step 1: clean up any prior aborted deploy's leftovers.
    run_step(&mut state, DeploymentState::Preparing, engine.remove_stale_old_containers(&container_name)).await?;

    // Step 2: rename the existing running container, if present, so it
    // keeps serving while the new one comes up. From here on, any
    // failure before `commit()` rolls this rename back (property 7).
    let old_name = target::old_container_name(&container_name, unix_ts());
    let existing_status = engine.inspect_status(&container_name).await.ok().flatten();
    let had_existing_running = existing_status.as_deref() == Some("running");
    if had_existing_running {
        run_step(&mut state, DeploymentState::Preparing, engine.rename(&container_name, &old_name)).await?;
        guard.track_rename(&old_name, &container_name);
    }

    // Step 3: pull the new image.
    run_step(&mut state, DeploymentState::Preparing, engine.pull(&image)).await?;

    // Step 4: run the new container under the target name.
    let run_result = run_step(&mut state, DeploymentState::Starting, engine.run(&container_name, &image, spec)).await;
    if let Err(e) = run_result {
        return Ok(state_after_failed_start(e, &state));
    }
    guard.track_new_container(&container_name);

    // Step 5: poll for `running`, else ContainerDidNotStart — the rollback
    // guard restores the old container's name on drop (property 7 /
    // scenario S4).
    run_step(
        &mut state,
        DeploymentState::Starting,
        engine.poll_until_running(&container_name, START_POLL_ATTEMPTS),
    )
    .await?;

    // Step 6: register the container row, wait for healthy, then switch
    // the reverse proxy target.
    let container_ip = engine.inspect_ip(&container_name, &spec.fabric_network).await.ok().flatten();
    let started_at_ms = unix_ts() * 1000;
    let insert_sql = format!(
        "INSERT INTO container (id, service, server_id, ip, started_at, health_status, consecutive_failures) VALUES ('{container_name}', '{}', '{}', {}, {started_at_ms}, 'unknown', 0)",
        req.service_name,
        req.server_id,
        container_ip.as_deref().map(|ip| format!("'{ip}'")).unwrap_or_else(|| "NULL".to_owned()),
    );
    if let Err(e) = store.exec(&[insert_sql]).await {
        log::error!("failed to register container row for {container_name}: {e}");
    }

    state = DeploymentState::HealthChecking;
    log::debug!("deployment slot -> {:?}", state);
    if let Err(e) = wait_until_healthy(store, &container_name, spec.deploy_timeout).await {
        state = DeploymentState::Failed(e.to_string());
        log::debug!("deployment slot -> {:?}", state);
        return Err(e);
    }

    if let Some(proxy) = &spec.proxy {
        state = DeploymentState::SwitchingProxy;
        log::debug!("deployment slot -> {:?}", state);
        for app_port in spec.proxy_targets.app_ports() {
            let target = target::compute_proxy_target(
                spec,
                &container_name,
                container_ip.as_deref(),
                &cfg.service_domain,
                app_port,
            );
            let mut deploy_args = vec![
                "deploy".to_owned(),
                req.service_name.clone(),
                "--target".to_owned(),
                target.clone(),
                "--host".to_owned(),
                proxy.host.clone(),
                "--path-prefix".to_owned(),
                proxy.path_prefix.clone(),
            ];
            if proxy.tls {
                deploy_args.push("--tls".to_owned());
            }
            match &spec.health_check {
                Some(crate::config::HealthCheck::Http { path, port }) => {
                    deploy_args.push("--health-check-path".to_owned());
                    deploy_args.push(path.clone());
                    deploy_args.push("--health-check-port".to_owned());
                    deploy_args.push(port.to_string());
                }
                Some(crate::config::HealthCheck::Command { cmd }) => {
                    deploy_args.push("--health-check-cmd".to_owned());
                    deploy_args.push(cmd.join(" "));
                }
                None => {}
            }
            let proxy_result = engine.exec_in_container(&cfg.proxy_container, &deploy_args).await;
            match proxy_result {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    let e = DeployError::ProxyDeployFailed { target: target.clone(), reason: out.stderr };
                    state = DeploymentState::Failed(e.to_string());
                    log::debug!("deployment slot -> {:?}", state);
                    return Err(e);
                }
                Err(e) => {
                    state = DeploymentState::Failed(e.to_string());
                    log::debug!("deployment slot -> {:?}", state);
                    return Err(e);
                }
            }
        }
    }

    // Step 7: success — remove the old container, prune images.
    state = DeploymentState::Cleanup;
    log::debug!("deployment slot -> {:?}", state);
    guard.commit();
    if had_existing_running
        && let Err(e) = engine.stop_and_remove(&old_name).await
    {
        log::warn!("failed to remove retired container {old_name}: {e}");
    }
    if let Err(e) = engine.prune_images(&image_repo(&image), cfg.image_retention).await {
        log::warn!("image prune failed for {image}: {e}");
    }

    state = DeploymentState::Idle;
    Ok(state)
}

fn state_after_failed_start(e: DeployError, _state: &DeploymentState) -> DeploymentState {
    DeploymentState::Failed(e.to_string())
}

fn image_repo(image: &str) -> String {
    image.split(':').next().unwrap_or(image).to_owned()
}

/// Waits until the reconciler marks the container `healthy`, or until
/// `deploy_timeout` elapses (spec §4.6 step 6).
async fn wait_until_healthy(store: &StoreClient, container_name: &str, deploy_timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + deploy_timeout;
    loop {
        let sql = format!(
            "SELECT health_status FROM container WHERE id = '{container_name}'"
        );
        match store.query(&sql).await {
            Ok(rows) => {
                if rows.first().and_then(|r| r.first()).map(String::as_str) == Some("healthy") {
                    return Ok(());
                }
            }
            Err(e) => log::warn!("health wait query failed for {container_name}: {e}"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DeployError::HealthTimeout {
                name: container_name.to_owned(),
                timeout_secs: deploy_timeout.as_secs(),
            });
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheck, ProxyTargets, ResourceLimits};
    use crate::ssh::fake::FakeExecutor;
    use crate::ssh::CommandOutput;
    use meridian_store::{StoreClient, StoreClientConfig};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn spec() -> ServiceContainerSpec {
        ServiceContainerSpec {
            service: "web".into(),
            project: "acme".into(),
            image: "v2".into(),
            env: HashMap::new(),
            volumes: vec![],
            port_mappings: vec!["3000:3000".into()],
            resources: ResourceLimits { cpu_nanos: None, memory_bytes: None },
            health_check: Some(HealthCheck::Http { path: "/healthz".into(), port: 3000 }),
            proxy: None,
            proxy_targets: ProxyTargets::None,
            fabric_network: "meridian0".into(),
            deploy_timeout: Duration::from_millis(50),
        }
    }

    fn unreachable_store() -> StoreClient {
        StoreClient::new(StoreClientConfig {
            cli_path: "false".into(),
            store_config_path: "/dev/null".into(),
            api_port: 1,
        })
    }

    /// Scenario S4: the new container never reports `running`. Expect
    /// `ContainerDidNotStart`, the new container removed by the rollback
    /// guard, and no proxy switch ever attempted.
    #[tokio::test]
    async fn failed_start_rolls_back_new_container_only() {
        let scripted = vec![
            // ps -a (remove_stale_old_containers)
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            // inspect (existing container status check) - not running
            CommandOutput { status: 1, stdout: String::new(), stderr: "no such".into() },
            // pull
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            // run
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            // poll_until_running x10, all failing
        ];
        let mut scripted = scripted;
        for _ in 0..10 {
            scripted.push(CommandOutput { status: 1, stdout: "stopped".into(), stderr: String::new() });
        }
        let fake = Arc::new(FakeExecutor::new(scripted));
        let engine = Engine::new(fake.clone(), "docker");
        let store = unreachable_store();

        let spec = spec();
        let req = DeploySlotRequest {
            service_name: "web".into(),
            host: "host-a".into(),
            server_id: "host-a".into(),
            spec: &spec,
        };

        let cfg = DeployEngineConfig {
            engine_bin: "docker".into(),
            ssh_pool_size: 30,
            image_retention: 3,
            registry_namespace: String::new(),
            proxy_container: "meridian-proxy".into(),
            service_domain: String::new(),
        };
        let result = run_deployment_slot(engine, &store, &cfg, req).await;
        assert!(matches!(result, Err(DeployError::ContainerDidNotStart { .. })));

        // rollback is spawned, give it a tick to run
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = fake.calls();
        assert!(calls.iter().any(|c| c.contains("rm -f 'web'")), "expected rollback rm of new container: {calls:?}");
        assert!(!calls.iter().any(|c| c.contains("exec 'meridian-proxy'")), "proxy switch must not run");
    }

    /// Scenario S4 with an existing running container: the rename to
    /// `web_old_<ts>` happens, the new container never reports `running`,
    /// and the rollback must rename `web_old_<ts>` back to `web` so the
    /// host ends with exactly one container named `web` (the old one) and
    /// no `web_old_<ts>` left behind (property 7).
    #[tokio::test]
    async fn failed_start_after_rename_restores_old_container_name() {
        let scripted = vec![
            // ps -a (remove_stale_old_containers)
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            // inspect (existing container status check) - running
            CommandOutput { status: 0, stdout: "running".into(), stderr: String::new() },
            // rename web -> web_old_<ts>
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            // pull
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            // run
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
        ];
        let mut scripted = scripted;
        for _ in 0..10 {
            scripted.push(CommandOutput { status: 1, stdout: "stopped".into(), stderr: String::new() });
        }
        let fake = Arc::new(FakeExecutor::new(scripted));
        let engine = Engine::new(fake.clone(), "docker");
        let store = unreachable_store();

        let spec = spec();
        let req = DeploySlotRequest {
            service_name: "web".into(),
            host: "host-a".into(),
            server_id: "host-a".into(),
            spec: &spec,
        };

        let cfg = DeployEngineConfig {
            engine_bin: "docker".into(),
            ssh_pool_size: 30,
            image_retention: 3,
            registry_namespace: String::new(),
            proxy_container: "meridian-proxy".into(),
            service_domain: String::new(),
        };
        let result = run_deployment_slot(engine, &store, &cfg, req).await;
        assert!(matches!(result, Err(DeployError::ContainerDidNotStart { .. })));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = fake.calls();
        assert!(calls.iter().any(|c| c.contains("rm -f 'web'")), "expected rollback rm of new container: {calls:?}");
        let rename_calls: Vec<&String> = calls.iter().filter(|c| c.contains("rename ")).collect();
        assert_eq!(rename_calls.len(), 2, "expected rename web->old and rollback old->web: {calls:?}");
        assert!(rename_calls[0].contains("'web'") && rename_calls[0].contains("_old_"));
        assert!(
            rename_calls[1].contains("_old_") && rename_calls[1].trim_end().ends_with("'web'"),
            "expected rollback rename back to 'web': {rename_calls:?}"
        );
    }
}
