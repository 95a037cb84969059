//! Thin entry point driving `run_rolling_deploy` (spec §5 non-goals: "no
//! CLI UX polish... not a full command surface"). Usage:
//!
//!   meridian-deployctl <service> <image> <host1,host2,...>
//!
//! Service container options beyond image/ports are intentionally not
//! exposed here — a generic config-file loading/validation layer is out
//! of scope (spec §1).

use eyre::{Context, ContextCompat, Result};
use meridian_deploy::config::{DeployEngineConfig, ProxyTargets, ResourceLimits, ServiceContainerSpec};
use meridian_deploy::run::{run_rolling_deploy, RollingDeployRequest};
use meridian_deploy::ssh::SshPool;
use meridian_store::{StoreClient, StoreClientConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let service = args.next().context("missing <service> argument")?;
    let image = args.next().context("missing <image> argument")?;
    let hosts_csv = args.next().context("missing <hosts> argument")?;
    let hosts: Vec<String> = hosts_csv.split(',').map(str::to_owned).collect();
    if hosts.is_empty() {
        eyre::bail!("at least one host must be given");
    }

    let cfg = DeployEngineConfig::load().context("load deploy engine config")?;
    let ssh_username = std::env::var("MERIDIAN_SSH_USER").unwrap_or_else(|_| "root".to_owned());
    let ssh_key_path = PathBuf::from(
        std::env::var("MERIDIAN_SSH_KEY").unwrap_or_else(|_| "/root/.ssh/id_ed25519".to_owned()),
    );
    let store_api_port: u16 = std::env::var("MERIDIAN_STORE_API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let store_cli = std::env::var("MERIDIAN_STORE_CLI")
        .unwrap_or_else(|_| "/opt/meridian/bin/corrosion".to_owned());
    let store_config = std::env::var("MERIDIAN_STORE_CONFIG")
        .unwrap_or_else(|_| "/opt/meridian/corrosion/config.toml".to_owned());

    let store = Arc::new(StoreClient::new(StoreClientConfig {
        cli_path: store_cli,
        store_config_path: store_config,
        api_port: store_api_port,
    }));

    let spec = ServiceContainerSpec {
        service: service.clone(),
        project: std::env::var("MERIDIAN_PROJECT").unwrap_or_else(|_| service.clone()),
        image,
        env: HashMap::new(),
        volumes: vec![],
        port_mappings: vec![],
        resources: ResourceLimits { cpu_nanos: None, memory_bytes: None },
        health_check: None,
        proxy: None,
        proxy_targets: ProxyTargets::None,
        fabric_network: std::env::var("MERIDIAN_FABRIC_NETWORK").unwrap_or_else(|_| "meridian0".to_owned()),
        deploy_timeout: Duration::from_secs(120),
    };

    let pool = SshPool::new(cfg.ssh_pool_size);
    let report = run_rolling_deploy(
        &cfg,
        store,
        &pool,
        RollingDeployRequest {
            service_name: service,
            hosts,
            ssh_username,
            ssh_key_path: &ssh_key_path,
            spec: &spec,
        },
    )
    .await;

    log::info!(
        "rolling deploy finished: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
