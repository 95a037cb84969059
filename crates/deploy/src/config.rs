//! Typed, fully-validated deployment configuration (spec §9 REDESIGN FLAG:
//! mutually-exclusive fields become sum types with one variant per valid
//! combination, instead of lazily-validated dynamic shapes).

use envconfig::Envconfig;
use eyre::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;

/// A service's container definition is either a single-target deployment
/// or a multi-target one exposing several `app_port`s through the proxy
/// independently (spec §4.6 "Multi-target services"). Collapsing the two
/// into one struct with optional fields would let an implementation
/// default into a "zero targets" state the spec never allows.
#[derive(Debug, Clone)]
pub enum ProxyTargets {
    None,
    Single(u16),
    Multi(Vec<u16>),
}

impl ProxyTargets {
    pub fn app_ports(&self) -> Vec<u16> {
        match self {
            ProxyTargets::None => vec![],
            ProxyTargets::Single(p) => vec![*p],
            ProxyTargets::Multi(ps) => ps.clone(),
        }
    }
}

/// Health check is either a command the engine runs inside the container
/// (resolved to the three-way proxy target's `container:port` form) or an
/// HTTP path probed on a specific port. The source's lazily-validated
/// `path` vs `cmd` fields become this sum type (spec §9).
#[derive(Debug, Clone)]
pub enum HealthCheck {
    Http { path: String, port: u16 },
    Command { cmd: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub path_prefix: String,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_nanos: Option<i64>,
    pub memory_bytes: Option<i64>,
}

/// Everything needed to run the new container for one deployment slot
/// (spec §4.6 step 4). The `ContainerCreateBody`/`HostConfig` shape this
/// feeds is lifted from the teacher's `deploy_challenge`, generalized from
/// a fixed CTF `Container` type to this.
#[derive(Debug, Clone)]
pub struct ServiceContainerSpec {
    pub service: String,
    pub project: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub volumes: Vec<String>,
    pub port_mappings: Vec<String>,
    pub resources: ResourceLimits,
    pub health_check: Option<HealthCheck>,
    pub proxy: Option<ProxyConfig>,
    pub proxy_targets: ProxyTargets,
    pub fabric_network: String,
    pub deploy_timeout: Duration,
}

impl ServiceContainerSpec {
    /// Every `app_port` a proxy target names must appear in the service's
    /// own `ports` list (spec §4.6: "every `app_port` listed must appear
    /// in the service's `ports` list") — a configuration error, caught
    /// eagerly rather than mid-deploy.
    pub fn validate(&self) -> Result<(), crate::error::DeployError> {
        let exposed: Vec<u16> = meridian_common::ports::extract_firewall_ports(
            &self.port_mappings.iter().map(String::as_str).collect::<Vec<_>>(),
        )
        .into_iter()
        .map(|p| p.port)
        .collect();
        for app_port in self.proxy_targets.app_ports() {
            let container_port_listed = self.port_mappings.iter().any(|m| {
                m.split(':')
                    .next_back()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse::<u16>().ok())
                    == Some(app_port)
            });
            if !container_port_listed && !exposed.contains(&app_port) {
                return Err(crate::error::DeployError::Config(format!(
                    "app_port {app_port} for service {} is not listed in its port mappings",
                    self.service
                )));
            }
        }
        Ok(())
    }
}

#[derive(Envconfig)]
struct RawEngineConfig {
    #[envconfig(from = "MERIDIAN_ENGINE_BIN", default = "docker")]
    pub engine_bin: String,
    #[envconfig(from = "MERIDIAN_SSH_POOL_SIZE", default = "30")]
    pub ssh_pool_size: usize,
    #[envconfig(from = "MERIDIAN_IMAGE_RETENTION", default = "3")]
    pub image_retention: usize,
    #[envconfig(from = "MERIDIAN_REGISTRY_NAMESPACE", default = "")]
    pub registry_namespace: String,
    #[envconfig(from = "MERIDIAN_PROXY_CONTAINER", default = "meridian-proxy")]
    pub proxy_container: String,
    #[envconfig(from = "MERIDIAN_SERVICE_DOMAIN", default = "")]
    pub service_domain: String,
}

/// Engine-wide configuration (as opposed to per-service `ServiceContainerSpec`).
/// Validated eagerly: an empty SSH pool size or a zero retention count is a
/// configuration error, surfaced before any deployment starts (spec §7).
#[derive(Clone)]
pub struct DeployEngineConfig {
    pub engine_bin: String,
    pub ssh_pool_size: usize,
    pub image_retention: usize,
    pub registry_namespace: String,
    pub proxy_container: String,
    pub service_domain: String,
}

impl DeployEngineConfig {
    pub fn load() -> Result<Self> {
        let raw = RawEngineConfig::init_from_env().context("load deploy engine config from environment")?;
        if raw.ssh_pool_size == 0 {
            return Err(eyre::eyre!("MERIDIAN_SSH_POOL_SIZE must be at least 1"));
        }
        if raw.image_retention == 0 {
            return Err(eyre::eyre!("MERIDIAN_IMAGE_RETENTION must be at least 1"));
        }
        Ok(Self {
            engine_bin: raw.engine_bin,
            ssh_pool_size: raw.ssh_pool_size,
            image_retention: raw.image_retention,
            registry_namespace: raw.registry_namespace,
            proxy_container: raw.proxy_container,
            service_domain: raw.service_domain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ports: Vec<&str>, targets: ProxyTargets) -> ServiceContainerSpec {
        ServiceContainerSpec {
            service: "web".into(),
            project: "acme".into(),
            image: "acme/web:v2".into(),
            env: HashMap::new(),
            volumes: vec![],
            port_mappings: ports.into_iter().map(String::from).collect(),
            resources: ResourceLimits { cpu_nanos: None, memory_bytes: None },
            health_check: None,
            proxy: None,
            proxy_targets: targets,
            fabric_network: "meridian0".into(),
            deploy_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn rejects_app_port_missing_from_ports_list() {
        let s = spec(vec!["80:8080/tcp"], ProxyTargets::Single(3000));
        assert!(s.validate().is_err());
    }

    #[test]
    fn accepts_app_port_listed_as_container_port() {
        let s = spec(vec!["80:3000/tcp"], ProxyTargets::Single(3000));
        assert!(s.validate().is_ok());
    }
}
