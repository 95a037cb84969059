//! Pure helpers for the deployment sequence (spec §4.6): container naming,
//! image-reference qualification, and reverse-proxy target computation.

use crate::config::{HealthCheck, ServiceContainerSpec};

/// `N_old_<unix_ts>` — the rename-then-replace name for the outgoing
/// container (spec §4.6 "State transitions").
pub fn old_container_name(name: &str, unix_ts: u64) -> String {
    format!("{name}_old_{unix_ts}")
}

/// Matches `<name>_old_*` container names from a prior, possibly aborted
/// deploy, so step 1 can clean them up before starting (spec §4.6 step 1).
pub fn is_stale_old_name(candidate: &str, container_name: &str) -> bool {
    let pattern = glob::Pattern::new(&format!("{container_name}_old_*")).expect("valid glob pattern");
    pattern.matches(candidate)
}

/// Expands an unqualified image reference to the configured registry
/// namespace (spec §4.6 step 3). An image ref already has a namespace
/// prefix if it contains a `/` before the first `:`.
pub fn qualify_image(image: &str, registry_namespace: &str) -> String {
    let repo_part = image.split(':').next().unwrap_or(image);
    if repo_part.contains('/') || registry_namespace.is_empty() {
        image.to_owned()
    } else {
        format!("{registry_namespace}/{image}")
    }
}

/// The three-way reverse-proxy deploy target computation (spec §4.6):
/// a command-based health check targets the container by name (so the
/// proxy can `exec` into it); a known container IP targets that IP;
/// otherwise falls back to the service's DNS name.
pub fn compute_proxy_target(
    spec: &ServiceContainerSpec,
    container_name: &str,
    container_ip: Option<&str>,
    service_domain: &str,
    app_port: u16,
) -> String {
    let uses_command_health_check = matches!(spec.health_check, Some(HealthCheck::Command { .. }));
    if uses_command_health_check {
        format!("{container_name}:{app_port}")
    } else if let Some(ip) = container_ip {
        format!("{ip}:{app_port}")
    } else {
        format!("{}-{}.{service_domain}:{app_port}", spec.project, spec.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyTargets, ResourceLimits};
    use std::collections::HashMap;
    use std::time::Duration;

    fn base_spec(health_check: Option<HealthCheck>) -> ServiceContainerSpec {
        ServiceContainerSpec {
            service: "web".into(),
            project: "acme".into(),
            image: "acme/web:v2".into(),
            env: HashMap::new(),
            volumes: vec![],
            port_mappings: vec!["3000:3000".into()],
            resources: ResourceLimits { cpu_nanos: None, memory_bytes: None },
            health_check,
            proxy: None,
            proxy_targets: ProxyTargets::Single(3000),
            fabric_network: "meridian0".into(),
            deploy_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn command_health_check_targets_container_name() {
        let spec = base_spec(Some(HealthCheck::Command { cmd: vec!["curl".into()] }));
        assert_eq!(
            compute_proxy_target(&spec, "web", Some("10.0.0.5"), "svc.internal", 3000),
            "web:3000"
        );
    }

    #[test]
    fn known_ip_targets_ip_when_no_command_health_check() {
        let spec = base_spec(Some(HealthCheck::Http { path: "/healthz".into(), port: 3000 }));
        assert_eq!(
            compute_proxy_target(&spec, "web", Some("10.0.0.5"), "svc.internal", 3000),
            "10.0.0.5:3000"
        );
    }

    #[test]
    fn falls_back_to_dns_name_without_ip() {
        let spec = base_spec(None);
        assert_eq!(
            compute_proxy_target(&spec, "web", None, "svc.internal", 3000),
            "acme-web.svc.internal:3000"
        );
    }

    #[test]
    fn qualifies_unnamespaced_image() {
        assert_eq!(qualify_image("web:v2", "registry.example.com"), "registry.example.com/web:v2");
        assert_eq!(qualify_image("acme/web:v2", "registry.example.com"), "acme/web:v2");
    }

    #[test]
    fn glob_matches_old_container_names() {
        assert!(is_stale_old_name("web_old_1700000000", "web"));
        assert!(!is_stale_old_name("web2_old_1700000000", "web"));
    }
}
