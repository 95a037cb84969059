//! Typed, eagerly-validated daemon configuration (spec §9 REDESIGN FLAG:
//! "explicit, fully-typed structs with early validation"). A configuration
//! error (spec §7) is surfaced before the loop ever starts, not discovered
//! mid-iteration.

use envconfig::Envconfig;
use eyre::{Context, Result};
use ipnet::Ipv4Net;
use std::time::Duration;

#[derive(Envconfig)]
pub struct RawConfig {
    #[envconfig(from = "MERIDIAN_SELF_ID")]
    pub self_id: String,
    #[envconfig(from = "MERIDIAN_IFACE", default = "wg0")]
    pub iface: String,
    #[envconfig(from = "MERIDIAN_CLUSTER_CIDR")]
    pub cluster_cidr: String,
    #[envconfig(from = "MERIDIAN_ENGINE_BIN", default = "docker")]
    pub engine_bin: String,
    #[envconfig(from = "MERIDIAN_STORE_CLI", default = "/opt/meridian/bin/corrosion")]
    pub store_cli: String,
    #[envconfig(
        from = "MERIDIAN_STORE_CONFIG",
        default = "/opt/meridian/corrosion/config.toml"
    )]
    pub store_config: String,
    #[envconfig(from = "MERIDIAN_STORE_API_PORT", default = "8080")]
    pub store_api_port: u16,
    #[envconfig(
        from = "MERIDIAN_STORE_SYSTEMD_UNIT",
        default = "meridian-corrosion.service"
    )]
    pub store_systemd_unit: String,
}

/// Validated daemon configuration. Construction is the only place the
/// cluster CIDR's shape is checked — after this, every other module can
/// assume it's a valid, sufficiently-narrow CIDR.
pub struct DaemonConfig {
    pub self_id: String,
    pub iface: String,
    pub cluster_cidr: Ipv4Net,
    pub engine_bin: String,
    pub store_cli: String,
    pub store_config: String,
    pub store_api_port: u16,
    pub store_systemd_unit: String,

    pub base_period: Duration,
    pub gc_every: u32,
    pub refresh_every: u32,
    pub store_check_every: u32,
    pub split_brain_every: u32,
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let raw = RawConfig::init_from_env().context("load daemon config from environment")?;
        let cluster_cidr: Ipv4Net = raw
            .cluster_cidr
            .parse()
            .with_context(|| format!("invalid cluster CIDR {:?}", raw.cluster_cidr))?;
        if cluster_cidr.prefix_len() > 24 {
            return Err(eyre::eyre!(
                "cluster CIDR prefix /{} is narrower than the required /24",
                cluster_cidr.prefix_len()
            ));
        }
        if raw.self_id.is_empty() {
            return Err(eyre::eyre!("MERIDIAN_SELF_ID must not be empty"));
        }

        Ok(Self {
            self_id: raw.self_id,
            iface: raw.iface,
            cluster_cidr,
            engine_bin: raw.engine_bin,
            store_cli: raw.store_cli,
            store_config: raw.store_config,
            store_api_port: raw.store_api_port,
            store_systemd_unit: raw.store_systemd_unit,
            base_period: Duration::from_secs(30),
            gc_every: 10,
            refresh_every: 20,
            store_check_every: 20,
            split_brain_every: 20,
        })
    }
}
