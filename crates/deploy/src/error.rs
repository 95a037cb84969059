//! Error taxonomy for the deployment engine (spec §7 "Deployment failure").
//! Every variant is surfaced per `(service, host)`; none of them abort a
//! rolling deploy across other slots.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ssh session to {host} failed: {source}")]
    Ssh {
        host: String,
        #[source]
        source: russh::Error,
    },

    #[error("engine command {command:?} on {host} exited with status {status}: {stderr}")]
    EngineCommand {
        host: String,
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("image pull failed for {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("container {name} did not reach running state after {attempts} attempts")]
    ContainerDidNotStart { name: String, attempts: u32 },

    #[error("container {name} did not become healthy within {timeout_secs}s")]
    HealthTimeout { name: String, timeout_secs: u64 },

    #[error("reverse proxy deploy failed for target {target}: {reason}")]
    ProxyDeployFailed { target: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] meridian_store::StoreError),
}

pub type Result<T> = std::result::Result<T, DeployError>;
