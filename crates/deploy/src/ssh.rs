//! SSH session pooling and remote command execution (spec §4.1, the
//! engine's "shared SSH/exec plumbing"). Every engine command in §4.6
//! (`rename`, `pull`, `run`, `rm -f`, `inspect`, `exec` into the proxy
//! sidecar) is, per spec §6's "External interfaces", a CLI invocation —
//! so the deployment engine drives it the same way the reconciler drives
//! `wg`/the store CLI (spec's own `tokio::process::Command` idiom), just
//! over an SSH channel to a remote host instead of a local subprocess.
//!
//! `russh` (pure-Rust async SSH client, attested in the retrieval pack's
//! `MystenLabs-sui` manifest) provides the transport.

use async_trait::async_trait;
use russh::keys::load_secret_key;
use russh::{client, ChannelMsg, Disconnect};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Caps concurrent deployments at a configurable permit count (spec §5,
/// default 30). Acquired once per `(service, host)` deployment slot and
/// held for its duration.
#[derive(Clone)]
pub struct SshPool {
    semaphore: Arc<Semaphore>,
}

impl SshPool {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Abstracts "run a shell command somewhere" so the deployment sequence
/// can be driven against a real SSH session in production and a scripted
/// fake in tests (spec §4.6 test tooling: "exercised against a fake
/// engine client trait, not a live Docker daemon").
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, command: &str) -> crate::error::Result<CommandOutput>;
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // The fabric has no external CA-backed host-key infrastructure (spec
    // §1 scope excludes anything beyond the core three subsystems); a
    // production deploy would pin known_hosts per-host. Left as an open
    // decision, recorded in DESIGN.md.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One live SSH connection to a deployment target host.
pub struct SshSession {
    host: String,
    handle: client::Handle<ClientHandler>,
}

impl SshSession {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        private_key_path: &Path,
    ) -> crate::error::Result<Self> {
        let key_pair = load_secret_key(private_key_path, None).map_err(|e| crate::error::DeployError::Ssh {
            host: host.to_owned(),
            source: russh::Error::IO(std::io::Error::other(e.to_string())),
        })?;
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let mut handle = client::connect(config, (host, port), ClientHandler)
            .await
            .map_err(|e| crate::error::DeployError::Ssh { host: host.to_owned(), source: e })?;
        let authenticated = handle
            .authenticate_publickey(username, Arc::new(key_pair))
            .await
            .map_err(|e| crate::error::DeployError::Ssh { host: host.to_owned(), source: e })?;
        if !authenticated {
            return Err(crate::error::DeployError::Ssh {
                host: host.to_owned(),
                source: russh::Error::NotAuthenticated,
            });
        }
        Ok(Self { host: host.to_owned(), handle })
    }

    pub async fn close(&self) -> crate::error::Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| crate::error::DeployError::Ssh { host: self.host.clone(), source: e })
    }
}

#[async_trait]
impl Executor for SshSession {
    async fn run(&self, command: &str) -> crate::error::Result<CommandOutput> {
        let to_ssh_err = |e: russh::Error| crate::error::DeployError::Ssh {
            host: self.host.clone(),
            source: e,
        };

        let mut channel = self.handle.channel_open_session().await.map_err(to_ssh_err)?;
        channel.exec(true, command).await.map_err(to_ssh_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = 0i32;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status as i32,
                _ => {}
            }
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records every command issued and returns scripted responses in
    /// order, falling back to a default success once exhausted. Used by
    /// the deployment-sequence tests to assert the exact command ordering
    /// spec §8 scenario S3 lists, without a live SSH server.
    pub struct FakeExecutor {
        pub calls: Mutex<Vec<String>>,
        pub scripted: Mutex<Vec<CommandOutput>>,
    }

    impl FakeExecutor {
        pub fn new(scripted: Vec<CommandOutput>) -> Self {
            Self { calls: Mutex::new(vec![]), scripted: Mutex::new(scripted) }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn run(&self, command: &str) -> crate::error::Result<CommandOutput> {
            self.calls.lock().unwrap().push(command.to_owned());
            let mut scripted = self.scripted.lock().unwrap();
            if scripted.is_empty() {
                Ok(CommandOutput { status: 0, stdout: String::new(), stderr: String::new() })
            } else {
                Ok(scripted.remove(0))
            }
        }
    }
}
