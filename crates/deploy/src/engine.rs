//! Container engine command construction (spec §6 "Container engine":
//! `pull`, `run`, `rename`, `rm -f`, `ps`, `inspect`, `images`, `rmi`,
//! `system prune`, `exec`). Docker-compatible and Podman-compatible
//! engines are both supported — the command syntax used here is the
//! subset identical between the two (spec §6).

use crate::config::{ResourceLimits, ServiceContainerSpec};
use crate::error::{DeployError, Result};
use crate::ssh::{CommandOutput, Executor};
use std::sync::Arc;

/// Single-quotes a shell argument, the way a remote-exec command string
/// must be built when there is no argv array to hand the channel — only
/// one opaque command string (spec §4.1's "run remote shell commands").
fn shq(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub struct ImageRecord {
    pub repo_tag: String,
    pub image_id: String,
    pub created_at_unix: i64,
}

/// Owns its executor via `Arc` (the teacher's `Arc<DeployableContext>`
/// shape in `deploy.rs`) rather than borrowing it, so a rollback guard
/// can clone the engine and run cleanup from a spawned task on `Drop`.
#[derive(Clone)]
pub struct Engine {
    executor: Arc<dyn Executor>,
    engine_bin: String,
}

impl Engine {
    pub fn new(executor: Arc<dyn Executor>, engine_bin: impl Into<String>) -> Self {
        Self { executor, engine_bin: engine_bin.into() }
    }

    async fn run_cli(&self, args: &str) -> Result<CommandOutput> {
        let command = format!("{} {args}", self.engine_bin);
        self.executor.run(&command).await
    }

    fn require_success(&self, command: &str, out: CommandOutput) -> Result<CommandOutput> {
        if out.success() {
            Ok(out)
        } else {
            Err(DeployError::EngineCommand {
                host: String::new(),
                command: command.to_owned(),
                status: out.status,
                stderr: out.stderr,
            })
        }
    }

    /// `engine ps -a --format '{{.Names}}'` — used both to clean up
    /// stale `N_old_*` containers (spec §4.6 step 1) and to check whether
    /// `N` already exists before renaming it.
    pub async fn list_container_names(&self) -> Result<Vec<String>> {
        let out = self.run_cli("ps -a --format '{{.Names}}'").await?;
        Ok(out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect())
    }

    /// Step 1: `engine rm -f <name>_old_*` cleanup of prior aborted
    /// deploys, matched by the `glob`-style pattern rather than passed
    /// as a literal wildcard (the engine CLI does not glob names itself).
    pub async fn remove_stale_old_containers(&self, container_name: &str) -> Result<()> {
        for name in self.list_container_names().await? {
            if crate::target::is_stale_old_name(&name, container_name) {
                self.rm_f(&name).await?;
            }
        }
        Ok(())
    }

    pub async fn rm_f(&self, name: &str) -> Result<()> {
        let cmd = format!("rm -f {}", shq(name));
        let out = self.run_cli(&cmd).await?;
        // rm -f against a name that doesn't exist is not a deployment
        // failure; only a non-zero status with output present on an
        // existing container is worth surfacing.
        if out.success() || out.stderr.contains("No such container") {
            Ok(())
        } else {
            self.require_success(&cmd, out).map(|_| ())
        }
    }

    /// Step 2: atomic rename to `N_old_<unix_ts>` (spec §4.6 "State
    /// transitions" — the old container keeps its IP and keeps serving).
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let cmd = format!("rename {} {}", shq(from), shq(to));
        let out = self.run_cli(&cmd).await?;
        self.require_success(&cmd, out).map(|_| ())
    }

    /// Step 3: pull the (possibly registry-qualified) image.
    pub async fn pull(&self, image: &str) -> Result<()> {
        let cmd = format!("pull {}", shq(image));
        let out = self.run_cli(&cmd).await?;
        if !out.success() {
            return Err(DeployError::ImagePullFailed { image: image.to_owned(), reason: out.stderr });
        }
        Ok(())
    }

    /// Step 4: run the new container named `N`, `--restart
    /// unless-stopped`, attached to the fabric network, with env/volume/
    /// port/resource options from the service spec.
    pub async fn run(&self, name: &str, image: &str, spec: &ServiceContainerSpec) -> Result<()> {
        let mut args = format!(
            "run -d --name {} --restart unless-stopped --network {}",
            shq(name),
            shq(&spec.fabric_network)
        );
        for (k, v) in &spec.env {
            args.push_str(&format!(" -e {}", shq(&format!("{k}={v}"))));
        }
        for vol in &spec.volumes {
            args.push_str(&format!(" -v {}", shq(vol)));
        }
        for port in &spec.port_mappings {
            args.push_str(&format!(" -p {}", shq(port)));
        }
        apply_resource_limits(&mut args, &spec.resources);
        args.push(' ');
        args.push_str(&shq(image));

        let out = self.run_cli(&args).await?;
        self.require_success(&args, out).map(|_| ())
    }

    /// Step 5: poll `inspect` for `Status == "running"`, up to
    /// `max_attempts` × 1s (spec §4.6 step 5, testable property 7).
    pub async fn poll_until_running(&self, name: &str, max_attempts: u32) -> Result<()> {
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            if self.inspect_status(name).await?.as_deref() == Some("running") {
                return Ok(());
            }
        }
        Err(DeployError::ContainerDidNotStart { name: name.to_owned(), attempts: max_attempts })
    }

    pub async fn inspect_status(&self, name: &str) -> Result<Option<String>> {
        let cmd = format!("inspect --format '{{{{.State.Status}}}}' {}", shq(name));
        let out = self.run_cli(&cmd).await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout.trim().to_owned()))
    }

    pub async fn inspect_ip(&self, name: &str, network: &str) -> Result<Option<String>> {
        let cmd = format!(
            "inspect --format '{{{{with index .NetworkSettings.Networks {}}}}}{{{{.IPAddress}}}}{{{{end}}}}' {}",
            shq(network),
            shq(name)
        );
        let out = self.run_cli(&cmd).await?;
        if !out.success() {
            return Ok(None);
        }
        let ip = out.stdout.trim();
        if ip.is_empty() { Ok(None) } else { Ok(Some(ip.to_owned())) }
    }

    pub async fn stop_and_remove(&self, name: &str) -> Result<()> {
        let _ = self.run_cli(&format!("stop {}", shq(name))).await;
        self.rm_f(name).await
    }

    /// Step 6: `exec` into the proxy sidecar container and invoke its
    /// deploy command (spec §4.6).
    pub async fn exec_in_container(&self, container: &str, command_args: &[String]) -> Result<CommandOutput> {
        let quoted_args: Vec<String> = command_args.iter().map(|a| shq(a)).collect();
        let cmd = format!("exec {} {}", shq(container), quoted_args.join(" "));
        self.run_cli(&cmd).await
    }

    /// `engine images --format '{{.Repository}}:{{.Tag}}\t{{.ID}}\t{{.CreatedAt}}'`
    /// filtered to a given repository (spec §4.6 step 7, "prune images
    /// retaining the N most recent per service").
    pub async fn list_images_for_repo(&self, repo: &str) -> Result<Vec<ImageRecord>> {
        let cmd = format!(
            "images --format '{{{{.Repository}}}}:{{{{.Tag}}}}\\t{{{{.ID}}}}\\t{{{{.CreatedAt}}}}' {}",
            shq(repo)
        );
        let out = self.run_cli(&cmd).await?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let cols: Vec<&str> = line.split('\t').collect();
                let [repo_tag, image_id, created] = cols.as_slice() else { return None };
                Some(ImageRecord {
                    repo_tag: (*repo_tag).to_owned(),
                    image_id: (*image_id).to_owned(),
                    created_at_unix: parse_docker_created_at(created),
                })
            })
            .collect())
    }

    pub async fn rmi(&self, image_id: &str) -> Result<()> {
        let _ = self.run_cli(&format!("rmi {}", shq(image_id))).await;
        Ok(())
    }

    /// Keep the `retain` most-recently-created images for `repo`, removing
    /// the rest, then prune dangling images (spec §4.6 step 7).
    pub async fn prune_images(&self, repo: &str, retain: usize) -> Result<()> {
        let mut images = self.list_images_for_repo(repo).await?;
        images.sort_by_key(|img| std::cmp::Reverse(img.created_at_unix));
        for stale in images.into_iter().skip(retain) {
            self.rmi(&stale.image_id).await?;
        }
        let _ = self.run_cli("image prune -f").await;
        Ok(())
    }
}

fn apply_resource_limits(args: &mut String, limits: &ResourceLimits) {
    if let Some(cpus) = limits.cpu_nanos {
        args.push_str(&format!(" --cpus {}", cpus as f64 / 1_000_000_000.0));
    }
    if let Some(mem) = limits.memory_bytes {
        args.push_str(&format!(" --memory {mem}"));
    }
}

/// Parses docker/podman's default `{{.CreatedAt}}` format, e.g.
/// `"2023-11-02 14:32:10 +0000 UTC"`. Falls back to 0 (oldest) on an
/// unparsable row rather than failing the whole prune.
fn parse_docker_created_at(s: &str) -> i64 {
    let trimmed = s.trim().trim_end_matches("UTC").trim();
    chrono::DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::FakeExecutor;

    fn spec() -> ServiceContainerSpec {
        ServiceContainerSpec {
            service: "web".into(),
            project: "acme".into(),
            image: "acme/web:v2".into(),
            env: std::collections::HashMap::new(),
            volumes: vec![],
            port_mappings: vec!["80:3000/tcp".into()],
            resources: ResourceLimits { cpu_nanos: None, memory_bytes: None },
            health_check: None,
            proxy: None,
            proxy_targets: crate::config::ProxyTargets::None,
            fabric_network: "meridian0".into(),
            deploy_timeout: std::time::Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn run_builds_restart_unless_stopped_flag() {
        let fake = std::sync::Arc::new(FakeExecutor::new(vec![]));
        let engine = Engine::new(fake.clone(), "docker");
        engine.run("web", "acme/web:v2", &spec()).await.unwrap();
        let calls = fake.calls();
        assert!(calls[0].contains("--restart unless-stopped"));
        assert!(calls[0].contains("--network 'meridian0'"));
    }

    #[tokio::test]
    async fn poll_until_running_fails_after_max_attempts() {
        use crate::ssh::CommandOutput;
        let scripted = vec![CommandOutput { status: 1, stdout: String::new(), stderr: String::new() }; 3];
        let fake = FakeExecutor::new(scripted);
        let engine = Engine::new(std::sync::Arc::new(fake), "docker");
        let result = engine.poll_until_running("web", 3).await;
        assert!(matches!(result, Err(DeployError::ContainerDidNotStart { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn poll_until_running_succeeds_on_status_running() {
        use crate::ssh::CommandOutput;
        let scripted = vec![CommandOutput { status: 0, stdout: "running".into(), stderr: String::new() }];
        let fake = FakeExecutor::new(scripted);
        let engine = Engine::new(std::sync::Arc::new(fake), "docker");
        engine.poll_until_running("web", 3).await.unwrap();
    }

    #[test]
    fn prune_retains_most_recently_created_images() {
        let created_at_unix = parse_docker_created_at("2023-11-02 14:32:10 +0000 UTC");
        assert_eq!(created_at_unix, 1698935530);
        assert!(parse_docker_created_at("garbage") == 0);

        let mut images = [
            ImageRecord { repo_tag: "acme/web:v1".into(), image_id: "a".into(), created_at_unix: 100 },
            ImageRecord { repo_tag: "acme/web:v2".into(), image_id: "b".into(), created_at_unix: 300 },
            ImageRecord { repo_tag: "acme/web:v3".into(), image_id: "c".into(), created_at_unix: 200 },
        ];
        images.sort_by_key(|img| std::cmp::Reverse(img.created_at_unix));
        let ids: Vec<&str> = images.iter().map(|i| i.image_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }
}
