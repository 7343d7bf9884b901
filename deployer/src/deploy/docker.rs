//! Docker CLI runtime

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::deploy::runtime::{ContainerRuntime, LaunchSpec};
use crate::errors::DeployError;
use crate::models::container::{ContainerHandle, ContainerStatus, RestartPolicy};

/// [`ContainerRuntime`] backed by the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    daemon_restart: Vec<String>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            daemon_restart: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "docker".to_string(),
            ],
        }
    }

    /// Use a different docker-compatible binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Override the command used to restart the daemon
    pub fn with_daemon_restart(mut self, command: Vec<String>) -> Self {
        self.daemon_restart = command;
        self
    }

    async fn output(&self, args: &[&str]) -> Result<Output, DeployError> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::RuntimeError(format!("Failed to run {}: {}", self.binary, e)))
    }

    /// Run a command and fail unless it exits zero
    async fn exec(&self, args: &[&str]) -> Result<String, DeployError> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(DeployError::RuntimeError(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                stderr_of(&output)
            )))
        }
    }

    /// Like [`exec`](Self::exec) but a missing container counts as success
    async fn exec_tolerating_absent(&self, args: &[&str]) -> Result<(), DeployError> {
        let output = self.output(args).await?;
        if output.status.success() || is_no_such_container(&stderr_of(&output)) {
            Ok(())
        } else {
            Err(DeployError::RuntimeError(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                stderr_of(&output)
            )))
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_no_such_container(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

/// Pair each `docker logs --timestamps` line with its time. Lines without a
/// parsable prefix inherit the time of the line before them.
fn stamped(stream: &str) -> Vec<(DateTime<Utc>, &str)> {
    let mut last = DateTime::<Utc>::MIN_UTC;
    stream
        .lines()
        .map(|line| {
            if let Some(ts) = line
                .split_once(' ')
                .and_then(|(ts, _)| DateTime::parse_from_rfc3339(ts).ok())
            {
                last = ts.with_timezone(&Utc);
            }
            (last, line)
        })
        .collect()
}

/// Interleave both output streams in time order and keep the last `lines`
fn merge_by_timestamp(stdout: &str, stderr: &str, lines: usize) -> Vec<String> {
    let (out, err) = (stamped(stdout), stamped(stderr));
    let mut merged = Vec::with_capacity(out.len() + err.len());
    let (mut i, mut j) = (0, 0);
    while i < out.len() || j < err.len() {
        let take_out = j >= err.len() || (i < out.len() && out[i].0 <= err[j].0);
        if take_out {
            merged.push(out[i].1.to_string());
            i += 1;
        } else {
            merged.push(err[j].1.to_string());
            j += 1;
        }
    }

    let excess = merged.len().saturating_sub(lines);
    merged.drain(..excess);
    merged
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    name: String,
    image: String,
    state: InspectState,
    config: InspectConfig,
    host_config: InspectHostConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    restart_policy: InspectRestartPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    name: String,
}

impl From<InspectEntry> for ContainerHandle {
    fn from(entry: InspectEntry) -> Self {
        ContainerHandle {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            image: entry.config.image,
            image_id: entry.image,
            pid: (entry.state.pid != 0).then_some(entry.state.pid),
            restart_policy: RestartPolicy::from_runtime(&entry.host_config.restart_policy.name),
            status: ContainerStatus::from_runtime(&entry.state.status),
            health: entry.state.health.map(|h| h.status),
        }
    }
}

/// Parse `docker inspect` output into a handle
fn parse_inspect(stdout: &[u8]) -> Result<Option<ContainerHandle>, DeployError> {
    let entries: Vec<InspectEntry> = serde_json::from_slice(stdout)?;
    Ok(entries.into_iter().next().map(ContainerHandle::from))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn login(
        &self,
        registry: &str,
        username: &str,
        secret: &SecretString,
    ) -> Result<(), DeployError> {
        let mut child = Command::new(&self.binary)
            .args(["login", registry, "-u", username, "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DeployError::AuthFailure(format!("Failed to run docker login: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(secret.expose_secret().as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DeployError::AuthFailure(format!(
                "{} rejected the credentials: {}",
                registry,
                stderr_of(&output)
            )))
        }
    }

    async fn pull(&self, image: &str) -> Result<(), DeployError> {
        self.exec(&["pull", "--quiet", image])
            .await
            .map(|_| ())
            .map_err(|e| DeployError::PullFailure(format!("{}: {}", image, e)))
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), DeployError> {
        self.exec(&["tag", source, target]).await.map(|_| ())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerHandle>, DeployError> {
        let output = self.output(&["inspect", "--type", "container", name]).await?;
        if output.status.success() {
            return parse_inspect(&output.stdout);
        }

        let stderr = stderr_of(&output);
        if is_no_such_container(&stderr) {
            Ok(None)
        } else {
            Err(DeployError::RuntimeError(format!("docker inspect failed: {}", stderr)))
        }
    }

    async fn list_ids(&self, name: &str) -> Result<Vec<String>, DeployError> {
        let filter = format!("name=^/{}$", name);
        let stdout = self
            .exec(&["ps", "--all", "--quiet", "--no-trunc", "--filter", &filter])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn set_restart_policy(
        &self,
        name: &str,
        policy: RestartPolicy,
    ) -> Result<(), DeployError> {
        self.exec_tolerating_absent(&["update", "--restart", policy.as_str(), name])
            .await
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), DeployError> {
        let secs = timeout.as_secs().to_string();
        self.exec_tolerating_absent(&["stop", "--time", &secs, name]).await
    }

    async fn kill(&self, name: &str) -> Result<(), DeployError> {
        let output = self.output(&["kill", name]).await?;
        let stderr = stderr_of(&output);
        // Killing an already stopped container is not an error for us.
        if output.status.success() || is_no_such_container(&stderr) || stderr.contains("is not running") {
            Ok(())
        } else {
            Err(DeployError::RuntimeError(format!("docker kill failed: {}", stderr)))
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), DeployError> {
        if force {
            self.exec_tolerating_absent(&["rm", "--force", name]).await
        } else {
            self.exec_tolerating_absent(&["rm", name]).await
        }
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<String, DeployError> {
        let env_file = spec.env_file.display().to_string();
        let mounts: Vec<String> = spec
            .volumes
            .iter()
            .map(|(host, container)| format!("{}:{}", host.display(), container))
            .collect();

        let mut args: Vec<&str> = vec![
            "run",
            "--detach",
            "--name",
            spec.name.as_str(),
            "--restart",
            spec.restart_policy.as_str(),
            "--env-file",
            env_file.as_str(),
        ];
        for mount in &mounts {
            args.push("--volume");
            args.push(mount);
        }
        args.push(&spec.image);

        self.exec(&args)
            .await
            .map_err(|e| DeployError::LaunchFailure(e.to_string()))
    }

    async fn logs_tail(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        let lines_arg = lines.to_string();
        let output = self
            .output(&["logs", "--timestamps", "--tail", &lines_arg, name])
            .await?;
        if !output.status.success() {
            return Err(DeployError::RuntimeError(format!(
                "docker logs failed: {}",
                stderr_of(&output)
            )));
        }

        // The container's stderr arrives on ours
        Ok(merge_by_timestamp(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            lines,
        ))
    }

    async fn kill_process(&self, pid: u32) -> Result<(), DeployError> {
        let delivered = tokio::task::spawn_blocking(move || {
            let pid = Pid::from_u32(pid);
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            // A process that is already gone needs no signal.
            system.process(pid).map(|p| p.kill_with(Signal::Kill))
        })
        .await
        .map_err(|e| DeployError::RuntimeError(format!("Signal task failed: {}", e)))?;

        match delivered {
            None => Ok(()),
            Some(Some(true)) => Ok(()),
            Some(Some(false)) => Err(DeployError::RuntimeError(format!(
                "SIGKILL to pid {} was refused",
                pid
            ))),
            Some(None) => Err(DeployError::RuntimeError(
                "SIGKILL is not supported on this platform".to_string(),
            )),
        }
    }

    async fn restart_daemon(&self) -> Result<(), DeployError> {
        let (program, args) = self
            .daemon_restart
            .split_first()
            .ok_or_else(|| DeployError::ConfigError("Empty daemon restart command".to_string()))?;

        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| DeployError::RuntimeError(format!("Failed to run {}: {}", program, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(DeployError::RuntimeError(format!(
                "{} exited with {}",
                self.daemon_restart.join(" "),
                status
            )))
        }
    }
}
