//! Container runtime capability consumed by the deployer

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::DeployError;
use crate::models::container::{ContainerHandle, RestartPolicy};

/// Everything needed to create and start one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub env_file: PathBuf,
    pub restart_policy: RestartPolicy,
    /// `(host path, container path)` bind mounts
    pub volumes: Vec<(PathBuf, String)>,
}

/// Operations the deployer needs from the host's container runtime.
///
/// Implementations report an absent container as `Ok(None)` from
/// [`ContainerRuntime::inspect`]; callers treat absence as success in every
/// teardown step.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Log in to a registry with a secret read from memory
    async fn login(
        &self,
        registry: &str,
        username: &str,
        secret: &SecretString,
    ) -> Result<(), DeployError>;

    async fn pull(&self, image: &str) -> Result<(), DeployError>;

    /// Point `target` at the same image as `source` (an id or a reference)
    async fn tag(&self, source: &str, target: &str) -> Result<(), DeployError>;

    /// Look up a container by name
    async fn inspect(&self, name: &str) -> Result<Option<ContainerHandle>, DeployError>;

    /// Ids of every container, running or not, whose name is exactly `name`
    async fn list_ids(&self, name: &str) -> Result<Vec<String>, DeployError>;

    async fn set_restart_policy(
        &self,
        name: &str,
        policy: RestartPolicy,
    ) -> Result<(), DeployError>;

    /// Ask the container to stop, waiting up to `timeout` before the
    /// runtime kills it itself
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), DeployError>;

    async fn kill(&self, name: &str) -> Result<(), DeployError>;

    async fn remove(&self, name: &str, force: bool) -> Result<(), DeployError>;

    /// Create and start a container, returning its id
    async fn run(&self, spec: &LaunchSpec) -> Result<String, DeployError>;

    /// Last `lines` lines of the container's combined output
    async fn logs_tail(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError>;

    /// Deliver an unconditional kill signal to a host process
    async fn kill_process(&self, pid: u32) -> Result<(), DeployError>;

    /// Restart the runtime daemon itself. Affects every container on the host.
    async fn restart_daemon(&self) -> Result<(), DeployError>;
}

/// Look up the currently running instance, if any
pub async fn current_instance<R>(runtime: &R, name: &str) -> Result<Option<ContainerHandle>, DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    Ok(runtime.inspect(name).await?.filter(ContainerHandle::is_running))
}
