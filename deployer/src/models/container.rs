//! Container models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a container as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopping,
    Stopped,
    Removed,
    Unknown,
}

impl ContainerStatus {
    /// Map a docker `State.Status` string
    pub fn from_runtime(status: &str) -> Self {
        match status {
            "running" => ContainerStatus::Running,
            "restarting" | "removing" => ContainerStatus::Stopping,
            "created" | "exited" | "dead" | "paused" => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// Restart policy attached to a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn from_runtime(name: &str) -> Self {
        match name {
            "always" => RestartPolicy::Always,
            "unless-stopped" => RestartPolicy::UnlessStopped,
            "on-failure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::No,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
        }
    }
}

/// Derived health of a launched instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    RunningWithoutHealthcheck,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::RunningWithoutHealthcheck => "running-without-healthcheck",
        };
        f.write_str(s)
    }
}

/// A point-in-time view of one container.
///
/// Handles are transient lookups against the runtime and must not be kept
/// across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Runtime container id
    pub id: String,

    /// Container name without the leading slash
    pub name: String,

    /// Image reference the container was created from
    pub image: String,

    /// Content id of the image the container runs
    pub image_id: String,

    /// Host pid of the main process, absent once the process is gone
    pub pid: Option<u32>,

    pub restart_policy: RestartPolicy,

    pub status: ContainerStatus,

    /// `State.Health.Status`, absent if the image declares no healthcheck
    pub health: Option<String>,
}

impl ContainerHandle {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Derive the health status from the observed state
    pub fn health_status(&self) -> HealthStatus {
        match self.health.as_deref() {
            Some("healthy") => HealthStatus::Healthy,
            Some("unhealthy") => HealthStatus::Unhealthy,
            Some(_) => HealthStatus::Unknown,
            None if self.is_running() => HealthStatus::RunningWithoutHealthcheck,
            None => HealthStatus::Unknown,
        }
    }
}
