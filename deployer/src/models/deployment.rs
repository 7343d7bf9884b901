//! Deployment models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DeployError, FailureKind};
use crate::models::container::HealthStatus;
use crate::models::image::ImageRef;

/// The service instance a run replaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTarget {
    /// Container name
    pub name: String,

    /// Image the run deploys
    pub image: ImageRef,

    /// Re-tagged copy of the previously running image.
    ///
    /// `None` until captured, and stays `None` when no previous instance
    /// existed; rollback is then unavailable.
    pub backup: Option<ImageRef>,
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>, image: ImageRef) -> Self {
        Self {
            name: name.into(),
            image,
            backup: None,
        }
    }
}

/// Steps of the rollback controller, named in failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStep {
    RemoveFailedInstance,
    RetagBackup,
    Relaunch,
    HealthCheck,
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackStep::RemoveFailedInstance => "remove failed instance",
            RollbackStep::RetagBackup => "re-tag backup image",
            RollbackStep::Relaunch => "relaunch",
            RollbackStep::HealthCheck => "health check",
        };
        f.write_str(s)
    }
}

/// What happened to the rollback in a failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RollbackReport {
    /// The primary path never needed one
    NotAttempted,

    /// No previous instance existed, nothing to restore
    Unavailable,

    /// The backup image is running again
    Succeeded { health: HealthStatus },

    /// The service is down with no automatic recovery path
    Failed { step: RollbackStep, detail: String },
}

impl RollbackReport {
    pub fn attempted(&self) -> bool {
        matches!(self, RollbackReport::Succeeded { .. } | RollbackReport::Failed { .. })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, RollbackReport::Succeeded { .. })
    }
}

/// Failure detail carried by an outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&DeployError> for Failure {
    fn from(err: &DeployError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Terminal record of one deployment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub run_id: String,

    pub container: String,

    pub image: String,

    /// `None` on success
    pub failure: Option<Failure>,

    pub last_health: HealthStatus,

    pub rollback: RollbackReport,

    /// Tail of the failed instance's logs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}

impl DeploymentOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// `0` on success, `2` when the rollback restored service, `1` otherwise
    pub fn exit_code(&self) -> i32 {
        match (&self.failure, &self.rollback) {
            (None, _) => 0,
            (Some(_), RollbackReport::Succeeded { .. }) => 2,
            (Some(_), _) => 1,
        }
    }
}
