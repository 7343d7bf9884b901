//! Error types for the deployer

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::container::HealthStatus;
use crate::models::deployment::RollbackStep;

/// Main error type for a deployment run
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfig(Vec<String>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Registry authentication failed: {0}")]
    AuthFailure(String),

    #[error("Image pull failed: {0}")]
    PullFailure(String),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("Could not remove container {container} after every escalation level: {detail}")]
    TerminationExhausted { container: String, detail: String },

    #[error("Launch failed: {0}")]
    LaunchFailure(String),

    #[error("Health check timed out after {waited:?} (last status: {last})")]
    HealthCheckTimeout { last: HealthStatus, waited: Duration },

    #[error("Rollback failed at {step}: {detail}")]
    RollbackFailed { step: RollbackStep, detail: String },
}

/// Serializable classification of a [`DeployError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingConfig,
    Config,
    AuthFailure,
    PullFailure,
    Runtime,
    Io,
    TerminationExhausted,
    LaunchFailure,
    HealthCheckTimeout,
    RollbackFailed,
}

impl DeployError {
    /// Classify the error for the outcome record
    pub fn kind(&self) -> FailureKind {
        match self {
            DeployError::IoError(_) | DeployError::JsonError(_) => FailureKind::Io,
            DeployError::MissingConfig(_) => FailureKind::MissingConfig,
            DeployError::ConfigError(_) => FailureKind::Config,
            DeployError::AuthFailure(_) => FailureKind::AuthFailure,
            DeployError::PullFailure(_) => FailureKind::PullFailure,
            DeployError::RuntimeError(_) => FailureKind::Runtime,
            DeployError::TerminationExhausted { .. } => FailureKind::TerminationExhausted,
            DeployError::LaunchFailure(_) => FailureKind::LaunchFailure,
            DeployError::HealthCheckTimeout { .. } => FailureKind::HealthCheckTimeout,
            DeployError::RollbackFailed { .. } => FailureKind::RollbackFailed,
        }
    }

    /// Whether this error triggers the rollback controller
    pub fn is_rollback_trigger(&self) -> bool {
        matches!(
            self,
            DeployError::LaunchFailure(_) | DeployError::HealthCheckTimeout { .. }
        )
    }
}
