//! Rollback controller

use tracing::{error, info, warn};

use crate::deploy::health::{await_healthy, HealthOptions, HealthPolicy};
use crate::deploy::launcher::launch;
use crate::deploy::runtime::{ContainerRuntime, LaunchSpec};
use crate::models::deployment::{DeploymentTarget, RollbackReport, RollbackStep};

/// Restore the backup image after a failed launch or health check.
///
/// The backup is re-tagged under the new image reference so `spec` is
/// reused unchanged. There is exactly one attempt.
pub async fn roll_back<R>(
    runtime: &R,
    target: &DeploymentTarget,
    spec: &LaunchSpec,
    health: &HealthOptions,
    policy: HealthPolicy,
) -> RollbackReport
where
    R: ContainerRuntime + ?Sized,
{
    let Some(backup) = &target.backup else {
        error!(
            "No previous instance of {} was running, rollback is unavailable",
            target.name
        );
        return RollbackReport::Unavailable;
    };

    info!("Rolling back {} to {}", target.name, backup);

    if let Err(e) = runtime.remove(&target.name, true).await {
        warn!("Removing failed instance {} reported: {}", target.name, e);
    }
    match runtime.inspect(&target.name).await {
        Ok(None) => {}
        Ok(Some(_)) => {
            return failed(
                RollbackStep::RemoveFailedInstance,
                format!("container {} is still present", target.name),
            )
        }
        Err(e) => return failed(RollbackStep::RemoveFailedInstance, e.to_string()),
    }

    let image = target.image.to_string();
    if let Err(e) = runtime.tag(&backup.to_string(), &image).await {
        return failed(RollbackStep::RetagBackup, e.to_string());
    }

    if let Err(e) = launch(runtime, spec).await {
        return failed(RollbackStep::Relaunch, e.to_string());
    }

    match await_healthy(runtime, &target.name, health, policy).await {
        Ok(report) => {
            info!(
                "Rollback of {} succeeded, backup image is running ({})",
                target.name, report.status
            );
            RollbackReport::Succeeded {
                health: report.status,
            }
        }
        Err(e) => failed(RollbackStep::HealthCheck, e.to_string()),
    }
}

fn failed(step: RollbackStep, detail: String) -> RollbackReport {
    error!("Rollback failed at {}: {}", step, detail);
    RollbackReport::Failed { step, detail }
}
