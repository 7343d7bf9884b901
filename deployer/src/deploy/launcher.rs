//! Launcher for the replacement container

use tracing::{error, info};

use crate::deploy::runtime::{ContainerRuntime, LaunchSpec};
use crate::errors::DeployError;

/// Start a container from `spec` without waiting for readiness.
///
/// Exactly one container with the spec's name must exist afterwards.
pub async fn launch<R>(runtime: &R, spec: &LaunchSpec) -> Result<String, DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    info!("Launching {} from {}", spec.name, spec.image);

    let id = runtime.run(spec).await.map_err(|e| match e {
        DeployError::LaunchFailure(msg) => DeployError::LaunchFailure(msg),
        other => DeployError::LaunchFailure(other.to_string()),
    })?;

    let ids = runtime
        .list_ids(&spec.name)
        .await
        .map_err(|e| DeployError::LaunchFailure(format!("Could not verify launch: {}", e)))?;

    match ids.len() {
        1 => {
            info!("Launched {} as {}", spec.name, short_id(&id));
            Ok(id)
        }
        0 => Err(DeployError::LaunchFailure(format!(
            "Container {} vanished right after start",
            spec.name
        ))),
        n => {
            error!("Found {} containers named {}: {:?}", n, spec.name, ids);
            Err(DeployError::LaunchFailure(format!(
                "Runtime left {} containers named {}",
                n, spec.name
            )))
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
