//! Deployment run
//!
//! One run is a linear sequence: authenticate, capture a backup of the
//! running image, pull, tear the old container down, write the env file,
//! launch, wait for health, and roll back once if the launch or health check
//! fails.
//!
//! Callers must not start two runs against the same container at once; the
//! run holds no lock of its own. Once teardown starts the run always goes to
//! completion.

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::authn::registry::authenticate;
use crate::deploy::health::{await_healthy, HealthPolicy, HealthReport};
use crate::deploy::launcher::launch;
use crate::deploy::rollback::roll_back;
use crate::deploy::runtime::{current_instance, ContainerRuntime, LaunchSpec};
use crate::deploy::terminator::Terminator;
use crate::errors::DeployError;
use crate::models::container::{HealthStatus, RestartPolicy};
use crate::models::deployment::{
    DeploymentOutcome, DeploymentTarget, Failure, RollbackReport,
};
use crate::models::image::ImageRef;
use crate::storage::settings::Settings;

/// Replace the running container with `settings.image`.
///
/// Returns `Err` for failures that end the run before a launch was
/// attempted (configuration, authentication, pull, teardown). Launch and
/// health failures are reported through the outcome together with the
/// rollback result.
pub async fn run<R>(settings: &Settings, runtime: &R) -> Result<DeploymentOutcome, DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    let run_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("deploy", run_id = %run_id, container = %settings.container_name);
    run_inner(run_id, settings, runtime).instrument(span).await
}

async fn run_inner<R>(
    run_id: String,
    settings: &Settings,
    runtime: &R,
) -> Result<DeploymentOutcome, DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    let started_at = Utc::now();
    let mut target = DeploymentTarget::new(settings.container_name.clone(), settings.image.clone());
    info!("Deploying {} as {}", target.image, target.name);

    authenticate(runtime, &settings.credentials).await?;

    target.backup = capture_backup(runtime, &target).await?;

    info!("Pulling {}", target.image);
    runtime.pull(&target.image.to_string()).await?;

    Terminator::new(runtime, &settings.termination)
        .with_credentials(&settings.credentials)
        .terminate(&target.name)
        .await?;

    let spec = LaunchSpec {
        name: target.name.clone(),
        image: target.image.to_string(),
        env_file: settings.layout.env_file().path().to_path_buf(),
        restart_policy: RestartPolicy::UnlessStopped,
        volumes: settings.layout.volumes(),
    };

    let primary = async {
        materialize(settings).await?;
        launch(runtime, &spec).await?;
        await_healthy(runtime, &target.name, &settings.health, HealthPolicy::Strict).await
    }
    .await;

    let mut outcome = DeploymentOutcome {
        run_id,
        container: target.name.clone(),
        image: target.image.to_string(),
        failure: None,
        last_health: HealthStatus::Unknown,
        rollback: RollbackReport::NotAttempted,
        diagnostics: Vec::new(),
        started_at,
        finished_at: started_at,
    };

    match primary {
        Ok(HealthReport { status, polls, elapsed }) => {
            info!(
                "Deployed {} ({} after {} poll(s), {:?})",
                target.image, status, polls, elapsed
            );
            outcome.last_health = status;
        }
        Err(e) if e.is_rollback_trigger() => {
            error!("Deployment of {} failed: {}", target.image, e);
            if let DeployError::HealthCheckTimeout { last, .. } = &e {
                outcome.last_health = *last;
            }
            outcome.diagnostics = collect_diagnostics(runtime, &target.name, settings.log_tail_lines).await;

            let rollback = roll_back(runtime, &target, &spec, &settings.health, settings.rollback_policy).await;
            outcome.failure = Some(match &rollback {
                RollbackReport::Failed { step, detail } => Failure::from(&DeployError::RollbackFailed {
                    step: *step,
                    detail: format!("{} (after: {})", detail, e),
                }),
                _ => Failure::from(&e),
            });
            outcome.rollback = rollback;
        }
        Err(e) => return Err(e),
    }

    outcome.finished_at = Utc::now();
    Ok(outcome)
}

/// Re-tag the running container's image so it survives the pull
async fn capture_backup<R>(
    runtime: &R,
    target: &DeploymentTarget,
) -> Result<Option<ImageRef>, DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    let Some(current) = current_instance(runtime, &target.name).await? else {
        warn!(
            "No running instance of {}; rollback will be unavailable",
            target.name
        );
        return Ok(None);
    };

    let backup = target.image.backup();
    runtime.tag(&current.image_id, &backup.to_string()).await?;
    info!("Captured {} ({}) as {}", current.image, current.image_id, backup);
    Ok(Some(backup))
}

/// Write the env file, creating the deployment directories if needed.
///
/// This happens after teardown, so a failure is treated as a failed launch.
async fn materialize(settings: &Settings) -> Result<(), DeployError> {
    let env_file = settings.layout.env_file();
    let result = async {
        settings.layout.setup().await?;
        settings.service_env.write(&env_file).await
    }
    .await;

    result.map(|_| ()).map_err(|e| {
        DeployError::LaunchFailure(format!(
            "Could not write {}: {}",
            env_file.path().display(),
            e
        ))
    })
}

async fn collect_diagnostics<R>(runtime: &R, name: &str, lines: usize) -> Vec<String>
where
    R: ContainerRuntime + ?Sized,
{
    if lines == 0 {
        return Vec::new();
    }
    match runtime.logs_tail(name, lines).await {
        Ok(tail) => tail,
        Err(e) => {
            warn!("Could not read logs of {}: {}", name, e);
            vec![format!("<logs unavailable: {}>", e)]
        }
    }
}
