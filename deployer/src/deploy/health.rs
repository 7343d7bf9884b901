//! Health monitor for a freshly launched container

use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::deploy::runtime::ContainerRuntime;
use crate::errors::DeployError;
use crate::models::container::HealthStatus;

/// Health monitor options
#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// Delay between polls
    pub interval: Duration,

    /// Total wall-clock budget, measured from the first poll
    pub budget: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            budget: Duration::from_secs(60),
        }
    }
}

/// When a poll counts as success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPolicy {
    /// Healthy, or running when the image has no healthcheck
    Strict,
    /// Observed running, whatever the healthcheck says
    RunningIsEnough,
}

/// Successful end of monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Poll `name` until it is healthy or the budget runs out.
///
/// A failed query counts as [`HealthStatus::Unknown`]. The budget is a
/// deadline: a poll still in flight when it passes is abandoned.
pub async fn await_healthy<R>(
    runtime: &R,
    name: &str,
    options: &HealthOptions,
    policy: HealthPolicy,
) -> Result<HealthReport, DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    let started = Instant::now();
    let deadline = started.checked_add(options.budget).ok_or_else(|| {
        DeployError::ConfigError(format!("Health budget {:?} is out of range", options.budget))
    })?;
    let mut last = HealthStatus::Unknown;
    let mut polls = 0;

    info!(
        "Waiting up to {:?} for {} to become healthy (every {:?})",
        options.budget, name, options.interval
    );

    loop {
        polls += 1;
        let polled = match timeout_at(deadline, runtime.inspect(name)).await {
            Ok(polled) => polled,
            Err(_) => {
                warn!("Health poll {} for {} outlived the budget", polls, name);
                break;
            }
        };

        let mut running = false;
        last = match polled {
            Ok(Some(handle)) => {
                running = handle.is_running();
                handle.health_status()
            }
            Ok(None) => {
                debug!("Container {} not found during health check", name);
                HealthStatus::Unknown
            }
            Err(e) => {
                warn!("Health poll {} for {} failed: {}", polls, name, e);
                HealthStatus::Unknown
            }
        };
        debug!("Health poll {} for {}: {}", polls, name, last);

        match (last, policy) {
            (HealthStatus::Healthy, _) => {
                info!("Container {} is healthy after {} poll(s)", name, polls);
                return Ok(report(last, polls, started));
            }
            (HealthStatus::RunningWithoutHealthcheck, _) => {
                warn!(
                    "Container {} declares no healthcheck; accepting it because it is running",
                    name
                );
                return Ok(report(last, polls, started));
            }
            (_, HealthPolicy::RunningIsEnough) if running => {
                warn!(
                    "Container {} is running with health '{}'; accepted without a passing healthcheck",
                    name, last
                );
                return Ok(report(last, polls, started));
            }
            _ => {}
        }

        let next = Instant::now().checked_add(options.interval).unwrap_or(deadline);
        if next >= deadline {
            sleep_until(deadline).await;
            break;
        }
        sleep_until(next).await;
    }

    let waited = started.elapsed();
    warn!("Container {} not healthy after {:?} (last: {})", name, waited, last);
    Err(DeployError::HealthCheckTimeout { last, waited })
}

fn report(status: HealthStatus, polls: u32, started: Instant) -> HealthReport {
    HealthReport {
        status,
        polls,
        elapsed: started.elapsed(),
    }
}
