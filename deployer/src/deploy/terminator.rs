//! Container terminator
//!
//! Drives an existing container to a confirmed-removed state through an
//! escalation ladder. Each level trades blast radius for certainty:
//!
//! 1. disable the restart policy, stop gracefully, kill if still running,
//!    remove
//! 2. SIGKILL the container's host process as reported at that moment,
//!    wait, remove again
//! 3. restart the runtime daemon, wait, log in to the registry again, remove
//!    one last time
//!
//! Failures of individual steps are logged and recorded but never abort the
//! ladder; only the absence check after the last level decides the result.
//! If level 3 fails too, recovery is a manual host reboot.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::authn::registry::{authenticate, RegistryCredentials};
use crate::deploy::fsm::{TerminationEvent, TerminationFsm, TerminationSettings, TerminationState};
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::DeployError;
use crate::models::container::{ContainerHandle, RestartPolicy};

/// Actions the terminator can take against the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStep {
    DisableRestart,
    GracefulStop,
    Kill,
    Remove,
    SignalProcess,
    RestartDaemon,
    Reauthenticate,
}

/// Result of one attempted step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: EscalationStep,
    /// Error swallowed by the ladder, if any
    pub error: Option<String>,
    /// Nothing was sent to the runtime or the host
    pub skipped: bool,
}

/// What the terminator did
#[derive(Debug, Clone)]
pub struct TerminationReport {
    pub container: String,
    /// The container did not exist when the terminator started
    pub already_absent: bool,
    pub steps: Vec<StepRecord>,
    pub path: Vec<TerminationState>,
}

/// Result of looking at the container between steps
enum Observation {
    Absent,
    Present(ContainerHandle),
    /// The query itself failed; treated as still present
    Unknown,
}

pub struct Terminator<'a, R: ?Sized> {
    runtime: &'a R,
    settings: &'a TerminationSettings,
    credentials: Option<&'a RegistryCredentials>,
}

impl<'a, R> Terminator<'a, R>
where
    R: ContainerRuntime + ?Sized,
{
    pub fn new(runtime: &'a R, settings: &'a TerminationSettings) -> Self {
        Self {
            runtime,
            settings,
            credentials: None,
        }
    }

    /// Credentials to log in with again after a daemon restart
    pub fn with_credentials(mut self, credentials: &'a RegistryCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Remove the named container, escalating until it is gone
    pub async fn terminate(&self, name: &str) -> Result<TerminationReport, DeployError> {
        let mut run = LadderRun {
            fsm: TerminationFsm::new(name),
            steps: Vec::new(),
        };

        match self.observe(name).await {
            Observation::Absent => {
                info!("Container {} is already absent", name);
                advance(&mut run.fsm, TerminationEvent::ObservedAbsent)?;
                return Ok(run.into_report(name, true));
            }
            Observation::Present(_) | Observation::Unknown => {}
        }

        info!("Terminating container {}", name);

        // Level 1: ask nicely, then insist
        let result = self.runtime.set_restart_policy(name, RestartPolicy::No).await;
        run.record(EscalationStep::DisableRestart, result);
        advance(&mut run.fsm, TerminationEvent::DisableRestart)?;

        let result = self.runtime.stop(name, self.settings.graceful_timeout).await;
        run.record(EscalationStep::GracefulStop, result);
        advance(&mut run.fsm, TerminationEvent::GracefulStop)?;

        match self.observe(name).await {
            Observation::Absent => {
                advance(&mut run.fsm, TerminationEvent::ObservedAbsent)?;
                return Ok(run.into_report(name, false));
            }
            Observation::Present(handle) if !handle.is_running() => {
                advance(&mut run.fsm, TerminationEvent::ObservedStopped)?;
            }
            _ => {
                warn!("Container {} ignored the stop request, killing", name);
                advance(&mut run.fsm, TerminationEvent::ObservedRunning)?;
                let result = self.runtime.kill(name).await;
                run.record(EscalationStep::Kill, result);
                advance(&mut run.fsm, TerminationEvent::Kill)?;
            }
        }

        if self.remove_and_check(name, &mut run).await? {
            return Ok(run.into_report(name, false));
        }

        // Level 2: kill the process behind the runtime's back. Only a pid
        // the runtime reports right now is signalled; an older one may
        // already belong to another process.
        warn!("Container {} survived removal, signalling its process", name);
        match self.observe(name).await {
            Observation::Absent => {
                advance(&mut run.fsm, TerminationEvent::ObservedAbsent)?;
                info!("Container {} removed", name);
                return Ok(run.into_report(name, false));
            }
            Observation::Present(ContainerHandle { pid: Some(pid), .. }) => {
                info!("Sending SIGKILL to pid {} of container {}", pid, name);
                let result = self.runtime.kill_process(pid).await;
                run.record(EscalationStep::SignalProcess, result);
                advance(&mut run.fsm, TerminationEvent::SignalProcess)?;
                tokio::time::sleep(self.settings.signal_settle).await;
            }
            Observation::Present(_) | Observation::Unknown => {
                info!("Container {} has no live host process, not signalling", name);
                run.skip(EscalationStep::SignalProcess);
                advance(&mut run.fsm, TerminationEvent::SignalProcess)?;
            }
        }

        if self.remove_and_check(name, &mut run).await? {
            return Ok(run.into_report(name, false));
        }

        // Level 3: restart the daemon, which hits every container on the host
        warn!(
            "Container {} survived a direct kill, restarting the container runtime daemon",
            name
        );
        let result = self.runtime.restart_daemon().await;
        run.record(EscalationStep::RestartDaemon, result);
        advance(&mut run.fsm, TerminationEvent::RestartDaemon)?;
        tokio::time::sleep(self.settings.daemon_settle).await;

        // The restart drops registry sessions
        if let Some(credentials) = self.credentials {
            let result = authenticate(self.runtime, credentials).await;
            run.record(EscalationStep::Reauthenticate, result);
        }

        if self.remove_and_check(name, &mut run).await? {
            return Ok(run.into_report(name, false));
        }

        advance(&mut run.fsm, TerminationEvent::GiveUp)?;
        let failed: Vec<String> = run
            .steps
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| format!("{:?}: {}", s.step, e)))
            .collect();
        error!(
            "Container {} is still present after every escalation level; reboot the host to recover",
            name
        );
        Err(DeployError::TerminationExhausted {
            container: name.to_string(),
            detail: if failed.is_empty() {
                "container still present after daemon restart".to_string()
            } else {
                failed.join("; ")
            },
        })
    }

    /// Force-remove and report whether the container is gone
    async fn remove_and_check(&self, name: &str, run: &mut LadderRun) -> Result<bool, DeployError> {
        let result = self.runtime.remove(name, true).await;
        run.record(EscalationStep::Remove, result);
        advance(&mut run.fsm, TerminationEvent::Remove)?;

        match self.observe(name).await {
            Observation::Absent => {
                advance(&mut run.fsm, TerminationEvent::ObservedAbsent)?;
                info!("Container {} removed", name);
                Ok(true)
            }
            _ => {
                advance(&mut run.fsm, TerminationEvent::ObservedPresent)?;
                Ok(false)
            }
        }
    }

    async fn observe(&self, name: &str) -> Observation {
        match self.runtime.inspect(name).await {
            Ok(None) => Observation::Absent,
            Ok(Some(handle)) => Observation::Present(handle),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", name, e);
                Observation::Unknown
            }
        }
    }
}

struct LadderRun {
    fsm: TerminationFsm,
    steps: Vec<StepRecord>,
}

impl LadderRun {
    fn record(&mut self, step: EscalationStep, result: Result<(), DeployError>) {
        let error = match result {
            Ok(()) => None,
            Err(e) => {
                warn!("Step {:?} failed, continuing: {}", step, e);
                Some(e.to_string())
            }
        };
        self.steps.push(StepRecord {
            step,
            error,
            skipped: false,
        });
    }

    fn skip(&mut self, step: EscalationStep) {
        self.steps.push(StepRecord {
            step,
            error: None,
            skipped: true,
        });
    }

    fn into_report(self, container: &str, already_absent: bool) -> TerminationReport {
        TerminationReport {
            container: container.to_string(),
            already_absent,
            path: self.fsm.path(),
            steps: self.steps,
        }
    }
}

fn advance(fsm: &mut TerminationFsm, event: TerminationEvent) -> Result<TerminationState, DeployError> {
    fsm.process(event).map_err(DeployError::RuntimeError)
}
