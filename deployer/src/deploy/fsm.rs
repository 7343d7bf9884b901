//! Finite State Machine for container termination

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Termination settings
#[derive(Debug, Clone)]
pub struct TerminationSettings {
    /// Time the container gets to exit on its own after a stop request
    pub graceful_timeout: Duration,

    /// Wait after signalling the container's process directly
    pub signal_settle: Duration,

    /// Wait after restarting the runtime daemon
    pub daemon_settle: Duration,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(10),
            signal_settle: Duration::from_secs(2),
            daemon_settle: Duration::from_secs(10),
        }
    }
}

/// Termination state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationState {
    /// Container exists, nothing done yet
    Running,

    /// Restart policy set to `no`
    RestartDisabled,

    /// Stop request sent
    GracefulStopAttempted,

    /// Container exited after the stop request
    Stopped,

    /// Container ignored the stop request
    StillRunning,

    /// Runtime kill sent
    KillAttempted,

    /// Removal requested
    Removed,

    /// Container confirmed absent
    Confirmed,

    /// Container still present after a removal
    StillPresent,

    /// Host process killed directly, or found to have none
    ProcessSignalled,

    /// Runtime daemon restarted
    DaemonRestarted,

    /// Every escalation level failed
    Exhausted,
}

impl TerminationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TerminationState::Confirmed | TerminationState::Exhausted)
    }
}

impl fmt::Display for TerminationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Termination event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationEvent {
    DisableRestart,
    GracefulStop,
    /// Observed the container no longer running
    ObservedStopped,
    /// Observed the container still running
    ObservedRunning,
    Kill,
    Remove,
    /// Observed the container gone
    ObservedAbsent,
    /// Observed the container still there
    ObservedPresent,
    SignalProcess,
    RestartDaemon,
    GiveUp,
}

/// One recorded transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TerminationState,
    pub to: TerminationState,
}

/// Termination FSM
#[derive(Debug, Clone)]
pub struct TerminationFsm {
    container: String,
    state: TerminationState,
    history: Vec<Transition>,
}

impl TerminationFsm {
    /// Create a new FSM for an existing container
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            state: TerminationState::Running,
            history: Vec::new(),
        }
    }

    /// Get current state
    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Every transition taken so far, in order
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Sequence of visited states, starting with the initial one
    pub fn path(&self) -> Vec<TerminationState> {
        let mut path = vec![TerminationState::Running];
        path.extend(self.history.iter().map(|t| t.to));
        path
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: TerminationEvent) -> Result<TerminationState, String> {
        use TerminationEvent as E;
        use TerminationState as S;

        let new_state = match (self.state, event) {
            // Absence is success from any non-terminal state
            (state, E::ObservedAbsent) if !state.is_terminal() => S::Confirmed,

            (S::Running, E::DisableRestart) => S::RestartDisabled,
            (S::RestartDisabled, E::GracefulStop) => S::GracefulStopAttempted,

            (S::GracefulStopAttempted, E::ObservedStopped) => S::Stopped,
            (S::GracefulStopAttempted, E::ObservedRunning) => S::StillRunning,
            (S::StillRunning, E::Kill) => S::KillAttempted,

            (S::Stopped, E::Remove)
            | (S::KillAttempted, E::Remove)
            | (S::ProcessSignalled, E::Remove)
            | (S::DaemonRestarted, E::Remove) => S::Removed,

            (S::Removed, E::ObservedPresent) => S::StillPresent,

            (S::StillPresent, E::SignalProcess) => S::ProcessSignalled,
            (S::StillPresent, E::RestartDaemon) => S::DaemonRestarted,
            (S::StillPresent, E::GiveUp) => S::Exhausted,

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        info!(
            container = %self.container,
            from = %self.state,
            to = %new_state,
            "termination transition"
        );
        self.history.push(Transition {
            from: self.state,
            to: new_state,
        });
        self.state = new_state;
        Ok(new_state)
    }
}
