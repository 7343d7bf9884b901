//! Scripted in-memory container runtime for tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use botdeploy::deploy::runtime::{ContainerRuntime, LaunchSpec};
use botdeploy::errors::DeployError;
use botdeploy::models::container::{ContainerHandle, ContainerStatus, RestartPolicy};
use botdeploy::storage::settings::Settings;

/// A runtime operation, as recorded in the call journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Login,
    Pull(String),
    Tag(String, String),
    Inspect(String),
    ListIds(String),
    SetRestartPolicy(String, RestartPolicy),
    Stop(String),
    Kill(String),
    Remove(String),
    Run(String),
    LogsTail(String),
    KillProcess(u32),
    RestartDaemon,
}

/// Health check behaviour of containers started from an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPlan {
    /// `starting` until the n-th inspect, `healthy` from then on
    HealthyAtPoll(u32),
    /// Always `unhealthy`
    Never,
    /// The image declares no healthcheck
    NoHealthcheck,
}

/// How hard a container is to get rid of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removable {
    Normally,
    AfterSignal,
    AfterDaemonRestart,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stubbornness {
    pub ignores_stop: bool,
    pub ignores_kill: bool,
    pub removable: Removable,
}

impl Stubbornness {
    pub fn cooperative() -> Self {
        Self {
            ignores_stop: false,
            ignores_kill: false,
            removable: Removable::Normally,
        }
    }

    pub fn stuck(removable: Removable) -> Self {
        Self {
            ignores_stop: true,
            ignores_kill: true,
            removable,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    image: String,
    image_id: String,
    pid: Option<u32>,
    status: ContainerStatus,
    restart_policy: RestartPolicy,
    stubborn: Stubbornness,
    health: HealthPlan,
    polls: u32,
    signalled: bool,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    containers: HashMap<String, FakeContainer>,
    images: HashMap<String, String>,
    remote: HashMap<String, String>,
    health_plans: HashMap<String, HealthPlan>,
    failing_images: HashSet<String>,
    login_fails: bool,
    logged_in: bool,
    daemon_restarted: bool,
    leave_duplicates: bool,
    inspect_failures: u32,
    inspect_delay: Option<Duration>,
    next_pid: u32,
}

/// Observable state of one fake container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerView {
    pub image_id: String,
    pub status: ContainerStatus,
    pub restart_policy: RestartPolicy,
}

pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    fn with_state(self, f: impl FnOnce(&mut State)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    /// Make `reference` pullable, resolving to image `id`
    pub fn with_remote_image(self, reference: &str, id: &str) -> Self {
        self.with_state(|s| {
            s.remote.insert(reference.to_string(), id.to_string());
        })
    }

    pub fn with_health_plan(self, image_id: &str, plan: HealthPlan) -> Self {
        self.with_state(|s| {
            s.health_plans.insert(image_id.to_string(), plan);
        })
    }

    /// A container already running `reference` (image `id`)
    pub fn with_running(self, name: &str, reference: &str, id: &str, stubborn: Stubbornness) -> Self {
        self.with_state(|s| {
            s.images.insert(reference.to_string(), id.to_string());
            s.next_pid += 1;
            let container = FakeContainer {
                id: format!("c-{}", s.next_pid),
                image: reference.to_string(),
                image_id: id.to_string(),
                pid: Some(s.next_pid),
                status: ContainerStatus::Running,
                restart_policy: RestartPolicy::UnlessStopped,
                stubborn,
                health: s.health_plans.get(id).copied().unwrap_or(HealthPlan::NoHealthcheck),
                polls: 0,
                signalled: false,
            };
            s.containers.insert(name.to_string(), container);
        })
    }

    /// Containers from this image refuse to start
    pub fn failing_launch(self, image_id: &str) -> Self {
        self.with_state(|s| {
            s.failing_images.insert(image_id.to_string());
        })
    }

    pub fn rejecting_login(self) -> Self {
        self.with_state(|s| s.login_fails = true)
    }

    /// The next `n` inspects fail
    pub fn with_inspect_failures(self, n: u32) -> Self {
        self.with_state(|s| s.inspect_failures = n)
    }

    /// Every inspect takes this long
    pub fn with_inspect_delay(self, delay: Duration) -> Self {
        self.with_state(|s| s.inspect_delay = Some(delay))
    }

    /// `list_ids` reports a second container with the same name
    pub fn leaving_duplicates(self) -> Self {
        self.with_state(|s| s.leave_duplicates = true)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// The journal without read-only queries
    pub fn actions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Inspect(_) | Call::ListIds(_)))
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<ContainerView> {
        self.state.lock().unwrap().containers.get(name).map(|c| ContainerView {
            image_id: c.image_id.clone(),
            status: c.status,
            restart_policy: c.restart_policy,
        })
    }

    pub fn image_id(&self, reference: &str) -> Option<String> {
        self.state.lock().unwrap().images.get(reference).cloned()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn runtime_error(msg: &str) -> DeployError {
    DeployError::RuntimeError(msg.to_string())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn login(
        &self,
        _registry: &str,
        _username: &str,
        _secret: &SecretString,
    ) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Login);
        if s.login_fails {
            return Err(DeployError::AuthFailure("unauthorized".to_string()));
        }
        s.logged_in = true;
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Pull(image.to_string()));
        if !s.logged_in {
            return Err(DeployError::PullFailure(format!("{}: not logged in", image)));
        }
        let id = s
            .remote
            .get(image)
            .cloned()
            .ok_or_else(|| DeployError::PullFailure(format!("{}: manifest unknown", image)))?;
        s.images.insert(image.to_string(), id);
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Tag(source.to_string(), target.to_string()));
        if target.contains('@') {
            return Err(runtime_error("refusing to create a tag with a digest reference"));
        }
        let id = match s.images.get(source) {
            Some(id) => id.clone(),
            None if s.images.values().any(|id| id == source) => source.to_string(),
            None => return Err(runtime_error("No such image")),
        };
        s.images.insert(target.to_string(), id);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerHandle>, DeployError> {
        let delay = {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::Inspect(name.to_string()));
            s.inspect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.state.lock().unwrap();
        if s.inspect_failures > 0 {
            s.inspect_failures -= 1;
            return Err(runtime_error("Cannot connect to the Docker daemon"));
        }

        Ok(s.containers.get_mut(name).map(|c| {
            c.polls += 1;
            let health = match c.health {
                HealthPlan::HealthyAtPoll(n) if c.polls >= n => Some("healthy".to_string()),
                HealthPlan::HealthyAtPoll(_) => Some("starting".to_string()),
                HealthPlan::Never => Some("unhealthy".to_string()),
                HealthPlan::NoHealthcheck => None,
            };
            ContainerHandle {
                id: c.id.clone(),
                name: name.to_string(),
                image: c.image.clone(),
                image_id: c.image_id.clone(),
                pid: c.pid,
                restart_policy: c.restart_policy,
                status: c.status,
                health,
            }
        }))
    }

    async fn list_ids(&self, name: &str) -> Result<Vec<String>, DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::ListIds(name.to_string()));
        let mut ids: Vec<String> = s.containers.get(name).map(|c| c.id.clone()).into_iter().collect();
        if s.leave_duplicates {
            ids.push("c-duplicate".to_string());
        }
        Ok(ids)
    }

    async fn set_restart_policy(
        &self,
        name: &str,
        policy: RestartPolicy,
    ) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::SetRestartPolicy(name.to_string(), policy));
        if let Some(c) = s.containers.get_mut(name) {
            c.restart_policy = policy;
        }
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Stop(name.to_string()));
        if let Some(c) = s.containers.get_mut(name) {
            if !c.stubborn.ignores_stop {
                c.status = ContainerStatus::Stopped;
                c.pid = None;
            }
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Kill(name.to_string()));
        match s.containers.get_mut(name) {
            Some(c) if c.stubborn.ignores_kill => Err(runtime_error("permission denied")),
            Some(c) => {
                c.status = ContainerStatus::Stopped;
                c.pid = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Remove(name.to_string()));
        let daemon_restarted = s.daemon_restarted;
        let removable = match s.containers.get(name) {
            None => return Ok(()),
            Some(c) => match c.stubborn.removable {
                Removable::Normally => true,
                Removable::AfterSignal => c.signalled,
                Removable::AfterDaemonRestart => daemon_restarted,
                Removable::Never => false,
            },
        };
        if removable {
            s.containers.remove(name);
            Ok(())
        } else {
            Err(runtime_error("device or resource busy"))
        }
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<String, DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::Run(spec.image.clone()));
        let image_id = s
            .images
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| DeployError::LaunchFailure(format!("No such image: {}", spec.image)))?;
        if s.failing_images.contains(&image_id) {
            return Err(DeployError::LaunchFailure(
                "Bind for 0.0.0.0:8080 failed: port is already allocated".to_string(),
            ));
        }
        if s.containers.contains_key(&spec.name) {
            return Err(DeployError::LaunchFailure(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        s.next_pid += 1;
        let id = format!("c-{}", s.next_pid);
        let health = s.health_plans.get(&image_id).copied().unwrap_or(HealthPlan::NoHealthcheck);
        let container = FakeContainer {
            id: id.clone(),
            image: spec.image.clone(),
            image_id,
            pid: Some(s.next_pid),
            status: ContainerStatus::Running,
            restart_policy: spec.restart_policy,
            stubborn: Stubbornness::cooperative(),
            health,
            polls: 0,
            signalled: false,
        };
        s.containers.insert(spec.name.clone(), container);
        Ok(id)
    }

    async fn logs_tail(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::LogsTail(name.to_string()));
        let c = s
            .containers
            .get(name)
            .ok_or_else(|| runtime_error("No such container"))?;
        let mut tail = vec![
            format!("starting from {}", c.image_id),
            "healthcheck: connection refused".to_string(),
        ];
        tail.truncate(lines);
        Ok(tail)
    }

    async fn kill_process(&self, pid: u32) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::KillProcess(pid));
        if let Some(c) = s.containers.values_mut().find(|c| c.pid == Some(pid)) {
            c.signalled = true;
            c.status = ContainerStatus::Stopped;
            c.pid = None;
        }
        Ok(())
    }

    async fn restart_daemon(&self) -> Result<(), DeployError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call::RestartDaemon);
        s.daemon_restarted = true;
        s.logged_in = false;
        Ok(())
    }
}

pub const REGISTRY_KEY: &str = r#"{"id": "ajek1", "service_account_id": "aje42", "private_key": "PRIVATE"}"#;

/// A complete environment for `Settings::from_lookup`
pub fn base_env(deploy_dir: &Path) -> HashMap<String, String> {
    [
        ("BOT_TOKEN", "123:abc"),
        ("CHAT_URL", "https://t.me/chat"),
        ("FEEDBACK_URL", "https://t.me/feedback"),
        ("SOS_URL", "https://t.me/sos"),
        ("ADMIN_ID", "4242"),
        ("LLM_TOKEN", "sk-test"),
        ("REGISTRY_ID", "crp123"),
        ("IMAGE", "bot:v2"),
        ("REGISTRY_KEY_JSON", REGISTRY_KEY),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .chain(std::iter::once((
        "DEPLOY_DIR".to_string(),
        deploy_dir.display().to_string(),
    )))
    .collect()
}

pub fn settings_from(env: &HashMap<String, String>) -> Result<Settings, DeployError> {
    Settings::from_lookup(|key| env.get(key).cloned())
}

pub const V1: &str = "cr.yandex/crp123/bot:v1";
pub const V2: &str = "cr.yandex/crp123/bot:v2";
pub const BACKUP: &str = "cr.yandex/crp123/bot:backup";
