//! End-to-end deployment runs against the scripted runtime

mod support;

use std::collections::HashMap;

use botdeploy::app::run::run;
use botdeploy::errors::{DeployError, FailureKind};
use botdeploy::filesys::dir::Dir;
use botdeploy::models::container::{ContainerStatus, HealthStatus, RestartPolicy};
use botdeploy::models::deployment::{RollbackReport, RollbackStep};
use botdeploy::storage::settings::Settings;

use support::{
    base_env, settings_from, Call, FakeRuntime, HealthPlan, Stubbornness, BACKUP, V1, V2,
};

struct Harness {
    dir: Dir,
    env: HashMap<String, String>,
}

impl Harness {
    async fn new() -> Self {
        let dir = Dir::create_temp_dir("botdeploy-rollout").await.unwrap();
        let env = base_env(dir.path());
        Self { dir, env }
    }

    fn set(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn settings(&self) -> Settings {
        settings_from(&self.env).unwrap()
    }

    async fn cleanup(self) {
        let _ = self.dir.delete().await;
    }
}

/// v1 healthy and running, v2 available in the registry
fn host_with_v1(v2_health: HealthPlan) -> FakeRuntime {
    FakeRuntime::new()
        .with_remote_image(V2, "sha256:v2")
        .with_health_plan("sha256:v1", HealthPlan::HealthyAtPoll(1))
        .with_health_plan("sha256:v2", v2_health)
        .with_running("bot", V1, "sha256:v1", Stubbornness::cooperative())
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_succeeds_without_rollback() {
    let harness = Harness::new().await;
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::HealthyAtPoll(2));

    let outcome = run(&settings, &runtime).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.image, V2);
    assert_eq!(outcome.last_health, HealthStatus::Healthy);
    assert_eq!(outcome.rollback, RollbackReport::NotAttempted);
    assert!(outcome.diagnostics.is_empty());

    let bot = runtime.container("bot").unwrap();
    assert_eq!(bot.image_id, "sha256:v2");
    assert_eq!(bot.status, ContainerStatus::Running);
    assert_eq!(bot.restart_policy, RestartPolicy::UnlessStopped);
    assert_eq!(runtime.image_id(BACKUP).as_deref(), Some("sha256:v1"));

    // Backup before pull, pull before teardown, teardown before launch
    let actions = runtime.actions();
    let position = |call: &Call| actions.iter().position(|c| c == call).unwrap();
    let tag = position(&Call::Tag("sha256:v1".to_string(), BACKUP.to_string()));
    let pull = position(&Call::Pull(V2.to_string()));
    let stop = position(&Call::Stop("bot".to_string()));
    let launch = position(&Call::Run(V2.to_string()));
    assert_eq!(actions[0], Call::Login);
    assert!(tag < pull && pull < stop && stop < launch);

    let env_file = settings.layout.env_file().read_string().await.unwrap();
    assert!(env_file.contains("BOT_TOKEN=123:abc\n"));

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_upgrade_rolls_back_to_previous_image() {
    let harness = Harness::new().await;
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::Never);

    let outcome = run(&settings, &runtime).await.unwrap();

    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::HealthCheckTimeout);
    assert_eq!(outcome.last_health, HealthStatus::Unhealthy);
    assert_eq!(
        outcome.rollback,
        RollbackReport::Succeeded {
            health: HealthStatus::Healthy
        }
    );
    assert_eq!(outcome.exit_code(), 2);
    assert!(outcome.diagnostics.iter().any(|l| l.contains("sha256:v2")));

    let bot = runtime.container("bot").unwrap();
    assert_eq!(bot.image_id, "sha256:v1");
    assert_eq!(bot.status, ContainerStatus::Running);

    // One rollback, one relaunch
    let runs = runtime
        .actions()
        .into_iter()
        .filter(|c| matches!(c, Call::Run(_)))
        .count();
    assert_eq!(runs, 2);

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_rolls_back() {
    let harness = Harness::new().await;
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::HealthyAtPoll(1)).failing_launch("sha256:v2");

    let outcome = run(&settings, &runtime).await.unwrap();

    assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::LaunchFailure);
    assert!(outcome.rollback.succeeded());
    assert_eq!(outcome.exit_code(), 2);
    // Nothing was running to read logs from
    assert!(outcome.diagnostics[0].contains("logs unavailable"));
    assert_eq!(runtime.container("bot").unwrap().image_id, "sha256:v1");

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_first_deploy_has_no_rollback() {
    let harness = Harness::new().await;
    let settings = harness.settings();
    let runtime = FakeRuntime::new()
        .with_remote_image(V2, "sha256:v2")
        .with_health_plan("sha256:v2", HealthPlan::Never);

    let outcome = run(&settings, &runtime).await.unwrap();

    assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::HealthCheckTimeout);
    assert_eq!(outcome.rollback, RollbackReport::Unavailable);
    assert_eq!(outcome.exit_code(), 1);
    assert!(runtime.image_id(BACKUP).is_none());

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_rollback_is_reported() {
    let harness = Harness::new().await.set("ROLLBACK_REQUIRE_HEALTHY", "true");
    let settings = harness.settings();
    let runtime = FakeRuntime::new()
        .with_remote_image(V2, "sha256:v2")
        .with_health_plan("sha256:v1", HealthPlan::Never)
        .with_health_plan("sha256:v2", HealthPlan::Never)
        .with_running("bot", V1, "sha256:v1", Stubbornness::cooperative());

    let outcome = run(&settings, &runtime).await.unwrap();

    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::RollbackFailed);
    assert!(failure.message.contains("Health check timed out"));
    assert!(matches!(
        outcome.rollback,
        RollbackReport::Failed {
            step: RollbackStep::HealthCheck,
            ..
        }
    ));
    assert_eq!(outcome.exit_code(), 1);

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_containers_fail_launch() {
    let harness = Harness::new().await;
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::HealthyAtPoll(1)).leaving_duplicates();

    let outcome = run(&settings, &runtime).await.unwrap();

    assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::RollbackFailed);
    assert!(matches!(
        outcome.rollback,
        RollbackReport::Failed {
            step: RollbackStep::Relaunch,
            ..
        }
    ));

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_leaves_running_container_alone() {
    let harness = Harness::new().await;
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::HealthyAtPoll(1)).rejecting_login();

    let err = run(&settings, &runtime).await.unwrap_err();

    assert!(matches!(err, DeployError::AuthFailure(_)));
    assert_eq!(runtime.actions(), vec![Call::Login]);
    assert_eq!(runtime.container("bot").unwrap().status, ContainerStatus::Running);

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_pull_failure_happens_before_teardown() {
    let harness = Harness::new().await.set("IMAGE", "bot:v3");
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::HealthyAtPoll(1));

    let err = run(&settings, &runtime).await.unwrap_err();

    assert!(matches!(err, DeployError::PullFailure(_)));
    assert!(!runtime.actions().contains(&Call::Stop("bot".to_string())));
    let bot = runtime.container("bot").unwrap();
    assert_eq!(bot.image_id, "sha256:v1");
    assert_eq!(bot.status, ContainerStatus::Running);

    harness.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_digest_pinned_image_never_reaches_the_runtime() {
    let harness = Harness::new()
        .await
        .set("IMAGE", "cr.yandex/crp123/bot@sha256:0b1c2d");

    let err = settings_from(&harness.env).unwrap_err();
    assert!(matches!(err, DeployError::ConfigError(_)));

    // The same image deployed by tag rolls back through a plain re-tag
    let harness = harness.set("IMAGE", "bot:v2");
    let settings = harness.settings();
    let runtime = host_with_v1(HealthPlan::Never);

    let outcome = run(&settings, &runtime).await.unwrap();
    assert!(outcome.rollback.succeeded());
    assert!(runtime
        .actions()
        .contains(&Call::Tag(BACKUP.to_string(), V2.to_string())));

    harness.cleanup().await;
}
