//! Settings read from the process environment

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::authn::registry::RegistryCredentials;
use crate::deploy::fsm::TerminationSettings;
use crate::deploy::health::{HealthOptions, HealthPolicy};
use crate::errors::DeployError;
use crate::logs::{LogLevel, LogOptions};
use crate::models::image::{ImageRef, BACKUP_TAG};
use crate::storage::layout::DeploymentLayout;
use crate::storage::snapshot::{parse_bool, EnvKey, EnvironmentSnapshot, KeyKind};

/// Keys rendered into the service's env file, in file order
pub const SERVICE_KEYS: &[EnvKey] = &[
    EnvKey::required("BOT_TOKEN", KeyKind::Text),
    EnvKey::required("CHAT_URL", KeyKind::Url),
    EnvKey::required("FEEDBACK_URL", KeyKind::Url),
    EnvKey::required("SOS_URL", KeyKind::Url),
    EnvKey::required("ADMIN_ID", KeyKind::Integer),
    EnvKey::required("LLM_TOKEN", KeyKind::Text),
    EnvKey::optional("LOG_LEVEL", "all", KeyKind::Choice(&["all", "none"])),
    EnvKey::optional("REQUIRED_CHANNELS", "", KeyKind::Text),
    EnvKey::optional("BASE_PRICE", "100", KeyKind::Integer),
    EnvKey::optional("DB_DIR", "/app/data", KeyKind::Text),
    EnvKey::optional("LLM_LOG_DIR", "/app/logs", KeyKind::Text),
];

/// Keys that configure the deployer itself; never written to the env file
pub const DEPLOYER_KEYS: &[EnvKey] = &[
    EnvKey::required("REGISTRY_ID", KeyKind::Text),
    EnvKey::required("IMAGE", KeyKind::Text),
    EnvKey::required("REGISTRY_KEY_JSON", KeyKind::Secret),
    EnvKey::optional("REGISTRY_HOST", "cr.yandex", KeyKind::Text),
    EnvKey::optional("REGISTRY_USERNAME", "json_key", KeyKind::Text),
    EnvKey::optional("CONTAINER_NAME", "bot", KeyKind::Text),
    EnvKey::optional("DEPLOY_DIR", "/opt/bot", KeyKind::Text),
    EnvKey::optional("STOP_TIMEOUT_SECS", "10", KeyKind::Integer),
    EnvKey::optional("SIGNAL_SETTLE_SECS", "2", KeyKind::Integer),
    EnvKey::optional("DAEMON_SETTLE_SECS", "10", KeyKind::Integer),
    EnvKey::optional("HEALTH_INTERVAL_SECS", "5", KeyKind::Integer),
    EnvKey::optional("HEALTH_TIMEOUT_SECS", "60", KeyKind::Integer),
    EnvKey::optional("LOG_TAIL_LINES", "50", KeyKind::Integer),
    EnvKey::optional("ROLLBACK_REQUIRE_HEALTHY", "false", KeyKind::Bool),
    EnvKey::optional("DEPLOY_LOG_LEVEL", "info", KeyKind::Text),
    EnvKey::optional("DEPLOY_LOG_JSON", "false", KeyKind::Bool),
    EnvKey::optional("DEPLOY_LOG_DIR", "", KeyKind::Text),
    EnvKey::optional("DOCKER_BIN", "docker", KeyKind::Text),
    EnvKey::optional("DAEMON_RESTART_COMMAND", "systemctl restart docker", KeyKind::Text),
];

/// Upper bound for every `*_SECS` key
pub const MAX_WAIT_SECS: u64 = 24 * 60 * 60;

/// Everything one deployment run needs
#[derive(Debug, Clone)]
pub struct Settings {
    /// Configuration handed to the service container
    pub service_env: EnvironmentSnapshot,

    /// Image to deploy
    pub image: ImageRef,

    pub container_name: String,

    pub layout: DeploymentLayout,

    pub credentials: RegistryCredentials,

    pub termination: TerminationSettings,

    pub health: HealthOptions,

    /// Health policy used after a rollback relaunch
    pub rollback_policy: HealthPolicy,

    /// Lines of the failed instance's logs to report
    pub log_tail_lines: usize,

    /// Docker-compatible CLI to drive
    pub docker_binary: String,

    /// Program and arguments that restart the runtime daemon
    pub daemon_restart: Vec<String>,

    pub log: LogOptions,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, DeployError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`.
    ///
    /// Both key tables are checked before anything is returned, so one
    /// error lists every missing key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service = EnvironmentSnapshot::build(SERVICE_KEYS, &lookup);
        let deployer = EnvironmentSnapshot::build(DEPLOYER_KEYS, &lookup);

        let (service_env, mut deployer) = match (service, deployer) {
            (Ok(service), Ok(deployer)) => (service, deployer),
            (Err(a), Err(b)) => return Err(merge_errors(a, b)),
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        let value = |snapshot: &EnvironmentSnapshot, key: &str| -> String {
            snapshot.get(key).unwrap_or_default().to_string()
        };

        let registry_host = value(&deployer, "REGISTRY_HOST");
        let registry_id = value(&deployer, "REGISTRY_ID");
        let image = ImageRef::resolve(&value(&deployer, "IMAGE"), &registry_host, &registry_id)?;
        // The backup is restored by re-tagging, and docker cannot tag a digest
        if image.digest.is_some() {
            return Err(DeployError::ConfigError(format!(
                "IMAGE '{}' is pinned by digest; deploy a tag instead",
                image
            )));
        }
        if image.tag.as_deref() == Some(BACKUP_TAG) {
            return Err(DeployError::ConfigError(format!(
                "IMAGE tag '{}' is reserved for the rollback image",
                BACKUP_TAG
            )));
        }

        let key = deployer.take("REGISTRY_KEY_JSON").unwrap_or_default();
        let credentials = RegistryCredentials::new(
            registry_host,
            value(&deployer, "REGISTRY_USERNAME"),
            SecretString::from(key),
        )?;

        let container_name = value(&deployer, "CONTAINER_NAME");
        if !is_valid_container_name(&container_name) {
            return Err(DeployError::ConfigError(format!(
                "CONTAINER_NAME '{}' is not a valid container name",
                container_name
            )));
        }

        let health = HealthOptions {
            interval: seconds(&deployer, "HEALTH_INTERVAL_SECS")?,
            budget: seconds(&deployer, "HEALTH_TIMEOUT_SECS")?,
        };
        if health.interval.is_zero() || health.budget.is_zero() {
            return Err(DeployError::ConfigError(
                "HEALTH_INTERVAL_SECS and HEALTH_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        let termination = TerminationSettings {
            graceful_timeout: seconds(&deployer, "STOP_TIMEOUT_SECS")?,
            signal_settle: seconds(&deployer, "SIGNAL_SETTLE_SECS")?,
            daemon_settle: seconds(&deployer, "DAEMON_SETTLE_SECS")?,
        };

        let rollback_policy = if flag(&deployer, "ROLLBACK_REQUIRE_HEALTHY") {
            HealthPolicy::Strict
        } else {
            HealthPolicy::RunningIsEnough
        };

        let log_tail_lines = value(&deployer, "LOG_TAIL_LINES")
            .parse::<usize>()
            .map_err(|_| DeployError::ConfigError("LOG_TAIL_LINES must be a non-negative integer".to_string()))?;

        let log_level = value(&deployer, "DEPLOY_LOG_LEVEL")
            .parse::<LogLevel>()
            .map_err(DeployError::ConfigError)?;
        let daemon_restart: Vec<String> = value(&deployer, "DAEMON_RESTART_COMMAND")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let log_dir = value(&deployer, "DEPLOY_LOG_DIR");
        let log = LogOptions {
            log_level,
            stderr: true,
            log_dir: (!log_dir.is_empty()).then(|| PathBuf::from(log_dir)),
            json_format: flag(&deployer, "DEPLOY_LOG_JSON"),
        };

        Ok(Self {
            service_env,
            image,
            container_name,
            layout: DeploymentLayout::new(value(&deployer, "DEPLOY_DIR")),
            credentials,
            termination,
            health,
            rollback_policy,
            log_tail_lines,
            docker_binary: value(&deployer, "DOCKER_BIN"),
            daemon_restart,
            log,
        })
    }
}

fn merge_errors(a: DeployError, b: DeployError) -> DeployError {
    match (a, b) {
        (DeployError::MissingConfig(mut a), DeployError::MissingConfig(b)) => {
            a.extend(b);
            DeployError::MissingConfig(a)
        }
        (DeployError::MissingConfig(a), _) | (_, DeployError::MissingConfig(a)) => {
            DeployError::MissingConfig(a)
        }
        (DeployError::ConfigError(a), DeployError::ConfigError(b)) => {
            DeployError::ConfigError(format!("{}; {}", a, b))
        }
        (a, _) => a,
    }
}

fn seconds(snapshot: &EnvironmentSnapshot, key: &str) -> Result<Duration, DeployError> {
    match snapshot.get(key).unwrap_or_default().parse::<u64>() {
        Ok(secs) if secs <= MAX_WAIT_SECS => Ok(Duration::from_secs(secs)),
        _ => Err(DeployError::ConfigError(format!(
            "{} must be an integer between 0 and {}",
            key, MAX_WAIT_SECS
        ))),
    }
}

fn flag(snapshot: &EnvironmentSnapshot, key: &str) -> bool {
    snapshot.get(key).and_then(parse_bool).unwrap_or(false)
}

/// Docker names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
