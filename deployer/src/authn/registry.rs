//! Registry authentication

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::deploy::runtime::ContainerRuntime;
use crate::errors::DeployError;

/// Credentials for one image registry.
///
/// The key is kept in memory only and handed to the runtime over stdin.
#[derive(Clone)]
pub struct RegistryCredentials {
    registry: String,
    username: String,
    key: SecretString,
}

impl RegistryCredentials {
    /// Validate credential material.
    ///
    /// The key must be a non-empty JSON object (a service-account key file).
    pub fn new(
        registry: impl Into<String>,
        username: impl Into<String>,
        key: SecretString,
    ) -> Result<Self, DeployError> {
        let registry = registry.into();
        let username = username.into();

        if registry.trim().is_empty() {
            return Err(DeployError::AuthFailure("Registry address is empty".to_string()));
        }
        if username.trim().is_empty() {
            return Err(DeployError::AuthFailure("Registry username is empty".to_string()));
        }

        let raw = key.expose_secret().trim();
        if raw.is_empty() {
            return Err(DeployError::AuthFailure("Registry key is empty".to_string()));
        }
        // Parse errors are not forwarded: they can quote the key.
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) if !map.is_empty() => {}
            Ok(_) => {
                return Err(DeployError::AuthFailure(
                    "Registry key must be a non-empty JSON object".to_string(),
                ))
            }
            Err(_) => {
                return Err(DeployError::AuthFailure(
                    "Registry key is not valid JSON".to_string(),
                ))
            }
        }

        Ok(Self {
            registry,
            username,
            key,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Log in to the registry. Any failure is an [`DeployError::AuthFailure`].
pub async fn authenticate<R>(runtime: &R, credentials: &RegistryCredentials) -> Result<(), DeployError>
where
    R: ContainerRuntime + ?Sized,
{
    debug!("Authenticating with registry {}", credentials.registry);

    match runtime
        .login(&credentials.registry, &credentials.username, &credentials.key)
        .await
    {
        Ok(()) => {
            info!("Authenticated with registry {}", credentials.registry);
            Ok(())
        }
        Err(DeployError::AuthFailure(msg)) => Err(DeployError::AuthFailure(msg)),
        Err(e) => Err(DeployError::AuthFailure(e.to_string())),
    }
}
