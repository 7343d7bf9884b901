//! Image references

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Tag under which the previously running image is kept
pub const BACKUP_TAG: &str = "backup";

/// A parsed `repository[:tag][@digest]` image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference.
    ///
    /// A colon only separates a tag when it appears after the last slash,
    /// so `host:5000/bot` is a repository without a tag.
    pub fn parse(reference: &str) -> Result<Self, DeployError> {
        let reference = reference.trim();
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(DeployError::ConfigError(format!(
                "Invalid image reference: '{}'",
                reference
            )));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(DeployError::ConfigError(format!(
                "Invalid image reference: '{}'",
                reference
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Resolve a configured image against a registry.
    ///
    /// Short names (no slash) are placed under `<host>/<registry_id>/`.
    pub fn resolve(image: &str, registry_host: &str, registry_id: &str) -> Result<Self, DeployError> {
        if image.contains('/') {
            Self::parse(image)
        } else {
            Self::parse(&format!("{}/{}/{}", registry_host, registry_id, image))
        }
    }

    /// The reference the previous image is re-tagged under before teardown
    pub fn backup(&self) -> ImageRef {
        ImageRef {
            repository: self.repository.clone(),
            tag: Some(BACKUP_TAG.to_string()),
            digest: None,
        }
    }

    /// Registry host part of the repository, if it has one
    pub fn registry_host(&self) -> Option<&str> {
        let (first, _) = self.repository.split_once('/')?;
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first)
        } else {
            None
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        match (&self.tag, &self.digest) {
            (Some(tag), Some(digest)) => write!(f, ":{}@{}", tag, digest),
            (Some(tag), None) => write!(f, ":{}", tag),
            (None, Some(digest)) => write!(f, "@{}", digest),
            (None, None) => f.write_str(":latest"),
        }
    }
}
