//! Environment snapshot materialization

use std::path::PathBuf;

use tracing::info;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::utils::sha256_hash;

/// Whether a key must be supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Required,
    /// Optional, with the value used when absent or empty
    Optional(&'static str),
}

/// Value validation applied to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Text,
    /// Like `Text`, but never shown and allowed to span lines
    Secret,
    Url,
    Integer,
    Bool,
    Choice(&'static [&'static str]),
}

/// One entry of an enumerated configuration key table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvKey {
    pub name: &'static str,
    pub requirement: Requirement,
    pub kind: KeyKind,
}

impl EnvKey {
    pub const fn required(name: &'static str, kind: KeyKind) -> Self {
        Self {
            name,
            requirement: Requirement::Required,
            kind,
        }
    }

    pub const fn optional(name: &'static str, default: &'static str, kind: KeyKind) -> Self {
        Self {
            name,
            requirement: Requirement::Optional(default),
            kind,
        }
    }

    fn validate(&self, value: &str) -> Result<(), String> {
        if self.kind != KeyKind::Secret && (value.contains('\n') || value.contains('\r')) {
            return Err(format!("{} must be a single line", self.name));
        }

        match self.kind {
            KeyKind::Text | KeyKind::Secret => Ok(()),
            KeyKind::Url => {
                if value.starts_with("https://") || value.starts_with("http://") {
                    Ok(())
                } else {
                    Err(format!("{} must be an http(s) URL", self.name))
                }
            }
            KeyKind::Integer => value
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("{} must be an integer, got '{}'", self.name, value)),
            KeyKind::Bool => parse_bool(value)
                .map(|_| ())
                .ok_or_else(|| format!("{} must be true or false, got '{}'", self.name, value)),
            KeyKind::Choice(choices) => {
                if choices.contains(&value) {
                    Ok(())
                } else {
                    Err(format!(
                        "{} must be one of {}, got '{}'",
                        self.name,
                        choices.join(", "),
                        value
                    ))
                }
            }
        }
    }
}

/// Parse the boolean spellings accepted in the environment
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Result of writing a snapshot to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub path: PathBuf,
    pub digest: String,
    /// Content differs from what the previous run wrote
    pub changed: bool,
}

/// Ordered key/value configuration built from a key table
#[derive(Clone, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    entries: Vec<(String, String)>,
}

impl EnvironmentSnapshot {
    /// Build a snapshot from `keys`, reading values through `lookup`.
    ///
    /// Defaults are applied here and nowhere else. Every missing required key
    /// is reported in one [`DeployError::MissingConfig`]; invalid values are
    /// reported together as a [`DeployError::ConfigError`].
    pub fn build<F>(keys: &[EnvKey], lookup: F) -> Result<Self, DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();
        let mut entries = Vec::with_capacity(keys.len());

        for key in keys {
            let supplied = lookup(key.name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());

            let value = match (supplied, key.requirement) {
                (Some(value), _) => value,
                (None, Requirement::Optional(default)) => default.to_string(),
                (None, Requirement::Required) => {
                    missing.push(key.name.to_string());
                    continue;
                }
            };

            if let Err(e) = key.validate(&value) {
                invalid.push(e);
            }
            entries.push((key.name.to_string(), value));
        }

        if !missing.is_empty() {
            return Err(DeployError::MissingConfig(missing));
        }
        if !invalid.is_empty() {
            return Err(DeployError::ConfigError(invalid.join("; ")));
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove a value, handing ownership to the caller
    pub fn take(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Env-file text, one `KEY=value` line per entry in table order
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn digest(&self) -> String {
        sha256_hash(self.render().as_bytes())
    }

    /// Write the snapshot to `file`, replacing any previous one
    pub async fn write(&self, file: &File) -> Result<MaterializeReport, DeployError> {
        let rendered = self.render();
        let previous = file.read_string_opt().await?;
        let changed = previous.as_deref() != Some(rendered.as_str());

        file.write_private_atomic(rendered.as_bytes()).await?;

        let digest = sha256_hash(rendered.as_bytes());
        info!(
            "Wrote {} keys to {} (sha256 {}, {})",
            self.entries.len(),
            file.path().display(),
            &digest[..12],
            if changed { "changed" } else { "unchanged" }
        );

        Ok(MaterializeReport {
            path: file.path().to_path_buf(),
            digest,
            changed,
        })
    }
}

impl std::fmt::Debug for EnvironmentSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
