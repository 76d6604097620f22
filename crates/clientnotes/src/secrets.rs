//! Credential resolution for the remote system.
//!
//! Each credential can come from one of three places, checked in order:
//!
//! 1. **Direct value** in the config file (local testing only)
//! 2. **File** holding the value (Docker secrets, `~` is expanded)
//! 3. **Environment variable** (systemd units, CI)

use std::fmt;
use std::fs;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided for {field} (need one of: value, file, or env_var)")]
    NoSourceProvided { field: &'static str },

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where one credential value comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl SecretSource {
    pub fn env(name: &str) -> Self {
        Self {
            env_var: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        has_secret_source(
            self.value.as_deref(),
            self.file.as_deref(),
            self.env_var.as_deref(),
        )
    }

    fn resolve(&self, field: &'static str) -> Result<SecretString> {
        resolve_secret(
            self.value.as_deref(),
            self.file.as_deref(),
            self.env_var.as_deref(),
        )
        .map_err(|e| match e {
            SecretError::NoSourceProvided { .. } => SecretError::NoSourceProvided { field },
            other => other,
        })
    }
}

/// Config section naming the sources of the three login values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    #[serde(default = "default_agency_source")]
    pub agency_id: SecretSource,
    #[serde(default = "default_email_source")]
    pub email: SecretSource,
    #[serde(default = "default_password_source")]
    pub password: SecretSource,
}

fn default_agency_source() -> SecretSource {
    SecretSource::env("CLIENTNOTES_AGENCY_ID")
}

fn default_email_source() -> SecretSource {
    SecretSource::env("CLIENTNOTES_EMAIL")
}

fn default_password_source() -> SecretSource {
    SecretSource::env("CLIENTNOTES_PASSWORD")
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            agency_id: default_agency_source(),
            email: default_email_source(),
            password: default_password_source(),
        }
    }
}

/// Resolved login values for the remote system.
pub struct Credentials {
    pub agency_id: SecretString,
    pub email: SecretString,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(agency_id: &str, email: &str, password: &str) -> Self {
        Self {
            agency_id: SecretString::from(agency_id),
            email: SecretString::from(email),
            password: SecretString::from(password),
        }
    }

    pub fn resolve(config: &CredentialsConfig) -> Result<Self> {
        Ok(Self {
            agency_id: config.agency_id.resolve("agency_id")?,
            email: config.email.resolve("email")?,
            password: config.password.resolve("password")?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("agency_id", &"[REDACTED]")
            .field("email", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Resolves a secret from the first non-empty source: direct value, file
/// contents, then environment variable. File and env values are trimmed.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = non_empty(direct) {
        return Ok(SecretString::from(value));
    }

    if let Some(path) = non_empty(file_path) {
        let expanded = expand_home(path);
        return fs::read_to_string(&expanded)
            .map(|content| SecretString::from(content.trim()))
            .map_err(|e| SecretError::FileReadError {
                path: expanded,
                source: e,
            });
    }

    if let Some(name) = non_empty(env_var) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided { field: "secret" })
}

/// Checks if at least one secret source is configured (non-empty).
pub fn has_secret_source(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> bool {
    non_empty(direct).is_some() || non_empty(file_path).is_some() || non_empty(env_var).is_some()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

/// Expands a leading `~` or `~/` to the user's home directory.
/// `~user/...` is not supported.
pub fn expand_home(path: &str) -> String {
    if path != "~" && !path.starts_with("~/") {
        return path.to_string();
    }
    match dirs::home_dir() {
        Some(home) => path.replacen('~', &home.to_string_lossy(), 1),
        None => path.to_string(),
    }
}
