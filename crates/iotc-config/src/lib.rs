//! Shared configuration for iotc tools.
//!
//! TOML device profiles, key resolution (env + keyring + plaintext),
//! and translation to `iotc_core::DeviceIdentity` / `ConnectConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use iotc_core::{ConnectConfig, DeviceCredentials, DeviceIdentity, LogLevel, X509Identity};

/// Keyring service name for stored device keys.
pub const KEYRING_SERVICE: &str = "iotc";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no key configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named device profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Connect timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    /// `DISABLED`, `API_ONLY` or `ALL`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            clean_session: default_clean_session(),
            log_level: default_log_level(),
        }
    }
}

impl Defaults {
    /// Parsed `log_level`.
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        LogLevel::parse(&self.log_level).map_err(|e| ConfigError::Validation {
            field: "defaults.log_level".into(),
            reason: e.to_string(),
        })
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_clean_session() -> bool {
    true
}
fn default_log_level() -> String {
    "DISABLED".into()
}

/// A named device profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Device id (also the provisioning registration id).
    pub device_id: String,

    /// Provisioning id scope.
    #[serde(default)]
    pub scope_id: String,

    /// Auth mode: "group-key", "device-key", "connection", or "certificate".
    #[serde(default = "default_auth")]
    pub auth: String,

    /// Symmetric key in plaintext. Prefer keyring or `key_env`.
    pub key: Option<String>,

    /// Environment variable name containing the key.
    pub key_env: Option<String>,

    /// Hub host for "connection" auth.
    pub hub: Option<String>,

    /// Client certificate for "certificate" auth.
    pub cert_file: Option<PathBuf>,
    pub cert_key_file: Option<PathBuf>,

    /// Model id announced during provisioning.
    pub model_id: Option<String>,

    /// Provisioning endpoint override.
    pub endpoint: Option<String>,

    /// Override connect timeout.
    pub timeout: Option<u64>,

    /// Override clean-session flag.
    pub clean_session: Option<bool>,
}

fn default_auth() -> String {
    "group-key".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "iotc", "iotc").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("iotc");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from `path`, with `IOTC_`-prefixed environment overrides
/// (`IOTC_DEFAULTS__TIMEOUT=10`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("IOTC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the profile's symmetric key.
///
/// Order: `key_env` variable, system keyring (`iotc` / `<profile>/device-key`),
/// plaintext `key`.
pub fn resolve_key(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.key_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/device-key")) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(ref key) = profile.key {
        return Ok(SecretString::from(key.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Build `DeviceCredentials` from a profile's `auth` field.
pub fn resolve_credentials(
    profile: &Profile,
    profile_name: &str,
) -> Result<DeviceCredentials, ConfigError> {
    match profile.auth.as_str() {
        "group-key" => Ok(DeviceCredentials::GroupKey {
            key: resolve_key(profile, profile_name)?,
        }),
        "device-key" => Ok(DeviceCredentials::DeviceKey {
            key: resolve_key(profile, profile_name)?,
        }),
        "connection" => {
            let host = profile.hub.clone().ok_or_else(|| ConfigError::Validation {
                field: "hub".into(),
                reason: "required for connection auth".into(),
            })?;
            Ok(DeviceCredentials::Connection {
                host,
                key: resolve_key(profile, profile_name)?,
            })
        }
        "certificate" => {
            let (Some(cert_file), Some(key_file)) =
                (profile.cert_file.clone(), profile.cert_key_file.clone())
            else {
                return Err(ConfigError::Validation {
                    field: "cert_file".into(),
                    reason: "cert_file and cert_key_file are required for certificate auth".into(),
                });
            };
            Ok(DeviceCredentials::Certificate(X509Identity {
                cert_file,
                key_file,
                passphrase: None,
            }))
        }
        other => Err(ConfigError::Validation {
            field: "auth".into(),
            reason: format!(
                "expected 'group-key', 'device-key', 'connection', or 'certificate', got '{other}'"
            ),
        }),
    }
}

/// Build a `DeviceIdentity` from a profile.
pub fn profile_to_identity(
    profile: &Profile,
    profile_name: &str,
) -> Result<DeviceIdentity, ConfigError> {
    if profile.device_id.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "device_id".into(),
            reason: "must not be empty".into(),
        });
    }
    let credentials = resolve_credentials(profile, profile_name)?;
    if profile.scope_id.is_empty() && !matches!(credentials, DeviceCredentials::Connection { .. }) {
        return Err(ConfigError::Validation {
            field: "scope_id".into(),
            reason: "required unless auth is 'connection'".into(),
        });
    }

    let mut identity =
        DeviceIdentity::new(profile.device_id.clone(), profile.scope_id.clone(), credentials);
    identity.model_id.clone_from(&profile.model_id);
    if let Some(ref endpoint) = profile.endpoint {
        identity.provisioning_endpoint.clone_from(endpoint);
    }
    Ok(identity)
}

/// Connect options for a profile, falling back to global defaults.
pub fn profile_to_connect_config(profile: &Profile, defaults: &Defaults) -> ConnectConfig {
    ConnectConfig {
        clean_session: profile.clean_session.unwrap_or(defaults.clean_session),
        timeout: Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout)),
        ..ConnectConfig::default()
    }
}
