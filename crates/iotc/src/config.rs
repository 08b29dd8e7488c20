//! Profile lookup for CLI commands.
//!
//! Thin layer over `iotc_config` that honours `--config` / `--profile`.

use std::path::PathBuf;

use iotc_config::{Config, ConfigError, Profile};

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub fn path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(iotc_config::config_path)
}

/// Load the config file, treating a missing file as an empty config.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = path(global);
    tracing::debug!(path = %path.display(), "loading config");
    Ok(iotc_config::load_config_from(&path)?)
}

/// Resolve `--profile` (or the default profile) to a name and its settings.
pub fn active_profile(global: &GlobalOpts, cfg: &Config) -> Result<(String, Profile), CliError> {
    match cfg.profile(global.profile.as_deref()) {
        Ok((name, profile)) => Ok((name.to_owned(), profile.clone())),
        Err(ConfigError::UnknownProfile { profile }) => Err(not_found(cfg, profile)),
        Err(other) => Err(other.into()),
    }
}

pub fn not_found(cfg: &Config, name: String) -> CliError {
    let mut names: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
    names.sort_unstable();
    let available = if names.is_empty() {
        "(none)".to_owned()
    } else {
        names.join(", ")
    };
    CliError::ProfileNotFound { name, available }
}
