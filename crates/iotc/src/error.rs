//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use iotc_config::ConfigError;
use iotc_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Credentials ──────────────────────────────────────────────────

    #[error("No key configured for profile '{profile}'")]
    #[diagnostic(
        code(iotc::no_credentials),
        help(
            "Store one with: iotc profile set-key {profile} --key <KEY>\n\
             Or set IOTC_DEVICE_KEY for a one-off command."
        )
    )]
    NoCredentials { profile: String },

    #[error("Invalid key: {reason}")]
    #[diagnostic(code(iotc::invalid_key), help("Keys are base64-encoded symmetric keys."))]
    InvalidKey { reason: String },

    #[error("Invalid credential bundle: {reason}")]
    #[diagnostic(
        code(iotc::invalid_credentials),
        help("Check the passphrase, or pass the bundle exactly as exported.")
    )]
    InvalidCredentials { reason: String },

    #[error("Keyring error: {reason}")]
    #[diagnostic(code(iotc::keyring))]
    Keyring { reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(iotc::profile_not_found),
        help("Available profiles: {available}")
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(iotc::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(iotc::config))]
    Config(ConfigError),

    // ── Device ───────────────────────────────────────────────────────

    #[error("'{operation}' is not supported for {auth} profiles")]
    #[diagnostic(
        code(iotc::unsupported),
        help("This command needs a profile with auth = \"connection\" and a hub host.")
    )]
    Unsupported { operation: String, auth: String },

    #[error("Could not reach the hub: {message}")]
    #[diagnostic(code(iotc::connection_failed))]
    ConnectionFailed { message: String },

    #[error("Upload of '{file}' failed with status {status}: {message}")]
    #[diagnostic(code(iotc::upload_failed))]
    UploadFailed {
        file: String,
        status: u16,
        message: String,
    },

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoCredentials { .. }
            | Self::InvalidKey { .. }
            | Self::InvalidCredentials { .. }
            | Self::Keyring { .. } => exit_code::AUTH,
            Self::ProfileNotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } | Self::Unsupported { .. } => exit_code::USAGE,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Library error mapping ────────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => Self::NoCredentials { profile },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl From<iotc_api::Error> for CliError {
    fn from(err: iotc_api::Error) -> Self {
        match err {
            iotc_api::Error::InvalidKey(reason) => Self::InvalidKey { reason },
            iotc_api::Error::InvalidCredentials(reason) => Self::InvalidCredentials { reason },
            iotc_api::Error::Upload { status, message } => Self::UploadFailed {
                file: String::new(),
                status,
                message,
            },
            other => Self::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidLogLevel { name } => Self::Validation {
                field: "log_level".into(),
                reason: format!("unknown level '{name}'"),
            },
            CoreError::Config { message } => Self::Validation {
                field: "profile".into(),
                reason: message,
            },
            other => Self::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}
