// ── Core error types ──
//
// User-facing errors from iotc-core. Transport and provisioning failures
// from iotc-api are folded into session-level variants by the
// `From<iotc_api::Error>` impl below.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lifecycle ────────────────────────────────────────────────────
    /// The caller's cancellation token fired. `step` is the last
    /// checkpoint the connect sequence completed.
    #[error("Connection aborted: {step}.")]
    Cancelled { step: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("No connection after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Provisioning rejected: {message}")]
    ProvisioningRejected { message: String },

    #[error("Device not connected")]
    NotConnected,

    // ── Protocol ─────────────────────────────────────────────────────
    #[error("Malformed twin document: {message}")]
    MalformedTwin { message: String },

    #[error("Invalid event name: {name}")]
    InvalidEventName { name: String },

    #[error("Invalid log level: {name}")]
    InvalidLogLevel { name: String },

    // ── Transport ────────────────────────────────────────────────────
    #[error("Transport error: {message}")]
    Transport { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from protocol-layer errors ────────────────────────────

impl From<iotc_api::Error> for CoreError {
    fn from(err: iotc_api::Error) -> Self {
        match err {
            iotc_api::Error::RetryExhausted { attempts } => CoreError::RetryExhausted { attempts },
            iotc_api::Error::ProvisioningRejected { message } => {
                CoreError::ProvisioningRejected { message }
            }
            iotc_api::Error::Transport(message) => CoreError::Transport { message },
            iotc_api::Error::ConnectionLost { reason } => CoreError::Transport {
                message: format!("connection lost: {reason}"),
            },
            iotc_api::Error::InvalidKey(message) => CoreError::Config {
                message: format!("invalid device key: {message}"),
            },
            iotc_api::Error::InvalidCredentials(message) => CoreError::Config {
                message: format!("invalid credential bundle: {message}"),
            },
            iotc_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            iotc_api::Error::Http(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_ms: 0 }
                } else {
                    CoreError::Transport {
                        message: e.to_string(),
                    }
                }
            }
            iotc_api::Error::Upload { status, message } => CoreError::Transport {
                message: format!("file upload failed (HTTP {status}): {message}"),
            },
            iotc_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
