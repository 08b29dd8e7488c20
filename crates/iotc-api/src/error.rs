use thiserror::Error;

/// Top-level error type for the `iotc-api` crate.
///
/// Covers every failure mode of the protocol clients: key handling,
/// transport, provisioning, and the HTTPS file-upload surface.
/// `iotc-core` maps these into session-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Credentials ─────────────────────────────────────────────────
    /// The symmetric key is not valid base64.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// A credential bundle could not be decrypted or parsed.
    #[error("Invalid credential bundle: {0}")]
    InvalidCredentials(String),

    // ── Transport ───────────────────────────────────────────────────
    /// The transport refused or failed an operation (connect, subscribe, publish).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport link dropped while an exchange was in flight.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// Connecting failed on every attempt of the fixed retry budget.
    #[error("No connection after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    // ── Provisioning ────────────────────────────────────────────────
    /// The provisioning service answered with a non-success or `failed` status.
    /// Carries the raw server message.
    #[error("Provisioning rejected: {message}")]
    ProvisioningRejected { message: String },

    // ── HTTP (file upload) ──────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Non-success status from the hub's file-upload endpoints.
    #[error("File upload failed (HTTP {status}): {message}")]
    Upload { status: u16, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    pub(crate) fn deserialization(err: &serde_json::Error, body: &str) -> Self {
        let preview: String = body.chars().take(200).collect();
        Self::Deserialization {
            message: format!("{err} (body preview: {preview:?})"),
            body: body.to_owned(),
        }
    }
}
