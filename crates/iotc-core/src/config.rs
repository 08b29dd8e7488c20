// ── Runtime device configuration ──
//
// These types describe *who* the device is and *how* a connect attempt
// behaves. They never touch disk; iotc-config or the embedding
// application builds them and hands them in.

use std::time::Duration;

use iotc_api::{DPS_DEFAULT_ENDPOINT, DeviceCredentials};

use crate::cancel::CancellationToken;

/// Immutable device identity.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Device id, also the provisioning registration id.
    pub device_id: String,
    /// Provisioning id scope. Unused for connection-string credentials.
    pub scope_id: String,
    pub credentials: DeviceCredentials,
    /// Model id sent during provisioning for automatic device approval.
    pub model_id: Option<String>,
    /// Provisioning endpoint host.
    pub provisioning_endpoint: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        scope_id: impl Into<String>,
        credentials: DeviceCredentials,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            scope_id: scope_id.into(),
            credentials,
            model_id: None,
            provisioning_endpoint: DPS_DEFAULT_ENDPOINT.to_owned(),
        }
    }
}

/// Options for one `connect()` call.
///
/// The timeout and token also govern any automatic reconnect that follows
/// from this connect.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub clean_session: bool,
    pub timeout: Duration,
    pub cancellation: CancellationToken,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            clean_session: true,
            timeout: Duration::from_secs(30),
            cancellation: CancellationToken::new(),
        }
    }
}
