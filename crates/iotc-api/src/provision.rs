//! Device registration against the provisioning service (DPS).
//!
//! The exchange runs over its own short-lived transport:
//!
//! ```text
//! connect ─► subscribe res/# ─► PUT iotdps-register
//!                                   │
//!              ┌──── 202 ◄──────────┤
//!              │  sleep(retry-after + 2s)
//!              └─► GET operationstatus ─► ... ─► 200 assigned ─► sign hub SAS
//! ```
//!
//! Responses are correlated by request id; frames for any other request
//! are ignored. The request id is generated once per client and reused by
//! every [`ProvisioningClient::register`] call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, trace, warn};

use crate::auth::{self, DeviceCredentials, SessionCredentials};
use crate::error::Error;
use crate::storage::SessionStorage;
use crate::topics;
use crate::transport::{
    ConnectOptions, EventReceiver, Transport, TransportEvent, TransportFactory,
    connect_with_retry,
};

/// Global provisioning endpoint used unless the caller overrides it.
pub const DPS_DEFAULT_ENDPOINT: &str = "global.azure-devices-provisioning.net";

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Added to the server's retry-after before polling.
const POLL_GRACE_SECS: u64 = 2;

/// Progress of the current registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Idle,
    Connecting,
    Registering,
    Polling,
    Assigned,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationAccepted {
    operation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResult {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
}

/// Drives the registration protocol and produces hub credentials.
pub struct ProvisioningClient {
    endpoint: String,
    registration_id: String,
    scope_id: String,
    credentials: DeviceCredentials,
    request_id: String,
    factory: Arc<dyn TransportFactory>,
    storage: Arc<dyn SessionStorage>,
    status: Mutex<RegistrationStatus>,
    operation_id: Mutex<Option<String>>,
}

impl std::fmt::Debug for ProvisioningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningClient")
            .field("endpoint", &self.endpoint)
            .field("registration_id", &self.registration_id)
            .field("scope_id", &self.scope_id)
            .field("auth", &self.credentials.kind())
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl ProvisioningClient {
    pub fn new(
        endpoint: impl Into<String>,
        registration_id: impl Into<String>,
        scope_id: impl Into<String>,
        credentials: DeviceCredentials,
        factory: Arc<dyn TransportFactory>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            registration_id: registration_id.into(),
            scope_id: scope_id.into(),
            credentials,
            request_id: uuid::Uuid::new_v4().to_string(),
            factory,
            storage,
            status: Mutex::new(RegistrationStatus::Idle),
            operation_id: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    /// The correlation id stamped on every request this client sends.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> RegistrationStatus {
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Operation id assigned by the service on the last 202, if any.
    pub fn operation_id(&self) -> Option<String> {
        self.operation_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: RegistrationStatus) {
        trace!(?status, "registration status");
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    /// Register the device and return signed credentials for its hub.
    ///
    /// `model_id` is sent in the registration payload for automatic
    /// approval. The provisioning transport is torn down on every exit.
    pub async fn register(&self, model_id: Option<&str>) -> Result<SessionCredentials, Error> {
        let device_key = self.credentials.device_key(&self.registration_id)?;
        let password = device_key
            .as_ref()
            .map(|key| {
                auth::provisioning_password(
                    &self.scope_id,
                    &self.registration_id,
                    key.expose_secret(),
                    Utc::now(),
                )
            })
            .transpose()?;

        let options = ConnectOptions::new(
            &self.endpoint,
            &self.registration_id,
            topics::dps_username(&self.scope_id, &self.registration_id),
        )
        .with_password(password)
        .with_certificate(self.credentials.certificate().cloned());

        *self
            .operation_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.set_status(RegistrationStatus::Connecting);
        info!(endpoint = %self.endpoint, registration_id = %self.registration_id, "registering device");

        let transport =
            self.factory
                .create(&self.endpoint, &self.registration_id, Arc::clone(&self.storage));

        let mut events =
            match connect_with_retry(transport.as_ref(), &options, CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    self.set_status(RegistrationStatus::Failed);
                    return Err(e);
                }
            };

        let outcome = self
            .exchange(transport.as_ref(), &mut events, device_key.as_ref(), model_id)
            .await;

        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "provisioning transport teardown failed (non-fatal)");
        }

        match &outcome {
            Ok(creds) => {
                self.set_status(RegistrationStatus::Assigned);
                info!(hub = %creds.host, "device assigned");
            }
            Err(e) => {
                self.set_status(RegistrationStatus::Failed);
                warn!(error = %e, "registration failed");
            }
        }
        outcome
    }

    async fn exchange(
        &self,
        transport: &dyn Transport,
        events: &mut EventReceiver,
        device_key: Option<&SecretString>,
        model_id: Option<&str>,
    ) -> Result<SessionCredentials, Error> {
        transport.subscribe(topics::dps_response_filter()).await?;

        let payload = registration_payload(&self.registration_id, model_id);
        transport
            .publish(&topics::dps_register(&self.request_id), payload)
            .await?;
        self.set_status(RegistrationStatus::Registering);

        loop {
            let message = match events.recv().await {
                Some(TransportEvent::Message(message)) => message,
                Some(TransportEvent::ConnectionLost { reason }) => {
                    return Err(Error::ConnectionLost { reason });
                }
                None => {
                    return Err(Error::ConnectionLost {
                        reason: "provisioning event stream closed".into(),
                    });
                }
            };

            let Some(response) = topics::parse_dps_response(&message.topic) else {
                trace!(topic = %message.topic, "ignoring non-registration frame");
                continue;
            };
            if response.request_id != self.request_id {
                debug!(
                    request_id = %response.request_id,
                    "ignoring registration response for another request"
                );
                continue;
            }

            let body = message.payload_str().into_owned();
            match response.status {
                202 => {
                    let accepted: OperationAccepted = serde_json::from_str(&body)
                        .map_err(|e| Error::deserialization(&e, &body))?;
                    self.set_status(RegistrationStatus::Polling);

                    let wait = Duration::from_secs(
                        response.retry_after.unwrap_or(0) + POLL_GRACE_SECS,
                    );
                    debug!(
                        operation_id = %accepted.operation_id,
                        wait_secs = wait.as_secs(),
                        "registration pending, polling"
                    );
                    tokio::time::sleep(wait).await;

                    transport
                        .publish(
                            &topics::dps_poll(&self.request_id, &accepted.operation_id),
                            Vec::new(),
                        )
                        .await?;
                    *self
                        .operation_id
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) =
                        Some(accepted.operation_id);
                }
                200 => {
                    let result: RegistrationResult = serde_json::from_str(&body)
                        .map_err(|e| Error::deserialization(&e, &body))?;
                    if result.status.as_deref() == Some("failed") {
                        return Err(Error::ProvisioningRejected { message: body });
                    }
                    let Some(hub) = result.registration_state.and_then(|s| s.assigned_hub)
                    else {
                        return Err(Error::ProvisioningRejected { message: body });
                    };
                    return auth::hub_credentials(&hub, &self.registration_id, device_key);
                }
                status => {
                    debug!(status, "registration rejected");
                    return Err(Error::ProvisioningRejected { message: body });
                }
            }
        }
    }
}

fn registration_payload(registration_id: &str, model_id: Option<&str>) -> Vec<u8> {
    let mut payload = json!({ "registrationId": registration_id });
    if let Some(model_id) = model_id {
        payload["payload"] = json!({
            "iotcModelId": model_id,
            "modelId": model_id,
        });
    }
    payload.to_string().into_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_model_id() {
        let payload: serde_json::Value =
            serde_json::from_slice(&registration_payload("dev1", None)).unwrap();
        assert_eq!(payload, json!({ "registrationId": "dev1" }));
    }

    #[test]
    fn payload_with_model_id() {
        let payload: serde_json::Value =
            serde_json::from_slice(&registration_payload("dev1", Some("dtmi:x;1"))).unwrap();
        assert_eq!(payload["payload"]["iotcModelId"], "dtmi:x;1");
        assert_eq!(payload["payload"]["modelId"], "dtmi:x;1");
    }
}
