// ── Device client facade ──
//
// The public entry point for applications. Wires a credential source,
// session manager and logger together from a `DeviceIdentity`, and
// exposes the device-side operations.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::watch;

use iotc_api::topics;
use iotc_api::{
    DPS_DEFAULT_ENDPOINT, DeviceCredentials, FileUploader, HttpConfig, MemoryStorage,
    ProvisioningClient, SessionStorage, TransportFactory, UploadResult,
};

use crate::config::{ConnectConfig, DeviceIdentity};
use crate::error::CoreError;
use crate::events::EventCallback;
use crate::logging::{LogLevel, Logger, TracingLogger};
use crate::protocol::TwinSnapshot;
use crate::session::{
    CredentialSource, DirectCredentials, ProvisionedCredentials, SessionManager, SessionState,
};

// ── Builder ──────────────────────────────────────────────────────

/// Configures a [`DeviceClient`] before it is created.
pub struct DeviceClientBuilder {
    identity: DeviceIdentity,
    factory: Arc<dyn TransportFactory>,
    storage: Option<Arc<dyn SessionStorage>>,
    logger: Option<Arc<dyn Logger>>,
    http: HttpConfig,
}

impl DeviceClientBuilder {
    pub fn new(identity: DeviceIdentity, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            identity,
            factory,
            storage: None,
            logger: None,
            http: HttpConfig::default(),
        }
    }

    /// Model id announced during provisioning.
    pub fn set_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.identity.model_id = Some(model_id.into());
        self
    }

    /// Override the provisioning endpoint host.
    pub fn set_global_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.identity.provisioning_endpoint = endpoint.into();
        self
    }

    /// Session storage handed to every transport. Defaults to [`MemoryStorage`].
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn http_config(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn build(self) -> DeviceClient {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::default()));
        let identity = self.identity;

        if identity.provisioning_endpoint != DPS_DEFAULT_ENDPOINT {
            logger.log(
                &format!("Endpoint set to {}.", identity.provisioning_endpoint),
                None,
            );
        }

        let source: Arc<dyn CredentialSource> = match &identity.credentials {
            DeviceCredentials::Connection { host, key } => Arc::new(DirectCredentials::new(
                host.clone(),
                identity.device_id.clone(),
                key.clone(),
            )),
            credentials => Arc::new(ProvisionedCredentials::new(
                ProvisioningClient::new(
                    identity.provisioning_endpoint.clone(),
                    identity.device_id.clone(),
                    identity.scope_id.clone(),
                    credentials.clone(),
                    Arc::clone(&self.factory),
                    Arc::clone(&storage),
                ),
                identity.model_id.clone(),
            )),
        };

        let session = SessionManager::new(
            identity.device_id.clone(),
            identity.credentials.certificate().cloned(),
            source,
            self.factory,
            storage,
        );

        DeviceClient {
            identity: Arc::new(identity),
            session,
            logger,
            http: self.http,
        }
    }
}

// ── DeviceClient ─────────────────────────────────────────────────

/// A device's connection to IoT Central.
///
/// Cheaply cloneable; clones share one session.
#[derive(Clone)]
pub struct DeviceClient {
    identity: Arc<DeviceIdentity>,
    session: SessionManager,
    logger: Arc<dyn Logger>,
    http: HttpConfig,
}

impl DeviceClient {
    /// Client with default storage and logger.
    pub fn new(identity: DeviceIdentity, factory: Arc<dyn TransportFactory>) -> Self {
        DeviceClientBuilder::new(identity, factory).build()
    }

    pub fn builder(identity: DeviceIdentity, factory: Arc<dyn TransportFactory>) -> DeviceClientBuilder {
        DeviceClientBuilder::new(identity, factory)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Provision (unless credentials name the hub directly), connect,
    /// subscribe and fetch the twin.
    pub async fn connect(&self, config: ConnectConfig) -> Result<(), CoreError> {
        self.logger.log("Connecting client...", None);
        self.session.connect(config).await?;
        self.logger.log("Client connected.", None);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.logger.log("Disconnecting client...", None);
        self.session.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Send a telemetry message, with optional message properties
    /// appended to the topic in insertion order.
    pub async fn send_telemetry<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        properties: Option<&IndexMap<String, String>>,
    ) -> Result<(), CoreError> {
        let body = encode(payload)?;
        let topic = match properties {
            Some(properties) => topics::telemetry(self.session.device_id(), properties),
            None => topics::telemetry(
                self.session.device_id(),
                std::iter::empty::<(&str, &str)>(),
            ),
        };
        self.logger.debug(&format!("Sending telemetry to {topic}"), Some("telemetry"));
        self.session.handle().publish(&topic, body).await
    }

    /// Send a reported-property patch.
    pub async fn send_property<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), CoreError> {
        let patch = serde_json::to_value(payload)
            .map_err(|e| CoreError::Internal(format!("cannot encode property: {e}")))?;
        self.logger.debug("Sending reported properties", Some("properties"));
        self.session.handle().send_reported(&patch).await
    }

    /// Request the full twin. [`twin`](Self::twin) reflects it once the
    /// response has been processed.
    pub async fn fetch_twin(&self) -> Result<(), CoreError> {
        self.session.handle().request_twin().await
    }

    pub fn twin(&self) -> TwinSnapshot {
        self.session.twin()
    }

    /// Upload a file through the hub's blob storage integration.
    pub async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
        encoding: Option<&str>,
    ) -> Result<UploadResult, CoreError> {
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        let creds = self.session.credentials().ok_or(CoreError::NotConnected)?;
        let password = creds.password.ok_or_else(|| CoreError::Config {
            message: "file upload requires SAS authentication".into(),
        })?;
        let uploader =
            FileUploader::new(&creds.host, self.session.device_id(), &password, &self.http)?;
        Ok(uploader.upload(file_name, content_type, data, encoding).await?)
    }

    // ── Events & logging ─────────────────────────────────────────

    /// Register a listener: `Properties`, `Commands`, `Properties.<name>`
    /// or `Commands.<name>`. Replaces the previous listener of the category.
    pub fn on(&self, event_name: &str, callback: EventCallback) -> Result<(), CoreError> {
        self.session.registry().on(event_name, callback)
    }

    /// Set the log level by name (`DISABLED`, `API_ONLY`, `ALL`).
    pub fn set_logging(&self, level: &str) -> Result<(), CoreError> {
        self.set_log_level(LogLevel::parse(level)?);
        Ok(())
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.logger.set_log_level(level);
        self.logger.log(&format!("Log level set to {level}"), None);
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("device_id", &self.identity.device_id)
            .field("auth", &self.identity.credentials.kind())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(payload).map_err(|e| CoreError::Internal(format!("cannot encode payload: {e}")))
}
