// Transport contract and shared HTTP configuration.
//
// The publish/subscribe transport (QoS, keep-alive, framing) is supplied by
// the embedding application through `TransportFactory`. The protocol
// engines only rely on connect / subscribe / publish / disconnect and an
// ordered stream of inbound events.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::auth::X509Identity;
use crate::error::Error;
use crate::storage::SessionStorage;

/// MQTT keep-alive used when the caller does not override it.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Everything a transport needs to open an authenticated link.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `wss://<host>:443/mqtt`
    pub uri: String,
    pub client_id: String,
    pub username: String,
    /// SAS password. `None` for certificate auth.
    pub password: Option<SecretString>,
    pub certificate: Option<X509Identity>,
    pub clean_session: bool,
    pub keep_alive: Duration,
}

impl ConnectOptions {
    pub fn new(host: &str, client_id: &str, username: String) -> Self {
        Self {
            uri: websocket_uri(host),
            client_id: client_id.to_owned(),
            username,
            password: None,
            certificate: None,
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    pub fn with_password(mut self, password: Option<SecretString>) -> Self {
        self.password = password;
        self
    }

    pub fn with_certificate(mut self, certificate: Option<X509Identity>) -> Self {
        self.certificate = certificate;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }
}

/// MQTT-over-WebSocket endpoint for a host.
pub fn websocket_uri(host: &str) -> String {
    format!("wss://{host}:443/mqtt")
}

/// A frame delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Events emitted by a connected transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The link dropped without the client asking for it.
    ConnectionLost { reason: String },
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// A single publish/subscribe link.
///
/// `connect` hands back the receiving end of the inbound event stream;
/// the stream ends when the transport is disconnected.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventReceiver, Error>;

    async fn subscribe(&self, topic: &str) -> Result<(), Error>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;

    async fn disconnect(&self) -> Result<(), Error>;
}

/// Builds transports for a given endpoint.
///
/// Both the provisioning client and the hub session create their links
/// through this, handing over the injected session storage.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        host: &str,
        client_id: &str,
        storage: Arc<dyn SessionStorage>,
    ) -> Arc<dyn Transport>;
}

/// Connect with a bounded number of attempts and a fixed delay between them.
///
/// Returns [`Error::RetryExhausted`] once every attempt has failed.
pub async fn connect_with_retry(
    transport: &dyn Transport,
    options: &ConnectOptions,
    max_attempts: u32,
    delay: Duration,
) -> Result<EventReceiver, Error> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match transport.connect(options).await {
            Ok(events) => {
                tracing::debug!(uri = %options.uri, attempt, "transport connected");
                return Ok(events);
            }
            Err(e) => {
                tracing::warn!(uri = %options.uri, attempt, error = %e, "transport connect failed");
                if attempt >= max_attempts {
                    return Err(Error::RetryExhausted { attempts: attempt });
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────

/// Shared configuration for the HTTPS side channel (file upload).
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    /// Build a `reqwest::Client` from this config, sending `headers` on
    /// every request.
    pub fn build_client(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("iotc/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(Error::Http)
    }
}
