// ── Session lifecycle ──
//
// Owns the hub transport for one device. A connect runs a fixed,
// checkpointed sequence:
//
//   credentials ─► create transport ─► connect (5 × 2s) ─► Connected
//     ─► start dispatcher ─► subscribe ─► twin GET
//
// An unsolicited link loss re-runs the whole sequence under the initiating
// connect's timeout and cancellation token, unless `disconnect()` was
// called since the last `connect()`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use iotc_api::topics;
use iotc_api::{
    ConnectOptions, EventReceiver, ProvisioningClient, SessionCredentials, SessionStorage,
    Transport, TransportEvent, TransportFactory, X509Identity,
};

use crate::cancel::{CancellationToken, ConnectStep, run_with_timeout};
use crate::config::ConnectConfig;
use crate::error::CoreError;
use crate::events::EventRegistry;
use crate::protocol::{ProtocolEngine, TwinSnapshot};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

// ── SessionState ─────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

// ── Credential sources ───────────────────────────────────────────

/// Produces fresh hub credentials for every connect or reconnect.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<SessionCredentials, CoreError>;
}

/// Credentials obtained by registering through the provisioning service.
#[derive(Debug)]
pub struct ProvisionedCredentials {
    client: ProvisioningClient,
    model_id: Option<String>,
}

impl ProvisionedCredentials {
    pub fn new(client: ProvisioningClient, model_id: Option<String>) -> Self {
        Self { client, model_id }
    }

    pub fn client(&self) -> &ProvisioningClient {
        &self.client
    }
}

#[async_trait]
impl CredentialSource for ProvisionedCredentials {
    async fn credentials(&self) -> Result<SessionCredentials, CoreError> {
        Ok(self.client.register(self.model_id.as_deref()).await?)
    }
}

/// Credentials signed locally for a hub known up front.
#[derive(Debug)]
pub struct DirectCredentials {
    host: String,
    device_id: String,
    key: SecretString,
}

impl DirectCredentials {
    pub fn new(host: impl Into<String>, device_id: impl Into<String>, key: SecretString) -> Self {
        Self {
            host: host.into(),
            device_id: device_id.into(),
            key,
        }
    }
}

#[async_trait]
impl CredentialSource for DirectCredentials {
    async fn credentials(&self) -> Result<SessionCredentials, CoreError> {
        Ok(iotc_api::generate_hub_credentials(
            &self.host,
            &self.device_id,
            self.key.expose_secret(),
        )?)
    }
}

// ── SessionHandle ────────────────────────────────────────────────

struct Link {
    device_id: String,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state: watch::Sender<SessionState>,
}

impl Link {
    fn new(device_id: String) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            device_id,
            transport: RwLock::new(None),
            state,
        }
    }
}

/// Cloneable publisher onto the live session.
///
/// Every send checks the session state first and fails with
/// [`CoreError::NotConnected`] without touching the network.
#[derive(Clone)]
pub struct SessionHandle {
    link: Arc<Link>,
}

impl SessionHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            link: Arc::new(Link::new(String::new())),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.link.device_id
    }

    pub fn is_connected(&self) -> bool {
        *self.link.state.borrow() == SessionState::Connected
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, CoreError> {
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        self.link
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CoreError::NotConnected)
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
        let transport = self.transport()?;
        trace!(topic, size = payload.len(), "publish");
        Ok(transport.publish(topic, payload).await?)
    }

    /// Publish a reported-property patch.
    pub async fn send_reported(&self, patch: &Value) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(patch)
            .map_err(|e| CoreError::Internal(format!("cannot encode reported patch: {e}")))?;
        let topic = topics::reported_patch(&uuid::Uuid::new_v4().to_string());
        self.publish(&topic, payload).await
    }

    /// Ask the hub for the full twin. The response arrives on the
    /// dispatcher and replaces the session's twin snapshot.
    pub async fn request_twin(&self) -> Result<(), CoreError> {
        let topic = topics::twin_get(&uuid::Uuid::new_v4().to_string());
        self.publish(&topic, Vec::new()).await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device_id", &self.link.device_id)
            .field("state", &*self.link.state.borrow())
            .finish()
    }
}

// ── SessionManager ───────────────────────────────────────────────

struct Dispatcher {
    cancel: tokio_util::sync::CancellationToken,
    _task: JoinHandle<()>,
}

struct SessionInner {
    device_id: String,
    certificate: Option<X509Identity>,
    source: Arc<dyn CredentialSource>,
    factory: Arc<dyn TransportFactory>,
    storage: Arc<dyn SessionStorage>,
    registry: Arc<EventRegistry>,
    handle: SessionHandle,
    engine: Arc<ProtocolEngine>,
    /// Set by `disconnect()`, cleared by `connect()`.
    explicit_disconnect: AtomicBool,
    retry_count: AtomicU32,
    credentials: RwLock<Option<SessionCredentials>>,
    /// Timeout and token of the last `connect()`, reused by reconnects.
    last_config: Mutex<Option<ConnectConfig>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

/// Connection lifecycle for one device.
///
/// Cheaply cloneable via `Arc<SessionInner>`.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        device_id: impl Into<String>,
        certificate: Option<X509Identity>,
        source: Arc<dyn CredentialSource>,
        factory: Arc<dyn TransportFactory>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        let device_id = device_id.into();
        let registry = Arc::new(EventRegistry::new());
        let handle = SessionHandle {
            link: Arc::new(Link::new(device_id.clone())),
        };
        let engine = Arc::new(ProtocolEngine::new(Arc::clone(&registry), handle.clone()));

        Self {
            inner: Arc::new(SessionInner {
                device_id,
                certificate,
                source,
                factory,
                storage,
                registry,
                handle,
                engine,
                explicit_disconnect: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                credentials: RwLock::new(None),
                last_config: Mutex::new(None),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.inner.handle
    }

    pub fn state(&self) -> SessionState {
        *self.inner.handle.link.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.handle.link.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.handle.is_connected()
    }

    pub fn twin(&self) -> TwinSnapshot {
        self.inner.engine.twin()
    }

    /// Credentials of the most recent connect cycle.
    pub fn credentials(&self) -> Option<SessionCredentials> {
        self.inner
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Failed transport connects in the current connect cycle.
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        trace!(?state, "session state");
        self.inner.handle.link.state.send_replace(state);
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Run the connect sequence, bounded by `config.timeout`.
    ///
    /// On timeout the sequence keeps running in the background; nothing
    /// already done is rolled back.
    pub async fn connect(&self, config: ConnectConfig) -> Result<(), CoreError> {
        self.inner.explicit_disconnect.store(false, Ordering::SeqCst);
        self.inner.retry_count.store(0, Ordering::SeqCst);
        self.teardown().await;
        *self
            .inner
            .last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.clone());

        let manager = self.clone();
        let token = config.cancellation.clone();
        let clean_session = config.clean_session;
        run_with_timeout(
            async move { manager.establish(&token, clean_session, false).await },
            config.timeout,
        )
        .await
    }

    /// Tear the session down and suppress automatic reconnection until
    /// the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        self.inner.explicit_disconnect.store(true, Ordering::SeqCst);
        self.teardown().await;
        self.set_state(SessionState::Disconnected);
        info!(device_id = %self.inner.device_id, "session disconnected");
    }

    async fn establish(
        &self,
        token: &CancellationToken,
        clean_session: bool,
        reconnecting: bool,
    ) -> Result<(), CoreError> {
        // A reconnect spawned before `disconnect` must not resurface.
        if reconnecting && self.inner.explicit_disconnect.load(Ordering::SeqCst) {
            return Err(CoreError::Cancelled {
                step: ConnectStep::PreProvisioning.to_string(),
            });
        }
        self.set_state(if reconnecting {
            SessionState::Reconnecting { attempt: 1 }
        } else {
            SessionState::Connecting
        });

        let result = self.run_sequence(token, clean_session, reconnecting).await;
        if let Err(ref e) = result {
            debug!(error = %e, "connect sequence failed");
            self.teardown().await;
            if !self.inner.explicit_disconnect.load(Ordering::SeqCst) {
                self.set_state(SessionState::Disconnected);
            }
        }
        result
    }

    /// Cancellation checkpoint. An explicit disconnect aborts an
    /// in-flight sequence the same way the caller's token does.
    fn checkpoint(&self, token: &CancellationToken, step: ConnectStep) -> Result<(), CoreError> {
        token.check(step)?;
        if self.inner.explicit_disconnect.load(Ordering::SeqCst) {
            return Err(CoreError::Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    async fn run_sequence(
        &self,
        token: &CancellationToken,
        clean_session: bool,
        reconnecting: bool,
    ) -> Result<(), CoreError> {
        let device_id = self.inner.device_id.as_str();

        self.checkpoint(token, ConnectStep::PreProvisioning)?;
        let creds = self.inner.source.credentials().await?;
        *self
            .inner
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(creds.clone());

        self.checkpoint(token, ConnectStep::PostProvisioning)?;
        let transport =
            self.inner
                .factory
                .create(&creds.host, device_id, Arc::clone(&self.inner.storage));

        self.checkpoint(token, ConnectStep::PostTransportInit)?;
        let options = ConnectOptions::new(
            &creds.host,
            device_id,
            topics::hub_username(&creds.host, device_id),
        )
        .with_password(creds.password.clone())
        .with_certificate(self.inner.certificate.clone())
        .with_clean_session(clean_session);

        let events = self
            .connect_transport(token, transport.as_ref(), &options, reconnecting)
            .await?;
        *self
            .inner
            .handle
            .link
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&transport));

        self.checkpoint(token, ConnectStep::PostConnect)?;
        self.set_state(SessionState::Connected);
        self.start_dispatcher(events);

        let device_bound = topics::device_bound_filter(device_id);
        for filter in [
            device_bound.as_str(),
            topics::twin_response_filter(),
            topics::desired_patch_filter(),
            topics::command_filter(),
        ] {
            transport.subscribe(filter).await?;
        }

        self.checkpoint(token, ConnectStep::PostSubscribe)?;
        self.inner.handle.request_twin().await?;

        self.checkpoint(token, ConnectStep::PostTwinFetch)?;
        info!(host = %creds.host, device_id, "session connected");
        Ok(())
    }

    async fn connect_transport(
        &self,
        token: &CancellationToken,
        transport: &dyn Transport,
        options: &ConnectOptions,
        reconnecting: bool,
    ) -> Result<EventReceiver, CoreError> {
        loop {
            self.checkpoint(token, ConnectStep::PostTransportInit)?;
            match transport.connect(options).await {
                Ok(events) => return Ok(events),
                Err(e) => {
                    let attempts = self.inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(uri = %options.uri, attempt = attempts, error = %e, "hub connect failed");
                    if attempts >= CONNECT_ATTEMPTS {
                        return Err(CoreError::RetryExhausted { attempts });
                    }
                    self.checkpoint(token, ConnectStep::PostTransportInit)?;
                    if reconnecting {
                        self.set_state(SessionState::Reconnecting {
                            attempt: attempts + 1,
                        });
                    }
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn start_dispatcher(&self, events: EventReceiver) {
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(dispatch(
            Arc::clone(&self.inner.engine),
            Arc::downgrade(&self.inner),
            events,
            cancel.clone(),
        ));
        let previous = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Dispatcher {
                cancel,
                _task: task,
            });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Stop the dispatcher and close the transport, if any.
    ///
    /// The dispatcher is not joined: it may be the caller (a callback
    /// invoking disconnect). It exits after its current frame.
    async fn teardown(&self) {
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel.cancel();
        }

        let transport = self
            .inner
            .handle
            .link
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "transport teardown failed (non-fatal)");
            }
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        if self.inner.explicit_disconnect.load(Ordering::SeqCst) {
            debug!(reason, "link closed after disconnect");
            return;
        }
        if self.state() != SessionState::Connected {
            debug!(reason, state = ?self.state(), "link lost outside connected state");
            return;
        }
        let config = self
            .inner
            .last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(config) = config else {
            self.set_state(SessionState::Disconnected);
            return;
        };

        warn!(reason, "connection lost, reconnecting");
        self.set_state(SessionState::Reconnecting { attempt: 1 });
        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect(config).await });
    }

    async fn reconnect(&self, config: ConnectConfig) {
        self.inner.retry_count.store(0, Ordering::SeqCst);
        self.teardown().await;

        let manager = self.clone();
        let token = config.cancellation.clone();
        let clean_session = config.clean_session;
        match run_with_timeout(
            async move { manager.establish(&token, clean_session, true).await },
            config.timeout,
        )
        .await
        {
            Ok(()) => info!(device_id = %self.inner.device_id, "session re-established"),
            Err(e) if self.inner.explicit_disconnect.load(Ordering::SeqCst) => {
                debug!(error = %e, "reconnect abandoned after disconnect");
            }
            Err(e) => {
                warn!(error = %e, "reconnect failed");
                self.set_state(SessionState::Disconnected);
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.state())
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

/// Single consumer of a transport's event stream. Each frame, including
/// the callback it triggers, completes before the next is taken.
async fn dispatch(
    engine: Arc<ProtocolEngine>,
    session: Weak<SessionInner>,
    mut events: EventReceiver,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(TransportEvent::Message(message)) => engine.handle(message).await,
            Some(TransportEvent::ConnectionLost { reason }) => {
                if let Some(inner) = session.upgrade() {
                    SessionManager { inner }.on_connection_lost(&reason);
                }
                break;
            }
            None => {
                if let Some(inner) = session.upgrade() {
                    SessionManager { inner }.on_connection_lost("event stream closed");
                }
                break;
            }
        }
    }
    trace!("dispatcher stopped");
}
