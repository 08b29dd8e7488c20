// MQTT-over-WebSocket transport backed by rumqttc.
//
// One `AsyncClient` per link. Its event loop runs on a spawned task that
// forwards inbound publishes, in arrival order, into the channel handed
// back by `connect`. rumqttc keeps in-flight QoS 1 state inside the event
// loop itself; the session storage only records whether the broker
// resumed a persistent session.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::storage::SessionStorage;
use crate::transport::{
    ConnectOptions, EventReceiver, InboundMessage, Transport, TransportEvent, TransportFactory,
};

/// Requests buffered between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 64;

/// Largest frame either side will accept. Twin documents and telemetry
/// are capped at 256 KiB by the hub.
const MAX_PACKET_SIZE: usize = 256 * 1024;

const WSS_PORT: u16 = 443;

/// Storage key under which the broker's session-present flag is kept.
pub fn session_present_key(client_id: &str) -> String {
    format!("{client_id}/session-present")
}

// ── Factory ──────────────────────────────────────────────────────────

/// [`TransportFactory`] producing [`MqttTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransportFactory;

impl MqttTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        host: &str,
        client_id: &str,
        storage: Arc<dyn SessionStorage>,
    ) -> Arc<dyn Transport> {
        debug!(host, client_id, "creating mqtt transport");
        Arc::new(MqttTransport::new(client_id, storage))
    }
}

// ── Transport ────────────────────────────────────────────────────────

struct Link {
    client: AsyncClient,
    cancel: CancellationToken,
}

/// A single MQTT link over `wss://<host>:443/mqtt`.
pub struct MqttTransport {
    client_id: String,
    storage: Arc<dyn SessionStorage>,
    link: Mutex<Option<Link>>,
}

impl MqttTransport {
    pub fn new(client_id: &str, storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            client_id: client_id.to_owned(),
            storage,
            link: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, Error> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.client.clone())
            .ok_or_else(|| Error::Transport("not connected".into()))
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let connected = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("MqttTransport")
            .field("client_id", &self.client_id)
            .field("connected", &connected)
            .finish_non_exhaustive()
    }
}

/// Translate [`ConnectOptions`] into rumqttc options.
///
/// Client certificates are not carried over the WebSocket transport.
pub fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, Error> {
    if options.certificate.is_some() {
        return Err(Error::Transport(
            "client certificates are not supported over the websocket transport".into(),
        ));
    }
    let port = Url::parse(&options.uri)?
        .port_or_known_default()
        .unwrap_or(WSS_PORT);

    let mut mqtt = MqttOptions::new(options.client_id.clone(), options.uri.clone(), port);
    mqtt.set_transport(rumqttc::Transport::wss_with_default_config());
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(options.clean_session);
    mqtt.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    let password = options
        .password
        .as_ref()
        .map(|password| password.expose_secret().to_owned())
        .unwrap_or_default();
    mqtt.set_credentials(options.username.clone(), password);
    Ok(mqtt)
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventReceiver, Error> {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(options)?, REQUEST_CAPACITY);
        let session_present = wait_for_connack(&mut eventloop).await?;
        self.storage.set(
            &session_present_key(&self.client_id),
            session_present.to_string(),
        );
        info!(uri = %options.uri, client_id = %self.client_id, session_present, "mqtt connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(pump(eventloop, events_tx, cancel.clone()));

        let previous = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Link { client, cancel });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(events_rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let link = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(link) = link else {
            return Ok(());
        };
        // The event loop flushes the DISCONNECT and then exits on its own.
        if let Err(e) = link.client.disconnect().await {
            link.cancel.cancel();
            return Err(Error::Transport(e.to_string()));
        }
        Ok(())
    }
}

// ── Event loop ───────────────────────────────────────────────────────

/// Drive the event loop until the broker acknowledges the connection.
/// Returns the session-present flag.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, Error> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(ack.session_present)
                } else {
                    Err(Error::Transport(format!("connection refused: {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Transport(e.to_string())),
        }
    }
}

/// Forward inbound publishes until the link ends. An unrequested end is
/// reported as [`TransportEvent::ConnectionLost`].
async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                    if events.send(TransportEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    lost(&events, "broker closed the session".into());
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(ConnectionError::RequestsDone) => {
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    lost(&events, e.to_string());
                    break;
                }
            },
        }
    }
    debug!("mqtt event loop exiting");
}

fn lost(events: &mpsc::UnboundedSender<TransportEvent>, reason: String) {
    warn!(reason = %reason, "mqtt link lost");
    let _ = events.send(TransportEvent::ConnectionLost { reason });
}
