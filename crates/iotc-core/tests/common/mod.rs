// Shared in-memory transport for session and protocol tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use iotc_api::{
    ConnectOptions, DeviceCredentials, Error, EventReceiver, InboundMessage, SessionStorage,
    Transport, TransportEvent, TransportFactory,
};
use iotc_core::{DeviceClient, DeviceIdentity};

pub const HUB: &str = "hub.azure-devices.net";
pub const DPS: &str = "global.azure-devices-provisioning.net";

// base64("secret-device-key-0123456789abcd")
pub const KEY: &str = "c2VjcmV0LWRldmljZS1rZXktMDEyMzQ1Njc4OWFiY2Q=";

// ── MockTransport ───────────────────────────────────────────────────

/// Records every call and lets the test push inbound frames.
#[derive(Default)]
pub struct MockTransport {
    connect_failures: AtomicU32,
    hang_connect: AtomicBool,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub options: Mutex<Vec<ConnectOptions>>,
    sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    pub subscribed: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    /// Body sent back as `$iothub/twin/res/200` for every twin GET.
    twin_response: Mutex<Option<String>>,
    /// Hub assigned in reply to a provisioning register request.
    assign_hub: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: u32) -> Arc<Self> {
        let transport = Self::default();
        transport.connect_failures.store(times, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn hanging() -> Arc<Self> {
        let transport = Self::default();
        transport.hang_connect.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn provisioning(hub: &str) -> Arc<Self> {
        let transport = Self::default();
        *transport.assign_hub.lock().unwrap() = Some(hub.to_owned());
        Arc::new(transport)
    }

    /// Refuse the next `times` connects.
    pub fn fail_next(&self, times: u32) {
        self.connect_failures.store(times, Ordering::SeqCst);
    }

    pub fn reply_to_twin(&self, body: Value) {
        *self.twin_response.lock().unwrap() = Some(body.to_string());
    }

    pub fn reply_to_twin_raw(&self, body: &str) {
        *self.twin_response.lock().unwrap() = Some(body.to_owned());
    }

    /// Deliver a frame as if it arrived from the hub.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.send(TransportEvent::Message(InboundMessage::new(topic, payload)));
    }

    /// Drop the link without the client asking for it.
    pub fn lose(&self, reason: &str) {
        self.send(TransportEvent::ConnectionLost {
            reason: reason.to_owned(),
        });
    }

    fn send(&self, event: TransportEvent) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published().into_iter().map(|(topic, _)| topic).collect()
    }

    /// Last publish whose topic starts with `prefix`, body parsed as JSON.
    pub fn last_published_json(&self, prefix: &str) -> Option<(String, Value)> {
        self.published()
            .into_iter()
            .rev()
            .find(|(topic, _)| topic.starts_with(prefix))
            .map(|(topic, body)| (topic, serde_json::from_slice(&body).unwrap()))
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> ConnectOptions {
        self.options.lock().unwrap().last().cloned().unwrap()
    }
}

fn request_id(topic: &str) -> &str {
    topic
        .split_once("$rid=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or_default())
        .unwrap_or_default()
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventReceiver, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.options.lock().unwrap().push(options.clone());
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        self.subscribed.lock().unwrap().push(topic.to_owned());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload));

        if topic.starts_with("$iothub/twin/GET/") {
            let body = self.twin_response.lock().unwrap().clone();
            if let Some(body) = body {
                let rid = request_id(topic);
                self.inject(&format!("$iothub/twin/res/200/?$rid={rid}"), body);
            }
        } else if topic.starts_with("$dps/registrations/PUT/") {
            let hub = self.assign_hub.lock().unwrap().clone();
            if let Some(hub) = hub {
                let rid = request_id(topic);
                let body = json!({
                    "operationId": "op-1",
                    "status": "assigned",
                    "registrationState": { "assignedHub": hub, "deviceId": "dev1" }
                });
                self.inject(
                    &format!("$dps/registrations/res/200/?$rid={rid}"),
                    body.to_string(),
                );
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── MockFactory ─────────────────────────────────────────────────────

/// Hands out a fixed transport per host; unknown hosts get `fallback`.
pub struct MockFactory {
    fallback: Arc<MockTransport>,
    by_host: HashMap<String, Arc<MockTransport>>,
    pub created: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new(fallback: Arc<MockTransport>) -> Arc<Self> {
        Arc::new(Self {
            fallback,
            by_host: HashMap::new(),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn with_hosts(fallback: Arc<MockTransport>, hosts: Vec<(&str, Arc<MockTransport>)>) -> Arc<Self> {
        Arc::new(Self {
            fallback,
            by_host: hosts
                .into_iter()
                .map(|(host, transport)| (host.to_owned(), transport))
                .collect(),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        host: &str,
        _client_id: &str,
        _storage: Arc<dyn SessionStorage>,
    ) -> Arc<dyn Transport> {
        self.created.lock().unwrap().push(host.to_owned());
        let transport = self.by_host.get(host).unwrap_or(&self.fallback);
        Arc::clone(transport) as Arc<dyn Transport>
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub fn direct_identity() -> DeviceIdentity {
    DeviceIdentity::new(
        "dev1",
        "",
        DeviceCredentials::Connection {
            host: HUB.to_owned(),
            key: SecretString::from(KEY.to_string()),
        },
    )
}

/// Client that signs hub credentials directly (no provisioning).
pub fn direct_client(transport: &Arc<MockTransport>) -> (Arc<MockFactory>, DeviceClient) {
    let factory = MockFactory::new(Arc::clone(transport));
    let client = DeviceClient::new(direct_identity(), Arc::clone(&factory) as Arc<dyn TransportFactory>);
    (factory, client)
}

/// Poll `condition` until it holds, letting background tasks run.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
