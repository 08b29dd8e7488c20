// Provisioning state machine tests against a scripted in-memory transport.
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::sync::mpsc;

use iotc_api::topics;
use iotc_api::{
    ConnectOptions, DeviceCredentials, Error, EventReceiver, InboundMessage, MemoryStorage,
    ProvisioningClient, RegistrationStatus, SessionStorage, Transport, TransportEvent,
    TransportFactory, X509Identity,
};

// ── Scripted transport ──────────────────────────────────────────────

/// Replies to each publish with the next scripted batch of events.
#[derive(Default)]
struct ScriptedTransport {
    connect_failures: AtomicU32,
    connects: AtomicU32,
    disconnected: AtomicBool,
    options: Mutex<Option<ConnectOptions>>,
    sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    subscribed: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    replies: Mutex<VecDeque<Vec<TransportEvent>>>,
}

impl ScriptedTransport {
    fn failing(times: u32) -> Self {
        let transport = Self::default();
        transport.connect_failures.store(times, Ordering::SeqCst);
        transport
    }

    fn on_publish(&self, events: Vec<TransportEvent>) {
        self.replies.lock().unwrap().push_back(events);
    }

    fn published_topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventReceiver, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        *self.options.lock().unwrap() = Some(options.clone());
        self.disconnected.store(false, Ordering::SeqCst);
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
        let batch = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            for event in batch {
                let _ = tx.send(event);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

struct SharedFactory(Arc<ScriptedTransport>);

impl TransportFactory for SharedFactory {
    fn create(
        &self,
        _host: &str,
        _client_id: &str,
        _storage: Arc<dyn SessionStorage>,
    ) -> Arc<dyn Transport> {
        Arc::clone(&self.0) as Arc<dyn Transport>
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

// base64("secret-device-key-0123456789abcd")
const KEY: &str = "c2VjcmV0LWRldmljZS1rZXktMDEyMzQ1Njc4OWFiY2Q=";

fn client_with(transport: &Arc<ScriptedTransport>, credentials: DeviceCredentials) -> ProvisioningClient {
    ProvisioningClient::new(
        iotc_api::DPS_DEFAULT_ENDPOINT,
        "dev1",
        "0ne000ABCD",
        credentials,
        Arc::new(SharedFactory(Arc::clone(transport))),
        Arc::new(MemoryStorage::new()),
    )
}

fn setup(transport: ScriptedTransport) -> (Arc<ScriptedTransport>, ProvisioningClient) {
    let transport = Arc::new(transport);
    let client = client_with(
        &transport,
        DeviceCredentials::DeviceKey {
            key: SecretString::from(KEY.to_string()),
        },
    );
    (transport, client)
}

fn response(status: u16, rid: &str, retry_after: Option<u64>, body: serde_json::Value) -> TransportEvent {
    let mut topic = format!("$dps/registrations/res/{status}/?$rid={rid}");
    if let Some(secs) = retry_after {
        topic.push_str(&format!("&retry-after={secs}"));
    }
    TransportEvent::Message(InboundMessage::new(topic, body.to_string()))
}

fn assigned(rid: &str, hub: &str) -> TransportEvent {
    response(
        200,
        rid,
        None,
        json!({
            "operationId": "op-1",
            "status": "assigned",
            "registrationState": {
                "registrationId": "dev1",
                "assignedHub": hub,
                "deviceId": "dev1",
                "status": "assigned"
            }
        }),
    )
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_register_polls_until_assigned() {
    let (transport, client) = setup(ScriptedTransport::default());
    let rid = client.request_id().to_owned();

    transport.on_publish(vec![response(
        202,
        &rid,
        Some(1),
        json!({ "operationId": "op-1", "status": "assigning" }),
    )]);
    transport.on_publish(vec![assigned(&rid, "hub-1.azure-devices.net")]);

    let start = tokio::time::Instant::now();
    let creds = client.register(Some("dtmi:contoso:thermostat;1")).await.unwrap();

    // retry-after (1s) plus the fixed 2s grace
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(creds.host, "hub-1.azure-devices.net");
    let password = creds.password.unwrap();
    assert!(
        password
            .expose_secret()
            .starts_with("SharedAccessSignature sr=hub-1.azure-devices.net%2Fdevices%2Fdev1&sig=")
    );

    assert_eq!(
        transport.published_topics(),
        vec![topics::dps_register(&rid), topics::dps_poll(&rid, "op-1")]
    );
    let (_, body) = transport.published.lock().unwrap()[0].clone();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["registrationId"], "dev1");
    assert_eq!(body["payload"]["modelId"], "dtmi:contoso:thermostat;1");

    assert_eq!(
        transport.subscribed.lock().unwrap().clone(),
        vec!["$dps/registrations/res/#".to_owned()]
    );
    assert_eq!(client.status(), RegistrationStatus::Assigned);
    assert_eq!(client.operation_id().as_deref(), Some("op-1"));
    assert!(transport.disconnected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_connect_options_for_provisioning() {
    let (transport, client) = setup(ScriptedTransport::default());
    let rid = client.request_id().to_owned();
    transport.on_publish(vec![assigned(&rid, "hub.azure-devices.net")]);

    tokio_test::assert_ok!(client.register(None).await);

    let options = transport.options.lock().unwrap().clone().unwrap();
    assert_eq!(
        options.uri,
        "wss://global.azure-devices-provisioning.net:443/mqtt"
    );
    assert_eq!(options.client_id, "dev1");
    assert_eq!(
        options.username,
        "0ne000ABCD/registrations/dev1/api-version=2019-03-31"
    );
    let password = options.password.unwrap();
    assert!(password.expose_secret().ends_with("&skn=registration"));
}

#[tokio::test]
async fn test_responses_for_other_requests_are_ignored() {
    let (transport, client) = setup(ScriptedTransport::default());
    let rid = client.request_id().to_owned();

    transport.on_publish(vec![
        assigned("some-other-request", "wrong.azure-devices.net"),
        TransportEvent::Message(InboundMessage::new("$iothub/twin/res/200/?$rid=1", "{}")),
        assigned(&rid, "right.azure-devices.net"),
    ]);

    let creds = client.register(None).await.unwrap();
    assert_eq!(creds.host, "right.azure-devices.net");
}

#[tokio::test]
async fn test_request_id_is_reused_across_calls() {
    let (transport, client) = setup(ScriptedTransport::default());
    let rid = client.request_id().to_owned();

    transport.on_publish(vec![assigned(&rid, "hub.azure-devices.net")]);
    transport.on_publish(vec![assigned(&rid, "hub.azure-devices.net")]);

    client.register(None).await.unwrap();
    client.register(None).await.unwrap();

    let topics = transport.published_topics();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[0], topics[1]);
    assert_eq!(topics[0], format!("$dps/registrations/PUT/iotdps-register/?$rid={rid}"));
}

#[tokio::test]
async fn test_group_key_signs_with_derived_key() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = client_with(
        &transport,
        DeviceCredentials::GroupKey {
            key: SecretString::from(KEY.to_string()),
        },
    );
    let rid = client.request_id().to_owned();
    transport.on_publish(vec![assigned(&rid, "hub.azure-devices.net")]);

    let creds = client.register(None).await.unwrap();

    let derived = iotc_api::compute_key(KEY, "dev1").unwrap();
    let expected = iotc_api::auth::generate_hub_credentials_at(
        "hub.azure-devices.net",
        "dev1",
        &derived,
        chrono::DateTime::from_timestamp(creds.expiry - iotc_api::SAS_TOKEN_TTL_SECS, 0).unwrap(),
    )
    .unwrap();
    assert_eq!(
        creds.password.unwrap().expose_secret(),
        expected.password.unwrap().expose_secret()
    );
}

#[tokio::test]
async fn test_certificate_auth_sends_no_password() {
    let transport = Arc::new(ScriptedTransport::default());
    let client = client_with(
        &transport,
        DeviceCredentials::Certificate(X509Identity {
            cert_file: "device.pem".into(),
            key_file: "device.key".into(),
            passphrase: None,
        }),
    );
    let rid = client.request_id().to_owned();
    transport.on_publish(vec![assigned(&rid, "hub.azure-devices.net")]);

    let creds = client.register(None).await.unwrap();
    assert!(creds.password.is_none());

    let options = transport.options.lock().unwrap().clone().unwrap();
    assert!(options.password.is_none());
    assert!(options.certificate.is_some());
}

// ── Rejections ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_status_is_rejected_with_body() {
    let (transport, client) = setup(ScriptedTransport::default());
    let rid = client.request_id().to_owned();
    transport.on_publish(vec![response(
        200,
        &rid,
        None,
        json!({
            "operationId": "op-1",
            "status": "failed",
            "registrationState": { "errorMessage": "Custom allocation failed" }
        }),
    )]);

    let err = client.register(None).await.unwrap_err();
    match err {
        Error::ProvisioningRejected { message } => {
            assert!(message.contains("Custom allocation failed"));
        }
        other => panic!("expected ProvisioningRejected, got {other:?}"),
    }
    assert_eq!(client.status(), RegistrationStatus::Failed);
    assert!(transport.disconnected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_unexpected_status_is_rejected() {
    let (transport, client) = setup(ScriptedTransport::default());
    let rid = client.request_id().to_owned();
    transport.on_publish(vec![response(
        401,
        &rid,
        None,
        json!({ "errorCode": 401_002, "message": "Unauthorized" }),
    )]);

    let err = client.register(None).await.unwrap_err();
    assert!(matches!(err, Error::ProvisioningRejected { ref message } if message.contains("Unauthorized")));
}

#[tokio::test]
async fn test_link_loss_fails_registration() {
    let (transport, client) = setup(ScriptedTransport::default());
    transport.on_publish(vec![TransportEvent::ConnectionLost {
        reason: "socket closed".into(),
    }]);

    let err = client.register(None).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost { .. }));
    assert!(transport.disconnected.load(Ordering::SeqCst));
}

// ── Connect retries ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_five_attempts() {
    let (transport, client) = setup(ScriptedTransport::failing(5));

    let err = client.register(None).await.unwrap_err();
    assert!(matches!(err, Error::RetryExhausted { attempts: 5 }));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 5);
    assert!(transport.published_topics().is_empty());
    assert_eq!(client.status(), RegistrationStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_on_fifth_attempt() {
    let (transport, client) = setup(ScriptedTransport::failing(4));
    let rid = client.request_id().to_owned();
    transport.on_publish(vec![assigned(&rid, "hub.azure-devices.net")]);

    let creds = client.register(None).await.unwrap();
    assert_eq!(creds.host, "hub.azure-devices.net");
    assert_eq!(transport.connects.load(Ordering::SeqCst), 5);
}
