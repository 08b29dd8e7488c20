// DeviceClient facade: logging collaborator, listener validation, upload guard.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use iotc_api::TransportFactory;
use iotc_core::{ConnectConfig, CoreError, DeviceClient, LogLevel, Logger, callback};

use common::{MockFactory, MockTransport, direct_client, direct_identity};

#[derive(Default)]
struct RecordingLogger {
    level: Mutex<Option<LogLevel>>,
    lines: Mutex<Vec<String>>,
}

impl RecordingLogger {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Logger for RecordingLogger {
    fn set_log_level(&self, level: LogLevel) {
        *self.level.lock().unwrap() = Some(level);
    }

    fn log(&self, message: &str, _tag: Option<&str>) {
        self.lines.lock().unwrap().push(message.to_owned());
    }

    fn debug(&self, _message: &str, _tag: Option<&str>) {}
}

fn logged_client(transport: &Arc<MockTransport>) -> (Arc<RecordingLogger>, DeviceClient) {
    let logger = Arc::new(RecordingLogger::default());
    let factory = MockFactory::new(Arc::clone(transport));
    let client = DeviceClient::builder(direct_identity(), factory as Arc<dyn TransportFactory>)
        .set_global_endpoint("dps.example.net")
        .logger(Arc::clone(&logger) as Arc<dyn Logger>)
        .build();
    (logger, client)
}

#[tokio::test]
async fn test_lifecycle_is_logged() {
    let transport = MockTransport::new();
    let (logger, client) = logged_client(&transport);
    assert_eq!(client.identity().provisioning_endpoint, "dps.example.net");

    client.connect(ConnectConfig::default()).await.unwrap();
    client.disconnect().await;

    assert_eq!(
        logger.lines(),
        vec![
            "Endpoint set to dps.example.net.".to_owned(),
            "Connecting client...".to_owned(),
            "Client connected.".to_owned(),
            "Disconnecting client...".to_owned(),
        ]
    );
}

#[tokio::test]
async fn test_set_logging_parses_level_names() {
    let transport = MockTransport::new();
    let (logger, client) = logged_client(&transport);

    client.set_logging("api_only").unwrap();
    assert_eq!(*logger.level.lock().unwrap(), Some(LogLevel::ApiOnly));
    assert_eq!(logger.lines().last().unwrap(), "Log level set to API_ONLY");

    let err = client.set_logging("chatty").unwrap_err();
    assert!(matches!(err, CoreError::InvalidLogLevel { ref name } if name == "chatty"));
    assert_eq!(*logger.level.lock().unwrap(), Some(LogLevel::ApiOnly));
}

#[tokio::test]
async fn test_unknown_event_names_are_rejected() {
    let transport = MockTransport::new();
    let (_factory, client) = direct_client(&transport);

    let err = client.on("Telemetry", callback(|_| async {})).unwrap_err();
    assert!(matches!(err, CoreError::InvalidEventName { .. }));
    assert!(client.on("Commands.reboot", callback(|_| async {})).is_ok());
}

#[tokio::test]
async fn test_upload_requires_connection() {
    let transport = MockTransport::new();
    let (_factory, client) = direct_client(&transport);

    let err = client
        .upload_file("log.txt", "text/plain", b"boot ok".to_vec(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotConnected));
}

#[tokio::test]
async fn test_state_is_observable() {
    let transport = MockTransport::new();
    let (_factory, client) = direct_client(&transport);
    let mut states = client.watch_state();

    client.connect(ConnectConfig::default()).await.unwrap();
    tokio_test::assert_ok!(states.changed().await);
    assert_eq!(*states.borrow(), iotc_core::SessionState::Connected);
}
