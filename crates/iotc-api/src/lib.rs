// iotc-api: device-side protocol clients for IoT Central (SAS, DPS, MQTT, upload)

pub mod auth;
pub mod credentials;
pub mod error;
pub mod mqtt;
pub mod provision;
pub mod storage;
pub mod topics;
pub mod transport;
pub mod upload;

pub use auth::{
    AuthKind, DeviceCredentials, SAS_TOKEN_TTL_SECS, SessionCredentials, X509Identity,
    compute_key, derive_device_key, generate_hub_credentials,
};
pub use credentials::{CredentialBundle, decode_credentials};
pub use error::Error;
pub use mqtt::{MqttTransport, MqttTransportFactory};
pub use provision::{DPS_DEFAULT_ENDPOINT, ProvisioningClient, RegistrationStatus};
pub use storage::{MemoryStorage, SessionStorage};
pub use transport::{
    ConnectOptions, EventReceiver, HttpConfig, InboundMessage, Transport, TransportEvent,
    TransportFactory,
};
pub use upload::{FileUploader, UploadResult};
