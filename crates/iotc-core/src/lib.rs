// iotc-core: session lifecycle, property/command protocol and device client

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod session;

pub use cancel::{CancellationToken, ConnectStep, run_with_timeout};
pub use client::{DeviceClient, DeviceClientBuilder};
pub use config::{ConnectConfig, DeviceIdentity};
pub use error::CoreError;
pub use events::{DeviceEvent, EventCallback, EventCategory, EventRegistry, callback};
pub use logging::{LogLevel, Logger, TracingLogger};
pub use protocol::{CommandEvent, CommandStatus, PropertyEvent, ProtocolEngine, TwinSnapshot};
pub use session::{
    CredentialSource, DirectCredentials, ProvisionedCredentials, SessionHandle, SessionManager,
    SessionState,
};

pub use iotc_api::{DeviceCredentials, UploadResult, X509Identity};
