//! `iotc send`: connect with the active profile and publish one message.

use std::sync::Arc;

use serde_json::{Value, json};

use iotc_api::MqttTransportFactory;
use iotc_core::DeviceClient;

use crate::cli::{GlobalOpts, SendArgs};
use crate::commands::emit;
use crate::config;
use crate::error::CliError;

pub async fn handle(args: SendArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = config::load(global)?;
    let log_level = cfg.defaults.log_level()?;
    let payload: Value = serde_json::from_str(&args.payload).map_err(|e| CliError::Validation {
        field: "payload".into(),
        reason: e.to_string(),
    })?;

    let (profile_name, profile) = config::active_profile(global, &cfg)?;
    let identity = iotc_config::profile_to_identity(&profile, &profile_name)?;
    let connect = iotc_config::profile_to_connect_config(&profile, &cfg.defaults);

    let client = DeviceClient::new(identity, Arc::new(MqttTransportFactory::new()));
    client.set_log_level(log_level);

    tracing::info!(profile = %profile_name, property = args.property, "connecting");
    client.connect(connect).await?;
    let sent = if args.property {
        client.send_property(&payload).await
    } else {
        client.send_telemetry(&payload, None).await
    };
    client.disconnect().await;
    sent?;

    let kind = if args.property { "property" } else { "telemetry" };
    emit(
        global,
        &format!("Sent {kind} as {}", client.identity().device_id),
        &json!({ "deviceId": client.identity().device_id, "kind": kind, "payload": payload }),
    )
}
