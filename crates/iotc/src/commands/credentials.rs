//! `iotc decode-credentials`: read an IoT Central credential bundle.

use secrecy::ExposeSecret;
use serde_json::json;

use iotc_config::Profile;

use crate::cli::{DecodeArgs, GlobalOpts};
use crate::commands::emit;
use crate::config;
use crate::error::CliError;

pub fn decode(args: DecodeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let bundle = iotc_api::decode_credentials(&args.bundle, args.passphrase.as_deref())?;
    let auth = if bundle.is_group_key() {
        "group-key"
    } else {
        "device-key"
    };

    if let Some(name) = args.save {
        let path = config::path(global);
        let mut cfg = config::load(global)?;
        let profile = Profile {
            device_id: bundle.device_id.clone(),
            scope_id: bundle.scope_id.clone(),
            auth: auth.into(),
            key: bundle
                .device_key
                .as_ref()
                .map(|key| key.expose_secret().to_owned()),
            key_env: None,
            hub: None,
            cert_file: None,
            cert_key_file: None,
            model_id: bundle.model_id.clone(),
            endpoint: None,
            timeout: None,
            clean_session: None,
        };
        cfg.profiles.insert(name.clone(), profile);
        iotc_config::save_config_to(&cfg, &path)?;
        tracing::info!(profile = %name, path = %path.display(), "profile saved from bundle");
        eprintln!("Profile '{name}' saved to {}", path.display());
    }

    let mut plain = vec![
        format!("device_id: {}", bundle.device_id),
        format!("scope_id: {}", bundle.scope_id),
        format!("auth: {auth}"),
    ];
    if let Some(ref model_id) = bundle.model_id {
        plain.push(format!("model_id: {model_id}"));
    }
    if bundle.device_key.is_some() {
        plain.push("key: ***".into());
    }
    emit(
        global,
        &plain.join("\n"),
        &json!({
            "deviceId": bundle.device_id,
            "scopeId": bundle.scope_id,
            "auth": auth,
            "modelId": bundle.model_id,
            "hasKey": bundle.device_key.is_some(),
        }),
    )
}
