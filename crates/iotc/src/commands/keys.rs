//! Key derivation and SAS signing.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use iotc_api::auth::provisioning_password;
use iotc_api::topics::{dps_username, hub_username};
use iotc_config::Profile;

use crate::cli::{GlobalOpts, SasArgs, SasCommand};
use crate::commands::emit;
use crate::config;
use crate::error::CliError;

pub fn derive(device_id: &str, group_key: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let key = iotc_api::derive_device_key(group_key, device_id)?;
    emit(
        global,
        key.expose_secret(),
        &json!({ "deviceId": device_id, "deviceKey": key.expose_secret() }),
    )
}

pub fn sas(args: SasArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        SasCommand::Hub {
            host,
            device_id,
            key,
        } => {
            let fallback =
                fallback_profile(global, host.is_none() || device_id.is_none() || key.is_none())?;
            let profile = fallback.as_ref().map(|(_, p)| p);

            let device_id = pick(device_id, profile.map(|p| p.device_id.clone()), "device-id")?;
            let host = pick(host, profile.and_then(|p| p.hub.clone()), "host")?;
            let key = signing_key(key, fallback.as_ref(), &device_id)?;

            let creds = iotc_api::generate_hub_credentials(&host, &device_id, key.expose_secret())?;
            let password = creds
                .password
                .as_ref()
                .map(ExposeSecret::expose_secret)
                .unwrap_or_default();
            emit(
                global,
                password,
                &json!({
                    "host": host,
                    "username": hub_username(&host, &device_id),
                    "password": password,
                    "expiresAt": expires_at(creds.expiry),
                }),
            )
        }
        SasCommand::Provisioning {
            scope_id,
            device_id,
            key,
        } => {
            let fallback = fallback_profile(
                global,
                scope_id.is_none() || device_id.is_none() || key.is_none(),
            )?;
            let profile = fallback.as_ref().map(|(_, p)| p);

            let device_id = pick(device_id, profile.map(|p| p.device_id.clone()), "device-id")?;
            let scope_id = pick(scope_id, profile.map(|p| p.scope_id.clone()), "scope-id")?;
            let key = signing_key(key, fallback.as_ref(), &device_id)?;

            let now = Utc::now();
            let password =
                provisioning_password(&scope_id, &device_id, key.expose_secret(), now)?;
            emit(
                global,
                password.expose_secret(),
                &json!({
                    "username": dps_username(&scope_id, &device_id),
                    "password": password.expose_secret(),
                    "expiresAt": expires_at(now.timestamp() + iotc_api::SAS_TOKEN_TTL_SECS),
                }),
            )
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Load the active profile only when some flag was left out.
fn fallback_profile(
    global: &GlobalOpts,
    needed: bool,
) -> Result<Option<(String, Profile)>, CliError> {
    if !needed {
        return Ok(None);
    }
    let cfg = config::load(global)?;
    config::active_profile(global, &cfg).map(Some)
}

fn pick(flag: Option<String>, fallback: Option<String>, field: &str) -> Result<String, CliError> {
    flag.or(fallback)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| CliError::Validation {
            field: field.into(),
            reason: format!("pass --{field} or set it in the profile"),
        })
}

/// Key from `--key`, else the profile's credentials (group keys are derived).
fn signing_key(
    flag: Option<String>,
    fallback: Option<&(String, Profile)>,
    registration_id: &str,
) -> Result<SecretString, CliError> {
    if let Some(key) = flag {
        return Ok(SecretString::from(key));
    }
    let Some((name, profile)) = fallback else {
        return Err(CliError::Validation {
            field: "key".into(),
            reason: "pass --key or set it in the profile".into(),
        });
    };
    let credentials = iotc_config::resolve_credentials(profile, name)?;
    credentials
        .device_key(registration_id)?
        .ok_or_else(|| CliError::Unsupported {
            operation: "sas".into(),
            auth: profile.auth.clone(),
        })
}

fn expires_at(expiry: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(expiry, 0).map(|at| at.to_rfc3339())
}
