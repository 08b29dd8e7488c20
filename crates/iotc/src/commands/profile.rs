//! Profile subcommand handlers.

use serde_json::{Value, json};

use iotc_config::KEYRING_SERVICE;

use crate::cli::{GlobalOpts, ProfileArgs, ProfileCommand};
use crate::commands::emit;
use crate::config;
use crate::error::CliError;

pub fn handle(args: ProfileArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ProfileCommand::List => {
            let cfg = config::load(global)?;
            let default = cfg.default_profile.as_deref().unwrap_or("default");
            let mut names: Vec<&String> = cfg.profiles.keys().collect();
            names.sort();

            let plain = names
                .iter()
                .map(|name| {
                    let marker = if name.as_str() == default { "*" } else { " " };
                    format!("{marker} {name}")
                })
                .collect::<Vec<_>>()
                .join("\n");
            let rows: Vec<Value> = names
                .iter()
                .map(|name| {
                    let profile = &cfg.profiles[name.as_str()];
                    json!({
                        "name": name,
                        "deviceId": profile.device_id,
                        "auth": profile.auth,
                        "default": name.as_str() == default,
                    })
                })
                .collect();
            emit(global, &plain, &Value::Array(rows))
        }

        ProfileCommand::Show { name } => {
            let cfg = config::load(global)?;
            let (name, profile) = match name {
                Some(name) => match cfg.profiles.get(&name) {
                    Some(profile) => (name, profile.clone()),
                    None => return Err(config::not_found(&cfg, name)),
                },
                None => config::active_profile(global, &cfg)?,
            };

            let mut fields = serde_json::to_value(&profile)?;
            if let Some(map) = fields.as_object_mut() {
                if map.get("key").is_some_and(|key| !key.is_null()) {
                    map.insert("key".into(), json!("***"));
                }
                map.retain(|_, value| !value.is_null());
                map.insert("name".into(), json!(name));
            }

            let plain = fields
                .as_object()
                .map(|map| {
                    map.iter()
                        .map(|(field, value)| match value {
                            Value::String(s) => format!("{field}: {s}"),
                            other => format!("{field}: {other}"),
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            emit(global, &plain, &fields)
        }

        ProfileCommand::Path => {
            let path = config::path(global);
            emit(global, &path.display().to_string(), &json!({ "path": path }))
        }

        ProfileCommand::Use { name } => {
            let path = config::path(global);
            let mut cfg = config::load(global)?;
            if !cfg.profiles.contains_key(&name) {
                return Err(config::not_found(&cfg, name));
            }
            cfg.default_profile = Some(name.clone());
            iotc_config::save_config_to(&cfg, &path)?;
            tracing::info!(profile = %name, path = %path.display(), "default profile updated");
            eprintln!("Default profile set to '{name}'");
            Ok(())
        }

        ProfileCommand::SetKey { name, key } => {
            // Reject keys that cannot sign before touching the keyring.
            iotc_api::compute_key(&key, &name)?;

            let entry = keyring::Entry::new(KEYRING_SERVICE, &format!("{name}/device-key"))
                .map_err(|e| CliError::Keyring {
                    reason: format!("failed to access keyring: {e}"),
                })?;
            entry.set_password(&key).map_err(|e| CliError::Keyring {
                reason: format!("failed to store key: {e}"),
            })?;
            eprintln!("✓ Key for '{name}' stored in system keyring");
            Ok(())
        }
    }
}
