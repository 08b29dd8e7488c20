//! `iotc upload`: hub-mediated blob upload for connection profiles.

use secrecy::ExposeSecret;
use serde_json::json;

use iotc_api::{FileUploader, HttpConfig};
use iotc_core::DeviceCredentials;

use crate::cli::{GlobalOpts, UploadArgs};
use crate::commands::emit;
use crate::config;
use crate::error::CliError;

pub async fn handle(args: UploadArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = config::load(global)?;
    let (profile_name, profile) = config::active_profile(global, &cfg)?;
    let identity = iotc_config::profile_to_identity(&profile, &profile_name)?;

    let DeviceCredentials::Connection { host, key } = &identity.credentials else {
        return Err(CliError::Unsupported {
            operation: "upload".into(),
            auth: profile.auth.clone(),
        });
    };

    let file_name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| CliError::Validation {
                field: "file".into(),
                reason: format!("{} has no file name", args.file.display()),
            })?,
    };
    let data = tokio::fs::read(&args.file).await?;

    let creds =
        iotc_api::generate_hub_credentials(host, &identity.device_id, key.expose_secret())?;
    let Some(password) = creds.password else {
        return Err(CliError::Unsupported {
            operation: "upload".into(),
            auth: profile.auth.clone(),
        });
    };
    let connect = iotc_config::profile_to_connect_config(&profile, &cfg.defaults);
    let uploader = FileUploader::new(
        host,
        &identity.device_id,
        &password,
        &HttpConfig {
            timeout: connect.timeout,
        },
    )?;

    tracing::info!(
        profile = %profile_name,
        file = %file_name,
        bytes = data.len(),
        "uploading"
    );
    let result = uploader
        .upload(&file_name, &args.content_type, data, args.encoding.as_deref())
        .await
        .map_err(|e| match CliError::from(e) {
            CliError::UploadFailed {
                status, message, ..
            } => CliError::UploadFailed {
                file: file_name.clone(),
                status,
                message,
            },
            other => other,
        })?;

    if !result.is_success() {
        return Err(CliError::UploadFailed {
            file: file_name,
            status: result.status,
            message: result.error_message.unwrap_or_default(),
        });
    }

    emit(
        global,
        &format!("Uploaded {file_name} ({})", result.status),
        &json!({ "file": file_name, "status": result.status }),
    )
}
