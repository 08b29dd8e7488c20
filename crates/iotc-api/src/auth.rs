// Shared-access-signature signing
//
// Stateless SAS token computation for both the provisioning service and
// the assigned hub. The signature is HMAC-SHA256 over `<uri>\n<expiry>`
// keyed with the base64-decoded device key.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of every SAS token we sign. Fixed, not configurable.
pub const SAS_TOKEN_TTL_SECS: i64 = 21_600;

/// Which authentication strategy a device uses.
///
/// Marker enum (no data) -- the actual key material lives in
/// [`DeviceCredentials`]. Useful for branching without carrying secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Enrollment-group symmetric key; the device key is derived from it.
    GroupKey,
    /// Per-device symmetric key, used as-is.
    DeviceKey,
    /// Hub host and device key known up front; provisioning is skipped.
    ConnectionString,
    /// X.509 client certificate presented by the transport.
    Certificate,
}

/// Client certificate material handed to the transport.
#[derive(Debug, Clone)]
pub struct X509Identity {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub passphrase: Option<SecretString>,
}

/// Credentials a device authenticates with.
///
/// Each variant carries the secret material needed for its auth flow.
#[derive(Debug, Clone)]
pub enum DeviceCredentials {
    /// Group SAS key. The per-device key is `compute_key(group_key, registration_id)`.
    GroupKey { key: SecretString },

    /// Device SAS key.
    DeviceKey { key: SecretString },

    /// Already-parsed hub host and device key.
    Connection { host: String, key: SecretString },

    /// X.509 certificate auth. No SAS password is sent.
    Certificate(X509Identity),
}

impl DeviceCredentials {
    pub fn kind(&self) -> AuthKind {
        match self {
            Self::GroupKey { .. } => AuthKind::GroupKey,
            Self::DeviceKey { .. } => AuthKind::DeviceKey,
            Self::Connection { .. } => AuthKind::ConnectionString,
            Self::Certificate(_) => AuthKind::Certificate,
        }
    }

    /// The symmetric key this device signs with, if it uses SAS auth.
    ///
    /// Group keys are derived per registration id; certificate auth
    /// returns `None`.
    pub fn device_key(&self, registration_id: &str) -> Result<Option<SecretString>, Error> {
        match self {
            Self::GroupKey { key } => {
                derive_device_key(key.expose_secret(), registration_id).map(Some)
            }
            Self::DeviceKey { key } | Self::Connection { key, .. } => Ok(Some(key.clone())),
            Self::Certificate(_) => Ok(None),
        }
    }

    pub fn certificate(&self) -> Option<&X509Identity> {
        match self {
            Self::Certificate(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Signed access to the assigned hub.
///
/// The password embeds its own expiry; a fresh value is signed on every
/// connect or reconnect cycle.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub host: String,
    pub password: Option<SecretString>,
    /// Unix timestamp (seconds) embedded as `se=` in the password.
    pub expiry: i64,
}

/// HMAC-SHA256 `data` with the base64-decoded `key`, base64-encode the digest.
pub fn compute_key(key: &str, data: &str) -> Result<String, Error> {
    let decoded = STANDARD
        .decode(key)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(&decoded).map_err(|e| Error::InvalidKey(e.to_string()))?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Derive a per-device key from an enrollment-group key.
pub fn derive_device_key(group_key: &str, registration_id: &str) -> Result<SecretString, Error> {
    compute_key(group_key, registration_id).map(SecretString::from)
}

/// Sign hub credentials valid for [`SAS_TOKEN_TTL_SECS`] from now.
pub fn generate_hub_credentials(
    host: &str,
    device_id: &str,
    key: &str,
) -> Result<SessionCredentials, Error> {
    generate_hub_credentials_at(host, device_id, key, Utc::now())
}

/// [`generate_hub_credentials`] with an explicit signing time.
pub fn generate_hub_credentials_at(
    host: &str,
    device_id: &str,
    key: &str,
    now: DateTime<Utc>,
) -> Result<SessionCredentials, Error> {
    let expiry = now.timestamp() + SAS_TOKEN_TTL_SECS;
    let uri = urlencode(&format!("{host}/devices/{device_id}"));
    let sig = urlencode(&compute_key(key, &format!("{uri}\n{expiry}"))?);
    Ok(SessionCredentials {
        host: host.to_owned(),
        password: Some(SecretString::from(format!(
            "SharedAccessSignature sr={uri}&sig={sig}&se={expiry}"
        ))),
        expiry,
    })
}

/// Hub credentials for a device that may or may not sign with a key.
///
/// Certificate-authenticated devices get the host with no password.
pub fn hub_credentials(
    host: &str,
    device_id: &str,
    key: Option<&SecretString>,
) -> Result<SessionCredentials, Error> {
    match key {
        Some(key) => generate_hub_credentials(host, device_id, key.expose_secret()),
        None => Ok(SessionCredentials {
            host: host.to_owned(),
            password: None,
            expiry: 0,
        }),
    }
}

/// SAS password for the provisioning service.
///
/// The resource URI is `<scope>/registrations/<id>`, left unencoded, and the
/// token carries `skn=registration`.
pub fn provisioning_password(
    scope_id: &str,
    registration_id: &str,
    key: &str,
    now: DateTime<Utc>,
) -> Result<SecretString, Error> {
    let expiry = now.timestamp() + SAS_TOKEN_TTL_SECS;
    let uri = format!("{scope_id}/registrations/{registration_id}");
    let sig = urlencode(&compute_key(key, &format!("{uri}\n{expiry}"))?);
    Ok(SecretString::from(format!(
        "SharedAccessSignature sr={uri}&sig={sig}&se={expiry}&skn=registration"
    )))
}

pub(crate) fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // base64("secret-device-key-0123456789abcd")
    const KEY: &str = "c2VjcmV0LWRldmljZS1rZXktMDEyMzQ1Njc4OWFiY2Q=";

    #[test]
    fn compute_key_is_deterministic() {
        let a = compute_key(KEY, "device-1").unwrap();
        let b = compute_key(KEY, "device-1").unwrap();
        assert_eq!(a, b);
        // SHA-256 digest is 32 bytes → 44 base64 chars
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn compute_key_changes_with_data_or_key() {
        let base = compute_key(KEY, "device-1").unwrap();
        assert_ne!(base, compute_key(KEY, "device-2").unwrap());

        let other_key = STANDARD.encode(b"secret-device-key-0123456789abce");
        assert_ne!(base, compute_key(&other_key, "device-1").unwrap());
    }

    #[test]
    fn compute_key_matches_known_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let key = STANDARD.encode(b"Jefe");
        let sig = compute_key(&key, "what do ya want for nothing?").unwrap();
        let expected = STANDARD.encode([
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ]);
        assert_eq!(sig, expected);
    }

    #[test]
    fn compute_key_rejects_non_base64_key() {
        let result = compute_key("not base64 !!", "data");
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn hub_credentials_expire_in_the_future() {
        let before = Utc::now().timestamp();
        let creds = generate_hub_credentials("hub.azure-devices.net", "dev1", KEY).unwrap();
        assert!(creds.expiry > before);
        assert_eq!(creds.expiry - before, SAS_TOKEN_TTL_SECS);
        assert_eq!(creds.host, "hub.azure-devices.net");
    }

    #[test]
    fn hub_password_grammar() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let creds =
            generate_hub_credentials_at("hub.azure-devices.net", "dev1", KEY, now).unwrap();
        let password = creds.password.unwrap();
        let password = password.expose_secret();

        let uri = "hub.azure-devices.net%2Fdevices%2Fdev1";
        let expiry = 1_700_000_000 + SAS_TOKEN_TTL_SECS;
        let sig = urlencode(&compute_key(KEY, &format!("{uri}\n{expiry}")).unwrap());
        assert_eq!(
            password,
            format!("SharedAccessSignature sr={uri}&sig={sig}&se={expiry}")
        );
        assert!(!sig.contains('/') && !sig.contains('+') && !sig.contains('='));
    }

    #[test]
    fn provisioning_password_carries_skn() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let password = provisioning_password("0ne000ABC", "dev1", KEY, now).unwrap();
        let password = password.expose_secret();
        assert!(password.starts_with("SharedAccessSignature sr=0ne000ABC/registrations/dev1&sig="));
        assert!(password.ends_with(&format!("&se={}&skn=registration", 1_700_021_600)));
    }

    #[test]
    fn group_key_derives_device_key() {
        let creds = DeviceCredentials::GroupKey {
            key: SecretString::from(KEY.to_string()),
        };
        let derived = creds.device_key("dev1").unwrap().unwrap();
        assert_eq!(derived.expose_secret(), compute_key(KEY, "dev1").unwrap());
        assert_eq!(creds.kind(), AuthKind::GroupKey);
    }

    #[test]
    fn device_key_is_used_as_is() {
        let creds = DeviceCredentials::DeviceKey {
            key: SecretString::from(KEY.to_string()),
        };
        let key = creds.device_key("dev1").unwrap().unwrap();
        assert_eq!(key.expose_secret(), KEY);
    }

    #[test]
    fn certificate_auth_has_no_key() {
        let creds = DeviceCredentials::Certificate(X509Identity {
            cert_file: "device.pem".into(),
            key_file: "device.key".into(),
            passphrase: None,
        });
        assert!(creds.device_key("dev1").unwrap().is_none());
        assert!(creds.certificate().is_some());
    }
}
