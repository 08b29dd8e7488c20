// Credential bundle decoding
//
// IoT Central can hand a device its identity as a single opaque string:
// the base64 of a JSON document, optionally encrypted with a passphrase
// in the OpenSSL `Salted__` envelope (MD5 key derivation, AES-256-CBC,
// PKCS#7 padding). A bundle that does not decrypt is read as plain base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use md5::{Digest, Md5};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::auth::DeviceCredentials;
use crate::error::Error;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_MAGIC: &[u8] = b"Salted__";
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Device identity carried by a credential bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub device_id: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub device_key: Option<SecretString>,
    #[serde(default)]
    pub model_id: Option<String>,
    /// `group` when `device_key` is an enrollment-group key.
    #[serde(default)]
    pub key_type: Option<String>,
}

impl CredentialBundle {
    /// The key material as [`DeviceCredentials`].
    pub fn credentials(&self) -> Result<DeviceCredentials, Error> {
        let key = self
            .device_key
            .clone()
            .ok_or_else(|| Error::InvalidCredentials("bundle carries no device key".into()))?;
        Ok(if self.is_group_key() {
            DeviceCredentials::GroupKey { key }
        } else {
            DeviceCredentials::DeviceKey { key }
        })
    }

    pub fn is_group_key(&self) -> bool {
        self.key_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("group"))
    }
}

/// Decode a credential bundle, decrypting it first when `passphrase` is
/// given.
///
/// Decryption failures are not fatal: the value is then read as a plain
/// bundle, and only that error is reported.
pub fn decode_credentials(value: &str, passphrase: Option<&str>) -> Result<CredentialBundle, Error> {
    let value = value.trim();
    if let Some(passphrase) = passphrase {
        match decrypt(value, passphrase).and_then(|plain| parse_encoded(&plain)) {
            Ok(bundle) => return Ok(bundle),
            Err(e) => debug!(error = %e, "bundle did not decrypt, reading it as plain"),
        }
    }
    parse_encoded(value)
}

fn parse_encoded(encoded: &str) -> Result<CredentialBundle, Error> {
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidCredentials(format!("not base64: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::InvalidCredentials(format!("not a credential document: {e}")))
}

fn decrypt(value: &str, passphrase: &str) -> Result<String, Error> {
    let raw = STANDARD
        .decode(value)
        .map_err(|e| Error::InvalidCredentials(format!("not base64: {e}")))?;
    let body = raw
        .strip_prefix(SALT_MAGIC)
        .filter(|body| body.len() > SALT_LEN)
        .ok_or_else(|| Error::InvalidCredentials("no salted envelope".into()))?;
    let (salt, ciphertext) = body.split_at(SALT_LEN);

    let (key, iv) = bytes_to_key(passphrase.as_bytes(), salt);
    let plain = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| Error::InvalidCredentials(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::InvalidCredentials("wrong passphrase or corrupt bundle".into()))?;
    String::from_utf8(plain)
        .map_err(|_| Error::InvalidCredentials("decrypted bundle is not text".into()))
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration.
fn bytes_to_key(passphrase: &[u8], salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut material = Vec::with_capacity(KEY_LEN + IV_LEN + 16);
    let mut block = Vec::new();
    while material.len() < KEY_LEN + IV_LEN {
        let mut hasher = Md5::new();
        hasher.update(&block);
        hasher.update(passphrase);
        hasher.update(salt);
        block = hasher.finalize().to_vec();
        material.extend_from_slice(&block);
    }

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}
