// HTTPS file upload through the hub.
//
// Three calls: ask the hub for a blob SAS URI, PUT the bytes to blob
// storage, then notify the hub of the outcome. Authenticated with the
// device's hub SAS password.

use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::transport::HttpConfig;

/// API version of the hub's file-upload endpoints.
pub const FILE_UPLOAD_API_VERSION: &str = "2020-09-30";

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BlobRequest<'a> {
    blob_name: &'a str,
}

/// Upload target granted by the hub.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobTarget {
    pub correlation_id: String,
    pub host_name: String,
    pub container_name: String,
    pub blob_name: String,
    pub sas_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadNotification<'a> {
    correlation_id: &'a str,
    is_success: bool,
    status_code: u16,
    status_description: &'a str,
}

/// Outcome of a file upload, as reported back to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// HTTP status of the blob PUT.
    pub status: u16,
    pub error_message: Option<String>,
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// File-upload client bound to one device on one hub.
pub struct FileUploader {
    http: reqwest::Client,
    base_url: Url,
    device_id: String,
}

impl FileUploader {
    /// Build for `https://<host>/`, authorizing with the hub SAS password.
    pub fn new(
        host: &str,
        device_id: &str,
        password: &SecretString,
        config: &HttpConfig,
    ) -> Result<Self, Error> {
        Self::with_base_url(&format!("https://{host}/"), device_id, password, config)
    }

    /// Like [`new`](Self::new) against an explicit hub base URL.
    pub fn with_base_url(
        base_url: &str,
        device_id: &str,
        password: &SecretString,
        config: &HttpConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(password.expose_secret())
            .map_err(|e| Error::InvalidKey(format!("invalid SAS header value: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = config.build_client(headers)?;
        Self::from_reqwest(base_url, device_id, http)
    }

    /// Wrap an existing `reqwest::Client` (caller manages auth headers).
    ///
    /// The blob PUT uses the scheme of `base_url`.
    pub fn from_reqwest(base_url: &str, device_id: &str, http: reqwest::Client) -> Result<Self, Error> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            device_id: device_id.to_owned(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .append_pair("api-version", FILE_UPLOAD_API_VERSION);
        Ok(url)
    }

    /// Upload `data` as blob `file_name`.
    ///
    /// A failed blob PUT is still reported to the hub and comes back as a
    /// non-success [`UploadResult`]; only the hub calls themselves error.
    pub async fn upload(
        &self,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
        encoding: Option<&str>,
    ) -> Result<UploadResult, Error> {
        let target = self.request_target(file_name).await?;

        let result = self.put_blob(&target, content_type, data, encoding).await;
        let description = result
            .error_message
            .clone()
            .unwrap_or_else(|| "Upload succeeded".to_owned());
        self.notify(&UploadNotification {
            correlation_id: &target.correlation_id,
            is_success: result.is_success(),
            status_code: result.status,
            status_description: &description,
        })
        .await?;

        Ok(result)
    }

    async fn request_target(&self, file_name: &str) -> Result<BlobTarget, Error> {
        let url = self.url(&format!("devices/{}/files", self.device_id))?;
        debug!("POST {url}");
        let resp = self
            .http
            .post(url)
            .json(&BlobRequest { blob_name: file_name })
            .send()
            .await?;
        handle_response(resp).await
    }

    async fn put_blob(
        &self,
        target: &BlobTarget,
        content_type: &str,
        data: Vec<u8>,
        encoding: Option<&str>,
    ) -> UploadResult {
        let blob_url = format!(
            "{}://{}/{}/{}{}",
            self.base_url.scheme(),
            target.host_name,
            target.container_name,
            target.blob_name,
            target.sas_token
        );
        debug!(blob = %target.blob_name, size = data.len(), "PUT blob");

        let mut request = self
            .http
            .put(&blob_url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, content_type)
            .body(data);
        if let Some(encoding) = encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => UploadResult {
                status: resp.status().as_u16(),
                error_message: None,
            },
            Ok(resp) => {
                let status = resp.status();
                let raw = resp.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "blob upload rejected");
                UploadResult {
                    status: status.as_u16(),
                    error_message: Some(if raw.is_empty() { status.to_string() } else { raw }),
                }
            }
            Err(e) => {
                warn!(error = %e, "blob upload failed");
                UploadResult {
                    status: e.status().map_or(500, |s| s.as_u16()),
                    error_message: Some(e.to_string()),
                }
            }
        }
    }

    async fn notify(&self, notification: &UploadNotification<'_>) -> Result<(), Error> {
        let url = self.url(&format!("devices/{}/files/notifications", self.device_id))?;
        debug!("POST {url}");
        let resp = self.http.post(url).json(notification).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(parse_error(status, resp).await)
        }
    }
}

async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| Error::deserialization(&e, &body))
    } else {
        Err(parse_error(status, resp).await)
    }
}

async fn parse_error(status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
    let raw = resp.text().await.unwrap_or_default();
    Error::Upload {
        status: status.as_u16(),
        message: if raw.is_empty() { status.to_string() } else { raw },
    }
}
