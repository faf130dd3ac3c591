//! Provider photo URL resolution against the object store.
//!
//! Raw values in the catalog range from full signed URLs to bare file
//! names. The resolver extracts the inner storage path and then walks a
//! three-level fallback chain: signed URL → public URL → manually
//! constructed public URL. Only when all three fail is the photo omitted.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// Signed URL lifetime: 6 hours.
pub const SIGNED_URL_EXPIRY_SECS: u64 = 6 * 60 * 60;

/// HTTP timeout for storage API calls.
const STORAGE_TIMEOUT_SECS: u64 = 5;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// HTTP request to the storage API failed.
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The storage API rejected the request.
    #[error("storage api error: status {0}")]
    Api(u16),
}

/// Object storage operations the resolver needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Request a time-limited signed URL for `path`.
    async fn signed_url(&self, path: &str, expires_secs: u64) -> Result<Option<String>, MediaError>;

    /// The public URL for `path`, when the bucket exposes one.
    fn public_url(&self, path: &str) -> Option<String>;

    /// Base URL of the storage service, for the constructed fallback.
    fn base_url(&self) -> &str;

    /// Bucket this store serves.
    fn bucket(&self) -> &str;
}

/// Extract the inner storage path from a raw photo value.
///
/// Recognizes signed/public/plain object URLs for `bucket` and the admin
/// image route; a bare file name maps into `faces/`; any other path is
/// taken as-is. Returns `None` only for empty input.
pub fn extract_storage_path(raw: &str, bucket: &str) -> Option<String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    let without_query = cleaned.split('?').next().unwrap_or(cleaned).trim_start_matches('/');

    let markers = [
        format!("storage/v1/object/sign/{bucket}/"),
        format!("storage/v1/object/public/{bucket}/"),
        format!("storage/v1/object/{bucket}/"),
        "admin/providers/image/".to_owned(),
    ];
    for marker in &markers {
        if let Some(pos) = without_query.find(marker.as_str()) {
            let path = without_query
                .get(pos.saturating_add(marker.len())..)
                .unwrap_or_default()
                .trim_start_matches('/');
            return Some(path.to_owned());
        }
    }

    if !without_query.contains('/') {
        return Some(format!("faces/{without_query}"));
    }
    Some(without_query.to_owned())
}

/// Resolve a raw photo value to a servable URL.
///
/// Walks signed → public → constructed. When no store is configured the
/// raw value is returned only if it already is an absolute URL.
pub async fn resolve_photo_url(store: Option<&dyn ObjectStore>, raw: &str) -> Option<String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }

    let Some(store) = store else {
        return cleaned.contains("://").then(|| cleaned.to_owned());
    };

    let Some(path) = extract_storage_path(cleaned, store.bucket()) else {
        return None;
    };

    match store.signed_url(&path, SIGNED_URL_EXPIRY_SECS).await {
        Ok(Some(url)) => return Some(url),
        Ok(None) => debug!(path, "no signed url available, trying public"),
        Err(e) => warn!(path, error = %e, "signed url request failed, trying public"),
    }

    if let Some(url) = store.public_url(&path) {
        return Some(url);
    }

    let base = store.base_url().trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    Some(format!(
        "{base}/storage/v1/object/public/{}/{path}",
        store.bucket()
    ))
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signed_url")]
    signed_url: Option<String>,
}

/// Supabase-storage-compatible [`ObjectStore`] over HTTP.
pub struct StorageClient {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    service_key: String,
}

impl StorageClient {
    /// Create a client for `bucket` at `base_url` using `service_key`.
    pub fn new(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        service_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(STORAGE_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build storage HTTP client, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            bucket: bucket.into(),
            service_key: service_key.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for StorageClient {
    async fn signed_url(
        &self,
        path: &str,
        expires_secs: u64,
    ) -> Result<Option<String>, MediaError> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{path}",
            self.base_url, self.bucket
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .json(&serde_json::json!({ "expiresIn": expires_secs }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MediaError::Api(status.as_u16()));
        }

        let body: SignResponse = response.json().await?;
        // The API returns a relative path; make it absolute.
        Ok(body.signed_url.map(|signed| {
            if signed.contains("://") {
                signed
            } else {
                format!("{}/storage/v1{}", self.base_url, ensure_leading_slash(&signed))
            }
        }))
    }

    fn public_url(&self, path: &str) -> Option<String> {
        Some(format!(
            "{}/storage/v1/object/public/{}/{path}",
            self.base_url, self.bucket
        ))
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}
