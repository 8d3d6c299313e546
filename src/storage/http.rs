//! HTTP(S) blob backends
//!
//! Blob URLs are built by substituting the blob id into a template, e.g.
//! `https://www.googleapis.com/drive/v3/files/{id}?alt=media` for downloads
//! or `https://www.googleapis.com/upload/drive/v3/files/{id}?uploadType=media`
//! for uploads. Credentials, if any, are a static bearer token obtained
//! elsewhere.

use super::{BlobError, BlobReader, BlobSink, BlobSource, UploadMethod};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Placeholder replaced by the blob id in URL templates
const ID_PLACEHOLDER: &str = "{id}";

/// Client, URL template and credentials shared by source and sink
struct Endpoint {
    client: reqwest::Client,
    url_template: String,
    bearer_token: Option<String>,
}

impl Endpoint {
    fn new(
        url_template: String,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BlobError> {
        if !url_template.contains(ID_PLACEHOLDER) {
            return Err(BlobError::Unsupported(format!(
                "url template {:?} has no {} placeholder",
                url_template, ID_PLACEHOLDER
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlobError::Unsupported(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_template,
            bearer_token,
        })
    }

    /// URL for blob `id`
    fn url_for(&self, id: &str) -> Result<String, BlobError> {
        let valid = !matches!(id, "" | "." | "..")
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'));
        if !valid {
            return Err(BlobError::InvalidId(id.to_string()));
        }
        Ok(self.url_template.replace(ID_PLACEHOLDER, id))
    }

    /// Send `request` and map transport failures and error statuses
    async fn send(
        &self,
        id: &str,
        mut request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BlobError> {
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BlobError::Timeout(id.to_string())
            } else {
                BlobError::Request {
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            return Err(BlobError::Status {
                id: id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

/// Blob source that downloads over HTTP(S)
pub struct HttpBlobSource {
    endpoint: Endpoint,
}

impl HttpBlobSource {
    /// Create a source for `url_template`
    pub fn new(
        url_template: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BlobError> {
        Ok(Self {
            endpoint: Endpoint::new(url_template.into(), bearer_token, timeout)?,
        })
    }
}

#[async_trait]
impl BlobSource for HttpBlobSource {
    async fn fetch(&self, id: &str) -> Result<BlobReader, BlobError> {
        let url = self.endpoint.url_for(id)?;
        debug!("GET {}", url);

        let response = self
            .endpoint
            .send(id, self.endpoint.client.get(&url))
            .await?;
        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }
}

/// Blob sink that replaces content over HTTP(S)
pub struct HttpBlobSink {
    endpoint: Endpoint,
    method: UploadMethod,
}

impl HttpBlobSink {
    /// Create a sink for `url_template`; each store sends the whole blob with `method`
    pub fn new(
        url_template: impl Into<String>,
        bearer_token: Option<String>,
        method: UploadMethod,
        timeout: Duration,
    ) -> Result<Self, BlobError> {
        Ok(Self {
            endpoint: Endpoint::new(url_template.into(), bearer_token, timeout)?,
            method,
        })
    }
}

#[async_trait]
impl BlobSink for HttpBlobSink {
    async fn store(&self, id: &str, data: Bytes) -> Result<(), BlobError> {
        let url = self.endpoint.url_for(id)?;
        debug!("{} {} ({} bytes)", self.method, url, data.len());

        let client = &self.endpoint.client;
        let request = match self.method {
            UploadMethod::Put => client.put(&url),
            UploadMethod::Post => client.post(&url),
            UploadMethod::Patch => client.patch(&url),
        }
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(data);

        self.endpoint.send(id, request).await?;
        Ok(())
    }
}
