//! Blob storage backends
//!
//! The tunnel only needs two capabilities from object storage:
//! - [`BlobSource`]: fetch a blob's content as a byte stream (client side)
//! - [`BlobSink`]: replace a blob's content (peer side)
//!
//! Backends:
//! - HTTP(S) downloads and uploads (`http` feature)
//! - A local directory, one file per blob
//! - An in-process map

mod dir;
#[cfg(feature = "http")]
mod http;
mod memory;

pub use dir::DirBlobStore;
#[cfg(feature = "http")]
pub use http::{HttpBlobSink, HttpBlobSource};
pub use memory::MemoryBlobStore;

use crate::config::{BlobSinkConfig, BlobSourceConfig};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Storage errors
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob id: {0:?}")]
    InvalidId(String),

    #[error("Storage returned status {status} for blob {id}")]
    Status { id: String, status: u16 },

    #[error("Request for blob {id} failed: {reason}")]
    Request { id: String, reason: String },

    #[error("Reading blob {id} failed: {source}")]
    Read {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Fetching blob {0} timed out")]
    Timeout(String),

    #[error("Unsupported blob source: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte stream of one blob's content
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Anything that can hand out blob content by identifier
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Open the content of blob `id` for streaming
    async fn fetch(&self, id: &str) -> Result<BlobReader, BlobError>;
}

/// Anything that can replace blob content by identifier
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Store `data` as the full content of blob `id`
    async fn store(&self, id: &str, data: Bytes) -> Result<(), BlobError>;
}

/// HTTP method used to replace blob content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    #[default]
    Put,
    Post,
    /// Drive-style media update of an existing file
    Patch,
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadMethod::Put => "PUT",
            UploadMethod::Post => "POST",
            UploadMethod::Patch => "PATCH",
        })
    }
}

/// Build the blob source described by a config section
pub fn from_config(
    config: &BlobSourceConfig,
    fetch_timeout: Duration,
) -> Result<Arc<dyn BlobSource>, BlobError> {
    match config {
        BlobSourceConfig::Dir { path } => Ok(Arc::new(DirBlobStore::new(path))),
        #[cfg(feature = "http")]
        BlobSourceConfig::Http {
            url_template,
            bearer_token,
        } => Ok(Arc::new(HttpBlobSource::new(
            url_template.clone(),
            bearer_token.clone(),
            fetch_timeout,
        )?)),
        #[cfg(not(feature = "http"))]
        BlobSourceConfig::Http { .. } => {
            let _ = fetch_timeout;
            Err(BlobError::Unsupported(
                "http blob source requires the `http` feature".to_string(),
            ))
        }
    }
}

/// Build the blob sink described by a config section
pub fn sink_from_config(
    config: &BlobSinkConfig,
    store_timeout: Duration,
) -> Result<Arc<dyn BlobSink>, BlobError> {
    match config {
        BlobSinkConfig::Dir { path } => Ok(Arc::new(DirBlobStore::new(path))),
        #[cfg(feature = "http")]
        BlobSinkConfig::Http {
            url_template,
            bearer_token,
            method,
        } => Ok(Arc::new(HttpBlobSink::new(
            url_template.clone(),
            bearer_token.clone(),
            *method,
            store_timeout,
        )?)),
        #[cfg(not(feature = "http"))]
        BlobSinkConfig::Http { .. } => {
            let _ = store_timeout;
            Err(BlobError::Unsupported(
                "http blob sink requires the `http` feature".to_string(),
            ))
        }
    }
}
