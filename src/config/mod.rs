//! Configuration management

use crate::protocol::{
    BLOB_FETCH_TIMEOUT, BLOB_STORE_TIMEOUT, CONNECT_TIMEOUT, DEFAULT_MAX_MANIFEST_BYTES,
    HANDSHAKE_TIMEOUT,
};
use crate::storage::UploadMethod;
use crate::transport::TransportConfig;
use crate::tunnel::BlobErrorPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server (relay) configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server (relay) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Blob store timeout in seconds
    pub store_timeout_secs: u64,
    /// Number of blob slots advertised in the manifest
    pub slot_count: u16,
    /// Prefix of slot blob ids (`<prefix><n>`)
    pub slot_prefix: String,
    /// How long packets are collected before a blob is written (ms)
    pub batch_window_ms: u64,
    /// Maximum packets held in one batch
    pub max_queued_packets: usize,
    /// Where blobs are written to
    pub sink: BlobSinkConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            store_timeout_secs: BLOB_STORE_TIMEOUT,
            slot_count: 64,
            slot_prefix: "slot-".to_string(),
            batch_window_ms: 200,
            max_queued_packets: 512,
            sink: BlobSinkConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Blob ids advertised to clients, in index order
    pub fn slot_ids(&self) -> Vec<String> {
        (0..self.slot_count)
            .map(|i| format!("{}{}", self.slot_prefix, i))
            .collect()
    }

    /// Batch window as a duration
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Blob store timeout as a duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port`)
    pub server: String,
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Handshake timeout in seconds
    pub handshake_timeout_secs: u64,
    /// Largest manifest accepted during the handshake
    pub max_manifest_bytes: usize,
    /// Blob fetch timeout in seconds
    pub blob_fetch_timeout_secs: u64,
    /// What to do when a blob cannot be fetched or is malformed
    pub on_blob_error: BlobErrorPolicy,
    /// Where blobs are downloaded from
    pub blobs: BlobSourceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            connect_timeout_secs: CONNECT_TIMEOUT,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT,
            max_manifest_bytes: DEFAULT_MAX_MANIFEST_BYTES,
            blob_fetch_timeout_secs: BLOB_FETCH_TIMEOUT,
            on_blob_error: BlobErrorPolicy::default(),
            blobs: BlobSourceConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Split `server` into host and port
    pub fn host_port(&self) -> Result<(String, u16), crate::Error> {
        let (host, port) = self
            .server
            .rsplit_once(':')
            .ok_or_else(|| crate::Error::Config(format!("No port in {:?}", self.server)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| crate::Error::Config(format!("Invalid port in {:?}: {}", self.server, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(crate::Error::Config(format!("No host in {:?}", self.server)));
        }
        Ok((host.to_string(), port))
    }

    /// Transport settings for the control socket
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout_secs,
            handshake_timeout: self.handshake_timeout_secs,
            max_manifest_bytes: self.max_manifest_bytes,
            ..TransportConfig::default()
        }
    }

    /// Blob fetch timeout as a duration
    pub fn blob_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.blob_fetch_timeout_secs)
    }
}

/// Blob source configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlobSourceConfig {
    /// Download over HTTP(S); `{id}` in the template is replaced by the blob id
    Http {
        url_template: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
    /// Read from a local directory, one file per blob
    Dir { path: PathBuf },
}

impl Default for BlobSourceConfig {
    fn default() -> Self {
        BlobSourceConfig::Dir {
            path: PathBuf::from("blobs"),
        }
    }
}

/// Blob sink configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlobSinkConfig {
    /// Upload over HTTP(S); `{id}` in the template is replaced by the blob id
    Http {
        url_template: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        method: UploadMethod,
    },
    /// Write to a local directory, one file per blob
    Dir { path: PathBuf },
}

impl Default for BlobSinkConfig {
    fn default() -> Self {
        BlobSinkConfig::Dir {
            path: PathBuf::from("blobs"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig {
            sink: BlobSinkConfig::Http {
                url_template:
                    "https://www.googleapis.com/upload/drive/v3/files/{id}?uploadType=media"
                        .to_string(),
                bearer_token: None,
                method: UploadMethod::Patch,
            },
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            blobs: BlobSourceConfig::Http {
                url_template: "https://www.googleapis.com/drive/v3/files/{id}?alt=media"
                    .to_string(),
                bearer_token: None,
            },
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}
