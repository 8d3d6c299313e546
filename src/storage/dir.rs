//! Directory-backed blob store: blob `id` lives in `<root>/<id>`

use super::{BlobError, BlobReader, BlobSink, BlobSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::trace;

/// Blob store rooted at a local directory
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// Create a store rooted at `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of blob `id`, rejecting ids that would escape the root
    fn blob_path(&self, id: &str) -> Result<PathBuf, BlobError> {
        let invalid = id.is_empty()
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0']);
        if invalid {
            return Err(BlobError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

#[async_trait]
impl BlobSource for DirBlobStore {
    async fn fetch(&self, id: &str) -> Result<BlobReader, BlobError> {
        let path = self.blob_path(id)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(id.to_string()))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

#[async_trait]
impl BlobSink for DirBlobStore {
    async fn store(&self, id: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.blob_path(id)?;
        tokio::fs::create_dir_all(&self.root).await?;

        // Readers must never observe a half-written blob
        let tmp = self.root.join(format!(".{}.partial", id));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        trace!("Stored blob {} ({} bytes) at {}", id, data.len(), path.display());
        Ok(())
    }
}
