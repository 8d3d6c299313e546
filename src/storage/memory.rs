//! In-process blob store

use super::{BlobError, BlobReader, BlobSink, BlobSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{RwLock, RwLockReadGuard};

/// Blob store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of blob `id`
    pub fn get(&self, id: &str) -> Option<Bytes> {
        self.read().get(id).cloned()
    }

    /// Insert or replace blob `id`
    pub fn insert(&self, id: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), data.into());
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Every write is a single map insert, so a poisoned map is still whole
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Bytes>> {
        self.blobs.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobSource for MemoryBlobStore {
    async fn fetch(&self, id: &str) -> Result<BlobReader, BlobError> {
        let data = self
            .get(id)
            .ok_or_else(|| BlobError::NotFound(id.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

#[async_trait]
impl BlobSink for MemoryBlobStore {
    async fn store(&self, id: &str, data: Bytes) -> Result<(), BlobError> {
        self.insert(id, data);
        Ok(())
    }
}
