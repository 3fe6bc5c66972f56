use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{env, path::PathBuf};
use tracing::debug;

/// Content-addressed binary storage collaborator. Streaming and transport
/// live behind this seam; callers see store-and-get-an-id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, bytes: &[u8]) -> Result<String>;
    async fn retrieve(&self, id: &str) -> Result<Option<Vec<u8>>>;
}

/// On-disk store keyed by the sha256 of the content. Storing the same image
/// twice is a natural no-op.
pub struct DiskBlobStore {
    dir: PathBuf,
}

impl DiskBlobStore {
    pub fn from_env() -> Self {
        let dir = env::var("BLOB_DIR").unwrap_or_else(|_| "blobs".to_string());
        Self { dir: PathBuf::from(dir) }
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        // Ids are hex digests; anything else is refused rather than joined
        // into a filesystem path.
        if id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(self.dir.join(id))
        } else {
            None
        }
    }
}

pub fn content_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn store(&self, bytes: &[u8]) -> Result<String> {
        let id = content_id(bytes);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create blob directory")?;
        let path = self.dir.join(&id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Blob {} already stored", id);
            return Ok(id);
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", id))?;
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob {}", id)),
        }
    }
}
