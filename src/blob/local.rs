//! Content-addressed blob store: `<root>/<ab>/<blake3 hex>.<ext>`.
//!
//! References are the path relative to the root, so identical bytes always
//! map to the same reference and re-uploads are no-ops.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use super::{ArtifactUpload, BlobStore};
use crate::error::UploadError;

pub struct LocalBlobStore {
    root: PathBuf,
    max_bytes: u64,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    /// Resolve a reference to its path, rejecting anything that could step
    /// outside the root.
    pub fn path_for(&self, reference: &str) -> Option<PathBuf> {
        let (prefix, name) = reference.split_once('/')?;
        let valid = |s: &str| {
            !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'.')
                && !s.starts_with('.')
        };
        (valid(prefix) && valid(name)).then(|| self.root.join(prefix).join(name))
    }

    fn reference_for(bytes: &[u8], extension: &str) -> String {
        let hex = blake3::hash(bytes).to_hex();
        let extension: String = extension
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if extension.is_empty() {
            format!("{}/{}", &hex[..2], hex)
        } else {
            format!("{}/{}.{}", &hex[..2], hex, extension)
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, artifact: &ArtifactUpload<'_>) -> Result<String, UploadError> {
        let size = artifact.bytes.len() as u64;
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        if artifact.bytes.is_empty() {
            return Err(UploadError::Rejected("empty artifact".to_string()));
        }

        let reference = Self::reference_for(artifact.bytes, artifact.file_extension);
        let path = self
            .path_for(&reference)
            .ok_or_else(|| UploadError::Rejected(format!("invalid reference {}", reference)))?;

        if tokio::fs::try_exists(&path).await? {
            return Ok(reference);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file + rename
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let temp_path = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp_path, artifact.bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(identity = %artifact.identity, reference = %reference, size, "Stored blob");
        Ok(reference)
    }

    async fn is_live(&self, reference: &str) -> Result<bool> {
        let Some(path) = self.path_for(reference) else {
            return Ok(false);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file() && meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
