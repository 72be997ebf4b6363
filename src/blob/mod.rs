//! Shared blob store receiving published artifacts.
//!
//! - [`LocalBlobStore`]: content-addressed files on local disk

pub mod local;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::UploadError;
use crate::identity::TrackIdentity;

pub use local::LocalBlobStore;

/// One upload submission. Metadata is advisory; stores may ignore it.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactUpload<'a> {
    pub identity: &'a TrackIdentity,
    pub bytes: &'a [u8],
    pub file_extension: &'a str,
    pub title: Option<&'a str>,
    pub performer: Option<&'a str>,
    pub duration_seconds: Option<u32>,
    pub thumbnail_url: Option<&'a str>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the artifact and return an opaque reference to it.
    async fn upload(&self, artifact: &ArtifactUpload<'_>) -> Result<String, UploadError>;

    /// Whether `reference` still resolves to stored content.
    async fn is_live(&self, reference: &str) -> Result<bool>;
}
