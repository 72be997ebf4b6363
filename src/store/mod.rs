//! Persistence for cached artifacts, song link resolutions and user tokens.
//!
//! - [`RedbStorage`]: embedded redb database (default)
//! - [`MemoryStorage`]: process-local maps, for tests and embedding
//!
//! Every write is an upsert; concurrent writers to the same key resolve
//! last-writer-wins.

pub mod memory;
pub mod redb_store;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::{PlatformType, TrackIdentity};
use crate::retrieval::QualityInfo;
use crate::song_link::CanonicalSongLink;

pub use memory::MemoryStorage;
pub use redb_store::RedbStorage;

/// A published artifact, keyed by its [`TrackIdentity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub artifact_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_by_user_id: Option<i64>,
    pub quality: QualityInfo,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    // ── Artifacts ───────────────────────────────────────────────────

    async fn get_cached_artifact(&self, identity: &TrackIdentity) -> Result<Option<CachedArtifact>>;

    async fn store_cached_artifact(
        &self,
        identity: &TrackIdentity,
        artifact: &CachedArtifact,
    ) -> Result<()>;

    /// Drop the uploader attribution from every artifact cached by `user_id`.
    /// Returns how many records changed.
    async fn purge_attribution(&self, user_id: i64) -> Result<usize>;

    // ── Song links ──────────────────────────────────────────────────

    async fn get_song_link(&self, track_url: &str) -> Result<Option<CanonicalSongLink>>;

    async fn store_song_link(&self, track_url: &str, link: &CanonicalSongLink) -> Result<()>;

    // ── User tokens ─────────────────────────────────────────────────

    /// Platform token payload as stored by the authorization flow.
    async fn get_user_token(
        &self,
        user_id: i64,
        platform: PlatformType,
    ) -> Result<Option<serde_json::Value>>;

    async fn store_user_token(
        &self,
        user_id: i64,
        platform: PlatformType,
        token: &serde_json::Value,
    ) -> Result<()>;
}

fn user_token_key(user_id: i64, platform: PlatformType) -> String {
    format!("{}:{}", user_id, platform)
}
