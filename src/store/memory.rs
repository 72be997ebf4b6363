use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{user_token_key, CachedArtifact, Storage};
use crate::identity::{PlatformType, TrackIdentity};
use crate::song_link::CanonicalSongLink;

#[derive(Default)]
struct Tables {
    artifacts: HashMap<String, CachedArtifact>,
    song_links: HashMap<String, CanonicalSongLink>,
    user_tokens: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|e| anyhow!("lock poisoned: {e}"))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn get_cached_artifact(&self, identity: &TrackIdentity) -> Result<Option<CachedArtifact>> {
        Ok(self.tables()?.artifacts.get(&identity.key()).cloned())
    }

    async fn store_cached_artifact(
        &self,
        identity: &TrackIdentity,
        artifact: &CachedArtifact,
    ) -> Result<()> {
        self.tables()?
            .artifacts
            .insert(identity.key(), artifact.clone());
        Ok(())
    }

    async fn purge_attribution(&self, user_id: i64) -> Result<usize> {
        let mut tables = self.tables()?;
        let mut purged = 0;
        for artifact in tables.artifacts.values_mut() {
            if artifact.cached_by_user_id == Some(user_id) {
                artifact.cached_by_user_id = None;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn get_song_link(&self, track_url: &str) -> Result<Option<CanonicalSongLink>> {
        Ok(self.tables()?.song_links.get(track_url).cloned())
    }

    async fn store_song_link(&self, track_url: &str, link: &CanonicalSongLink) -> Result<()> {
        self.tables()?
            .song_links
            .insert(track_url.to_string(), link.clone());
        Ok(())
    }

    async fn get_user_token(
        &self,
        user_id: i64,
        platform: PlatformType,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .tables()?
            .user_tokens
            .get(&user_token_key(user_id, platform))
            .cloned())
    }

    async fn store_user_token(
        &self,
        user_id: i64,
        platform: PlatformType,
        token: &serde_json::Value,
    ) -> Result<()> {
        self.tables()?
            .user_tokens
            .insert(user_token_key(user_id, platform), token.clone());
        Ok(())
    }
}
