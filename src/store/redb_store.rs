//! redb-backed [`Storage`]. Three tables, values are JSON bytes:
//!   artifacts:   "{platform}_{id}"       → CachedArtifact
//!   song_links:  source URL              → song link URL
//!   user_tokens: "{user_id}:{platform}"  → token payload

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::{user_token_key, CachedArtifact, Storage};
use crate::identity::{PlatformType, TrackIdentity};
use crate::song_link::CanonicalSongLink;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const ARTIFACTS: JsonTable = TableDefinition::new("artifacts");
const SONG_LINKS: TableDefinition<&str, &str> = TableDefinition::new("song_links");
const USER_TOKENS: JsonTable = TableDefinition::new("user_tokens");

/// Transactions commit with fsync, so every call runs on the blocking pool.
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open redb at {}", path.display()))?;
        // Ensure tables exist
        let txn = db.begin_write()?;
        {
            txn.open_table(ARTIFACTS)?;
            txn.open_table(SONG_LINKS)?;
            txn.open_table(USER_TOKENS)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("songvault");
        Ok(data_dir.join("songvault.redb"))
    }

    async fn with_db<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .context("redb task failed")?
    }

    async fn put(&self, table: JsonTable, key: String, value: Vec<u8>) -> Result<()> {
        self.with_db(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(table)?;
                table.insert(key.as_str(), value.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, table: JsonTable, key: String) -> Result<Option<Vec<u8>>> {
        self.with_db(move |db| {
            let rtxn = db.begin_read()?;
            let table = rtxn.open_table(table)?;
            Ok(table.get(key.as_str())?.map(|guard| guard.value().to_vec()))
        })
        .await
    }
}

fn purge_attribution_blocking(db: &Database, user_id: i64) -> Result<usize> {
    let txn = db.begin_write()?;
    let purged = {
        let mut table = txn.open_table(ARTIFACTS)?;
        let mut updates: Vec<(String, Vec<u8>)> = Vec::new();
        for item in table.iter()? {
            let (key, val) = item?;
            let Ok(mut artifact) = serde_json::from_slice::<CachedArtifact>(val.value()) else {
                continue;
            };
            if artifact.cached_by_user_id == Some(user_id) {
                artifact.cached_by_user_id = None;
                updates.push((key.value().to_string(), serde_json::to_vec(&artifact)?));
            }
        }
        for (key, json) in &updates {
            table.insert(key.as_str(), json.as_slice())?;
        }
        updates.len()
    };
    txn.commit()?;
    Ok(purged)
}

#[async_trait]
impl Storage for RedbStorage {
    fn backend_name(&self) -> &str {
        "redb"
    }

    async fn get_cached_artifact(&self, identity: &TrackIdentity) -> Result<Option<CachedArtifact>> {
        match self.get(ARTIFACTS, identity.key()).await? {
            Some(bytes) => {
                let artifact = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt artifact record for {}", identity))?;
                Ok(Some(artifact))
            }
            None => Ok(None),
        }
    }

    async fn store_cached_artifact(
        &self,
        identity: &TrackIdentity,
        artifact: &CachedArtifact,
    ) -> Result<()> {
        let json = serde_json::to_vec(artifact)?;
        self.put(ARTIFACTS, identity.key(), json).await
    }

    async fn purge_attribution(&self, user_id: i64) -> Result<usize> {
        self.with_db(move |db| purge_attribution_blocking(db, user_id)).await
    }

    async fn get_song_link(&self, track_url: &str) -> Result<Option<CanonicalSongLink>> {
        let track_url = track_url.to_string();
        let stored = self
            .with_db(move |db| {
                let rtxn = db.begin_read()?;
                let table = rtxn.open_table(SONG_LINKS)?;
                Ok(table.get(track_url.as_str())?.map(|guard| guard.value().to_string()))
            })
            .await?;
        stored.map(|url| url.parse()).transpose()
    }

    async fn store_song_link(&self, track_url: &str, link: &CanonicalSongLink) -> Result<()> {
        let track_url = track_url.to_string();
        let link_url = link.url();
        self.with_db(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SONG_LINKS)?;
                table.insert(track_url.as_str(), link_url.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_user_token(
        &self,
        user_id: i64,
        platform: PlatformType,
    ) -> Result<Option<serde_json::Value>> {
        match self.get(USER_TOKENS, user_token_key(user_id, platform)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_user_token(
        &self,
        user_id: i64,
        platform: PlatformType,
        token: &serde_json::Value,
    ) -> Result<()> {
        let json = serde_json::to_vec(token)?;
        self.put(USER_TOKENS, user_token_key(user_id, platform), json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::QualityInfo;

    fn create_test_artifact(reference: &str, user: Option<i64>) -> CachedArtifact {
        CachedArtifact {
            artifact_reference: reference.to_string(),
            cached_by_user_id: user,
            quality: QualityInfo::mp3(320, 44.1, true),
        }
    }

    fn open_temp() -> (tempfile::TempDir, RedbStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(&dir.path().join("nested").join("test.redb")).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_artifact_upsert() {
        let (_dir, storage) = open_temp();
        let identity = TrackIdentity::new(PlatformType::Spotify, "abc");

        assert!(storage.get_cached_artifact(&identity).await.unwrap().is_none());

        storage
            .store_cached_artifact(&identity, &create_test_artifact("ref-1", Some(7)))
            .await
            .unwrap();
        storage
            .store_cached_artifact(&identity, &create_test_artifact("ref-2", Some(8)))
            .await
            .unwrap();

        let stored = storage.get_cached_artifact(&identity).await.unwrap().unwrap();
        assert_eq!(stored.artifact_reference, "ref-2");
        assert_eq!(stored.cached_by_user_id, Some(8));
    }

    #[tokio::test]
    async fn test_purge_attribution() {
        let (_dir, storage) = open_temp();
        let a = TrackIdentity::new(PlatformType::Spotify, "a");
        let b = TrackIdentity::new(PlatformType::Deezer, "b");
        let c = TrackIdentity::new(PlatformType::YouTube, "c");
        storage.store_cached_artifact(&a, &create_test_artifact("ra", Some(1))).await.unwrap();
        storage.store_cached_artifact(&b, &create_test_artifact("rb", Some(1))).await.unwrap();
        storage.store_cached_artifact(&c, &create_test_artifact("rc", Some(2))).await.unwrap();

        assert_eq!(storage.purge_attribution(1).await.unwrap(), 2);
        assert_eq!(storage.purge_attribution(1).await.unwrap(), 0);

        let a = storage.get_cached_artifact(&a).await.unwrap().unwrap();
        assert_eq!(a.cached_by_user_id, None);
        assert_eq!(a.artifact_reference, "ra");
        let c = storage.get_cached_artifact(&c).await.unwrap().unwrap();
        assert_eq!(c.cached_by_user_id, Some(2));
    }

    #[tokio::test]
    async fn test_song_links_and_tokens() {
        let (_dir, storage) = open_temp();
        let url = "https://listen.tidal.com/track/1";
        let link = CanonicalSongLink::song("d", "3135556");

        storage.store_song_link(url, &link).await.unwrap();
        assert_eq!(storage.get_song_link(url).await.unwrap(), Some(link));
        assert_eq!(storage.get_song_link("https://other").await.unwrap(), None);

        let token = serde_json::json!({"access_token": "t", "refresh_token": "r"});
        storage.store_user_token(5, PlatformType::Spotify, &token).await.unwrap();
        assert_eq!(
            storage.get_user_token(5, PlatformType::Spotify).await.unwrap(),
            Some(token)
        );
        assert_eq!(storage.get_user_token(5, PlatformType::LastFm).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.redb");
        let identity = TrackIdentity::new(PlatformType::Deezer, "42");
        {
            let storage = RedbStorage::open(&path).unwrap();
            storage
                .store_cached_artifact(&identity, &create_test_artifact("kept", None))
                .await
                .unwrap();
        }
        let storage = RedbStorage::open(&path).unwrap();
        let stored = storage.get_cached_artifact(&identity).await.unwrap().unwrap();
        assert_eq!(stored.artifact_reference, "kept");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_writes_on_single_thread_runtime() {
        let (_dir, storage) = open_temp();
        let storage = Arc::new(storage);

        let writes = (0..16).map(|i| {
            let storage = Arc::clone(&storage);
            async move {
                let identity = TrackIdentity::new(PlatformType::Deezer, i.to_string());
                storage
                    .store_cached_artifact(&identity, &create_test_artifact(&format!("ref-{i}"), Some(i)))
                    .await
            }
        });
        for result in futures_util::future::join_all(writes).await {
            result.unwrap();
        }

        for i in 0..16 {
            let identity = TrackIdentity::new(PlatformType::Deezer, i.to_string());
            let stored = storage.get_cached_artifact(&identity).await.unwrap().unwrap();
            assert_eq!(stored.artifact_reference, format!("ref-{i}"));
        }
        assert_eq!(storage.purge_attribution(3).await.unwrap(), 1);
    }
}
