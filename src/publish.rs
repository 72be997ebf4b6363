//! Cache-and-publish: the one entry point callers use.
//!
//! A request first checks the artifact store and validates a hit against the
//! blob store. On a miss the identity is locked, the store is checked again
//! (a previous holder may have published it meanwhile) and the track is
//! resolved, retrieved, uploaded and persisted. That work runs in a spawned
//! task, so a caller that stops waiting never cancels a fetch other callers
//! are queued behind.

use std::sync::Arc;
use std::time::Duration;

use crate::blob::{ArtifactUpload, BlobStore};
use crate::config::UploadConfig;
use crate::error::{RetrievalError, UploadError};
use crate::identity::TrackIdentity;
use crate::lock::LockManager;
use crate::platform::{PlatformRegistry, Track};
use crate::reporter::Reporter;
use crate::retrieval::{RetrievalChain, RetrievalResult};
use crate::song_link::{SongLinkInfo, SongLinkResolver};
use crate::store::{CachedArtifact, Storage};

/// Who is asking. Only `user_id` and the opt-out flag affect behavior.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: i64,
    pub display_name: String,
    pub username: Option<String>,
    /// Do not record this user as the uploader of artifacts they trigger.
    pub attribution_opt_out: bool,
}

impl UserContext {
    pub fn new(user_id: i64, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            username: None,
            attribution_opt_out: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    pub attempts: u32,
    /// Attempt `n` is followed by a wait of `n * backoff`.
    pub backoff: Duration,
}

impl From<&UploadConfig> for UploadPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

struct Inner {
    storage: Arc<dyn Storage>,
    blob: Arc<dyn BlobStore>,
    resolver: Arc<SongLinkResolver>,
    chain: RetrievalChain,
    platforms: PlatformRegistry,
    reporter: Arc<dyn Reporter>,
    locks: LockManager,
    policy: UploadPolicy,
}

#[derive(Clone)]
pub struct CachePublisher {
    inner: Arc<Inner>,
}

impl CachePublisher {
    pub fn new(
        storage: Arc<dyn Storage>,
        blob: Arc<dyn BlobStore>,
        resolver: Arc<SongLinkResolver>,
        chain: RetrievalChain,
        platforms: PlatformRegistry,
        reporter: Arc<dyn Reporter>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                blob,
                resolver,
                chain,
                platforms,
                reporter,
                locks: LockManager::new(),
                policy,
            }),
        }
    }

    /// Published artifact for `identity`, fetching and publishing it first if
    /// needed. Concurrent calls for one identity share a single fetch.
    pub async fn resolve_and_cache(
        &self,
        identity: &TrackIdentity,
        user: &UserContext,
    ) -> Result<CachedArtifact, RetrievalError> {
        if let Some(hit) = self.inner.valid_cached(identity).await? {
            tracing::debug!(identity = %identity, "Cache hit");
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let task_identity = identity.clone();
        let task_user = user.clone();
        let handle = tokio::spawn(async move {
            let outcome = inner.fetch_and_publish(&task_identity, &task_user).await;
            if let Err(ref e) = outcome {
                inner.report_failure(&task_identity, e).await;
            }
            outcome
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = RetrievalError::Aborted {
                    identity: identity.clone(),
                };
                tracing::error!(identity = %identity, "Retrieval task did not complete: {}", e);
                self.inner.report_failure(identity, &err).await;
                Err(err)
            }
        }
    }

    /// Whether some request currently holds the fetch lock for `identity`.
    pub fn is_fetch_in_progress(&self, identity: &TrackIdentity) -> bool {
        self.inner.locks.is_locked(&identity.key())
    }

    pub fn resolver(&self) -> &SongLinkResolver {
        &self.inner.resolver
    }
}

impl Inner {
    /// A stored artifact whose blob is still live. Liveness probe failures
    /// serve the hit rather than refetching.
    async fn valid_cached(&self, identity: &TrackIdentity) -> Result<Option<CachedArtifact>, RetrievalError> {
        let Some(hit) = self
            .storage
            .get_cached_artifact(identity)
            .await
            .map_err(RetrievalError::Storage)?
        else {
            return Ok(None);
        };

        match self.blob.is_live(&hit.artifact_reference).await {
            Ok(true) => Ok(Some(hit)),
            Ok(false) => {
                tracing::info!(
                    identity = %identity,
                    reference = %hit.artifact_reference,
                    "Cached artifact is no longer live, refetching"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(identity = %identity, "Liveness probe failed, serving cached artifact: {:#}", e);
                Ok(Some(hit))
            }
        }
    }

    async fn fetch_and_publish(
        &self,
        identity: &TrackIdentity,
        user: &UserContext,
    ) -> Result<CachedArtifact, RetrievalError> {
        let _guard = self.locks.acquire(&identity.key()).await;

        if let Some(hit) = self.valid_cached(identity).await? {
            tracing::debug!(identity = %identity, "Published while waiting for the lock");
            return Ok(hit);
        }

        tracing::info!(
            identity = %identity,
            user_id = user.user_id,
            user = %user.display_name,
            "Fetching track"
        );

        let client = self
            .platforms
            .client_for_user(identity.platform(), user.user_id)
            .await
            .map_err(|e| RetrievalError::from_platform(e, identity))?;
        let track = client
            .get_track(identity.id())
            .await
            .map_err(|e| RetrievalError::from_platform(e, identity))?
            .ok_or_else(|| RetrievalError::NotFound {
                identity: identity.clone(),
            })?;

        let links = self.links_for(&track).await;
        let result = self
            .chain
            .retrieve(identity, &links, &track.artist, &track.name)
            .await?;

        let reference = self.upload(identity, &track, &result).await?;
        let artifact = CachedArtifact {
            artifact_reference: reference,
            cached_by_user_id: (!user.attribution_opt_out).then_some(user.user_id),
            quality: result.quality,
        };
        self.storage
            .store_cached_artifact(identity, &artifact)
            .await
            .map_err(RetrievalError::Storage)?;

        tracing::info!(
            identity = %identity,
            source = %result.source_platform,
            reference = %artifact.artifact_reference,
            "Published track"
        );
        Ok(artifact)
    }

    /// Per-platform URLs for `track`. The track's own URL is always present,
    /// so its platform's strategy can run even when expansion fails.
    async fn links_for(&self, track: &Track) -> SongLinkInfo {
        let mut links = match track.song_link(&self.resolver).await {
            Some(link) => match self.resolver.platform_links(&link).await {
                Ok(links) => links,
                Err(e) => {
                    tracing::warn!(link = %link, "Failed to expand song link: {:#}", e);
                    SongLinkInfo::default()
                }
            },
            None => {
                tracing::debug!(url = %track.url, "No song link for track");
                SongLinkInfo::default()
            }
        };
        links
            .platforms
            .entry(track.platform)
            .or_insert_with(|| track.url.clone());
        links
    }

    async fn upload(
        &self,
        identity: &TrackIdentity,
        track: &Track,
        result: &RetrievalResult,
    ) -> Result<String, RetrievalError> {
        let upload = ArtifactUpload {
            identity,
            bytes: &result.bytes,
            file_extension: result.file_extension,
            title: Some(result.title.as_deref().unwrap_or(&track.name)),
            performer: Some(result.performer.as_deref().unwrap_or(&track.artist)),
            duration_seconds: result.duration_seconds,
            thumbnail_url: result.thumbnail_url.as_deref(),
        };

        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.blob.upload(&upload).await {
                Ok(reference) => return Ok(reference),
                Err(UploadError::TooLarge { size, limit }) => {
                    return Err(RetrievalError::ArtifactTooLarge {
                        identity: identity.clone(),
                        size,
                        limit,
                    });
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, attempt, "Upload failed: {}", e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }
            }
        }

        Err(RetrievalError::UploadFailed {
            identity: identity.clone(),
            attempts,
            reason: last_error,
        })
    }

    async fn report_failure(&self, identity: &TrackIdentity, error: &RetrievalError) {
        let strategies = self.chain.strategy_names().join(", ");
        tracing::warn!(
            identity = %identity,
            platform = %identity.platform(),
            strategies = %strategies,
            "Failed to cache track: {}",
            error
        );
        self.reporter
            .report(&format!("Failed to cache {} (strategies: {}): {}", identity, strategies, error))
            .await;
    }
}
