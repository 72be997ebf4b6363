//! Song-identity resolution: platform URL → cross-platform song link.
//!
//! Resolution order:
//! 1. structural parsers ([`parsers`]) keyed by host, no network;
//! 2. in-process LRU memo, then the persistent link store;
//! 3. the song.link resolve API, whose provider tag is mapped onto the same
//!    short-code vocabulary the parsers emit.
//!
//! Successful network answers are persisted keyed by the source URL, except
//! for platforms that require live resolution. Those pages are resolved
//! through the external links they advertise ([`LiveLinkSource`]) before the
//! resolve API is tried on the page URL itself.

pub mod lastfm_page;
pub mod odesli;
pub mod parsers;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::identity::PlatformType;
use crate::reporter::Reporter;
use crate::store::Storage;

pub use lastfm_page::LastFmPageLinks;
pub use odesli::OdesliClient;

const SONG_LINK_HOST: &str = "song.link";
const ALBUM_LINK_HOST: &str = "album.link";

/// Provider tags returned by the resolve API mapped to the short codes used
/// in song.link paths.
const PROVIDER_SHORT_CODES: &[(&str, &str)] = &[
    ("amazon", "a"),
    ("audiomack", "am"),
    ("audius", "au"),
    ("bandcamp", "b"),
    ("boomplay", "bp"),
    ("deezer", "d"),
    ("itunes", "i"),
    ("napster", "n"),
    ("pandora", "p"),
    ("soundcloud", "sc"),
    ("spinrilla", "sp"),
    ("spotify", "s"),
    ("tidal", "t"),
    ("yandex", "ya"),
    ("youtube", "y"),
];

pub fn short_code_for_provider(provider: &str) -> Option<&'static str> {
    PROVIDER_SHORT_CODES
        .iter()
        .find(|(name, _)| *name == provider)
        .map(|(_, code)| *code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Song,
    Album,
}

/// Opaque cross-platform pointer such as `https://song.link/ya/79714180`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CanonicalSongLink {
    kind: LinkKind,
    short_code: String,
    id: String,
}

impl CanonicalSongLink {
    pub fn song(short_code: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::Song,
            short_code: short_code.into(),
            id: id.into(),
        }
    }

    pub fn album(short_code: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::Album,
            short_code: short_code.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// `"{short_code}/{id}"`, the part shared by both resolution paths.
    pub fn suffix(&self) -> String {
        format!("{}/{}", self.short_code, self.id)
    }

    pub fn url(&self) -> String {
        let host = match self.kind {
            LinkKind::Song => SONG_LINK_HOST,
            LinkKind::Album => ALBUM_LINK_HOST,
        };
        format!("https://{}/{}", host, self.suffix())
    }
}

impl std::fmt::Display for CanonicalSongLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

impl std::str::FromStr for CanonicalSongLink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;
        let kind = match url.host_str() {
            Some(SONG_LINK_HOST) => LinkKind::Song,
            Some(ALBUM_LINK_HOST) => LinkKind::Album,
            other => anyhow::bail!("not a song link host: {:?}", other),
        };
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        // Country-prefixed links (`/fr/i/123`) keep only the code and id.
        match segments.as_slice() {
            [.., code, id] => Ok(Self {
                kind,
                short_code: code.to_string(),
                id: id.to_string(),
            }),
            _ => anyhow::bail!("song link {:?} has no code/id path", s),
        }
    }
}

impl From<CanonicalSongLink> for String {
    fn from(link: CanonicalSongLink) -> Self {
        link.url()
    }
}

impl TryFrom<String> for CanonicalSongLink {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Entity returned by the network resolver before short-code mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedEntity {
    pub id: String,
    pub provider: String,
}

/// Per-platform variants of a song link.
#[derive(Debug, Clone, Default)]
pub struct SongLinkInfo {
    pub platforms: BTreeMap<PlatformType, String>,
    pub thumbnail_url: Option<String>,
}

impl SongLinkInfo {
    pub fn url_for(&self, platform: PlatformType) -> Option<&str> {
        self.platforms.get(&platform).map(String::as_str)
    }
}

/// Network side of song link resolution.
#[async_trait]
pub trait SongLinkApi: Send + Sync {
    /// Resolve an arbitrary platform URL. `Ok(None)` means the service
    /// answered but knows no such entity.
    async fn resolve(&self, track_url: &str) -> Result<Option<ResolvedEntity>>;

    /// Expand a song link into its per-platform URLs.
    async fn links(&self, link: &CanonicalSongLink) -> Result<SongLinkInfo>;
}

/// Map a resolver answer onto the short-code vocabulary.
pub fn link_from_entity(entity: &ResolvedEntity) -> Option<CanonicalSongLink> {
    let code = short_code_for_provider(&entity.provider)?;
    Some(CanonicalSongLink::song(code, entity.id.clone()))
}

/// Source of candidate platform URLs for pages that cannot be resolved
/// directly, such as Last.fm track pages advertising external listings.
#[async_trait]
pub trait LiveLinkSource: Send + Sync {
    /// External URLs advertised by `page_url`, best candidates first.
    async fn external_links(&self, page_url: &str) -> Result<Vec<String>>;
}

pub struct SongLinkResolver {
    api: Arc<dyn SongLinkApi>,
    storage: Arc<dyn Storage>,
    reporter: Arc<dyn Reporter>,
    allow_fallback: bool,
    live_links: Option<Arc<dyn LiveLinkSource>>,
    memo: Mutex<LruCache<String, CanonicalSongLink>>,
}

impl SongLinkResolver {
    pub fn new(
        api: Arc<dyn SongLinkApi>,
        storage: Arc<dyn Storage>,
        reporter: Arc<dyn Reporter>,
        allow_fallback: bool,
        memo_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(memo_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            api,
            storage,
            reporter,
            allow_fallback,
            live_links: None,
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_live_links(mut self, source: Arc<dyn LiveLinkSource>) -> Self {
        self.live_links = Some(source);
        self
    }

    /// [`get_song_link`](Self::get_song_link) with the configured fallback policy.
    pub async fn resolve(&self, track_url: &str) -> Option<CanonicalSongLink> {
        self.get_song_link(track_url, self.allow_fallback).await
    }

    /// Resolve `track_url` to a song link. Never fails: every error path
    /// yields `None` because retrieval may still have another source of truth.
    pub async fn get_song_link(
        &self,
        track_url: &str,
        allow_fallback: bool,
    ) -> Option<CanonicalSongLink> {
        let live = Url::parse(track_url)
            .ok()
            .and_then(|u| u.host_str().and_then(PlatformType::from_host))
            .map(|p| p.requires_live_resolution())
            .unwrap_or(false);

        if !live {
            return self.resolve_stable(track_url, allow_fallback).await;
        }

        if let Some(link) = self.resolve_live(track_url, allow_fallback).await {
            return Some(link);
        }
        if !allow_fallback {
            return None;
        }
        self.resolve_remote(track_url).await
    }

    /// Walk the external links a live page advertises and take the first
    /// one that resolves. Nothing found here is persisted under the page URL.
    async fn resolve_live(&self, page_url: &str, allow_fallback: bool) -> Option<CanonicalSongLink> {
        let source = self.live_links.as_ref()?;
        let candidates = match source.external_links(page_url).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(url = page_url, "failed to read external links: {:#}", e);
                return None;
            }
        };

        for candidate in candidates {
            if let Some(link) = self.resolve_stable(&candidate, allow_fallback).await {
                tracing::debug!(url = page_url, via = %candidate, "resolved live page");
                return Some(link);
            }
        }
        None
    }

    async fn resolve_stable(&self, track_url: &str, allow_fallback: bool) -> Option<CanonicalSongLink> {
        if let Some(link) = parsers::parse_structural(track_url) {
            return Some(link);
        }
        if let Some(link) = self.cached(track_url).await {
            return Some(link);
        }
        if !allow_fallback {
            return None;
        }

        let link = self.resolve_remote(track_url).await?;
        self.remember(track_url, &link).await;
        Some(link)
    }

    /// Network-only path, bypassing the structural parsers and the caches.
    pub async fn resolve_remote(&self, track_url: &str) -> Option<CanonicalSongLink> {
        tracing::debug!(url = track_url, "falling back to the song link API");
        let entity = match self.api.resolve(track_url).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return None,
            Err(e) => {
                self.reporter
                    .report(&format!("Song link resolution failed for {}: {:#}", track_url, e))
                    .await;
                return None;
            }
        };

        let link = link_from_entity(&entity);
        if link.is_none() {
            self.reporter
                .report(&format!(
                    "Song link provider {:?} is unsupported (url: {})",
                    entity.provider, track_url
                ))
                .await;
        }
        link
    }

    pub async fn platform_links(&self, link: &CanonicalSongLink) -> Result<SongLinkInfo> {
        self.api.links(link).await
    }

    async fn cached(&self, track_url: &str) -> Option<CanonicalSongLink> {
        if let Some(link) = self.lock_memo().get(track_url).cloned() {
            return Some(link);
        }

        match self.storage.get_song_link(track_url).await {
            Ok(Some(link)) => {
                self.lock_memo().put(track_url.to_string(), link.clone());
                Some(link)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(url = track_url, "song link store read failed: {:#}", e);
                None
            }
        }
    }

    async fn remember(&self, track_url: &str, link: &CanonicalSongLink) {
        self.lock_memo().put(track_url.to_string(), link.clone());
        if let Err(e) = self.storage.store_song_link(track_url, link).await {
            tracing::warn!(url = track_url, "song link store write failed: {:#}", e);
        }
    }

    fn lock_memo(&self) -> std::sync::MutexGuard<'_, LruCache<String, CanonicalSongLink>> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
