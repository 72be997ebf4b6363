//! Per-user platform clients behind a capability-tagged trait.
//!
//! Each adapter declares a fixed feature set. Track getters are mandatory;
//! queue and playback control are optional and answer
//! [`PlatformError::UnsupportedOperation`] when not declared.

pub mod lastfm;
pub mod spotify;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::OnceCell;

use crate::error::PlatformError;
use crate::identity::{PlatformType, TrackIdentity};
use crate::song_link::{CanonicalSongLink, SongLinkResolver};

pub use lastfm::{LastFmClient, LastFmPlatform};
pub use spotify::{SpotifyClient, SpotifyPlatform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformFeature {
    TrackGetters,
    AddToQueue,
    Play,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub platform: PlatformType,
    pub id: String,
    pub artist: String,
    pub name: String,
    pub url: String,
    pub currently_playing: bool,
    pub played_at: Option<DateTime<Utc>>,
    song_link: OnceCell<Option<CanonicalSongLink>>,
}

impl Track {
    pub fn new(
        platform: PlatformType,
        id: impl Into<String>,
        artist: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            id: id.into(),
            artist: artist.into(),
            name: name.into(),
            url: url.into(),
            currently_playing: false,
            played_at: None,
            song_link: OnceCell::new(),
        }
    }

    pub fn now_playing(mut self) -> Self {
        self.currently_playing = true;
        self
    }

    pub fn played_at(mut self, at: DateTime<Utc>) -> Self {
        self.played_at = Some(at);
        self
    }

    pub fn identity(&self) -> TrackIdentity {
        TrackIdentity::new(self.platform, self.id.clone())
    }

    /// Song link for this track, resolved on first use and memoized for the
    /// lifetime of this value. An unresolvable track memoizes `None`.
    pub async fn song_link(&self, resolver: &SongLinkResolver) -> Option<CanonicalSongLink> {
        self.song_link
            .get_or_init(|| resolver.resolve(&self.url))
            .await
            .clone()
    }
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> PlatformType;

    fn features(&self) -> &'static [PlatformFeature];

    fn supports(&self, feature: PlatformFeature) -> bool {
        self.features().contains(&feature)
    }

    fn can_control_playback(&self) -> bool {
        self.supports(PlatformFeature::AddToQueue) || self.supports(PlatformFeature::Play)
    }

    async fn current_track(&self) -> Result<Option<Track>, PlatformError>;

    async fn recent_tracks(&self, limit: usize) -> Result<Vec<Track>, PlatformError>;

    /// Current and recent tracks in whatever order the platform returns
    /// them. Adapters that get both from one request override this.
    async fn listening_history(&self, limit: usize) -> Result<Vec<Track>, PlatformError> {
        let mut tracks: Vec<Track> = self.current_track().await?.into_iter().collect();
        tracks.extend(self.recent_tracks(limit).await?);
        Ok(tracks)
    }

    async fn get_track(&self, id: &str) -> Result<Option<Track>, PlatformError>;

    async fn add_to_queue(&self, _id: &str) -> Result<(), PlatformError> {
        Err(PlatformError::UnsupportedOperation {
            platform: self.platform(),
            feature: PlatformFeature::AddToQueue,
        })
    }

    async fn play(&self, _id: &str) -> Result<(), PlatformError> {
        Err(PlatformError::UnsupportedOperation {
            platform: self.platform(),
            feature: PlatformFeature::Play,
        })
    }
}

/// Currently playing track first, the rest by descending play time.
/// Repeated identities keep their first occurrence. `limit` bounds the
/// recent part; the currently playing track comes on top of it.
pub fn order_tracks(tracks: Vec<Track>, limit: usize) -> Vec<Track> {
    let (current, mut recent): (Vec<Track>, Vec<Track>) =
        tracks.into_iter().partition(|t| t.currently_playing);
    recent.sort_by(|a, b| b.played_at.cmp(&a.played_at));

    let mut seen: HashSet<TrackIdentity> = HashSet::new();
    let mut ordered: Vec<Track> = Vec::with_capacity(limit + 1);
    let mut current = current.into_iter();
    if let Some(playing) = current.next() {
        seen.insert(playing.identity());
        ordered.push(playing);
    }
    let cap = ordered.len() + limit;

    // Extra tracks flagged as playing are treated as plain history.
    let rest = current.map(|mut t| {
        t.currently_playing = false;
        t
    });
    for track in rest.chain(recent) {
        if ordered.len() >= cap {
            break;
        }
        if seen.insert(track.identity()) {
            ordered.push(track);
        }
    }
    ordered
}

/// Lazy stream over the user's current and recent tracks. Nothing is
/// requested until the stream is first polled, and it yields each track once.
pub fn current_and_recent_tracks(
    client: Arc<dyn PlatformClient>,
    limit: usize,
) -> BoxStream<'static, Result<Track, PlatformError>> {
    stream::once(async move {
        let tracks = client.listening_history(limit).await?;
        Ok::<_, PlatformError>(order_tracks(tracks, limit))
    })
    .map(|fetched| match fetched {
        Ok(tracks) => stream::iter(tracks.into_iter().map(Ok)).left_stream(),
        Err(e) => stream::once(future::ready(Err(e))).right_stream(),
    })
    .flatten()
    .boxed()
}

/// Builds authenticated clients for one platform.
#[async_trait]
pub trait Platform: Send + Sync {
    fn platform_type(&self) -> PlatformType;

    /// Client for `user_id` from their stored token. A missing or rejected
    /// token is [`PlatformError::Unauthenticated`].
    async fn client_for_user(&self, user_id: i64) -> Result<Arc<dyn PlatformClient>, PlatformError>;
}

#[derive(Default)]
pub struct PlatformRegistry {
    platforms: HashMap<PlatformType, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.platform_type(), platform);
    }

    pub fn platforms(&self) -> Vec<PlatformType> {
        let mut platforms: Vec<PlatformType> = self.platforms.keys().copied().collect();
        platforms.sort();
        platforms
    }

    pub async fn client_for_user(
        &self,
        platform: PlatformType,
        user_id: i64,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        match self.platforms.get(&platform) {
            Some(factory) => factory.client_for_user(user_id).await,
            None => Err(PlatformError::UnsupportedPlatform(platform)),
        }
    }
}
