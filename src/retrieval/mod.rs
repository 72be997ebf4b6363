//! Ordered fallback chain of audio retrieval strategies.
//!
//! Strategies are bound to a platform tag and tried in declared priority.
//! A strategy only runs when the song link expansion has a URL for its
//! platform; any failure or an empty result moves on to the next one.

pub mod crypto;
pub mod deezer;
pub mod soundcloud;
pub mod tags;
pub mod youtube;
pub mod ytdlp;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RetrievalError, StrategyError};
use crate::identity::{PlatformType, TrackIdentity};
use crate::song_link::SongLinkInfo;

pub use deezer::DeezerStrategy;
pub use soundcloud::SoundCloudStrategy;
pub use youtube::{CobaltClient, YouTubeStrategy};
pub use ytdlp::YtDlp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
    pub bitrate_kbps: u32,
    pub sample_rate_khz: f32,
    /// Whether the source had nothing better to offer.
    pub highest_available: bool,
}

impl QualityInfo {
    pub fn mp3(bitrate_kbps: u32, sample_rate_khz: f32, highest_available: bool) -> Self {
        Self {
            bit_depth: None,
            bitrate_kbps,
            sample_rate_khz,
            highest_available,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub bytes: Vec<u8>,
    pub file_extension: &'static str,
    pub duration_seconds: Option<u32>,
    pub quality: QualityInfo,
    pub thumbnail_url: Option<String>,
    pub source_platform: PlatformType,
    pub title: Option<String>,
    pub performer: Option<String>,
}

/// What a strategy gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub identity: &'a TrackIdentity,
    /// URL of the track on the strategy's own platform.
    pub source_url: &'a str,
    pub artist: &'a str,
    pub title: &'a str,
}

#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn platform(&self) -> PlatformType;

    async fn retrieve(&self, request: RetrievalRequest<'_>) -> Result<RetrievalResult, StrategyError>;
}

/// MP3 magic: an ID3v2 header or an MPEG-1 Layer III frame sync.
pub fn is_mp3(data: &[u8]) -> bool {
    data.starts_with(b"ID3")
        || matches!(data, [0xFF, 0xFB | 0xF3 | 0xF2, ..])
}

pub struct RetrievalChain {
    strategies: Vec<Arc<dyn RetrievalStrategy>>,
}

impl RetrievalChain {
    pub fn new(strategies: Vec<Arc<dyn RetrievalStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn retrieve(
        &self,
        identity: &TrackIdentity,
        links: &SongLinkInfo,
        artist: &str,
        title: &str,
    ) -> Result<RetrievalResult, RetrievalError> {
        let mut attempted = Vec::new();

        for strategy in &self.strategies {
            let Some(source_url) = links.url_for(strategy.platform()) else {
                continue;
            };
            attempted.push(strategy.name());

            tracing::debug!(
                identity = %identity,
                strategy = strategy.name(),
                url = source_url,
                "Trying retrieval strategy"
            );
            let request = RetrievalRequest {
                identity,
                source_url,
                artist,
                title,
            };

            match strategy.retrieve(request).await {
                Ok(mut result) if !result.bytes.is_empty() => {
                    if result.thumbnail_url.is_none() {
                        result.thumbnail_url = links.thumbnail_url.clone();
                    }
                    tracing::info!(
                        identity = %identity,
                        strategy = strategy.name(),
                        bytes = result.bytes.len(),
                        "Retrieved audio"
                    );
                    return Ok(result);
                }
                Ok(_) => {
                    tracing::warn!(identity = %identity, strategy = strategy.name(), "Strategy returned no audio");
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, strategy = strategy.name(), "Strategy failed: {}", e);
                }
            }
        }

        Err(RetrievalError::RetrievalExhausted {
            identity: identity.clone(),
            attempted,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Strategy double with a scripted outcome.
    pub(crate) struct ScriptedStrategy {
        pub name: &'static str,
        pub platform: PlatformType,
        pub bytes: Option<Vec<u8>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedStrategy {
        pub fn ok(name: &'static str, platform: PlatformType, bytes: &[u8]) -> Self {
            Self {
                name,
                platform,
                bytes: Some(bytes.to_vec()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(name: &'static str, platform: PlatformType) -> Self {
            Self {
                name,
                platform,
                bytes: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RetrievalStrategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        fn platform(&self) -> PlatformType {
            self.platform
        }

        async fn retrieve(&self, _request: RetrievalRequest<'_>) -> Result<RetrievalResult, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = self.bytes.clone().ok_or(StrategyError::NotFound)?;
            Ok(RetrievalResult {
                bytes,
                file_extension: "mp3",
                duration_seconds: Some(180),
                quality: QualityInfo::mp3(320, 44.1, true),
                thumbnail_url: None,
                source_platform: self.platform,
                title: None,
                performer: None,
            })
        }
    }

    fn links(platforms: &[PlatformType]) -> SongLinkInfo {
        SongLinkInfo {
            platforms: platforms
                .iter()
                .map(|p| (*p, format!("https://{}.example/track/1", p)))
                .collect(),
            thumbnail_url: Some("https://thumb.example/1.jpg".to_string()),
        }
    }

    fn identity() -> TrackIdentity {
        TrackIdentity::new(PlatformType::Spotify, "abc")
    }

    #[test]
    fn test_is_mp3() {
        assert!(is_mp3(b"ID3\x03\x00"));
        assert!(is_mp3(&[0xFF, 0xFB, 0x90]));
        assert!(is_mp3(&[0xFF, 0xF3]));
        assert!(!is_mp3(b"{\"status\":\"error\"}"));
        assert!(!is_mp3(&[0xFF]));
        assert!(!is_mp3(&[]));
    }

    #[tokio::test]
    async fn test_first_available_strategy_wins() {
        let deezer = Arc::new(ScriptedStrategy::ok("deezer", PlatformType::Deezer, b"ID3deezer"));
        let youtube = Arc::new(ScriptedStrategy::ok("youtube", PlatformType::YouTube, b"ID3yt"));
        let chain = RetrievalChain::new(vec![deezer.clone(), youtube.clone()]);

        let result = chain
            .retrieve(&identity(), &links(&[PlatformType::Deezer, PlatformType::YouTube]), "a", "t")
            .await
            .unwrap();

        assert_eq!(result.source_platform, PlatformType::Deezer);
        assert_eq!(result.thumbnail_url.as_deref(), Some("https://thumb.example/1.jpg"));
        assert_eq!(deezer.calls(), 1);
        assert_eq!(youtube.calls(), 0);
    }

    #[tokio::test]
    async fn test_skips_platforms_without_links_and_failures() {
        let deezer = Arc::new(ScriptedStrategy::ok("deezer", PlatformType::Deezer, b"ID3deezer"));
        let soundcloud = Arc::new(ScriptedStrategy::failing("soundcloud", PlatformType::SoundCloud));
        let youtube = Arc::new(ScriptedStrategy::ok("youtube", PlatformType::YouTube, b"ID3yt"));
        let chain = RetrievalChain::new(vec![deezer.clone(), soundcloud.clone(), youtube.clone()]);

        let result = chain
            .retrieve(&identity(), &links(&[PlatformType::SoundCloud, PlatformType::YouTube]), "a", "t")
            .await
            .unwrap();

        assert_eq!(result.bytes, b"ID3yt");
        assert_eq!(deezer.calls(), 0);
        assert_eq!(soundcloud.calls(), 1);
        assert_eq!(youtube.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_bytes_fall_through() {
        let empty = Arc::new(ScriptedStrategy::ok("deezer", PlatformType::Deezer, b""));
        let youtube = Arc::new(ScriptedStrategy::ok("youtube", PlatformType::YouTube, b"ID3yt"));
        let chain = RetrievalChain::new(vec![empty, youtube]);

        let result = chain
            .retrieve(&identity(), &links(&[PlatformType::Deezer, PlatformType::YouTube]), "a", "t")
            .await
            .unwrap();
        assert_eq!(result.source_platform, PlatformType::YouTube);
    }

    #[tokio::test]
    async fn test_exhaustion_lists_attempted_strategies() {
        let chain = RetrievalChain::new(vec![
            Arc::new(ScriptedStrategy::failing("deezer", PlatformType::Deezer)),
            Arc::new(ScriptedStrategy::failing("soundcloud", PlatformType::SoundCloud)),
            Arc::new(ScriptedStrategy::failing("youtube", PlatformType::YouTube)),
        ]);

        let err = chain
            .retrieve(&identity(), &links(&[PlatformType::Deezer, PlatformType::YouTube]), "a", "t")
            .await
            .unwrap_err();

        match err {
            RetrievalError::RetrievalExhausted { identity: id, attempted } => {
                assert_eq!(id, identity());
                assert_eq!(attempted, vec!["deezer", "youtube"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
