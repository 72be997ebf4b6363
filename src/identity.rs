use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies which platform a track or link belongs to.
///
/// The string forms match the platform keys used by the song.link
/// `linksByPlatform` payload, so the same tag can be used for cache keys,
/// platform clients and retrieval strategy dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlatformType {
    #[serde(rename = "spotify")]
    Spotify,
    #[serde(rename = "lastfm")]
    LastFm,
    #[serde(rename = "yandex")]
    Yandex,
    #[serde(rename = "deezer")]
    Deezer,
    #[serde(rename = "soundcloud")]
    SoundCloud,
    #[serde(rename = "youtube")]
    YouTube,
    #[serde(rename = "youtubeMusic")]
    YouTubeMusic,
    #[serde(rename = "appleMusic")]
    AppleMusic,
    #[serde(rename = "tidal")]
    Tidal,
    #[serde(rename = "amazonMusic")]
    AmazonMusic,
    #[serde(rename = "bandcamp")]
    Bandcamp,
}

impl PlatformType {
    pub const ALL: [PlatformType; 11] = [
        PlatformType::Spotify,
        PlatformType::LastFm,
        PlatformType::Yandex,
        PlatformType::Deezer,
        PlatformType::SoundCloud,
        PlatformType::YouTube,
        PlatformType::YouTubeMusic,
        PlatformType::AppleMusic,
        PlatformType::Tidal,
        PlatformType::AmazonMusic,
        PlatformType::Bandcamp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Spotify => "spotify",
            PlatformType::LastFm => "lastfm",
            PlatformType::Yandex => "yandex",
            PlatformType::Deezer => "deezer",
            PlatformType::SoundCloud => "soundcloud",
            PlatformType::YouTube => "youtube",
            PlatformType::YouTubeMusic => "youtubeMusic",
            PlatformType::AppleMusic => "appleMusic",
            PlatformType::Tidal => "tidal",
            PlatformType::AmazonMusic => "amazonMusic",
            PlatformType::Bandcamp => "bandcamp",
        }
    }

    /// Song links for these platforms are resolved on every request and never
    /// persisted. Last.fm track pages point at whatever external listing the
    /// page currently advertises, so a stored answer can go stale.
    pub fn requires_live_resolution(&self) -> bool {
        matches!(self, PlatformType::LastFm)
    }

    /// Guess the platform a URL belongs to from its host.
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.trim_start_matches("www.").trim_start_matches("m.");
        if is_yandex_music_host(host) {
            return Some(PlatformType::Yandex);
        }
        match host {
            "open.spotify.com" | "play.spotify.com" => Some(PlatformType::Spotify),
            "last.fm" | "lastfm.com" => Some(PlatformType::LastFm),
            "deezer.com" => Some(PlatformType::Deezer),
            "soundcloud.com" | "api.soundcloud.com" => Some(PlatformType::SoundCloud),
            "youtube.com" | "youtu.be" => Some(PlatformType::YouTube),
            "music.youtube.com" => Some(PlatformType::YouTubeMusic),
            "music.apple.com" | "geo.music.apple.com" | "itunes.apple.com" => {
                Some(PlatformType::AppleMusic)
            }
            "tidal.com" | "listen.tidal.com" => Some(PlatformType::Tidal),
            "music.amazon.com" => Some(PlatformType::AmazonMusic),
            _ if host.ends_with(".bandcamp.com") => Some(PlatformType::Bandcamp),
            _ => None,
        }
    }
}

/// Yandex Music hosts: `music.yandex.<tld>` for every regional TLD, plus the
/// `music.example` mirror.
pub fn is_yandex_music_host(host: &str) -> bool {
    let host = host.strip_prefix("www.").unwrap_or(host);
    host.starts_with("music.yandex.") || host == "music.example"
}

impl std::fmt::Display for PlatformType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlatformType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlatformType::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown platform type: {}", s))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityParseError {
    #[error("track identity {0:?} has no platform separator")]
    MissingSeparator(String),
    #[error("track identity {0:?} names an unknown platform")]
    UnknownPlatform(String),
    #[error("track identity {0:?} has an empty id")]
    EmptyId(String),
}

/// Platform-qualified track reference, the cache key of the whole pipeline.
///
/// Serialized as `"{platform}_{id}"`. Platform tags never contain `_`, so the
/// first underscore always separates the two halves even when the id has its
/// own underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackIdentity {
    platform: PlatformType,
    id: String,
}

impl TrackIdentity {
    pub fn new(platform: PlatformType, id: impl Into<String>) -> Self {
        Self {
            platform,
            id: id.into(),
        }
    }

    pub fn platform(&self) -> PlatformType {
        self.platform
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key form used for the artifact store and the dedup lock table.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for TrackIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.platform, self.id)
    }
}

impl std::str::FromStr for TrackIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (platform, id) = s
            .split_once('_')
            .ok_or_else(|| IdentityParseError::MissingSeparator(s.to_string()))?;
        let platform: PlatformType = platform
            .parse()
            .map_err(|_| IdentityParseError::UnknownPlatform(s.to_string()))?;
        if id.is_empty() {
            return Err(IdentityParseError::EmptyId(s.to_string()));
        }
        Ok(Self::new(platform, id))
    }
}

impl Serialize for TrackIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrackIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
