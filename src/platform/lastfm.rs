//! Last.fm adapter: listening history only, no playback control.
//!
//! Requests are signed with the app's shared secret and the user's session
//! key. Track ids are the path of the track page below `/music/`, e.g.
//! `Rick+Astley/_/Never+Gonna+Give+You+Up`, so a track can be rebuilt from its
//! id without another request.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::{Platform, PlatformClient, PlatformFeature, Track};
use crate::error::PlatformError;
use crate::identity::PlatformType;
use crate::store::Storage;

const API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
const TRACK_PAGE_PREFIX: &str = "https://www.last.fm/music/";
const USER_AGENT: &str = "songvault";

const FEATURES: &[PlatformFeature] = &[PlatformFeature::TrackGetters];

/// API error codes meaning the session is gone: authentication failed,
/// invalid session key, unauthorized token, login required.
const SESSION_ERRORS: &[u32] = &[4, 9, 14, 17];

/// Stored token: either `{"session_key": "..."}` or the bare key string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredSession {
    Object { session_key: String },
    Bare(String),
}

impl StoredSession {
    fn into_key(self) -> String {
        match self {
            StoredSession::Object { session_key } => session_key,
            StoredSession::Bare(key) => key,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct TextField {
    #[serde(rename = "#text", default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct TrackAttr {
    #[serde(default)]
    nowplaying: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlayedDate {
    uts: String,
}

#[derive(Debug, Deserialize)]
struct RecentTrack {
    artist: TextField,
    name: String,
    url: String,
    #[serde(rename = "@attr", default)]
    attr: TrackAttr,
    #[serde(default)]
    date: Option<PlayedDate>,
}

#[derive(Debug, Deserialize)]
struct RecentTracksPage {
    #[serde(default)]
    track: OneOrMany<RecentTrack>,
}

#[derive(Debug, Deserialize)]
struct RecentTracksResponse {
    recenttracks: RecentTracksPage,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: u32,
    #[serde(default)]
    message: String,
}

/// `md5(concat(sorted name+value pairs) + secret)`, as the API expects.
pub fn sign(params: &BTreeMap<&str, String>, shared_secret: &str) -> String {
    let mut payload = String::new();
    for (name, value) in params {
        payload.push_str(name);
        payload.push_str(value);
    }
    payload.push_str(shared_secret);
    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// Page URL → track id, `None` for anything that is not a track page.
pub fn track_id_from_url(url: &str) -> Option<String> {
    let path = url
        .strip_prefix(TRACK_PAGE_PREFIX)
        .or_else(|| url.strip_prefix("https://last.fm/music/"))?;
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.contains("/_/").then(|| path.to_string())
}

fn decode_segment(segment: &str) -> String {
    let spaced = segment.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Rebuild a track from its id alone.
pub fn track_from_id(id: &str) -> Option<Track> {
    let (artist, name) = id.split_once("/_/")?;
    if artist.is_empty() || name.is_empty() {
        return None;
    }
    Some(Track::new(
        PlatformType::LastFm,
        id,
        decode_segment(artist),
        decode_segment(name),
        format!("{}{}", TRACK_PAGE_PREFIX, id),
    ))
}

fn parse_recent_tracks(response: RecentTracksResponse) -> Vec<Track> {
    response
        .recenttracks
        .track
        .into_vec()
        .into_iter()
        .filter_map(|item| {
            let Some(id) = track_id_from_url(&item.url) else {
                tracing::debug!(url = %item.url, "Skipping Last.fm entry without a track page");
                return None;
            };
            let playing = item.attr.nowplaying.as_deref() == Some("true");
            let played_at = item
                .date
                .and_then(|d| d.uts.parse::<i64>().ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .unwrap_or_else(Utc::now);

            let track = Track::new(PlatformType::LastFm, id, item.artist.text, item.name, item.url)
                .played_at(played_at);
            Some(if playing { track.now_playing() } else { track })
        })
        .collect()
}

struct AppCredentials {
    api_key: String,
    shared_secret: String,
}

pub struct LastFmClient {
    http_client: HttpClient,
    credentials: Arc<AppCredentials>,
    session_key: String,
    user_id: i64,
    username: OnceCell<String>,
}

impl LastFmClient {
    fn unavailable(&self, reason: impl ToString) -> PlatformError {
        PlatformError::TemporarilyUnavailable {
            platform: PlatformType::LastFm,
            reason: reason.to_string(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        extra: &[(&'static str, String)],
    ) -> Result<T, PlatformError> {
        let mut params: BTreeMap<&str, String> = extra.iter().cloned().collect();
        params.insert("method", method.to_string());
        params.insert("api_key", self.credentials.api_key.clone());
        params.insert("sk", self.session_key.clone());
        let signature = sign(&params, &self.credentials.shared_secret);
        params.insert("api_sig", signature);
        params.insert("format", "json".to_string());

        let response = self
            .http_client
            .get(API_URL)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&params)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(self.unavailable(format!("status {}", status)));
        }
        let body = response.text().await.map_err(|e| self.unavailable(e))?;

        if let Ok(error) = serde_json::from_str::<ApiError>(&body) {
            if SESSION_ERRORS.contains(&error.error) {
                tracing::info!(user_id = self.user_id, code = error.error, "Last.fm session rejected");
                return Err(PlatformError::Unauthenticated {
                    platform: PlatformType::LastFm,
                    user_id: self.user_id,
                });
            }
            return Err(PlatformError::Other(anyhow!(
                "Last.fm {} failed with code {}: {}",
                method,
                error.error,
                error.message
            )));
        }
        if !status.is_success() {
            return Err(PlatformError::Other(anyhow!(
                "Last.fm {} answered {}: {}",
                method,
                status,
                body
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| PlatformError::Other(anyhow!("Failed to parse Last.fm {} response: {}", method, e)))
    }

    async fn username(&self) -> Result<&str, PlatformError> {
        let name = self
            .username
            .get_or_try_init(|| async {
                let info: UserInfoResponse = self.call("user.getInfo", &[]).await?;
                Ok::<_, PlatformError>(info.user.name)
            })
            .await?;
        Ok(name.as_str())
    }
}

#[async_trait]
impl PlatformClient for LastFmClient {
    fn platform(&self) -> PlatformType {
        PlatformType::LastFm
    }

    fn features(&self) -> &'static [PlatformFeature] {
        FEATURES
    }

    async fn current_track(&self) -> Result<Option<Track>, PlatformError> {
        Ok(self
            .listening_history(1)
            .await?
            .into_iter()
            .find(|t| t.currently_playing))
    }

    async fn recent_tracks(&self, limit: usize) -> Result<Vec<Track>, PlatformError> {
        Ok(self
            .listening_history(limit)
            .await?
            .into_iter()
            .filter(|t| !t.currently_playing)
            .collect())
    }

    /// One request yields both; the limit does not count the playing track.
    async fn listening_history(&self, limit: usize) -> Result<Vec<Track>, PlatformError> {
        let user = self.username().await?.to_string();
        let response: RecentTracksResponse = self
            .call(
                "user.getRecentTracks",
                &[("user", user), ("limit", limit.max(1).to_string())],
            )
            .await?;
        Ok(parse_recent_tracks(response))
    }

    async fn get_track(&self, id: &str) -> Result<Option<Track>, PlatformError> {
        Ok(track_from_id(id))
    }
}

/// Builds [`LastFmClient`]s from stored session keys.
pub struct LastFmPlatform {
    http_client: HttpClient,
    credentials: Arc<AppCredentials>,
    storage: Arc<dyn Storage>,
}

impl LastFmPlatform {
    pub fn new(
        http_client: HttpClient,
        api_key: impl Into<String>,
        shared_secret: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            http_client,
            credentials: Arc::new(AppCredentials {
                api_key: api_key.into(),
                shared_secret: shared_secret.into(),
            }),
            storage,
        }
    }
}

#[async_trait]
impl Platform for LastFmPlatform {
    fn platform_type(&self) -> PlatformType {
        PlatformType::LastFm
    }

    async fn client_for_user(&self, user_id: i64) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let unauthenticated = PlatformError::Unauthenticated {
            platform: PlatformType::LastFm,
            user_id,
        };

        let Some(stored) = self.storage.get_user_token(user_id, PlatformType::LastFm).await? else {
            return Err(unauthenticated);
        };
        let session_key = match serde_json::from_value::<StoredSession>(stored) {
            Ok(session) => session.into_key(),
            Err(e) => {
                tracing::warn!(user_id, "Stored Last.fm session is malformed: {}", e);
                return Err(unauthenticated);
            }
        };
        if session_key.is_empty() {
            return Err(unauthenticated);
        }

        Ok(Arc::new(LastFmClient {
            http_client: self.http_client.clone(),
            credentials: Arc::clone(&self.credentials),
            session_key,
            user_id,
            username: OnceCell::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn test_signature() {
        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("method", "user.getInfo".to_string());
        params.insert("api_key", "key".to_string());
        params.insert("sk", "session".to_string());

        let expected = format!(
            "{:x}",
            md5::compute("api_keykeymethoduser.getInfosksessionsecret".as_bytes())
        );
        assert_eq!(sign(&params, "secret"), expected);
    }

    #[test]
    fn test_track_id_round_trip() {
        let url = "https://www.last.fm/music/Rick+Astley/_/Never+Gonna+Give+You+Up";
        let id = track_id_from_url(url).unwrap();
        assert_eq!(id, "Rick+Astley/_/Never+Gonna+Give+You+Up");

        let track = track_from_id(&id).unwrap();
        assert_eq!(track.artist, "Rick Astley");
        assert_eq!(track.name, "Never Gonna Give You Up");
        assert_eq!(track.url, url);
        assert_eq!(track.identity().to_string(), format!("lastfm_{}", id));
    }

    #[test]
    fn test_track_id_decoding() {
        let track = track_from_id("AC%2FDC/_/T.N.T.+%2B+more").unwrap();
        assert_eq!(track.artist, "AC/DC");
        assert_eq!(track.name, "T.N.T. + more");
    }

    #[test]
    fn test_non_track_pages_have_no_id() {
        assert!(track_id_from_url("https://www.last.fm/music/Rick+Astley").is_none());
        assert!(track_id_from_url("https://example.org/music/a/_/b").is_none());
        assert!(track_from_id("no-separator").is_none());
    }

    #[test]
    fn test_recent_tracks_parsing() {
        let body = r##"{"recenttracks":{"track":[
            {"artist":{"mbid":"","#text":"Boards of Canada"},"name":"Roygbiv",
             "url":"https://www.last.fm/music/Boards+of+Canada/_/Roygbiv",
             "@attr":{"nowplaying":"true"}},
            {"artist":{"mbid":"","#text":"Aphex Twin"},"name":"Xtal",
             "url":"https://www.last.fm/music/Aphex+Twin/_/Xtal",
             "date":{"uts":"1700000000","#text":"14 Nov 2023, 22:13"}}
        ],"@attr":{"user":"someone","page":"1"}}}"##;
        let response: RecentTracksResponse = serde_json::from_str(body).unwrap();
        let tracks = parse_recent_tracks(response);

        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].currently_playing);
        assert_eq!(tracks[0].artist, "Boards of Canada");
        assert!(tracks[0].played_at.is_some());
        assert!(!tracks[1].currently_playing);
        assert_eq!(tracks[1].id, "Aphex+Twin/_/Xtal");
        assert_eq!(tracks[1].played_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_single_recent_track_object() {
        let body = r##"{"recenttracks":{"track":
            {"artist":{"#text":"A"},"name":"B","url":"https://www.last.fm/music/A/_/B",
             "date":{"uts":"10"}}}}"##;
        let response: RecentTracksResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parse_recent_tracks(response).len(), 1);
    }

    #[tokio::test]
    async fn test_client_requires_session() {
        let storage = Arc::new(MemoryStorage::new());
        let platform = LastFmPlatform::new(HttpClient::new(), "key", "secret", storage.clone());
        assert!(matches!(
            platform.client_for_user(3).await,
            Err(PlatformError::Unauthenticated { user_id: 3, .. })
        ));

        storage
            .store_user_token(3, PlatformType::LastFm, &serde_json::json!({"session_key": "sk"}))
            .await
            .unwrap();
        let client = platform.client_for_user(3).await.unwrap();
        assert!(!client.can_control_playback());
        assert!(matches!(
            client.play("A/_/B").await,
            Err(PlatformError::UnsupportedOperation { .. })
        ));

        let track = client.get_track("A/_/B").await.unwrap().unwrap();
        assert_eq!(track.platform, PlatformType::LastFm);
    }

    #[tokio::test]
    async fn test_bare_session_string_is_accepted() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .store_user_token(4, PlatformType::LastFm, &serde_json::json!("sk"))
            .await
            .unwrap();
        let platform = LastFmPlatform::new(HttpClient::new(), "key", "secret", storage);
        assert!(platform.client_for_user(4).await.is_ok());
    }
}
