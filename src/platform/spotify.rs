//! Spotify Web API adapter.
//!
//! User tokens live in the token store as the JSON written by the
//! authorization flow. Expired tokens are refreshed with the app credentials
//! before use, and a 401 mid-session triggers one refresh and one retry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Platform, PlatformClient, PlatformFeature, Track};
use crate::error::PlatformError;
use crate::identity::PlatformType;
use crate::store::Storage;

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const MAX_RECENT: usize = 50;
const PREMIUM_REQUIRED: &str = "Spotify premium required";
const NO_ACTIVE_DEVICE: &str = "No active Spotify device found";

const FEATURES: &[PlatformFeature] = &[
    PlatformFeature::TrackGetters,
    PlatformFeature::AddToQueue,
    PlatformFeature::Play,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyToken {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SpotifyToken {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            // Refresh a minute early so requests do not race the expiry
            Some(expires_at) => expires_at - Duration::seconds(60) < Utc::now(),
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrackItem {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    #[serde(default)]
    external_urls: HashMap<String, String>,
    #[serde(default)]
    is_local: bool,
}

impl SpotifyTrackItem {
    /// Local files have no Spotify id or URL and are skipped.
    fn into_track(self) -> Option<Track> {
        if self.is_local {
            return None;
        }
        let url = self.external_urls.get("spotify")?.clone();
        let id = self.id?;
        let artist = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Some(Track::new(PlatformType::Spotify, id, artist, self.name, url))
    }
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    #[serde(default)]
    item: Option<SpotifyTrackItem>,
}

#[derive(Debug, Deserialize)]
struct PlayHistory {
    track: Option<SpotifyTrackItem>,
    played_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayed {
    #[serde(default)]
    items: Vec<PlayHistory>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

/// Map a non-success Spotify response onto the platform error taxonomy.
fn classify_error(status: StatusCode, body: &str, user_id: i64) -> PlatformError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return PlatformError::TemporarilyUnavailable {
            platform: PlatformType::Spotify,
            reason: format!("status {}", status),
        };
    }
    if status == StatusCode::UNAUTHORIZED {
        return PlatformError::Unauthenticated {
            platform: PlatformType::Spotify,
            user_id,
        };
    }

    let error = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|e| e.error)
        .unwrap_or_default();
    match error.reason.as_deref() {
        Some("PREMIUM_REQUIRED") => PlatformError::ClientSide(PREMIUM_REQUIRED.to_string()),
        Some("NO_ACTIVE_DEVICE") => PlatformError::ClientSide(NO_ACTIVE_DEVICE.to_string()),
        _ => {
            let detail = if error.message.is_empty() { body } else { error.message.as_str() };
            PlatformError::Other(anyhow!("Spotify answered {}: {}", status, detail))
        }
    }
}

struct AppCredentials {
    client_id: String,
    client_secret: String,
}

pub struct SpotifyClient {
    http_client: HttpClient,
    credentials: Arc<AppCredentials>,
    storage: Arc<dyn Storage>,
    user_id: i64,
    token: Mutex<SpotifyToken>,
}

impl SpotifyClient {
    fn unavailable(&self, e: reqwest::Error) -> PlatformError {
        PlatformError::TemporarilyUnavailable {
            platform: PlatformType::Spotify,
            reason: e.to_string(),
        }
    }

    fn unauthenticated(&self) -> PlatformError {
        PlatformError::Unauthenticated {
            platform: PlatformType::Spotify,
            user_id: self.user_id,
        }
    }

    /// Refresh the access token unless another request already replaced
    /// `stale_access` while we waited for the lock.
    async fn refresh(&self, stale_access: Option<&str>) -> Result<(), PlatformError> {
        let mut token = self.token.lock().await;
        if let Some(stale) = stale_access {
            if token.access_token != stale {
                return Ok(());
            }
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", token.refresh_token.as_str()),
        ];
        let response = self
            .http_client
            .post(TOKEN_URL)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&params)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(PlatformError::TemporarilyUnavailable {
                platform: PlatformType::Spotify,
                reason: format!("token refresh answered {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(user_id = self.user_id, %status, "Spotify token refresh rejected: {}", body);
            return Err(self.unauthenticated());
        }

        let refreshed: RefreshResponse = response.json().await.map_err(|e| self.unavailable(e))?;
        token.access_token = refreshed.access_token;
        if let Some(refresh_token) = refreshed.refresh_token {
            token.refresh_token = refresh_token;
        }
        token.expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        let stored = serde_json::to_value(&*token).map_err(|e| PlatformError::Other(e.into()))?;
        if let Err(e) = self
            .storage
            .store_user_token(self.user_id, PlatformType::Spotify, &stored)
            .await
        {
            tracing::warn!(user_id = self.user_id, "Failed to persist refreshed Spotify token: {:#}", e);
        }
        tracing::debug!(user_id = self.user_id, "Spotify token refreshed");
        Ok(())
    }

    async fn access_token(&self) -> Result<String, PlatformError> {
        let expired = self.token.lock().await.is_expired();
        if expired {
            self.refresh(None).await?;
        }
        Ok(self.token.lock().await.access_token.clone())
    }

    /// Send a request built by `build`, refreshing the token once on 401.
    async fn send<F>(&self, build: F) -> Result<Response, PlatformError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut retried = false;
        loop {
            let access = self.access_token().await?;
            let response = build(&access).send().await.map_err(|e| self.unavailable(e))?;

            if response.status() == StatusCode::UNAUTHORIZED && !retried {
                tracing::info!(user_id = self.user_id, "Got 401 from Spotify, refreshing token");
                self.refresh(Some(&access)).await?;
                retried = true;
                continue;
            }
            return Ok(response);
        }
    }

    async fn ensure_success(&self, response: Response) -> Result<Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status, &body, self.user_id))
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, response: Response) -> Result<T, PlatformError> {
        response
            .json()
            .await
            .map_err(|e| PlatformError::Other(anyhow!("Failed to parse Spotify response: {}", e)))
    }
}

#[async_trait]
impl PlatformClient for SpotifyClient {
    fn platform(&self) -> PlatformType {
        PlatformType::Spotify
    }

    fn features(&self) -> &'static [PlatformFeature] {
        FEATURES
    }

    async fn current_track(&self) -> Result<Option<Track>, PlatformError> {
        let url = format!("{}/me/player/currently-playing", API_BASE);
        let response = self
            .send(|token| self.http_client.get(&url).bearer_auth(token))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = self.ensure_success(response).await?;
        let playing: CurrentlyPlaying = self.json(response).await?;
        Ok(playing
            .item
            .and_then(SpotifyTrackItem::into_track)
            .map(|t| t.now_playing().played_at(Utc::now())))
    }

    async fn recent_tracks(&self, limit: usize) -> Result<Vec<Track>, PlatformError> {
        let url = format!("{}/me/player/recently-played", API_BASE);
        let limit = limit.clamp(1, MAX_RECENT).to_string();
        let response = self
            .send(|token| {
                self.http_client
                    .get(&url)
                    .query(&[("limit", limit.as_str())])
                    .bearer_auth(token)
            })
            .await?;
        let response = self.ensure_success(response).await?;
        let history: RecentlyPlayed = self.json(response).await?;
        Ok(parse_history(history))
    }

    async fn get_track(&self, id: &str) -> Result<Option<Track>, PlatformError> {
        let url = format!("{}/tracks/{}", API_BASE, id);
        let response = self
            .send(|token| self.http_client.get(&url).bearer_auth(token))
            .await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        let response = self.ensure_success(response).await?;
        let item: SpotifyTrackItem = self.json(response).await?;
        Ok(item.into_track())
    }

    async fn add_to_queue(&self, id: &str) -> Result<(), PlatformError> {
        let url = format!("{}/me/player/queue", API_BASE);
        let uri = track_uri(id);
        let response = self
            .send(|token| {
                self.http_client
                    .post(&url)
                    .query(&[("uri", uri.as_str())])
                    .header(reqwest::header::CONTENT_LENGTH, 0)
                    .bearer_auth(token)
            })
            .await?;
        self.ensure_success(response).await?;
        Ok(())
    }

    async fn play(&self, id: &str) -> Result<(), PlatformError> {
        let url = format!("{}/me/player/play", API_BASE);
        let body = serde_json::json!({ "uris": [track_uri(id)] });
        let response = self
            .send(|token| self.http_client.put(&url).json(&body).bearer_auth(token))
            .await?;
        self.ensure_success(response).await?;
        Ok(())
    }
}

fn track_uri(id: &str) -> String {
    format!("spotify:track:{}", id)
}

fn parse_history(history: RecentlyPlayed) -> Vec<Track> {
    history
        .items
        .into_iter()
        .filter_map(|entry| {
            let played_at = entry.played_at;
            entry.track?.into_track().map(|t| t.played_at(played_at))
        })
        .collect()
}

/// Builds [`SpotifyClient`]s from stored user tokens.
pub struct SpotifyPlatform {
    http_client: HttpClient,
    credentials: Arc<AppCredentials>,
    storage: Arc<dyn Storage>,
}

impl SpotifyPlatform {
    pub fn new(
        http_client: HttpClient,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            http_client,
            credentials: Arc::new(AppCredentials {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
            }),
            storage,
        }
    }
}

#[async_trait]
impl Platform for SpotifyPlatform {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Spotify
    }

    async fn client_for_user(&self, user_id: i64) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let unauthenticated = PlatformError::Unauthenticated {
            platform: PlatformType::Spotify,
            user_id,
        };

        let stored = self
            .storage
            .get_user_token(user_id, PlatformType::Spotify)
            .await?;
        let Some(stored) = stored else {
            return Err(unauthenticated);
        };
        let token: SpotifyToken = match serde_json::from_value(stored) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(user_id, "Stored Spotify token is malformed: {}", e);
                return Err(unauthenticated);
            }
        };

        let expired = token.is_expired();
        let client = SpotifyClient {
            http_client: self.http_client.clone(),
            credentials: Arc::clone(&self.credentials),
            storage: Arc::clone(&self.storage),
            user_id,
            token: Mutex::new(token),
        };
        if expired {
            client.refresh(None).await?;
        }
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn platform(storage: Arc<MemoryStorage>) -> SpotifyPlatform {
        SpotifyPlatform::new(HttpClient::new(), "id", "secret", storage)
    }

    #[test]
    fn test_track_item_parsing() {
        let body = r#"{
            "id": "4uLU6hMCjMI75M1A2tKUQC",
            "name": "Never Gonna Give You Up",
            "artists": [{"name": "Rick Astley"}, {"name": "Guest"}],
            "external_urls": {"spotify": "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"},
            "is_local": false
        }"#;
        let item: SpotifyTrackItem = serde_json::from_str(body).unwrap();
        let track = item.into_track().unwrap();
        assert_eq!(track.id, "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(track.artist, "Rick Astley, Guest");
        assert_eq!(track.identity().to_string(), "spotify_4uLU6hMCjMI75M1A2tKUQC");
    }

    #[test]
    fn test_local_tracks_are_skipped() {
        let body = r#"{
            "id": null,
            "name": "home recording",
            "artists": [],
            "external_urls": {},
            "is_local": true
        }"#;
        let item: SpotifyTrackItem = serde_json::from_str(body).unwrap();
        assert!(item.into_track().is_none());
    }

    #[test]
    fn test_history_keeps_play_time() {
        let body = r#"{"items": [
            {"played_at": "2024-05-01T10:00:00.000Z", "track": {
                "id": "a", "name": "A", "artists": [{"name": "X"}],
                "external_urls": {"spotify": "https://open.spotify.com/track/a"}}},
            {"played_at": "2024-05-01T09:00:00.000Z", "track": {
                "id": null, "name": "local", "artists": [], "is_local": true}}
        ]}"#;
        let history: RecentlyPlayed = serde_json::from_str(body).unwrap();
        let tracks = parse_history(history);
        assert_eq!(tracks.len(), 1);
        assert_eq!(
            tracks[0].played_at.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_error_classification() {
        let premium = r#"{"error":{"status":403,"message":"Player command failed: Premium required","reason":"PREMIUM_REQUIRED"}}"#;
        assert!(matches!(
            classify_error(StatusCode::FORBIDDEN, premium, 1),
            PlatformError::ClientSide(ref msg) if msg == PREMIUM_REQUIRED
        ));

        let no_device = r#"{"error":{"status":404,"message":"Player command failed: No active device found","reason":"NO_ACTIVE_DEVICE"}}"#;
        assert!(matches!(
            classify_error(StatusCode::NOT_FOUND, no_device, 1),
            PlatformError::ClientSide(_)
        ));

        assert!(matches!(
            classify_error(StatusCode::BAD_GATEWAY, "", 1),
            PlatformError::TemporarilyUnavailable { .. }
        ));
        assert!(matches!(
            classify_error(StatusCode::UNAUTHORIZED, "", 7),
            PlatformError::Unauthenticated { user_id: 7, .. }
        ));
        assert!(matches!(
            classify_error(StatusCode::FORBIDDEN, "not json", 1),
            PlatformError::Other(_)
        ));
    }

    #[test]
    fn test_token_expiry() {
        let mut token = SpotifyToken {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        };
        assert!(!token.is_expired());
        token.expires_at = Some(Utc::now() + Duration::seconds(30));
        assert!(token.is_expired());
        token.expires_at = None;
        assert!(!token.is_expired());
    }

    #[test]
    fn test_token_json_uses_unix_expiry() {
        let token: SpotifyToken = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_at":1700000000,"scope":"streaming"}"#,
        )
        .unwrap();
        assert_eq!(token.expires_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let result = platform(Arc::new(MemoryStorage::new())).client_for_user(5).await;
        assert!(matches!(
            result,
            Err(PlatformError::Unauthenticated { user_id: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_token_is_unauthenticated() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .store_user_token(5, PlatformType::Spotify, &serde_json::json!({"nope": true}))
            .await
            .unwrap();
        let result = platform(storage).client_for_user(5).await;
        assert!(matches!(result, Err(PlatformError::Unauthenticated { .. })));
    }

    #[tokio::test]
    async fn test_valid_token_builds_client() {
        let storage = Arc::new(MemoryStorage::new());
        let token = serde_json::json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_at": (Utc::now() + Duration::hours(1)).timestamp(),
        });
        storage
            .store_user_token(5, PlatformType::Spotify, &token)
            .await
            .unwrap();

        let client = platform(storage).client_for_user(5).await.unwrap();
        assert!(client.can_control_playback());
        assert!(client.supports(PlatformFeature::Play));
    }
}
