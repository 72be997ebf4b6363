//! YouTube strategy: Cobalt direct stream first, yt-dlp extraction second.
//!
//! Cobalt instances come and go, and some answer with an error page instead
//! of audio. The client re-rolls to a random healthy public instance when the
//! current one fails and bans instances that served non-MP3 bodies.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::{header, Client as HttpClient};
use serde::{Deserialize, Serialize};

use super::ytdlp::YtDlp;
use super::{is_mp3, QualityInfo, RetrievalRequest, RetrievalResult, RetrievalStrategy};
use crate::error::StrategyError;
use crate::identity::PlatformType;
use crate::reporter::Reporter;

pub const DEFAULT_COBALT_URL: &str = "https://api.cobalt.tools";
pub const DEFAULT_INSTANCES_URL: &str = "https://instances.hyper.lol/instances.json";

const API_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTHY_SCORE: u32 = 100;

/// Entry of the public instance list.
#[derive(Debug, Clone, Deserialize)]
pub struct CobaltApiInstance {
    #[serde(default)]
    pub api_online: bool,
    #[serde(default)]
    pub services: HashMap<String, bool>,
    #[serde(default)]
    pub score: u32,
    pub protocol: String,
    pub api: String,
}

impl CobaltApiInstance {
    fn url(&self) -> String {
        format!("{}://{}", self.protocol, self.api)
    }

    fn is_healthy(&self) -> bool {
        self.api_online
            && self.score == HEALTHY_SCORE
            && self.services.get("youtube").copied().unwrap_or(false)
    }
}

/// Pick a random healthy instance that is neither banned nor current.
pub fn pick_instance(
    instances: &[CobaltApiInstance],
    banned: &HashSet<String>,
    current: &str,
) -> Option<String> {
    let candidates: Vec<String> = instances
        .iter()
        .filter(|i| i.is_healthy())
        .map(CobaltApiInstance::url)
        .filter(|url| url != current && !banned.contains(url))
        .collect();
    candidates.choose(&mut rand::thread_rng()).cloned()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    is_audio_only: bool,
    url: &'a str,
    a_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

struct InstanceState {
    current: String,
    banned: HashSet<String>,
}

pub struct CobaltClient {
    http_client: HttpClient,
    default_url: String,
    instances_url: String,
    attempts: u32,
    reporter: Arc<dyn Reporter>,
    state: Mutex<InstanceState>,
}

impl CobaltClient {
    pub fn new(
        http_client: HttpClient,
        default_url: impl Into<String>,
        instances_url: impl Into<String>,
        attempts: u32,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let default_url = default_url.into().trim_end_matches('/').to_string();
        Self {
            http_client,
            instances_url: instances_url.into(),
            attempts: attempts.max(1),
            reporter,
            state: Mutex::new(InstanceState {
                current: default_url.clone(),
                banned: HashSet::new(),
            }),
            default_url,
        }
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_instance(&self) -> String {
        self.state().current.clone()
    }

    /// Switch to another public instance, falling back to the default one
    /// when the list is unreachable or has nothing usable.
    pub async fn re_roll(&self, ban_current: bool) {
        if ban_current {
            let mut state = self.state();
            let current = state.current.clone();
            state.banned.insert(current);
        }

        let instances = match self.fetch_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::debug!("Cobalt instance list unavailable: {}", e);
                self.state().current = self.default_url.clone();
                return;
            }
        };

        let mut state = self.state();
        match pick_instance(&instances, &state.banned, &state.current) {
            Some(url) => {
                tracing::info!(instance = %url, "Re-rolled Cobalt instance");
                state.current = url;
            }
            None => state.current = self.default_url.clone(),
        }
    }

    async fn fetch_instances(&self) -> Result<Vec<CobaltApiInstance>, reqwest::Error> {
        self.http_client
            .get(&self.instances_url)
            .timeout(API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Ask the current instance for an MP3 stream URL.
    pub async fn stream_url(&self, youtube_url: &str) -> Option<String> {
        let instance = self.current_instance();
        let response = self
            .http_client
            .post(format!("{}/api/json", instance))
            .header(header::ACCEPT, "application/json")
            .timeout(API_TIMEOUT)
            .json(&StreamRequest {
                is_audio_only: true,
                url: youtube_url,
                a_format: "mp3",
            })
            .send()
            .await
            .ok()?;

        let status = response.status();
        let body = response.text().await.ok()?;
        if !status.is_success() {
            self.reporter
                .report(&format!("Got a weird response from {}: {}", instance, body))
                .await;
            return None;
        }

        let Ok(parsed) = serde_json::from_str::<StreamResponse>(&body) else {
            self.reporter
                .report(&format!("Got unsupported json from {}: {}", instance, body))
                .await;
            return None;
        };

        match (parsed.status.as_deref(), parsed.url) {
            (Some("error") | Some("rate-limit") | None, _) | (_, None) => {
                self.reporter
                    .report(&format!("Got an error/ratelimit from {}: {}", instance, body))
                    .await;
                None
            }
            (_, Some(url)) => Some(url),
        }
    }

    pub async fn download_mp3(&self, youtube_url: &str) -> Result<Vec<u8>, StrategyError> {
        for attempt in 1..=self.attempts {
            let Some(stream) = self.stream_url(youtube_url).await else {
                self.re_roll(false).await;
                continue;
            };

            let audio = match self.fetch(&stream).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(attempt, "Cobalt stream download failed: {}", e);
                    Vec::new()
                }
            };
            if is_mp3(&audio) {
                return Ok(audio);
            }

            tracing::warn!(instance = %self.current_instance(), "Cobalt served a non-MP3 body, banning instance");
            self.re_roll(true).await;
        }

        Err(StrategyError::Tool(format!(
            "no Cobalt instance produced audio in {} attempts",
            self.attempts
        )))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self
            .http_client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

pub struct YouTubeStrategy {
    cobalt: Option<CobaltClient>,
    ytdlp: Option<Arc<YtDlp>>,
}

impl YouTubeStrategy {
    pub fn new(cobalt: Option<CobaltClient>, ytdlp: Option<Arc<YtDlp>>) -> Self {
        Self { cobalt, ytdlp }
    }
}

#[async_trait]
impl RetrievalStrategy for YouTubeStrategy {
    fn name(&self) -> &'static str {
        "youtube"
    }

    fn platform(&self) -> PlatformType {
        PlatformType::YouTube
    }

    async fn retrieve(&self, request: RetrievalRequest<'_>) -> Result<RetrievalResult, StrategyError> {
        if let Some(ref cobalt) = self.cobalt {
            match cobalt.download_mp3(request.source_url).await {
                Ok(bytes) => {
                    return Ok(RetrievalResult {
                        bytes,
                        file_extension: "mp3",
                        duration_seconds: None,
                        quality: QualityInfo::mp3(128, 44.1, false),
                        thumbnail_url: None,
                        source_platform: PlatformType::YouTube,
                        title: None,
                        performer: None,
                    });
                }
                Err(e) => tracing::debug!(identity = %request.identity, "Cobalt failed: {}", e),
            }
        }

        match self.ytdlp {
            Some(ref ytdlp) => Ok(ytdlp
                .extract_mp3(request.source_url)
                .await?
                .into_result(PlatformType::YouTube)),
            None => Err(StrategyError::Tool("no YouTube extractor available".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_instance(api: &str, score: u32, youtube: bool, online: bool) -> CobaltApiInstance {
        CobaltApiInstance {
            api_online: online,
            services: HashMap::from([("youtube".to_string(), youtube)]),
            score,
            protocol: "https".to_string(),
            api: api.to_string(),
        }
    }

    #[test]
    fn test_pick_instance_filters_unhealthy_and_banned() {
        let instances = vec![
            create_test_instance("low.example", 80, true, true),
            create_test_instance("noyt.example", 100, false, true),
            create_test_instance("down.example", 100, true, false),
            create_test_instance("banned.example", 100, true, true),
            create_test_instance("current.example", 100, true, true),
            create_test_instance("good.example", 100, true, true),
        ];
        let banned = HashSet::from(["https://banned.example".to_string()]);

        for _ in 0..20 {
            assert_eq!(
                pick_instance(&instances, &banned, "https://current.example").as_deref(),
                Some("https://good.example")
            );
        }
    }

    #[test]
    fn test_pick_instance_none_available() {
        let instances = vec![create_test_instance("current.example", 100, true, true)];
        assert_eq!(
            pick_instance(&instances, &HashSet::new(), "https://current.example"),
            None
        );
        assert_eq!(pick_instance(&[], &HashSet::new(), "x"), None);
    }

    #[test]
    fn test_instance_list_parses() {
        let body = r#"[{"api_online":true,"cors":1,"services":{"youtube":true,"tiktok":false},
            "score":100,"protocol":"https","name":"x","api":"cobalt.example.org","version":"7"}]"#;
        let instances: Vec<CobaltApiInstance> = serde_json::from_str(body).unwrap();
        assert!(instances[0].is_healthy());
        assert_eq!(instances[0].url(), "https://cobalt.example.org");
    }

    #[test]
    fn test_stream_request_shape() {
        let json = serde_json::to_value(StreamRequest {
            is_audio_only: true,
            url: "https://youtu.be/x",
            a_format: "mp3",
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"isAudioOnly": true, "url": "https://youtu.be/x", "aFormat": "mp3"})
        );
    }
}
