//! Wires configured components into a ready [`CachePublisher`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client as HttpClient;

use crate::blob::LocalBlobStore;
use crate::config::Config;
use crate::platform::{LastFmPlatform, PlatformRegistry, SpotifyPlatform};
use crate::publish::{CachePublisher, UploadPolicy};
use crate::reporter::{Reporter, TracingReporter, WebhookReporter};
use crate::retrieval::{
    CobaltClient, DeezerStrategy, RetrievalChain, RetrievalStrategy, SoundCloudStrategy, YouTubeStrategy, YtDlp,
};
use crate::song_link::{LastFmPageLinks, OdesliClient, SongLinkResolver};
use crate::store::{RedbStorage, Storage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct App {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub publisher: CachePublisher,
    strategies: Vec<&'static str>,
    init_errors: BTreeMap<&'static str, String>,
}

impl App {
    pub fn from_config(config: Config) -> Result<Self> {
        let http_client = build_http_client()?;
        let reporter = build_reporter(&config, &http_client);

        let storage_path = config.storage_path()?;
        let storage: Arc<dyn Storage> = Arc::new(
            RedbStorage::open(&storage_path)
                .with_context(|| format!("Failed to open store at {}", storage_path.display()))?,
        );
        tracing::info!(backend = storage.backend_name(), path = %storage_path.display(), "Store ready");

        let blob_dir = config.blob_dir()?;
        let blob = Arc::new(LocalBlobStore::new(blob_dir, config.blob.max_upload_bytes));

        let resolver = Arc::new(
            SongLinkResolver::new(
                Arc::new(OdesliClient::new(http_client.clone(), &config.song_link.odesli_base_url)),
                Arc::clone(&storage),
                Arc::clone(&reporter),
                config.song_link.allow_fallback,
                config.song_link.memo_capacity,
            )
            .with_live_links(Arc::new(LastFmPageLinks::new(http_client.clone()))),
        );

        let (chain, init_errors) = build_chain(&config, &http_client, &reporter);
        let strategies = chain.strategy_names();
        for (strategy, error) in &init_errors {
            tracing::warn!(strategy, "Retrieval strategy unavailable: {}", error);
        }
        tracing::info!(?strategies, "Retrieval chain ready");

        let platforms = build_platforms(&config, &http_client, &storage);

        let publisher = CachePublisher::new(
            Arc::clone(&storage),
            blob,
            resolver,
            chain,
            platforms,
            reporter,
            UploadPolicy::from(&config.upload),
        );

        Ok(Self {
            config,
            storage,
            publisher,
            strategies,
            init_errors,
        })
    }

    pub fn strategies(&self) -> &[&'static str] {
        &self.strategies
    }

    pub fn init_errors(&self) -> &BTreeMap<&'static str, String> {
        &self.init_errors
    }
}

fn build_http_client() -> Result<HttpClient> {
    HttpClient::builder()
        .user_agent(concat!("songvault/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

fn build_reporter(config: &Config, http_client: &HttpClient) -> Arc<dyn Reporter> {
    match config.reporting.webhook_url {
        Some(ref url) if !url.is_empty() => Arc::new(WebhookReporter::new(http_client.clone(), url.clone())),
        _ => Arc::new(TracingReporter),
    }
}

/// Strategies in priority order: Deezer, SoundCloud, YouTube. Strategies
/// that cannot run with this config or host are left out and explained.
pub fn build_chain(
    config: &Config,
    http_client: &HttpClient,
    reporter: &Arc<dyn Reporter>,
) -> (RetrievalChain, BTreeMap<&'static str, String>) {
    let mut strategies: Vec<Arc<dyn RetrievalStrategy>> = Vec::new();
    let mut init_errors = BTreeMap::new();

    match config.deezer.arl_cookie {
        Some(ref cookie) if !cookie.is_empty() => strategies.push(Arc::new(DeezerStrategy::new(
            http_client.clone(),
            cookie.clone(),
            Arc::clone(reporter),
        ))),
        _ => {
            init_errors.insert("deezer", "no arl session cookie configured".to_string());
        }
    }

    let ytdlp = match YtDlp::locate(
        config.youtube.ytdlp_path.as_deref(),
        config.youtube.cookies_path.as_ref().map(PathBuf::from),
    ) {
        Ok(ytdlp) => Some(Arc::new(ytdlp)),
        Err(e) => {
            init_errors.insert("yt-dlp", e.to_string());
            None
        }
    };

    if config.soundcloud.enabled {
        match ytdlp {
            Some(ref ytdlp) => strategies.push(Arc::new(SoundCloudStrategy::new(Arc::clone(ytdlp)))),
            None => {
                init_errors.insert("soundcloud", "requires yt-dlp".to_string());
            }
        }
    }

    let cobalt = CobaltClient::new(
        http_client.clone(),
        config.youtube.cobalt_url.clone(),
        config.youtube.cobalt_instances_url.clone(),
        config.youtube.cobalt_attempts,
        Arc::clone(reporter),
    );
    strategies.push(Arc::new(YouTubeStrategy::new(Some(cobalt), ytdlp)));

    (RetrievalChain::new(strategies), init_errors)
}

fn build_platforms(config: &Config, http_client: &HttpClient, storage: &Arc<dyn Storage>) -> PlatformRegistry {
    let mut platforms = PlatformRegistry::new();
    if !config.spotify.client_id.is_empty() {
        platforms.register(Arc::new(SpotifyPlatform::new(
            http_client.clone(),
            config.spotify.client_id.clone(),
            config.spotify.client_secret.clone(),
            Arc::clone(storage),
        )));
    } else {
        tracing::info!("Spotify client id not configured, Spotify tracks are unavailable");
    }
    if !config.lastfm.api_key.is_empty() {
        platforms.register(Arc::new(LastFmPlatform::new(
            http_client.clone(),
            config.lastfm.api_key.clone(),
            config.lastfm.shared_secret.clone(),
            Arc::clone(storage),
        )));
    } else {
        tracing::info!("Last.fm api key not configured, Last.fm tracks are unavailable");
    }
    platforms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PlatformType;

    fn reporter() -> Arc<dyn Reporter> {
        Arc::new(TracingReporter)
    }

    #[test]
    fn test_chain_without_deezer_cookie() {
        let config = Config::default();
        let (chain, errors) = build_chain(&config, &HttpClient::new(), &reporter());

        let names = chain.strategy_names();
        assert!(!names.contains(&"deezer"));
        assert_eq!(names.last(), Some(&"youtube"));
        assert!(errors.contains_key("deezer"));
    }

    #[test]
    fn test_chain_priority_order() {
        let mut config = Config::default();
        config.deezer.arl_cookie = Some("arl".to_string());
        config.soundcloud.enabled = false;
        let (chain, _) = build_chain(&config, &HttpClient::new(), &reporter());

        assert_eq!(chain.strategy_names(), vec!["deezer", "youtube"]);
    }

    #[test]
    fn test_platforms_follow_credentials() {
        let storage: Arc<dyn Storage> = Arc::new(crate::store::MemoryStorage::new());
        let mut config = Config::default();
        assert!(build_platforms(&config, &HttpClient::new(), &storage).platforms().is_empty());

        config.spotify.client_id = "id".to_string();
        config.lastfm.api_key = "key".to_string();
        assert_eq!(
            build_platforms(&config, &HttpClient::new(), &storage).platforms(),
            vec![PlatformType::Spotify, PlatformType::LastFm]
        );
    }

    #[test]
    fn test_app_opens_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = Some(dir.path().join("db.redb").display().to_string());
        config.blob.dir = Some(dir.path().join("blobs").display().to_string());

        let app = App::from_config(config).unwrap();
        assert_eq!(app.storage.backend_name(), "redb");
        assert_eq!(app.strategies().last(), Some(&"youtube"));
        assert!(app.init_errors().contains_key("deezer"));
    }
}
