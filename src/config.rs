use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::retrieval::youtube::{DEFAULT_COBALT_URL, DEFAULT_INSTANCES_URL};
use crate::song_link::odesli;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub blob: BlobConfig,
    pub upload: UploadConfig,
    pub song_link: SongLinkConfig,
    pub deezer: DeezerConfig,
    pub youtube: YouTubeConfig,
    pub soundcloud: SoundCloudConfig,
    pub spotify: SpotifyConfig,
    pub lastfm: LastFmConfig,
    pub reporting: ReportingConfig,
}

/// Persistent store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb database file (empty = default data dir)
    pub path: Option<String>,
}

/// Local blob store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Directory holding published artifacts (empty = default data dir)
    pub dir: Option<String>,
    /// Largest artifact the store accepts, in bytes
    pub max_upload_bytes: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Upload retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Total upload attempts, including the first
    pub attempts: u32,
    /// Backoff step; attempt N waits N * backoff_ms
    pub backoff_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Song link resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SongLinkConfig {
    /// Use the song.link resolve API when no structural parser matches
    pub allow_fallback: bool,
    /// Entries in the in-process resolution memo
    pub memo_capacity: usize,
    pub odesli_base_url: String,
}

impl Default for SongLinkConfig {
    fn default() -> Self {
        Self {
            allow_fallback: true,
            memo_capacity: 1024,
            odesli_base_url: odesli::DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Deezer strategy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeezerConfig {
    /// Logged-in `arl` session cookie; the strategy is disabled without it
    pub arl_cookie: Option<String>,
}

/// YouTube strategy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeConfig {
    /// Cobalt instance used until a re-roll picks another one
    pub cobalt_url: String,
    /// Public instance list used for re-rolls
    pub cobalt_instances_url: String,
    pub cobalt_attempts: u32,
    /// yt-dlp binary (empty = look up in PATH)
    pub ytdlp_path: Option<String>,
    /// Netscape cookie file passed to yt-dlp
    pub cookies_path: Option<String>,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            cobalt_url: DEFAULT_COBALT_URL.to_string(),
            cobalt_instances_url: DEFAULT_INSTANCES_URL.to_string(),
            cobalt_attempts: 3,
            ytdlp_path: None,
            cookies_path: None,
        }
    }
}

/// SoundCloud strategy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundCloudConfig {
    pub enabled: bool,
}

impl Default for SoundCloudConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Spotify app credentials, used to refresh user tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Last.fm app credentials, used to sign user requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LastFmConfig {
    pub api_key: String,
    pub shared_secret: String,
}

/// Operator channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// JSON webhook receiving error reports (empty = log only)
    pub webhook_url: Option<String>,
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("songvault");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default path, creating it if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            // Create default config and save it
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    pub fn storage_path(&self) -> Result<PathBuf> {
        match self.storage.path {
            Some(ref path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => crate::store::RedbStorage::default_path(),
        }
    }

    pub fn blob_dir(&self) -> Result<PathBuf> {
        match self.blob.dir {
            Some(ref dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => Ok(dirs::data_dir()
                .context("Failed to get data directory")?
                .join("songvault")
                .join("blobs")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.upload.attempts, 3);
        assert_eq!(config.upload.backoff_ms, 500);
        assert_eq!(config.blob.max_upload_bytes, 50 * 1024 * 1024);
        assert!(config.song_link.allow_fallback);
        assert_eq!(config.song_link.odesli_base_url, "https://api.odesli.co");
        assert_eq!(config.youtube.cobalt_attempts, 3);
        assert!(config.soundcloud.enabled);
        assert!(config.deezer.arl_cookie.is_none());
        assert!(config.reporting.webhook_url.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[deezer]
arl_cookie = "abc123"

[upload]
attempts = 5
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        // Custom values
        assert_eq!(config.deezer.arl_cookie.as_deref(), Some("abc123"));
        assert_eq!(config.upload.attempts, 5);
        // Default values
        assert_eq!(config.upload.backoff_ms, 500);
        assert_eq!(config.song_link.memo_capacity, 1024);
        assert_eq!(config.youtube.cobalt_url, "https://api.cobalt.tools");
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[storage]
path = "/var/lib/songvault/db.redb"

[blob]
dir = "/srv/blobs"
max_upload_bytes = 1000

[upload]
attempts = 2
backoff_ms = 0

[song_link]
allow_fallback = false
memo_capacity = 8
odesli_base_url = "http://localhost:9000"

[youtube]
cobalt_url = "https://cobalt.example"
cobalt_instances_url = "https://instances.example/list.json"
cobalt_attempts = 1
ytdlp_path = "/usr/bin/yt-dlp"
cookies_path = "/etc/yt-cookies.txt"

[soundcloud]
enabled = false

[spotify]
client_id = "id"
client_secret = "secret"

[lastfm]
api_key = "key"
shared_secret = "shh"

[reporting]
webhook_url = "https://hooks.example/abc"
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.storage_path().unwrap(), PathBuf::from("/var/lib/songvault/db.redb"));
        assert_eq!(config.blob_dir().unwrap(), PathBuf::from("/srv/blobs"));
        assert_eq!(config.blob.max_upload_bytes, 1000);
        assert_eq!(config.upload.attempts, 2);
        assert_eq!(config.upload.backoff_ms, 0);
        assert!(!config.song_link.allow_fallback);
        assert_eq!(config.song_link.memo_capacity, 8);
        assert_eq!(config.youtube.cobalt_attempts, 1);
        assert_eq!(config.youtube.ytdlp_path.as_deref(), Some("/usr/bin/yt-dlp"));
        assert!(!config.soundcloud.enabled);
        assert_eq!(config.spotify.client_secret, "secret");
        assert_eq!(config.lastfm.api_key, "key");
        assert_eq!(config.lastfm.shared_secret, "shh");
        assert_eq!(config.reporting.webhook_url.as_deref(), Some("https://hooks.example/abc"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.upload.attempts, 3);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.youtube.cobalt_url, config.youtube.cobalt_url);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_with_unknown_fields_is_ignored() {
        let toml_with_extra = r#"
[upload]
attempts = 3
unknown_field = "should be ignored"

[unknown_section]
foo = "bar"
"#;

        let result: Result<Config, _> = toml::from_str(toml_with_extra);
        assert!(result.is_ok());
    }
}
