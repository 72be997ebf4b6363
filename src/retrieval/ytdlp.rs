use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tokio::process::Command;

use super::{QualityInfo, RetrievalResult};
use crate::error::StrategyError;
use crate::identity::PlatformType;

/// Metadata yt-dlp prints for the extracted entry.
#[derive(Debug, Default, Deserialize)]
pub struct ExtractedInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub artist: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub abr: Option<f64>,
    pub asr: Option<u32>,
}

pub struct Extracted {
    pub bytes: Vec<u8>,
    pub info: ExtractedInfo,
}

impl Extracted {
    pub fn into_result(self, source_platform: PlatformType) -> RetrievalResult {
        let info = self.info;
        let sample_rate_khz = info.asr.map(|hz| hz as f32 / 1000.0).unwrap_or(44.1);
        // The postprocessor re-encodes at 320K no matter what the source was.
        let highest_available = info.abr.map(|abr| abr >= 256.0).unwrap_or(false);
        RetrievalResult {
            bytes: self.bytes,
            file_extension: "mp3",
            duration_seconds: info.duration.map(|d| d.round() as u32),
            quality: QualityInfo::mp3(320, sample_rate_khz, highest_available),
            thumbnail_url: info.thumbnail,
            source_platform,
            title: info.title,
            performer: info.artist.or(info.uploader),
        }
    }
}

/// yt-dlp driven as a black box, extracting MP3 through its ffmpeg
/// postprocessor into a scratch directory.
pub struct YtDlp {
    ytdlp_path: PathBuf,
    cookies_path: Option<PathBuf>,
    scratch_root: PathBuf,
}

impl YtDlp {
    /// Locate yt-dlp (configured path or PATH) and ffmpeg.
    pub fn locate(ytdlp_path: Option<&str>, cookies_path: Option<PathBuf>) -> Result<Self> {
        let ytdlp_path = match ytdlp_path {
            Some(path) => PathBuf::from(path),
            None => which::which("yt-dlp").map_err(|_| {
                anyhow!("yt-dlp not found in PATH. Install via: pip install yt-dlp")
            })?,
        };
        which::which("ffmpeg")
            .map_err(|_| anyhow!("ffmpeg not found in PATH, yt-dlp cannot extract MP3"))?;

        Ok(Self {
            ytdlp_path,
            cookies_path,
            scratch_root: std::env::temp_dir(),
        })
    }

    fn scratch_dir(&self) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        self.scratch_root
            .join(format!("songvault-ytdlp-{}-{}", std::process::id(), n))
    }

    fn args(&self, url: &str, output_template: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-f",
            "bestaudio/best",
            "--geo-bypass",
            "--no-check-certificates",
            "--no-playlist",
            "--no-warnings",
            "-x",
            "--audio-format",
            "mp3",
            "--audio-quality",
            "320K",
            "-j",
            "--no-simulate",
            "-o",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(output_template.to_string_lossy().into_owned());
        if let Some(ref cookies) = self.cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args.push(url.to_string());
        args
    }

    pub async fn extract_mp3(&self, url: &str) -> Result<Extracted, StrategyError> {
        let dir = self.scratch_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow!("failed to create {}: {}", dir.display(), e))?;

        let result = self.extract_into(url, &dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(dir = %dir.display(), "Failed to clean yt-dlp scratch dir: {}", e);
        }
        result
    }

    async fn extract_into(&self, url: &str, dir: &Path) -> Result<Extracted, StrategyError> {
        let output = Command::new(&self.ytdlp_path)
            .args(self.args(url, &dir.join("audio.%(ext)s")))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StrategyError::Tool(format!("failed to run yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrategyError::Tool(format!("yt-dlp failed: {}", stderr.trim())));
        }

        let info = String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| serde_json::from_str::<ExtractedInfo>(line).ok())
            .unwrap_or_default();

        let bytes = tokio::fs::read(dir.join("audio.mp3"))
            .await
            .map_err(|e| StrategyError::Tool(format!("yt-dlp produced no mp3: {}", e)))?;
        if bytes.is_empty() {
            return Err(StrategyError::Empty);
        }

        Ok(Extracted { bytes, info })
    }
}
