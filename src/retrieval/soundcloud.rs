use std::sync::Arc;

use async_trait::async_trait;

use super::ytdlp::YtDlp;
use super::{RetrievalRequest, RetrievalResult, RetrievalStrategy};
use crate::error::StrategyError;
use crate::identity::PlatformType;

/// SoundCloud tracks through yt-dlp, which handles both progressive and HLS
/// transcodings.
pub struct SoundCloudStrategy {
    ytdlp: Arc<YtDlp>,
}

impl SoundCloudStrategy {
    pub fn new(ytdlp: Arc<YtDlp>) -> Self {
        Self { ytdlp }
    }
}

#[async_trait]
impl RetrievalStrategy for SoundCloudStrategy {
    fn name(&self) -> &'static str {
        "soundcloud"
    }

    fn platform(&self) -> PlatformType {
        PlatformType::SoundCloud
    }

    async fn retrieve(&self, request: RetrievalRequest<'_>) -> Result<RetrievalResult, StrategyError> {
        tracing::debug!(url = request.source_url, "Downloading from SoundCloud");
        let extracted = self.ytdlp.extract_mp3(request.source_url).await?;
        Ok(extracted.into_result(PlatformType::SoundCloud))
    }
}
