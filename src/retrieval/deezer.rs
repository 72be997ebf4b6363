//! Deezer decrypt-and-remux strategy.
//!
//! The public track page carries the stream parameters inside an inline
//! `{"DATA": ...}` state blob when fetched with a logged-in `arl` cookie.
//! Those parameters give the stream URL key and the Blowfish key for the
//! striped stream; the decrypted MP3 gets wrapped in ID3v2/ID3v1.1 tags.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client as HttpClient, StatusCode};
use scraper::{Html, Selector};
use serde::{Deserialize, Deserializer};

use super::crypto::{self, StripeDecryptor};
use super::tags::{self, TrackTags};
use super::{QualityInfo, RetrievalRequest, RetrievalResult, RetrievalStrategy};
use crate::error::StrategyError;
use crate::identity::PlatformType;
use crate::reporter::Reporter;

const TRACK_PAGE_URL: &str = "https://www.deezer.com/de/track";
const COVER_URL: &str = "https://e-cdns-images.dzcdn.net/images/cover";
const STATE_MARKER: &str = "{\"DATA\":";
const AUTH_MARKER: &str = "MD5_ORIGIN";

/// Stream format ids understood by the CDN.
const FORMAT_MP3_320: u8 = 3;
const FORMAT_MP3_256: u8 = 5;
const FORMAT_MP3_128: u8 = 1;

/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOC: usize = 32 * 1024 * 1024;

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

fn opt_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// The subset of the page state needed to stream and tag a track.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeezerTrackData {
    #[serde(deserialize_with = "string_or_number")]
    pub sng_id: String,
    pub md5_origin: String,
    #[serde(deserialize_with = "string_or_number")]
    pub media_version: String,
    #[serde(default)]
    pub sng_title: String,
    #[serde(default)]
    pub art_name: String,
    #[serde(default)]
    pub alb_title: String,
    #[serde(default)]
    pub alb_picture: Option<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub track_number: Option<u64>,
    #[serde(default, deserialize_with = "opt_number")]
    pub disk_number: Option<u64>,
    #[serde(default, deserialize_with = "opt_number")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub physical_release_date: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub label_name: Option<String>,
    #[serde(default, deserialize_with = "opt_number")]
    pub filesize_mp3_320: Option<u64>,
    #[serde(default, deserialize_with = "opt_number")]
    pub filesize_mp3_256: Option<u64>,
}

impl DeezerTrackData {
    /// Best MP3 format the track advertises a nonzero file size for.
    pub fn format(&self) -> u8 {
        if self.filesize_mp3_320.unwrap_or(0) > 0 {
            FORMAT_MP3_320
        } else if self.filesize_mp3_256.unwrap_or(0) > 0 {
            FORMAT_MP3_256
        } else {
            FORMAT_MP3_128
        }
    }

    pub fn quality(&self) -> QualityInfo {
        let format = self.format();
        let bitrate = match format {
            FORMAT_MP3_320 => 320,
            FORMAT_MP3_256 => 256,
            _ => 128,
        };
        QualityInfo::mp3(bitrate, 44.1, format == FORMAT_MP3_320)
    }

    pub fn stream_url(&self) -> anyhow::Result<String> {
        let key = crypto::stream_url_key(
            &self.md5_origin,
            self.format(),
            &self.sng_id,
            &self.media_version,
        );
        crypto::stream_url(&self.md5_origin, &key)
    }

    pub fn cover_url(&self) -> Option<String> {
        self.alb_picture
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/{}/1200x1200.jpg", COVER_URL, p))
    }

    fn tags(&self, cover_jpeg: Option<Vec<u8>>) -> TrackTags {
        TrackTags {
            title: self.sng_title.clone(),
            artist: self.art_name.clone(),
            album: self.alb_title.clone(),
            track_number: self.track_number.and_then(|n| u32::try_from(n).ok()),
            disc_number: self.disk_number.and_then(|n| u32::try_from(n).ok()),
            release_date: self.physical_release_date.clone(),
            duration_seconds: self.duration.and_then(|n| u32::try_from(n).ok()),
            isrc: self.isrc.clone(),
            publisher: self.label_name.clone(),
            cover_jpeg,
        }
    }
}

/// Pull the `DATA` object out of the first inline script carrying the state
/// blob. The blob is usually followed by more script text, so it is read as
/// the first JSON value of a stream rather than a whole document.
pub fn extract_track_data(html: &str) -> anyhow::Result<DeezerTrackData> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script").map_err(|e| anyhow!("bad selector: {e}"))?;

    for script in document.select(&selector) {
        let text: String = script.text().collect();
        let Some(start) = text.find(STATE_MARKER) else {
            continue;
        };
        let mut values =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        let state = values
            .next()
            .ok_or_else(|| anyhow!("empty Deezer page state"))?
            .context("Malformed Deezer page state")?;
        let data = state
            .get("DATA")
            .cloned()
            .ok_or_else(|| anyhow!("Deezer page state has no DATA"))?;
        return serde_json::from_value(data).context("Unexpected Deezer track data");
    }

    Err(anyhow!("no Deezer page state found"))
}

/// Buffer to reserve for a stream announcing `content_length` bytes.
fn capacity_hint(content_length: Option<u64>) -> usize {
    content_length
        .and_then(|len| usize::try_from(len).ok())
        .unwrap_or(0)
        .min(MAX_PREALLOC)
}

/// Track id from a Deezer URL such as `https://www.deezer.com/track/3135556`.
fn track_id_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/').find(|s| !s.is_empty())
}

pub struct DeezerStrategy {
    http_client: HttpClient,
    arl_cookie: String,
    reporter: Arc<dyn Reporter>,
}

impl DeezerStrategy {
    pub fn new(http_client: HttpClient, arl_cookie: String, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            http_client,
            arl_cookie,
            reporter,
        }
    }

    fn cookie(&self) -> String {
        format!("arl={}; comeback=1", self.arl_cookie)
    }

    async fn fetch_track_data(&self, track_id: &str) -> Result<DeezerTrackData, StrategyError> {
        let response = self
            .http_client
            .get(format!("{}/{}", TRACK_PAGE_URL, track_id))
            .header(header::COOKIE, self.cookie())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StrategyError::NotFound),
            status if !status.is_success() => return Err(StrategyError::Status(status)),
            _ => {}
        }

        let body = response.text().await?;
        if !body.contains(AUTH_MARKER) {
            self.reporter
                .report("Deezer arl cookie is no longer logged in, update deezer.arl_cookie")
                .await;
            return Err(StrategyError::Unauthenticated);
        }

        Ok(extract_track_data(&body)?)
    }

    async fn fetch_cover(&self, data: &DeezerTrackData) -> Option<Vec<u8>> {
        let url = data.cover_url()?;
        let response = match self.http_client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::debug!(url = %url, status = %resp.status(), "No Deezer cover art");
                return None;
            }
            Err(e) => {
                tracing::debug!(url = %url, "Deezer cover art request failed: {}", e);
                return None;
            }
        };
        response.bytes().await.ok().map(|b| b.to_vec())
    }

    async fn download_decrypted(&self, data: &DeezerTrackData) -> Result<Vec<u8>, StrategyError> {
        let url = data.stream_url()?;
        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StrategyError::Status(response.status()));
        }

        let mut out = Vec::with_capacity(capacity_hint(response.content_length()));
        let mut decryptor = StripeDecryptor::new(&crypto::track_key(&data.sng_id))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            decryptor.update(&chunk?, &mut out);
        }
        decryptor.finish(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl RetrievalStrategy for DeezerStrategy {
    fn name(&self) -> &'static str {
        "deezer"
    }

    fn platform(&self) -> PlatformType {
        PlatformType::Deezer
    }

    async fn retrieve(&self, request: RetrievalRequest<'_>) -> Result<RetrievalResult, StrategyError> {
        let track_id = track_id_from_url(request.source_url).ok_or(StrategyError::NotFound)?;
        let data = self.fetch_track_data(track_id).await?;

        let audio = self.download_decrypted(&data).await?;
        if audio.is_empty() {
            return Err(StrategyError::Empty);
        }

        let cover = self.fetch_cover(&data).await;
        let track_tags = data.tags(cover);
        let header = tags::id3v2(&track_tags)?;
        let trailer = tags::id3v1_1(&track_tags);

        let mut bytes = Vec::with_capacity(header.len() + audio.len() + trailer.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&audio);
        bytes.extend_from_slice(&trailer);

        Ok(RetrievalResult {
            bytes,
            file_extension: "mp3",
            duration_seconds: track_tags.duration_seconds,
            quality: data.quality(),
            thumbnail_url: data.cover_url(),
            source_platform: PlatformType::Deezer,
            title: Some(data.sng_title.clone()),
            performer: Some(data.art_name.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <script>window.dataLayer = [];</script>
        <script>window.__DZR_APP_STATE__ = {"DATA":{"__TYPE__":"song","SNG_ID":"3135556","MD5_ORIGIN":"a1b2c3d4e5f60718293a4b5c6d7e8f90","MEDIA_VERSION":"8","SNG_TITLE":"Harder, Better, Faster, Stronger","ART_NAME":"Daft Punk","ALB_TITLE":"Discovery","ALB_PICTURE":"2e018122cb56986277102d2041a592c8","TRACK_NUMBER":"4","DISK_NUMBER":1,"DURATION":"224","PHYSICAL_RELEASE_DATE":"2001-03-07","ISRC":"GBDUW0000059","FILESIZE_MP3_320":"8962463","FILESIZE_MP3_256":0},"SONGS":{"data":[]}}; window.__DZR_FLAGS__ = {};</script>
        </head><body></body></html>"#;

    #[test]
    fn test_extract_track_data() {
        let data = extract_track_data(PAGE).unwrap();
        assert_eq!(data.sng_id, "3135556");
        assert_eq!(data.media_version, "8");
        assert_eq!(data.art_name, "Daft Punk");
        assert_eq!(data.track_number, Some(4));
        assert_eq!(data.disk_number, Some(1));
        assert_eq!(data.duration, Some(224));
        assert_eq!(data.format(), FORMAT_MP3_320);
        assert!(data.quality().highest_available);
        assert_eq!(
            data.cover_url().as_deref(),
            Some("https://e-cdns-images.dzcdn.net/images/cover/2e018122cb56986277102d2041a592c8/1200x1200.jpg")
        );
        assert!(data
            .stream_url()
            .unwrap()
            .starts_with("https://e-cdns-proxy-a.dzcdn.net/mobile/1/544ff65f"));
    }

    #[test]
    fn test_numeric_ids_are_accepted() {
        let page = r#"<script>var s = {"DATA":{"SNG_ID":3135556,"MD5_ORIGIN":"abc","MEDIA_VERSION":4}}</script>"#;
        let data = extract_track_data(page).unwrap();
        assert_eq!(data.sng_id, "3135556");
        assert_eq!(data.media_version, "4");
        assert_eq!(data.format(), FORMAT_MP3_128);
        assert_eq!(data.quality().bitrate_kbps, 128);
    }

    #[test]
    fn test_format_falls_back_to_256() {
        let page = r#"<script>{"DATA":{"SNG_ID":"1","MD5_ORIGIN":"abc","MEDIA_VERSION":"1","FILESIZE_MP3_320":"0","FILESIZE_MP3_256":"123"}}</script>"#;
        let data = extract_track_data(page).unwrap();
        assert_eq!(data.format(), FORMAT_MP3_256);
        assert!(!data.quality().highest_available);
    }

    #[test]
    fn test_missing_state() {
        assert!(extract_track_data("<script>var x = 1;</script>").is_err());
    }

    #[test]
    fn test_label_becomes_publisher() {
        let page = r#"<script>{"DATA":{"SNG_ID":"1","MD5_ORIGIN":"abc","MEDIA_VERSION":"1","SNG_TITLE":"One More Time","LABEL_NAME":"Parlophone"}}</script>"#;
        let data = extract_track_data(page).unwrap();
        let track_tags = data.tags(None);
        assert_eq!(track_tags.publisher.as_deref(), Some("Parlophone"));

        let trailer = tags::id3v1_1(&track_tags);
        assert_eq!(&trailer[97..107], b"Parlophone");
        assert!(extract_track_data(PAGE).unwrap().tags(None).publisher.is_none());
    }

    #[test]
    fn test_capacity_hint_is_bounded() {
        assert_eq!(capacity_hint(None), 0);
        assert_eq!(capacity_hint(Some(8_962_463)), 8_962_463);
        assert_eq!(capacity_hint(Some(u64::MAX)), MAX_PREALLOC);
    }

    #[test]
    fn test_track_id_from_url() {
        assert_eq!(track_id_from_url("https://www.deezer.com/track/3135556"), Some("3135556"));
        assert_eq!(
            track_id_from_url("https://www.deezer.com/en/track/3135556?utm_source=x"),
            Some("3135556")
        );
        assert_eq!(track_id_from_url("https://www.deezer.com/track/1/"), Some("1"));
    }
}
