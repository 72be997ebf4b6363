use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::{CanonicalSongLink, ResolvedEntity, SongLinkApi, SongLinkInfo};
use crate::identity::PlatformType;

pub const DEFAULT_BASE_URL: &str = "https://api.odesli.co";

/// song.link (Odesli) HTTP API.
pub struct OdesliClient {
    http_client: HttpClient,
    base_url: String,
}

impl OdesliClient {
    pub fn new(http_client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinksResponse {
    entity_unique_id: Option<String>,
    #[serde(default)]
    entities_by_unique_id: HashMap<String, EntityItem>,
    #[serde(default)]
    links_by_platform: HashMap<String, PlatformLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityItem {
    thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformLink {
    url: String,
}

/// Parse the body of a `resolve` answer. A body without an `id` means the
/// service has no entity for the URL.
pub fn parse_resolve_body(body: &str) -> Result<Option<ResolvedEntity>> {
    let value: serde_json::Value =
        serde_json::from_str(body).context("Malformed song link resolve payload")?;
    if value.get("id").is_none() {
        return Ok(None);
    }
    let entity = serde_json::from_value(value).context("Unexpected song link resolve payload")?;
    Ok(Some(entity))
}

fn parse_links_body(body: &str) -> Result<SongLinkInfo> {
    let response: LinksResponse =
        serde_json::from_str(body).context("Malformed song link links payload")?;

    let platforms: BTreeMap<PlatformType, String> = response
        .links_by_platform
        .into_iter()
        .filter_map(|(key, link)| key.parse::<PlatformType>().ok().map(|p| (p, link.url)))
        .collect();

    let thumbnail_url = response
        .entity_unique_id
        .as_ref()
        .and_then(|id| response.entities_by_unique_id.get(id))
        .and_then(|entity| entity.thumbnail_url.clone());

    Ok(SongLinkInfo {
        platforms,
        thumbnail_url,
    })
}

#[async_trait]
impl SongLinkApi for OdesliClient {
    async fn resolve(&self, track_url: &str) -> Result<Option<ResolvedEntity>> {
        let response = self
            .http_client
            .get(format!("{}/resolve", self.base_url))
            .query(&[("url", track_url)])
            .send()
            .await
            .context("Song link resolve request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Song link resolve returned status {}", status));
        }

        let body = response.text().await?;
        parse_resolve_body(&body)
    }

    async fn links(&self, link: &CanonicalSongLink) -> Result<SongLinkInfo> {
        let response = self
            .http_client
            .get(format!("{}/v1-alpha.1/links", self.base_url))
            .query(&[("url", link.url())])
            .send()
            .await
            .context("Song link links request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Song link links returned status {} for {}", status, link));
        }

        let body = response.text().await?;
        parse_links_body(&body)
    }
}
