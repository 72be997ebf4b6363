//! External listing links scraped from Last.fm track pages.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client as HttpClient};
use scraper::{Html, Selector};

use super::LiveLinkSource;

const PAGE_ATTEMPTS: u32 = 5;
const PAGE_TIMEOUT: Duration = Duration::from_secs(5);
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0";

pub struct LastFmPageLinks {
    http_client: HttpClient,
}

impl LastFmPageLinks {
    pub fn new(http_client: HttpClient) -> Self {
        Self { http_client }
    }

    async fn fetch_page(&self, page_url: &str) -> Result<String> {
        let mut last_error = None;
        for _ in 0..PAGE_ATTEMPTS {
            let sent = self
                .http_client
                .get(page_url)
                .header(header::USER_AGENT, BROWSER_USER_AGENT)
                .header(header::ACCEPT, "text/html,application/xhtml+xml")
                .timeout(PAGE_TIMEOUT)
                .send()
                .await;
            match sent {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(anyhow!("last.fm answered {} for {}", status, page_url));
                    }
                    return response.text().await.context("Failed to read last.fm page");
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(anyhow!(
            "last.fm page {} unreachable: {}",
            page_url,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

#[async_trait]
impl LiveLinkSource for LastFmPageLinks {
    async fn external_links(&self, page_url: &str) -> Result<Vec<String>> {
        let html = self.fetch_page(page_url).await?;
        extract_play_links(&html)
    }
}

/// Sort rank: Spotify, Apple, everything else, YouTube last.
fn link_rank(link: &str) -> u8 {
    if link.contains("spotify.com") {
        0
    } else if link.contains("apple.com") {
        1
    } else if link.contains("youtube.com") {
        3
    } else {
        2
    }
}

pub fn extract_play_links(html: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("ul.play-this-track-playlinks a[href]")
        .map_err(|e| anyhow!("bad selector: {e}"))?;

    let mut links: Vec<String> = Vec::new();
    for href in document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.starts_with("https://"))
    {
        if !links.iter().any(|l| l == href) {
            links.push(href.to_string());
        }
    }
    links.sort_by_key(|l| link_rank(l));
    Ok(links)
}
