//! Source resolution for rongyok.com
//!
//! Turns a series URL into a series id, a series id into [`SeriesInfo`], and a
//! series/episode pair into an [`EpisodeDescriptor`] carrying the video URL.
//! The watch page embeds every episode's CDN URL in a JavaScript object, so
//! resolution is regex extraction over the fetched HTML.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::{Client, ClientBuilder};
use tokio::sync::Mutex;

use crate::core::error::{Error, Result};

/// Configuration for the source site and its HTTP client
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Watch page, queried with `?series_id=N[&ep=E]`
    pub watch_url: String,

    /// Referer sent with every request
    pub referer: String,

    /// User agent sent with every request
    pub user_agent: String,

    /// Connection establishment timeout
    pub connect_timeout: Duration,

    /// Maximum wait for any single read from the server
    pub read_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            watch_url: "https://rongyok.com/watch/".to_string(),
            referer: "https://rongyok.com/".to_string(),
            user_agent: format!("rongyok-dl/{}", env!("RONGYOK_DL_VERSION")),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the HTTP client shared by resolution and transfers
///
/// There is deliberately no overall request timeout: an episode body may take
/// far longer than any fixed bound. Stalls are caught by the read timeout.
pub fn build_client(config: &SourceConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Ok(referer) = HeaderValue::from_str(&config.referer) {
        headers.insert(REFERER, referer);
    }

    ClientBuilder::new()
        .default_headers(headers)
        .user_agent(config.user_agent.clone())
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .build()
        .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {e}")))
}

/// One downloadable episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeDescriptor {
    pub episode: u32,
    pub title: String,
    pub url: String,
}

impl EpisodeDescriptor {
    pub fn new(episode: u32, url: impl Into<String>) -> Self {
        Self {
            episode,
            title: format!("Episode {episode}"),
            url: url.into(),
        }
    }
}

/// What the watch page says about a series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesInfo {
    pub series_id: u64,
    pub title: String,
    pub total_episodes: u32,
    pub poster_url: Option<String>,
    /// Every episode URL found on the series page
    pub episode_urls: BTreeMap<u32, String>,
}

/// Looks up series metadata and per-episode video URLs
#[async_trait]
pub trait EpisodeResolver: Send + Sync {
    /// Fetch (or return cached) information about a series
    async fn series_info(&self, series_id: u64) -> Result<SeriesInfo>;

    /// Resolve one episode; `Ok(None)` when the source has no URL for it
    async fn resolve(&self, series_id: u64, episode: u32) -> Result<Option<EpisodeDescriptor>>;
}

static SERIES_ID_QUERY: Lazy<Regex> = Lazy::new(|| Regex::new(r"series_id=(\d+)").unwrap());
static SERIES_ID_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/series/(\d+)(?:/|$)").unwrap());

static TITLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static TITLE_EPISODE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*-\s*ตอนที่\s*\d+.*$").unwrap());

static META_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());
static META_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)([a-z:_-]+)\s*=\s*["']([^"']*)["']"#).unwrap());

static CDN_NUMERIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?:(?:\\/\\/|//)cdn\.discordapp\.com(?:\\/|/)attachments(?:\\/|/)(\d+)(?:\\/|/)(\d+)(?:\\/|/)(\d+)\.mp4\?[^"'<>\s]+"#)
        .unwrap()
});
static CDN_EP_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?:(?:\\/\\/|//)cdn\.discordapp\.com(?:\\/|/)attachments(?:\\/|/)(\d+)(?:\\/|/)(\d+)(?:\\/|/)EP(\d+)\.mp4\?[^"'<>\s]+"#)
        .unwrap()
});
static JSON_VIDEO_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""video_url"\s*:\s*"(https?:[^"]+\.mp4[^"]*)""#).unwrap());
static URL_EPISODE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[/\\](?:EP)?(\d+)\.mp4").unwrap());

static DESCRIPTION_EPISODES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*ตอน").unwrap());
static EPISODE_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"ตอนที่\s*(\d+)").unwrap());

/// Extract the series id from a rongyok URL
///
/// Accepts `https://rongyok.com/watch/?series_id=941` and
/// `https://rongyok.com/series/941/<title>` (title optionally URL-encoded).
pub fn parse_series_url(url: &str) -> Option<u64> {
    SERIES_ID_QUERY
        .captures(url)
        .or_else(|| SERIES_ID_PATH.captures(url))
        .and_then(|caps| caps[1].parse().ok())
}

/// Undo the JavaScript and HTML escaping found around embedded URLs
fn unescape_url(raw: &str) -> String {
    raw.replace("\\/", "/")
        .replace("\\u0026", "&")
        .replace("&amp;", "&")
}

/// Find every episode video URL embedded in a page
pub fn extract_episode_urls(html: &str) -> BTreeMap<u32, String> {
    let mut urls: BTreeMap<u32, String> = BTreeMap::new();

    // CDN links carry the episode number as the file name; the longest
    // variant keeps the full signed query string
    for pattern in [&*CDN_NUMERIC, &*CDN_EP_PREFIX] {
        for caps in pattern.captures_iter(html) {
            let Ok(episode) = caps[3].parse::<u32>() else {
                continue;
            };
            let url = unescape_url(&caps[0]);
            let keep_existing = urls
                .get(&episode)
                .is_some_and(|existing| existing.len() >= url.len());
            if !keep_existing {
                urls.insert(episode, url);
            }
        }
    }

    // Generic JSON field, only fills gaps
    for caps in JSON_VIDEO_URL.captures_iter(html) {
        let url = unescape_url(&caps[1]);
        let episode = URL_EPISODE_NUMBER
            .captures(&url)
            .and_then(|c| c[1].parse::<u32>().ok());
        if let Some(episode) = episode {
            urls.entry(episode).or_insert(url);
        }
    }

    urls
}

/// `content` of the first `<meta>` tag whose `key` attribute equals `value`
fn meta_content(html: &str, key: &str, value: &str) -> Option<String> {
    META_TAG.find_iter(html).find_map(|tag| {
        let mut matched = false;
        let mut content = None;
        for attr in META_ATTR.captures_iter(tag.as_str()) {
            let name = attr[1].to_ascii_lowercase();
            if name == key && attr[2].eq_ignore_ascii_case(value) {
                matched = true;
            } else if name == "content" {
                content = Some(attr[2].to_string());
            }
        }
        if matched {
            content
        } else {
            None
        }
    })
}

/// Series title from `<title>`, without the trailing episode label
pub fn extract_title(html: &str, series_id: u64) -> String {
    TITLE_TAG
        .captures(html)
        .map(|caps| caps[1].trim().to_string())
        .map(|title| TITLE_EPISODE_SUFFIX.replace(&title, "").trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| format!("Series {series_id}"))
}

/// Episode count when the page has no extractable URLs
pub fn extract_total_episodes(html: &str) -> u32 {
    if let Some(description) = meta_content(html, "name", "description") {
        if let Some(count) = DESCRIPTION_EPISODES
            .captures(&description)
            .and_then(|caps| caps[1].parse().ok())
        {
            return count;
        }
    }

    EPISODE_LABEL
        .captures_iter(html)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .max()
        .unwrap_or(1)
}

/// Build [`SeriesInfo`] from a series watch page
pub fn parse_series_page(series_id: u64, html: &str) -> SeriesInfo {
    let episode_urls = extract_episode_urls(html);
    let total_episodes = if episode_urls.is_empty() {
        extract_total_episodes(html)
    } else {
        episode_urls.len() as u32
    };

    SeriesInfo {
        series_id,
        title: extract_title(html, series_id),
        total_episodes,
        poster_url: meta_content(html, "property", "og:image"),
        episode_urls,
    }
}

/// Direct lookup of one episode's CDN link on its own page
fn find_episode_link(html: &str, episode: u32) -> Option<String> {
    let pattern = format!(
        r#"https://cdn\.discordapp\.com/attachments/\d+/\d+/{episode}\.mp4\?[^"'<>\s\\]+"#
    );
    let regex = Regex::new(&pattern).ok()?;
    regex
        .find(html)
        .map(|m| m.as_str().replace("\\u0026", "&").replace("&amp;", "&"))
}

/// Resolver backed by the rongyok.com watch pages
pub struct RongyokResolver {
    client: Client,
    config: SourceConfig,
    cache: Mutex<HashMap<u64, SeriesInfo>>,
}

impl RongyokResolver {
    /// Create a resolver with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(SourceConfig::default())
    }

    /// Create a resolver with custom configuration
    pub fn with_config(config: SourceConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn fetch_page(&self, query: &[(&str, String)]) -> Result<String> {
        let response = self
            .client
            .get(&self.config.watch_url)
            .query(query)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "th,en-US;q=0.9,en;q=0.8")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl EpisodeResolver for RongyokResolver {
    async fn series_info(&self, series_id: u64) -> Result<SeriesInfo> {
        if let Some(info) = self.cache.lock().await.get(&series_id) {
            return Ok(info.clone());
        }

        let html = self
            .fetch_page(&[("series_id", series_id.to_string())])
            .await?;
        let info = parse_series_page(series_id, &html);
        debug!(
            "Series {series_id}: '{}' with {} episodes ({} URLs found)",
            info.title,
            info.total_episodes,
            info.episode_urls.len()
        );

        self.cache.lock().await.insert(series_id, info.clone());
        Ok(info)
    }

    async fn resolve(&self, series_id: u64, episode: u32) -> Result<Option<EpisodeDescriptor>> {
        match self.series_info(series_id).await {
            Ok(info) => {
                if let Some(url) = info.episode_urls.get(&episode) {
                    return Ok(Some(EpisodeDescriptor::new(episode, url.clone())));
                }
            }
            Err(e) => warn!("Series page for {series_id} unavailable, trying episode page: {e}"),
        }

        let html = self
            .fetch_page(&[
                ("series_id", series_id.to_string()),
                ("ep", episode.to_string()),
            ])
            .await?;

        let url = extract_episode_urls(&html)
            .remove(&episode)
            .or_else(|| find_episode_link(&html, episode));

        if url.is_none() {
            warn!("Could not find video URL for episode {episode}");
        }
        Ok(url.map(|url| EpisodeDescriptor::new(episode, url)))
    }
}
