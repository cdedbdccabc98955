//! Media library client.
//!
//! The daemon files finished downloads into a media-center library and asks
//! it what is already owned. The wire protocol is Kodi-style JSON-RPC 2.0
//! (`VideoLibrary.*` methods); `NullLibrary` stands in when no media center
//! is configured, reporting an empty library and accepting every rescan.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// A TV show as the media library knows it.
#[derive(Debug, Clone)]
pub struct LibraryShow {
    pub library_id: i64,
    pub title: String,
    /// Kodi keeps the scraper id in `imdbnumber`; for TV scrapers that is
    /// the tvdb id.
    pub tvdb_id: Option<u32>,
    pub path: Option<String>,
}

/// An episode as the media library knows it.
#[derive(Debug, Clone)]
pub struct LibraryEpisode {
    pub library_id: i64,
    pub show_library_id: i64,
    pub season: u32,
    pub episode: u32,
    pub file: Option<String>,
}

#[async_trait]
pub trait LibraryClient: Send + Sync {
    /// Is the library reachable right now?
    async fn is_available(&self) -> bool;

    async fn shows(&self) -> Result<Vec<LibraryShow>>;

    async fn episodes(&self, show_library_id: i64, season: Option<u32>)
    -> Result<Vec<LibraryEpisode>>;

    /// Kick off a library scan, optionally limited to one directory.
    async fn rescan(&self, directory: Option<&str>) -> Result<()>;
}

/// Kodi JSON-RPC implementation.
pub struct KodiLibrary {
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct KodiShow {
    tvshowid: i64,
    title: String,
    #[serde(default)]
    imdbnumber: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KodiEpisode {
    episodeid: i64,
    tvshowid: i64,
    season: u32,
    episode: u32,
    #[serde(default)]
    file: Option<String>,
}

impl KodiLibrary {
    pub fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/jsonrpc", url.trim_end_matches('/')),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        debug!(method = %method, "Calling media library");

        let response: JsonRpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("library request failed")?
            .json()
            .await
            .context("library response was not JSON-RPC")?;

        if let Some(err) = response.error {
            anyhow::bail!("library call {method} failed: {err}");
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl LibraryClient for KodiLibrary {
    async fn is_available(&self) -> bool {
        self.call("JSONRPC.Ping", json!({})).await.is_ok()
    }

    async fn shows(&self) -> Result<Vec<LibraryShow>> {
        let result = self
            .call(
                "VideoLibrary.GetTVShows",
                json!({ "properties": ["title", "imdbnumber", "file"] }),
            )
            .await?;

        let shows: Vec<KodiShow> = match result.get("tvshows") {
            Some(v) => serde_json::from_value(v.clone())
                .context("unexpected GetTVShows payload")?,
            None => Vec::new(),
        };

        Ok(shows
            .into_iter()
            .map(|s| LibraryShow {
                library_id: s.tvshowid,
                title: s.title,
                tvdb_id: s.imdbnumber.as_deref().and_then(|n| n.parse().ok()),
                path: s.file,
            })
            .collect())
    }

    async fn episodes(
        &self,
        show_library_id: i64,
        season: Option<u32>,
    ) -> Result<Vec<LibraryEpisode>> {
        let mut params = json!({
            "tvshowid": show_library_id,
            "properties": ["season", "episode", "tvshowid", "file"],
        });
        if let Some(season) = season {
            params["season"] = json!(season);
        }
        let result = self.call("VideoLibrary.GetEpisodes", params).await?;

        let episodes: Vec<KodiEpisode> = match result.get("episodes") {
            Some(v) => serde_json::from_value(v.clone())
                .context("unexpected GetEpisodes payload")?,
            None => Vec::new(),
        };

        Ok(episodes
            .into_iter()
            .map(|e| LibraryEpisode {
                library_id: e.episodeid,
                show_library_id: e.tvshowid,
                season: e.season,
                episode: e.episode,
                file: e.file,
            })
            .collect())
    }

    async fn rescan(&self, directory: Option<&str>) -> Result<()> {
        let params = match directory {
            Some(dir) => json!({ "directory": dir }),
            None => json!({}),
        };
        info!(directory = ?directory, "Requesting library rescan");
        self.call("VideoLibrary.Scan", params).await?;
        Ok(())
    }
}

/// Library client used when no media center is configured.
pub struct NullLibrary;

#[async_trait]
impl LibraryClient for NullLibrary {
    async fn is_available(&self) -> bool {
        true
    }

    async fn shows(&self) -> Result<Vec<LibraryShow>> {
        Ok(Vec::new())
    }

    async fn episodes(
        &self,
        _show_library_id: i64,
        _season: Option<u32>,
    ) -> Result<Vec<LibraryEpisode>> {
        Ok(Vec::new())
    }

    async fn rescan(&self, directory: Option<&str>) -> Result<()> {
        warn!(directory = ?directory, "No media library configured; skipping rescan");
        Ok(())
    }
}
