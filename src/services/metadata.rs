//! TVMaze API client for TV show metadata
//!
//! TVMaze is a free API that doesn't require authentication. Shows are
//! addressed by their tvdb id throughout the daemon, so every call here
//! goes through the `/lookup/shows?thetvdb=` bridge first. Lookups are
//! cached in memory for an hour; the episode cache in the database is the
//! durable store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::rate_limiter::RateLimitedClient;

const SHOW_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Show search result from TVMaze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeSearchResult {
    pub score: f64,
    pub show: TvMazeShow,
}

/// Show details from TVMaze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeShow {
    pub id: u32,
    pub name: String,
    pub status: Option<String>,
    pub premiered: Option<String>,
    pub network: Option<TvMazeNetwork>,
    pub externals: Option<TvMazeExternals>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeNetwork {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeExternals {
    pub tvrage: Option<u32>,
    pub thetvdb: Option<u32>,
    pub imdb: Option<String>,
}

/// Episode from TVMaze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvMazeEpisode {
    pub id: u32,
    pub name: String,
    pub season: u32,
    pub number: u32,
    pub airdate: Option<String>,
}

impl TvMazeEpisode {
    pub fn first_aired(&self) -> Option<NaiveDate> {
        self.airdate
            .as_deref()
            .filter(|d| !d.is_empty())
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }
}

/// Metadata client backed by TVMaze.
pub struct MetadataClient {
    client: RateLimitedClient,
    base_url: String,
    show_cache: RwLock<HashMap<u32, (Instant, Option<TvMazeShow>)>>,
}

impl MetadataClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: RateLimitedClient::for_tvmaze(),
            base_url: base_url.trim_end_matches('/').to_string(),
            show_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a show by its tvdb id. `None` when TVMaze has no mapping
    /// for it.
    pub async fn show_by_tvdb(&self, tvdb_id: u32) -> Result<Option<TvMazeShow>> {
        if let Some((at, cached)) = self.show_cache.read().get(&tvdb_id) {
            if at.elapsed() < SHOW_CACHE_TTL {
                return Ok(cached.clone());
            }
        }

        debug!(tvdb_id = tvdb_id, "Looking up show on TVMaze");
        let url = format!("{}/lookup/shows", self.base_url);
        let response = self
            .client
            .get_with_query(&url, &[("thetvdb", tvdb_id.to_string())])
            .await
            .context("Failed to look up show on TVMaze")?;

        let show = if response.status().is_client_error() {
            None
        } else if response.status().is_success() {
            Some(
                response
                    .json::<TvMazeShow>()
                    .await
                    .context("Failed to parse TVMaze show")?,
            )
        } else {
            anyhow::bail!("TVMaze lookup failed with status: {}", response.status());
        };

        self.show_cache
            .write()
            .insert(tvdb_id, (Instant::now(), show.clone()));
        Ok(show)
    }

    /// All episodes of a show, addressed by tvdb id.
    pub async fn episodes_by_tvdb(&self, tvdb_id: u32) -> Result<Vec<TvMazeEpisode>> {
        let Some(show) = self.show_by_tvdb(tvdb_id).await? else {
            return Ok(Vec::new());
        };

        info!(tvdb_id = tvdb_id, tvmaze_id = show.id, "Fetching episodes from TVMaze");
        let url = format!("{}/shows/{}/episodes", self.base_url, show.id);
        let response = self
            .client
            .get(&url)
            .await
            .context("Failed to fetch episodes from TVMaze")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "TVMaze get episodes failed with status: {}",
                response.status()
            );
        }

        let episodes: Vec<TvMazeEpisode> = response
            .json()
            .await
            .context("Failed to parse TVMaze episodes")?;

        debug!(count = episodes.len(), "TVMaze returned episodes");
        Ok(episodes)
    }

    /// Search for shows by name. Results without a tvdb mapping are kept;
    /// callers that need a tvdb id filter on `externals.thetvdb`.
    pub async fn search_shows(&self, query: &str) -> Result<Vec<TvMazeSearchResult>> {
        info!(query = %query, "Searching TVMaze for shows");

        let url = format!("{}/search/shows", self.base_url);
        let response = self
            .client
            .get_with_query(&url, &[("q", query)])
            .await
            .context("Failed to search TVMaze")?;

        if !response.status().is_success() {
            anyhow::bail!("TVMaze search failed with status: {}", response.status());
        }

        let results: Vec<TvMazeSearchResult> = response
            .json()
            .await
            .context("Failed to parse TVMaze search results")?;

        debug!(count = results.len(), "TVMaze search returned results");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn airdate_parsing() {
        let ep = TvMazeEpisode {
            id: 1,
            name: "Pilot".to_string(),
            season: 1,
            number: 1,
            airdate: Some("2004-11-16".to_string()),
        };
        assert_eq!(ep.first_aired(), NaiveDate::from_ymd_opt(2004, 11, 16));

        let blank = TvMazeEpisode {
            airdate: Some(String::new()),
            ..ep.clone()
        };
        assert_eq!(blank.first_aired(), None);
        let missing = TvMazeEpisode { airdate: None, ..ep };
        assert_eq!(missing.first_aired(), None);
    }
}
