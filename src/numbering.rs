//! Scene-to-tvdb numbering service.
//!
//! Wraps the xem map repository with on-demand refresh: a lookup for a
//! show whose map is older than a day fetches a fresh map first. Fetch
//! failures are logged and the stale rows keep serving; a missing map is
//! normal (most shows are numbered identically) and callers fall back to
//! identity.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::{Database, XemEntry};
use crate::services::rate_limiter::RateLimitedClient;

const MAX_MAP_AGE_SECS: i64 = 86_400;

pub struct NumberingService {
    db: Database,
    client: RateLimitedClient,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct XemResponse {
    result: String,
    #[serde(default)]
    data: Vec<XemMapping>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XemMapping {
    tvdb: Option<XemNumber>,
    scene: Option<XemNumber>,
}

#[derive(Debug, Deserialize)]
struct XemNumber {
    season: u32,
    episode: u32,
}

impl NumberingService {
    pub fn new(db: Database, base_url: &str) -> Arc<Self> {
        Arc::new(Self {
            db,
            client: RateLimitedClient::for_numbering(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn to_tvdb(
        &self,
        tvdb_id: u32,
        scene_season: u32,
        scene_episode: u32,
    ) -> Result<Vec<(u32, u32)>> {
        self.refresh_if_stale(tvdb_id).await;
        self.db
            .numbering()
            .to_tvdb(tvdb_id, scene_season, scene_episode)
            .await
    }

    pub async fn to_scene(
        &self,
        tvdb_id: u32,
        tvdb_season: u32,
        tvdb_episode: u32,
    ) -> Result<Vec<(u32, u32)>> {
        self.refresh_if_stale(tvdb_id).await;
        self.db
            .numbering()
            .to_scene(tvdb_id, tvdb_season, tvdb_episode)
            .await
    }

    async fn refresh_if_stale(&self, tvdb_id: u32) {
        let stale = match self.db.numbering().last_refreshed(tvdb_id).await {
            Ok(Some(at)) => Utc::now().timestamp() - at > MAX_MAP_AGE_SECS,
            Ok(None) => true,
            Err(e) => {
                warn!(tvdb_id = tvdb_id, error = %e, "numbering refresh check failed");
                false
            }
        };
        if !stale {
            return;
        }
        if let Err(e) = self.refresh_show(tvdb_id).await {
            // Keep whatever rows we have; the next lookup retries.
            warn!(tvdb_id = tvdb_id, error = %e, "numbering map refresh failed");
        }
    }

    /// Fetch and store the full map for one show. A "no mapping" answer
    /// from the service is stored as an empty map so we stop re-asking
    /// until it ages out.
    pub async fn refresh_show(&self, tvdb_id: u32) -> Result<()> {
        let url = format!("{}/map/all", self.base_url);
        let response = self
            .client
            .get_with_query(&url, &[("id", tvdb_id.to_string()), ("origin", "tvdb".into())])
            .await
            .context("numbering map request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("numbering map fetch failed with status: {}", response.status());
        }
        let body: XemResponse = response
            .json()
            .await
            .context("numbering map response was not JSON")?;

        let entries: Vec<XemEntry> = if body.result == "success" {
            body.data
                .into_iter()
                .filter_map(|m| {
                    let tvdb = m.tvdb?;
                    let scene = m.scene?;
                    Some(XemEntry {
                        tvdb_season: tvdb.season,
                        tvdb_episode: tvdb.episode,
                        scene_season: scene.season,
                        scene_episode: scene.episode,
                    })
                })
                .collect()
        } else {
            debug!(
                tvdb_id = tvdb_id,
                message = ?body.message,
                "no numbering map for show"
            );
            Vec::new()
        };

        debug!(tvdb_id = tvdb_id, entries = entries.len(), "storing numbering map");
        self.db.numbering().replace_show(tvdb_id, &entries).await
    }

    /// Ids that have not been refreshed within the last day.
    pub async fn stale_shows(&self, candidates: &[u32]) -> Vec<u32> {
        let mut out = Vec::new();
        for id in candidates {
            match self.db.numbering().last_refreshed(*id).await {
                Ok(Some(at)) if Utc::now().timestamp() - at <= MAX_MAP_AGE_SECS => {}
                Ok(_) => out.push(*id),
                Err(e) => warn!(tvdb_id = id, error = %e, "refresh check failed"),
            }
        }
        out
    }
}
