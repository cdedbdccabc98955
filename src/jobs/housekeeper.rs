//! Periodic maintenance: blacklist expiry, episode-cache refresh,
//! scene-name exception refresh, cross-numbering refresh, history pruning.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::blacklist::{Blacklist, DEFAULT_MAX_AGE};
use crate::config::Config;
use crate::db::{Database, EpisodeRow};
use crate::events::{EventBus, EventKind};
use crate::naming::simplify_show_name;
use crate::numbering::NumberingService;
use crate::services::metadata::{MetadataClient, TvMazeEpisode};
use crate::services::rate_limiter::{RateLimitedClient, RetryConfig, retry_async};

/// Continuing shows go stale after a day, ended shows after ten.
const CONTINUING_STALE_SECS: i64 = 24 * 3600;
const ENDED_STALE_SECS: i64 = 10 * 24 * 3600;
/// At most this many shows refreshed per run, stalest first.
const REFRESH_BATCH: usize = 7;
const EXCEPTIONS_STALE_SECS: i64 = 24 * 3600;
const EXCEPTIONS_STAMP_KEY: &str = "exceptions_last_refreshed";
const HISTORY_RETENTION_DAYS: u32 = 365;

pub struct Housekeeper {
    config: Arc<Config>,
    db: Database,
    blacklist: Arc<Blacklist>,
    metadata: Arc<MetadataClient>,
    numbering: Arc<NumberingService>,
    events: Arc<EventBus>,
    client: RateLimitedClient,
}

impl Housekeeper {
    pub fn new(
        config: Arc<Config>,
        db: Database,
        blacklist: Arc<Blacklist>,
        metadata: Arc<MetadataClient>,
        numbering: Arc<NumberingService>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            blacklist,
            metadata,
            numbering,
            events,
            client: RateLimitedClient::for_rss(),
        })
    }

    pub async fn run_once(&self) -> Result<()> {
        debug!("housekeeper run starting");
        self.blacklist.expire_old_records(DEFAULT_MAX_AGE);

        let followed = self.db.show_settings().followed_ids().await?;

        if let Err(e) = self.refresh_stale_episode_caches(&followed).await {
            warn!(error = %e, "episode cache refresh failed");
        }
        if let Err(e) = self.refresh_scene_exceptions().await {
            warn!(error = %e, "scene exception refresh failed");
        }
        self.refresh_stale_numbering(&followed).await;

        match self.db.history().prune(HISTORY_RETENTION_DAYS).await {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "pruned old history rows"),
            Err(e) => warn!(error = %e, "history prune failed"),
        }
        Ok(())
    }

    async fn refresh_stale_episode_caches(&self, followed: &[u32]) -> Result<()> {
        let now = Utc::now().timestamp();
        let stale = self
            .db
            .episodes()
            .refresh_needed_shows(
                followed,
                now - CONTINUING_STALE_SECS,
                now - ENDED_STALE_SECS,
            )
            .await?;
        for tvdb_id in stale.into_iter().take(REFRESH_BATCH) {
            if let Err(e) = refresh_episodes(&self.db, &self.metadata, tvdb_id).await {
                warn!(tvdb_id = tvdb_id, error = %e, "episode refresh failed");
            }
        }
        Ok(())
    }

    async fn refresh_scene_exceptions(&self) -> Result<()> {
        let Some(url) = self.config.exceptions_url.clone() else {
            return Ok(());
        };
        let last: i64 = self
            .db
            .settings()
            .get_or_default(EXCEPTIONS_STAMP_KEY, 0i64)
            .await?;
        if Utc::now().timestamp() - last < EXCEPTIONS_STALE_SECS {
            return Ok(());
        }

        let body = retry_async(
            || async {
                let response = self.client.get(&url).await?;
                if !response.status().is_success() {
                    anyhow::bail!("exception list returned {}", response.status());
                }
                response.text().await.context("reading exception list")
            },
            &RetryConfig::default(),
            "scene_exceptions",
        )
        .await?;

        let entries = parse_exception_list(&body);
        info!(count = entries.len(), "fetched scene-name exceptions");
        let changed = self.db.scene_names().replace_all(&entries).await?;
        self.db
            .settings()
            .set(EXCEPTIONS_STAMP_KEY, Utc::now().timestamp())
            .await?;
        if changed {
            self.events.publish(EventKind::ExceptionsChanged);
        }
        Ok(())
    }

    async fn refresh_stale_numbering(&self, followed: &[u32]) {
        for tvdb_id in self.numbering.stale_shows(followed).await {
            if let Err(e) = self.numbering.refresh_show(tvdb_id).await {
                warn!(tvdb_id = tvdb_id, error = %e, "numbering refresh failed");
            }
        }
    }
}

/// Refetch one show's episode listing from the metadata service into the
/// local cache. Also used by the RPC `refresh_episodes` method.
pub async fn refresh_episodes(
    db: &Database,
    metadata: &MetadataClient,
    tvdb_id: u32,
) -> Result<()> {
    let status = metadata
        .show_by_tvdb(tvdb_id)
        .await?
        .and_then(|show| show.status);
    let episodes = metadata.episodes_by_tvdb(tvdb_id).await?;
    let rows = episode_rows(tvdb_id, &episodes);
    db.episodes()
        .replace_show(tvdb_id, &rows, status.as_deref())
        .await?;
    info!(tvdb_id = tvdb_id, episodes = rows.len(), "episode cache refreshed");
    Ok(())
}

fn episode_rows(tvdb_id: u32, episodes: &[TvMazeEpisode]) -> Vec<EpisodeRow> {
    episodes
        .iter()
        .map(|ep| EpisodeRow {
            tvdb_id,
            season: ep.season,
            episode: ep.number,
            name: Some(ep.name.clone()),
            first_aired: ep.first_aired(),
        })
        .collect()
}

/// Exception lists are lines of `tvdb_id: Name One, Name Two,`.
fn parse_exception_list(body: &str) -> Vec<(u32, String, String)> {
    let mut entries = Vec::new();
    for line in body.lines() {
        let Some((id, names)) = line.split_once(':') else {
            continue;
        };
        let Ok(tvdb_id) = id.trim().parse::<u32>() else {
            continue;
        };
        for name in names.split(',') {
            let name = name.trim().trim_matches('\'').trim();
            if name.is_empty() {
                continue;
            }
            let simplified = simplify_show_name(name);
            if simplified.is_empty() {
                continue;
            }
            entries.push((tvdb_id, name.to_string(), simplified));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_list_parsing() {
        let body = "\
73255: 'House', 'House M.D.',
75760: 'The Office (US)',
not a line
: no id
";
        let entries = parse_exception_list(body);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (73255, "House".to_string(), "house".to_string()));
        assert_eq!(entries[1].1, "House M.D.");
        assert_eq!(entries[1].2, "housemd");
        assert_eq!(entries[2].0, 75760);
        assert_eq!(entries[2].2, "theofficeus");
    }

    #[test]
    fn episode_rows_keep_titles_and_air_dates() {
        let episodes = vec![TvMazeEpisode {
            id: 1,
            name: "Pilot".to_string(),
            season: 1,
            number: 1,
            airdate: Some("2020-03-01".to_string()),
        }];
        let rows = episode_rows(42, &episodes);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tvdb_id, 42);
        assert_eq!(rows[0].name.as_deref(), Some("Pilot"));
        assert_eq!(
            rows[0].first_aired,
            Some(chrono::NaiveDate::from_ymd_opt(2020, 3, 1).unwrap())
        );
    }
}
