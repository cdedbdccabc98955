//! Backlog search: fill in wanted episodes the live feeds never carried.
//!
//! Walks followed shows' cached episode listings, skips anything owned,
//! running, or already downloaded, and asks search-capable feeders for the
//! rest. Winners go through the same selection path as feed candidates.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::db::Database;
use crate::feeds::FeederRegistry;
use crate::feeds::aggregate::FeedAggregator;

/// Cap on episode searches per run; one run every 16 hours means a large
/// backlog drains over days instead of hammering the feeds.
const MAX_SEARCHES_PER_RUN: usize = 30;

pub struct BacklogSearcher {
    db: Database,
    catalog: Arc<Catalog>,
    feeders: Arc<FeederRegistry>,
    aggregator: Arc<FeedAggregator>,
}

impl BacklogSearcher {
    pub fn new(
        db: Database,
        catalog: Arc<Catalog>,
        feeders: Arc<FeederRegistry>,
        aggregator: Arc<FeedAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            catalog,
            feeders,
            aggregator,
        })
    }

    pub async fn run_once(&self) -> Result<()> {
        let shows: Vec<_> = self
            .catalog
            .all_shows()
            .await?
            .into_iter()
            .filter(|s| s.followed)
            .collect();
        if shows.is_empty() {
            return Ok(());
        }

        let feeders = self.feeders.enabled().await;
        let today = Utc::now().date_naive();
        let mut searched = 0usize;
        let mut candidates = Vec::new();

        'shows: for show in shows {
            for row in self.db.episodes().all_episodes(show.tvdb_id).await? {
                if searched >= MAX_SEARCHES_PER_RUN {
                    break 'shows;
                }
                // Specials and unaired episodes are not backlog material.
                if row.season == 0 {
                    continue;
                }
                match row.first_aired {
                    Some(aired) if aired <= today => {}
                    _ => continue,
                }
                if self
                    .db
                    .history()
                    .episode_succeeded(show.tvdb_id, row.season, row.episode)
                    .await?
                {
                    continue;
                }
                let episode = self
                    .catalog
                    .episode_from_tvdb(show.clone(), row.season, row.episode)
                    .await?;
                if !self
                    .catalog
                    .is_wanted_in_quality(&episode, show.wanted_quality)
                {
                    continue;
                }

                debug!(
                    show = %show.name,
                    season = row.season,
                    episode = row.episode,
                    "searching backlog episode"
                );
                searched += 1;
                for feeder in &feeders {
                    if let Some(found) = feeder.search(&episode).await {
                        candidates.extend(found);
                    }
                }
            }
        }

        if candidates.is_empty() {
            return Ok(());
        }
        let dispatched = self.aggregator.select_and_dispatch(candidates).await?;
        if dispatched > 0 {
            info!(count = dispatched, searched = searched, "backlog dispatched downloads");
        }
        Ok(())
    }
}
