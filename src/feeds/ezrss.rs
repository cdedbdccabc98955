//! EZRSS feeder. Entries carry `torrent:*` extension tags (info-hash,
//! magnet, filename), and the site exposes a per-episode RSS search that
//! the backlog pass uses.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::rss::fetch_feed;
use super::{FeedState, Feeder, FeederContext};
use crate::catalog::TvEpisode;
use crate::release::Downloadable;
use crate::release::quality::Quality;

const FEED_URL: &str = "https://ezrss.it/feed/";
const SEARCH_URL: &str = "https://ezrss.it/search/index.php";

pub struct EzRssFeeder {
    ctx: Arc<FeederContext>,
    state: FeedState,
}

impl EzRssFeeder {
    pub fn new(ctx: Arc<FeederContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: FeedState::new(),
        })
    }

    async fn refresh(&self) -> Vec<Downloadable> {
        let entries = match fetch_feed(&self.ctx.client, FEED_URL).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "ezrss fetch failed");
                return Vec::new();
            }
        };
        self.ctx
            .candidates(Some(self.name()), &entries, |_| Quality::UNKNOWN)
            .await
    }
}

#[async_trait]
impl Feeder for EzRssFeeder {
    fn name(&self) -> &'static str {
        "ezrss"
    }

    async fn is_enabled(&self) -> bool {
        self.ctx.feeder_enabled(self.name()).await
    }

    async fn get_latest(&self) -> Vec<Downloadable> {
        if self.state.is_update_due(self.update_freq()) {
            let items = self.refresh().await;
            self.state.store(items);
        }
        self.state.cached()
    }

    async fn get_updates(&self) -> Vec<Downloadable> {
        if !self.state.is_update_due(self.update_freq()) {
            return Vec::new();
        }
        let items = self.refresh().await;
        self.state.store(items.clone());
        items
    }

    async fn search(&self, episode: &TvEpisode) -> Option<Vec<Downloadable>> {
        let (season, number) = *episode.scene_episodes.first()?;
        let url = format!(
            "{SEARCH_URL}?show_name={}&season={}&episode={}&mode=rss",
            urlencoding::encode(&episode.show.name),
            season,
            number,
        );
        let entries = match fetch_feed(&self.ctx.client, &url).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(show = %episode.show.name, error = %e, "ezrss search failed");
                return Some(Vec::new());
            }
        };
        // Backlog-discovered candidates carry no origin feeder.
        Some(self.ctx.candidates(None, &entries, |_| Quality::UNKNOWN).await)
    }
}
