//! PublicHD feeder. The feed mixes movies and TV, so entries are filtered
//! to the TV categories; titles open with a `[TORRENT] ` tag that must go
//! before parsing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::rss::{FeedEntry, fetch_feed};
use super::{FeedState, Feeder, FeederContext};
use crate::release::Downloadable;
use crate::release::quality::Quality;

const FEED_URL: &str = "https://publichd.se/rss.php";
const TITLE_TAG: &str = "[TORRENT] ";
const TV_CATEGORIES: &[&str] = &["TV Show", "TV Show HD", "TV-Show", "TV-Show HD"];

pub struct PublicHdFeeder {
    ctx: Arc<FeederContext>,
    state: FeedState,
}

impl PublicHdFeeder {
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
                warn!(error = %e, "publichd fetch failed");
                return Vec::new();
            }
        };
        let entries: Vec<FeedEntry> = entries
            .into_iter()
            .filter(is_tv_entry)
            .map(|mut entry| {
                if let Some(rest) = entry.title.strip_prefix(TITLE_TAG) {
                    entry.title = rest.to_string();
                }
                entry
            })
            .collect();
        self.ctx
            .candidates(Some(self.name()), &entries, |_| Quality::UNKNOWN)
            .await
    }
}

fn is_tv_entry(entry: &FeedEntry) -> bool {
    entry
        .category
        .as_deref()
        .is_some_and(|c| TV_CATEGORIES.contains(&c))
}

#[async_trait]
impl Feeder for PublicHdFeeder {
    fn name(&self) -> &'static str {
        "publichd"
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_filter() {
        let tv = FeedEntry {
            title: "[TORRENT] House S06E12 720p HDTV X264-DIMENSION".to_string(),
            category: Some("TV Show HD".to_string()),
            ..Default::default()
        };
        let movie = FeedEntry {
            title: "[TORRENT] Some Movie 1080p".to_string(),
            category: Some("Movie".to_string()),
            ..Default::default()
        };
        assert!(is_tv_entry(&tv));
        assert!(!is_tv_entry(&movie));
    }
}
