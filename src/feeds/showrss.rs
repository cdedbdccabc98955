//! ShowRSS feeder: a per-user feed whose url lives in settings.
//!
//! ShowRSS titles sometimes open with a quality tag like `HD 720p: ` that
//! the scene parser does not understand; it is stripped before parsing and
//! used as a quality fallback when the name itself says nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::rss::fetch_feed;
use super::{FeedState, Feeder, FeederContext};
use crate::release::Downloadable;
use crate::release::quality::Quality;

const FEED_URL_SETTING: &str = "showrss_feed_url";

pub struct ShowRssFeeder {
    ctx: Arc<FeederContext>,
    state: FeedState,
}

impl ShowRssFeeder {
    pub fn new(ctx: Arc<FeederContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: FeedState::new(),
        })
    }

    async fn feed_url(&self) -> Option<String> {
        self.ctx
            .db
            .settings()
            .get_value::<String>(FEED_URL_SETTING)
            .await
            .unwrap_or(None)
    }

    async fn refresh(&self) -> Vec<Downloadable> {
        let Some(url) = self.feed_url().await else {
            return Vec::new();
        };
        let entries = match fetch_feed(&self.ctx.client, &url).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "showrss fetch failed");
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for mut entry in entries {
            let (fallback, rest) = strip_quality_prefix(&entry.title);
            entry.title = rest.to_string();
            out.extend(
                self.ctx
                    .candidates(Some(self.name()), std::slice::from_ref(&entry), |_| fallback)
                    .await,
            );
        }
        out
    }
}

/// Split a `HD 720p: ` style prefix off a ShowRSS title. Returns the
/// fallback quality the prefix implies and the remaining title.
fn strip_quality_prefix(title: &str) -> (Quality, &str) {
    for (prefix, quality) in [
        ("HD 720p: ", Quality::HD720P),
        ("HD 1080p: ", Quality::HD1080P),
        ("HD: ", Quality::HD),
        ("SD: ", Quality::SD),
    ] {
        if let Some(rest) = title.strip_prefix(prefix) {
            return (quality, rest);
        }
    }
    (Quality::UNKNOWN, title)
}

#[async_trait]
impl Feeder for ShowRssFeeder {
    fn name(&self) -> &'static str {
        "showrss"
    }

    async fn is_available(&self) -> bool {
        self.feed_url().await.is_some()
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
    fn quality_prefix_stripping() {
        let (q, rest) = strip_quality_prefix("HD 720p: House S06E12");
        assert_eq!(q, Quality::HD720P);
        assert_eq!(rest, "House S06E12");

        let (q, rest) = strip_quality_prefix("House S06E12 720p HDTV");
        assert_eq!(q, Quality::UNKNOWN);
        assert_eq!(rest, "House S06E12 720p HDTV");
    }
}
