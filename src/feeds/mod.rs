//! Release feeders: periodic sources of download candidates.
//!
//! Each feeder wraps one or more RSS feeds and turns entries into
//! `Downloadable`s via the scene-name parser. Feeders keep their own
//! refresh clock so the aggregation tick can run far more often than any
//! feed is actually fetched.

pub mod aggregate;
pub mod ezrss;
pub mod publichd;
pub mod rss;
pub mod showrss;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::blacklist::Blacklist;
use crate::catalog::TvEpisode;
use crate::db::Database;
use crate::naming::SceneNameParser;
use crate::release::quality::Quality;
use crate::release::{Downloadable, ReleaseKind};
use crate::services::rate_limiter::RateLimitedClient;
use rss::FeedEntry;

pub const DEFAULT_UPDATE_FREQ: Duration = Duration::from_secs(15 * 60);

#[async_trait]
pub trait Feeder: Send + Sync {
    fn name(&self) -> &'static str;

    fn update_freq(&self) -> Duration {
        DEFAULT_UPDATE_FREQ
    }

    /// Static capability check: is the feeder configured at all?
    async fn is_available(&self) -> bool {
        true
    }

    async fn is_enabled(&self) -> bool;

    /// Current candidate list, refreshed only when the feeder is due.
    async fn get_latest(&self) -> Vec<Downloadable>;

    /// Fresh candidates when due, empty otherwise.
    async fn get_updates(&self) -> Vec<Downloadable>;

    /// Search for a specific episode. `None` means the feeder cannot
    /// search.
    async fn search(&self, _episode: &TvEpisode) -> Option<Vec<Downloadable>> {
        None
    }
}

/// Refresh clock and candidate cache shared by every feeder impl.
pub struct FeedState {
    last_update: Mutex<Option<Instant>>,
    cache: Mutex<Vec<Downloadable>>,
}

impl FeedState {
    pub fn new() -> Self {
        Self {
            last_update: Mutex::new(None),
            cache: Mutex::new(Vec::new()),
        }
    }

    pub fn is_update_due(&self, freq: Duration) -> bool {
        match *self.last_update.lock() {
            Some(last) => last.elapsed() >= freq,
            None => true,
        }
    }

    pub fn store(&self, items: Vec<Downloadable>) {
        *self.last_update.lock() = Some(Instant::now());
        *self.cache.lock() = items;
    }

    pub fn cached(&self) -> Vec<Downloadable> {
        self.cache.lock().clone()
    }
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Dependencies every feeder shares.
pub struct FeederContext {
    pub client: RateLimitedClient,
    pub parser: Arc<SceneNameParser>,
    pub blacklist: Arc<Blacklist>,
    pub db: Database,
}

impl FeederContext {
    pub fn new(parser: Arc<SceneNameParser>, blacklist: Arc<Blacklist>, db: Database) -> Arc<Self> {
        Arc::new(Self {
            client: RateLimitedClient::for_rss(),
            parser,
            blacklist,
            db,
        })
    }

    /// The settings toggle every feeder answers `is_enabled` from.
    pub async fn feeder_enabled(&self, name: &str) -> bool {
        self.db
            .settings()
            .get_or_default(&format!("feeder_{name}_enabled"), true)
            .await
            .unwrap_or(true)
    }

    /// Turn feed entries into candidates: parse the name, keep only
    /// entries resolving to known episodes, drop blacklisted ones.
    /// `fallback_quality` supplies a feeder-specific quality when the name
    /// itself yields `UNKNOWN`.
    pub async fn candidates(
        &self,
        feeder: Option<&'static str>,
        entries: &[FeedEntry],
        fallback_quality: impl Fn(&FeedEntry) -> Quality,
    ) -> Vec<Downloadable> {
        let mut out = Vec::new();
        for entry in entries {
            let name = entry.filename.clone().unwrap_or_else(|| entry.title.clone());
            let parsed = match self.parser.parse(&name, entry.filename.is_some()).await {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(name = %name, error = %e, "parse failed, skipping entry");
                    continue;
                }
            };
            if !parsed.is_known() {
                debug!(name = %name, "entry did not resolve to known episodes");
                continue;
            }

            let urls = entry.candidate_urls();
            if urls.is_empty() {
                continue;
            }

            let quality = if parsed.quality == Quality::UNKNOWN {
                fallback_quality(entry)
            } else {
                parsed.quality
            };

            let candidate = Downloadable::new(
                ReleaseKind::Torrent,
                urls,
                parsed.episodes,
                Some(name),
                quality,
                feeder.map(String::from),
            );
            if self.blacklist.contains(&candidate.unique_key())
                || candidate.urls().iter().any(|u| self.blacklist.contains(u))
            {
                debug!(key = %candidate.unique_key(), "skipping blacklisted entry");
                continue;
            }
            out.push(candidate);
        }
        out
    }
}

/// The feeders in priority order, with the enabled subset cached until
/// settings change.
pub struct FeederRegistry {
    feeders: Vec<Arc<dyn Feeder>>,
    enabled: Mutex<Option<Vec<Arc<dyn Feeder>>>>,
}

impl FeederRegistry {
    pub fn new(feeders: Vec<Arc<dyn Feeder>>) -> Arc<Self> {
        Arc::new(Self {
            feeders,
            enabled: Mutex::new(None),
        })
    }

    /// Drop the enabled-set cache; the next call to [`Self::enabled`]
    /// re-evaluates every feeder.
    pub fn invalidate(&self) {
        *self.enabled.lock() = None;
    }

    pub fn all(&self) -> &[Arc<dyn Feeder>] {
        &self.feeders
    }

    pub async fn enabled(&self) -> Vec<Arc<dyn Feeder>> {
        if let Some(enabled) = self.enabled.lock().clone() {
            return enabled;
        }
        let mut enabled = Vec::new();
        for feeder in &self.feeders {
            if feeder.is_enabled().await && feeder.is_available().await {
                enabled.push(feeder.clone());
            }
        }
        *self.enabled.lock() = Some(enabled.clone());
        enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_state_due_tracking() {
        let state = FeedState::new();
        assert!(state.is_update_due(Duration::from_secs(60)));

        state.store(Vec::new());
        assert!(!state.is_update_due(Duration::from_secs(60)));
        assert!(state.is_update_due(Duration::ZERO));
    }
}
