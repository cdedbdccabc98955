//! Feed aggregation: merge every feeder's fresh candidates, pick the best
//! release per episode, and hand winners to download dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use super::FeederRegistry;
use crate::blacklist::Blacklist;
use crate::catalog::Catalog;
use crate::db::Database;
use crate::downloader::{BackendRegistry, dispatch};
use crate::release::Downloadable;
use crate::release::quality::Quality;

pub struct FeedAggregator {
    feeders: Arc<FeederRegistry>,
    catalog: Arc<Catalog>,
    backends: Arc<BackendRegistry>,
    blacklist: Arc<Blacklist>,
    db: Database,
}

impl FeedAggregator {
    pub fn new(
        feeders: Arc<FeederRegistry>,
        catalog: Arc<Catalog>,
        backends: Arc<BackendRegistry>,
        blacklist: Arc<Blacklist>,
        db: Database,
    ) -> Arc<Self> {
        Arc::new(Self {
            feeders,
            catalog,
            backends,
            blacklist,
            db,
        })
    }

    /// One scheduler tick: fresh candidates from every enabled feeder, in
    /// feeder priority order, through selection and dispatch.
    pub async fn poll_once(&self) -> Result<()> {
        let mut candidates = Vec::new();
        for feeder in self.feeders.enabled().await {
            candidates.extend(feeder.get_updates().await);
        }
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(count = candidates.len(), "fresh feed candidates");
        let dispatched = self.select_and_dispatch(candidates).await?;
        if dispatched > 0 {
            info!(count = dispatched, "dispatched downloads from feeds");
        }
        Ok(())
    }

    /// Filter to wanted episodes, pick one winner per episode, dispatch.
    /// Also used by the backlog pass so searches go through the exact same
    /// selection rules. Returns how many downloads were dispatched.
    pub async fn select_and_dispatch(&self, candidates: Vec<Downloadable>) -> Result<usize> {
        let wanted: Vec<Downloadable> = candidates
            .into_iter()
            .filter(|c| {
                c.episodes()
                    .iter()
                    .any(|ep| self.catalog.is_wanted_in_quality(ep, c.quality()))
            })
            .collect();

        // Group by episode; a multi-episode release joins every group it
        // covers. Insertion order within a group preserves feeder priority.
        let mut groups: HashMap<(u32, u32, u32), Vec<usize>> = HashMap::new();
        for (idx, candidate) in wanted.iter().enumerate() {
            for key in candidate.tvdb_keys() {
                groups.entry(key).or_default().push(idx);
            }
        }

        let mut dispatched = 0;
        let mut seen_keys = HashSet::new();
        for indices in groups.values() {
            let group: Vec<&Downloadable> = indices.iter().map(|&i| &wanted[i]).collect();
            let Some(winner) = select_winner(&group) else {
                continue;
            };
            let key = winner.unique_key();
            if !seen_keys.insert(key.clone()) {
                continue;
            }
            if self.blacklist.contains(&key) {
                continue;
            }
            if self.db.history().is_in_history(&key).await.unwrap_or(false) {
                debug!(key = %key, "candidate already in history");
                continue;
            }
            if dispatch(&self.backends, winner).await? {
                dispatched += 1;
            } else {
                debug!(name = ?winner.name(), "no backend accepted candidate");
            }
        }
        Ok(dispatched)
    }
}

/// Pick one candidate from a group covering the same episode: first seen
/// per distinct quality, any known quality over UNKNOWN, highest known
/// quality wins.
fn select_winner<'a>(group: &[&'a Downloadable]) -> Option<&'a Downloadable> {
    let mut per_quality: Vec<(Quality, &Downloadable)> = Vec::new();
    for candidate in group {
        if !per_quality.iter().any(|(q, _)| *q == candidate.quality()) {
            per_quality.push((candidate.quality(), candidate));
        }
    }
    per_quality
        .iter()
        .filter(|(q, _)| *q != Quality::UNKNOWN)
        .max_by_key(|(q, _)| q.rank())
        .or_else(|| per_quality.first())
        .map(|(_, c)| *c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseKind;

    fn candidate(name: &str, quality: Quality) -> Downloadable {
        Downloadable::new(
            ReleaseKind::Torrent,
            vec![format!("https://example.com/{name}.torrent")],
            Vec::new(),
            Some(name.to_string()),
            quality,
            Some("test".to_string()),
        )
    }

    #[test]
    fn known_quality_beats_unknown() {
        let unknown = candidate("a", Quality::UNKNOWN);
        let sd = candidate("b", Quality::SDTV);
        let group = vec![&unknown, &sd];
        let winner = select_winner(&group).unwrap();
        assert_eq!(winner.name(), Some("b"));
    }

    #[test]
    fn highest_known_quality_wins() {
        let sd = candidate("a", Quality::SDTV);
        let hd = candidate("b", Quality::FULLHDTV);
        let mid = candidate("c", Quality::HDTV);
        let group = vec![&sd, &hd, &mid];
        assert_eq!(select_winner(&group).unwrap().name(), Some("b"));
    }

    #[test]
    fn first_candidate_wins_quality_ties() {
        let first = candidate("first", Quality::HDTV);
        let second = candidate("second", Quality::HDTV);
        let group = vec![&first, &second];
        assert_eq!(select_winner(&group).unwrap().name(), Some("first"));
    }

    #[test]
    fn all_unknown_takes_first() {
        let a = candidate("a", Quality::UNKNOWN);
        let b = candidate("b", Quality::UNKNOWN);
        let group = vec![&a, &b];
        assert_eq!(select_winner(&group).unwrap().name(), Some("a"));
    }
}
