//! Release-name parsing: from a raw scene name to real episodes.
//!
//! `scene` does the pure pattern matching; `SceneNameParser` resolves the
//! matched series name against the catalog, maps scene numbering to tvdb
//! numbering, and detects quality, producing a `ParsedName` the feed and
//! filing passes can act on directly.

pub mod scene;

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, trace};

use crate::catalog::{Catalog, TvEpisode};
use crate::db::Database;
use crate::release::quality::{Quality, quality_from_name};

pub use scene::{clean_series_name, is_bad_release, match_release, simplify_show_name};

/// Everything we could work out about one release name.
#[derive(Debug, Clone)]
pub struct ParsedName {
    pub original: String,
    /// Cleaned series name from the pattern match, resolved or not.
    pub series_name: Option<String>,
    pub tvdb_id: Option<u32>,
    /// Fully resolved episodes. Empty when the show or numbering could
    /// not be resolved.
    pub episodes: Vec<TvEpisode>,
    /// Scene season from the raw match; `None` for season-less forms.
    pub season: Option<u32>,
    /// Scene episode numbers from the raw match.
    pub episode_numbers: Vec<u32>,
    pub air_date: Option<NaiveDate>,
    pub quality: Quality,
    pub release_group: Option<String>,
    /// The name carries a marker we always reject (dub, subpack, sample).
    pub is_bad: bool,
}

impl ParsedName {
    /// Did we resolve this name to concrete episodes of a known show?
    pub fn is_known(&self) -> bool {
        !self.is_bad && !self.episodes.is_empty()
    }

    fn unparsed(original: &str) -> Self {
        Self {
            original: original.to_string(),
            series_name: None,
            tvdb_id: None,
            episodes: Vec::new(),
            season: None,
            episode_numbers: Vec::new(),
            air_date: None,
            quality: Quality::UNKNOWN,
            release_group: None,
            is_bad: false,
        }
    }
}

pub struct SceneNameParser {
    catalog: Arc<Catalog>,
    db: Database,
}

impl SceneNameParser {
    pub fn new(catalog: Arc<Catalog>, db: Database) -> Arc<Self> {
        Arc::new(Self { catalog, db })
    }

    /// Parse a release name or filename. `has_extension` strips the last
    /// dot-suffix before matching (filenames only; release names keep
    /// their dots).
    pub async fn parse(&self, name: &str, has_extension: bool) -> Result<ParsedName> {
        let stem = if has_extension {
            name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name)
        } else {
            name
        };

        let mut parsed = ParsedName::unparsed(name);
        parsed.quality = quality_from_name(name, has_extension);

        if is_bad_release(stem) {
            debug!(name = %name, "rejecting bad release");
            parsed.is_bad = true;
            return Ok(parsed);
        }

        let Some(matched) = match_release(stem) else {
            trace!(name = %name, "no pattern matched");
            return Ok(parsed);
        };
        parsed.series_name = matched.series_name.clone();
        parsed.season = matched.season;
        parsed.episode_numbers = matched.episodes.clone();
        parsed.air_date = matched.air_date;
        parsed.release_group = matched.release_group.clone();

        let Some(series_name) = &matched.series_name else {
            return Ok(parsed);
        };
        let Some(tvdb_id) = self.catalog.resolve_series_name(series_name).await? else {
            trace!(series = %series_name, "series name did not resolve");
            return Ok(parsed);
        };
        parsed.tvdb_id = Some(tvdb_id);

        let Some(show) = self.catalog.show_by_tvdb(tvdb_id).await? else {
            return Ok(parsed);
        };

        if let Some(date) = matched.air_date {
            // Daily shows: the episode cache maps air date to numbering.
            for row in self.db.episodes().episodes_on_date(date).await? {
                if row.tvdb_id == tvdb_id {
                    let ep = self
                        .catalog
                        .episode_from_tvdb(show.clone(), row.season, row.episode)
                        .await?;
                    parsed.episodes.push(ep);
                }
            }
            return Ok(parsed);
        }

        let Some(season) = matched.season else {
            // Season-less names are resolved by callers with more context
            // (the filer knows the download's season).
            return Ok(parsed);
        };
        for number in &matched.episodes {
            let ep = self
                .catalog
                .episode_from_scene(show.clone(), season, *number)
                .await?;
            parsed.episodes.push(ep);
        }

        Ok(parsed)
    }

    /// Re-resolve a season-less parse using a season supplied by the
    /// caller (e.g. the filer, when the download itself pins the season).
    pub async fn resolve_with_season(
        &self,
        parsed: &ParsedName,
        season: u32,
    ) -> Result<Vec<TvEpisode>> {
        let Some(tvdb_id) = parsed.tvdb_id else {
            return Ok(Vec::new());
        };
        let Some(show) = self.catalog.show_by_tvdb(tvdb_id).await? else {
            return Ok(Vec::new());
        };
        let mut episodes = Vec::new();
        for number in &parsed.episode_numbers {
            episodes.push(
                self.catalog
                    .episode_from_scene(show.clone(), season, *number)
                    .await?,
            );
        }
        Ok(episodes)
    }
}
