//! Shows and episodes as the daemon sees them.
//!
//! A `TvShow` merges three sources: the media library (identity, on-disk
//! path, what is already owned), the per-show settings table (followed,
//! wanted quality), and the metadata service (name and status for shows
//! not in the library yet). A `TvEpisode` carries both tvdb and scene
//! numbering, because feeds speak scene numbering and the library speaks
//! tvdb numbering.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;

use crate::db::Database;
use crate::downloader::ActiveEpisodes;
use crate::naming::simplify_show_name;
use crate::numbering::NumberingService;
use crate::release::quality::Quality;
use crate::services::library::{LibraryClient, LibraryEpisode, LibraryShow};
use crate::services::metadata::MetadataClient;

const LIBRARY_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TvShow {
    pub tvdb_id: u32,
    /// Set when the media library knows the show.
    pub library_id: Option<i64>,
    pub name: String,
    /// On-disk location, when the library has one.
    pub path: Option<PathBuf>,
    pub followed: bool,
    pub wanted_quality: Quality,
    /// "Running", "Ended", etc. from the metadata service.
    pub status: Option<String>,
}

impl TvShow {
    /// Where this show's files live or should be created. Shows the
    /// library does not know yet get a sanitized directory under the
    /// new-show root.
    pub fn fs_path(&self, new_show_path: &std::path::Path) -> PathBuf {
        match &self.path {
            Some(p) => p.clone(),
            None => new_show_path.join(sanitize_filename::sanitize(&self.name)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TvEpisode {
    pub show: Arc<TvShow>,
    /// Set when the library already owns a copy.
    pub library_id: Option<i64>,
    /// (season, episode) in tvdb numbering. Usually one entry; more when
    /// one scene episode covers several tvdb episodes.
    pub tvdb_episodes: Vec<(u32, u32)>,
    /// (season, episode) in scene numbering.
    pub scene_episodes: Vec<(u32, u32)>,
}

impl TvEpisode {
    /// The episode key used for grouping and history: first tvdb number.
    pub fn tvdb_key(&self) -> Option<(u32, u32, u32)> {
        self.tvdb_episodes
            .first()
            .map(|(s, e)| (self.show.tvdb_id, *s, *e))
    }
}

pub struct Catalog {
    db: Database,
    library: Arc<dyn LibraryClient>,
    metadata: Arc<MetadataClient>,
    numbering: Arc<NumberingService>,
    active: Arc<ActiveEpisodes>,
    new_show_path: PathBuf,
    shows_cache: Mutex<Option<(Instant, Arc<Vec<LibraryShow>>)>>,
    episode_cache: Mutex<HashMap<(i64, u32), (Instant, Arc<Vec<LibraryEpisode>>)>>,
}

impl Catalog {
    pub fn new(
        db: Database,
        library: Arc<dyn LibraryClient>,
        metadata: Arc<MetadataClient>,
        numbering: Arc<NumberingService>,
        active: Arc<ActiveEpisodes>,
        new_show_path: PathBuf,
    ) -> Self {
        Self {
            db,
            library,
            metadata,
            numbering,
            active,
            new_show_path,
            shows_cache: Mutex::new(None),
            episode_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_show_path(&self) -> &std::path::Path {
        &self.new_show_path
    }

    /// Library show list, cached briefly; the library is polled from
    /// every feed pass and rarely changes between them.
    pub async fn library_shows(&self) -> Result<Arc<Vec<LibraryShow>>> {
        if let Some((at, shows)) = self.shows_cache.lock().as_ref() {
            if at.elapsed() < LIBRARY_CACHE_TTL {
                return Ok(shows.clone());
            }
        }
        let shows = Arc::new(self.library.shows().await?);
        *self.shows_cache.lock() = Some((Instant::now(), shows.clone()));
        Ok(shows)
    }

    /// Drop cached library views, e.g. after a rescan.
    pub fn invalidate_library_cache(&self) {
        *self.shows_cache.lock() = None;
        self.episode_cache.lock().clear();
    }

    async fn library_episodes(
        &self,
        show_library_id: i64,
        season: u32,
    ) -> Result<Arc<Vec<LibraryEpisode>>> {
        let key = (show_library_id, season);
        if let Some((at, eps)) = self.episode_cache.lock().get(&key) {
            if at.elapsed() < LIBRARY_CACHE_TTL {
                return Ok(eps.clone());
            }
        }
        let eps = Arc::new(self.library.episodes(show_library_id, Some(season)).await?);
        self.episode_cache
            .lock()
            .insert(key, (Instant::now(), eps.clone()));
        Ok(eps)
    }

    /// Build a `TvShow` for a tvdb id: library first, metadata second.
    /// `None` when nobody has heard of it.
    pub async fn show_by_tvdb(&self, tvdb_id: u32) -> Result<Option<Arc<TvShow>>> {
        let settings = self
            .db
            .show_settings()
            .get(tvdb_id)
            .await?
            .unwrap_or_else(|| crate::db::ShowSettingsRow::unconfigured(tvdb_id));

        let shows = self.library_shows().await?;
        if let Some(lib) = shows.iter().find(|s| s.tvdb_id == Some(tvdb_id)) {
            return Ok(Some(Arc::new(TvShow {
                tvdb_id,
                library_id: Some(lib.library_id),
                name: lib.title.clone(),
                path: lib.path.clone().map(PathBuf::from),
                followed: settings.followed,
                wanted_quality: settings.wanted_quality,
                status: None,
            })));
        }

        let Some(info) = self.metadata.show_by_tvdb(tvdb_id).await? else {
            return Ok(None);
        };
        Ok(Some(Arc::new(TvShow {
            tvdb_id,
            library_id: None,
            name: info.name,
            path: None,
            followed: settings.followed,
            wanted_quality: settings.wanted_quality,
            status: info.status,
        })))
    }

    /// Every show worth listing: the library's shows plus followed shows
    /// the library does not have yet.
    pub async fn all_shows(&self) -> Result<Vec<Arc<TvShow>>> {
        let mut out = Vec::new();
        let mut seen = Vec::new();

        for lib in self.library_shows().await?.iter() {
            let Some(tvdb_id) = lib.tvdb_id else { continue };
            let settings = self
                .db
                .show_settings()
                .get(tvdb_id)
                .await?
                .unwrap_or_else(|| crate::db::ShowSettingsRow::unconfigured(tvdb_id));
            seen.push(tvdb_id);
            out.push(Arc::new(TvShow {
                tvdb_id,
                library_id: Some(lib.library_id),
                name: lib.title.clone(),
                path: lib.path.clone().map(PathBuf::from),
                followed: settings.followed,
                wanted_quality: settings.wanted_quality,
                status: None,
            }));
        }

        for tvdb_id in self.db.show_settings().followed_ids().await? {
            if seen.contains(&tvdb_id) {
                continue;
            }
            if let Some(show) = self.show_by_tvdb(tvdb_id).await? {
                out.push(show);
            }
        }

        Ok(out)
    }

    /// Map a scene (season, episode) onto episodes. Identity when the show
    /// has no numbering map; an empty mapping row set for an episode the
    /// map does know about means "does not exist", which yields identity
    /// too (feeds are wrong more often than the map).
    pub async fn episode_from_scene(
        &self,
        show: Arc<TvShow>,
        scene_season: u32,
        scene_episode: u32,
    ) -> Result<TvEpisode> {
        let mapped = self
            .numbering
            .to_tvdb(show.tvdb_id, scene_season, scene_episode)
            .await?;
        let tvdb_episodes = if mapped.is_empty() {
            vec![(scene_season, scene_episode)]
        } else {
            mapped
        };

        let library_id = self
            .owned_episode_id(&show, &tvdb_episodes)
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "library episode lookup failed; assuming not owned");
                None
            });

        Ok(TvEpisode {
            show,
            library_id,
            tvdb_episodes,
            scene_episodes: vec![(scene_season, scene_episode)],
        })
    }

    /// Build an episode straight from tvdb numbering.
    pub async fn episode_from_tvdb(
        &self,
        show: Arc<TvShow>,
        season: u32,
        episode: u32,
    ) -> Result<TvEpisode> {
        let mapped = self.numbering.to_scene(show.tvdb_id, season, episode).await?;
        let scene_episodes = if mapped.is_empty() {
            vec![(season, episode)]
        } else {
            mapped
        };
        let library_id = self
            .owned_episode_id(&show, &[(season, episode)])
            .await
            .unwrap_or(None);

        Ok(TvEpisode {
            show,
            library_id,
            tvdb_episodes: vec![(season, episode)],
            scene_episodes,
        })
    }

    async fn owned_episode_id(
        &self,
        show: &TvShow,
        tvdb_episodes: &[(u32, u32)],
    ) -> Result<Option<i64>> {
        let Some(show_library_id) = show.library_id else {
            return Ok(None);
        };
        for (season, episode) in tvdb_episodes {
            let eps = self.library_episodes(show_library_id, *season).await?;
            if let Some(found) = eps.iter().find(|e| e.episode == *episode) {
                return Ok(Some(found.library_id));
            }
        }
        Ok(None)
    }

    /// Wantedness: followed show, quality in the wanted mask, not already
    /// owned, not already downloading.
    pub fn is_wanted_in_quality(&self, episode: &TvEpisode, quality: Quality) -> bool {
        if !episode.show.followed {
            return false;
        }
        if !episode.show.wanted_quality.intersects(quality) {
            return false;
        }
        if episode.library_id.is_some() {
            return false;
        }
        for (season, ep) in &episode.tvdb_episodes {
            if self.active.contains(episode.show.tvdb_id, *season, *ep) {
                return false;
            }
        }
        true
    }

    /// Resolve a parsed series name to a tvdb id: exact simplified match
    /// against library titles first, then the scene-name exception table.
    pub async fn resolve_series_name(&self, name: &str) -> Result<Option<u32>> {
        let simplified = simplify_show_name(name);
        if simplified.is_empty() {
            return Ok(None);
        }

        for show in self.library_shows().await?.iter() {
            if show.tvdb_id.is_some() && simplify_show_name(&show.title) == simplified {
                return Ok(show.tvdb_id);
            }
        }

        self.db.scene_names().tvdb_id_for_simplified(&simplified).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::library::NullLibrary;

    async fn catalog_with_active() -> (Catalog, Arc<ActiveEpisodes>) {
        let db = Database::connect_memory().await.unwrap();
        let active = ActiveEpisodes::new();
        let catalog = Catalog::new(
            db.clone(),
            Arc::new(NullLibrary),
            Arc::new(MetadataClient::new("http://127.0.0.1:9")),
            NumberingService::new(db, "http://127.0.0.1:9"),
            active.clone(),
            PathBuf::from("/tv"),
        );
        (catalog, active)
    }

    fn episode(followed: bool, wanted: Quality, library_id: Option<i64>) -> TvEpisode {
        TvEpisode {
            show: Arc::new(TvShow {
                tvdb_id: 1,
                library_id: None,
                name: "Show".to_string(),
                path: None,
                followed,
                wanted_quality: wanted,
                status: None,
            }),
            library_id,
            tvdb_episodes: vec![(1, 1)],
            scene_episodes: vec![(1, 1)],
        }
    }

    #[tokio::test]
    async fn wantedness_requires_follow_mask_and_no_copy() {
        let (catalog, active) = catalog_with_active().await;

        let ep = episode(true, Quality::HD, None);
        assert!(catalog.is_wanted_in_quality(&ep, Quality::HDTV));

        // Quality outside the wanted mask.
        assert!(!catalog.is_wanted_in_quality(&ep, Quality::SDTV));

        // Not followed.
        let ep = episode(false, Quality::HD, None);
        assert!(!catalog.is_wanted_in_quality(&ep, Quality::HDTV));

        // Library already owns a copy.
        let ep = episode(true, Quality::HD, Some(7));
        assert!(!catalog.is_wanted_in_quality(&ep, Quality::HDTV));

        // Already downloading.
        let ep = episode(true, Quality::HD, None);
        let candidate = crate::release::Downloadable::new(
            crate::release::ReleaseKind::Torrent,
            vec!["magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567".to_string()],
            vec![ep.clone()],
            None,
            Quality::HDTV,
            None,
        );
        active.mark(&candidate);
        assert!(!catalog.is_wanted_in_quality(&ep, Quality::HDTV));
        active.unmark(&candidate);
        assert!(catalog.is_wanted_in_quality(&ep, Quality::HDTV));
    }
}
