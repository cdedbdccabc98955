//! Post-download filing: moving finished payloads into the library layout.
//!
//! One download at a time (a single global lock), because filing touches
//! shared directories and the media library rescans behind it. A download
//! whose payload contains no recognizable episode video is a bad release:
//! its keys are blacklisted so the feeds never pick it again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::blacklist::Blacklist;
use crate::catalog::TvEpisode;
use crate::config::Config;
use crate::db::Database;
use crate::events::{EventBus, EventKind};
use crate::naming::SceneNameParser;
use crate::services::library::LibraryClient;

const COPY_ATTEMPTS: u32 = 5;
const COPY_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Bound on a single copy attempt; a wedged mount must not stall filing
/// forever.
const COPY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const VIDEO_EXTENSIONS: &[&str] = &[
    "avi", "divx", "flv", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "ogm", "ts", "webm", "wmv",
];

// Containers and leftovers that are never the payload.
const JUNK_EXTENSIONS: &[&str] = &[
    "rar", "zip", "r00", "nzb", "strm", "pls", "m3u", "srt", "sub", "idx", "nfo", "sfv", "txt",
    "jpg", "png", "torrent", "part",
];

static SAMPLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|[\W_])sample\d*[\W_]").expect("sample pattern"));

/// Is this a video file worth filing? Rejects samples, resource forks,
/// partial downloads, and non-video extensions.
pub fn is_video_file(filename: &str) -> bool {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);

    if name.starts_with("._") {
        return false;
    }
    if name.contains(".partial.") {
        return false;
    }
    if SAMPLE_RE.is_match(name) {
        return false;
    }

    let Some(ext) = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()) else {
        return false;
    };
    if JUNK_EXTENSIONS.contains(&ext.as_str()) {
        return false;
    }
    VIDEO_EXTENSIONS.contains(&ext.as_str())
}

/// What a payload file turned out to be.
enum FileTarget {
    /// Identified episodes; place under a synthesized library filename.
    Episodes(Vec<TvEpisode>),
    /// Unparseable, but the download pins a single season; keep the
    /// file's own name under that season's folder.
    SeasonFolder(u32),
    Unknown,
}

pub struct Filer {
    config: Arc<Config>,
    db: Database,
    library: Arc<dyn LibraryClient>,
    blacklist: Arc<Blacklist>,
    parser: Arc<SceneNameParser>,
    events: Arc<EventBus>,
    lock: Mutex<()>,
}

impl Filer {
    pub fn new(
        config: Arc<Config>,
        db: Database,
        library: Arc<dyn LibraryClient>,
        blacklist: Arc<Blacklist>,
        parser: Arc<SceneNameParser>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            library,
            blacklist,
            parser,
            events,
            lock: Mutex::new(()),
        })
    }

    /// File a finished download's payload. `files` are the absolute paths
    /// the engine wrote. Returns whether anything was copied into the
    /// library; when nothing was even recognized as known media, the
    /// download's keys are blacklisted. Copy failures alone never
    /// blacklist, so the candidate stays retryable.
    pub async fn file_download(
        &self,
        episodes: &[TvEpisode],
        name: Option<&str>,
        keys: &[String],
        files: &[PathBuf],
    ) -> Result<bool> {
        let _guard = self.lock.lock().await;

        let videos: Vec<&PathBuf> = files
            .iter()
            .filter(|f| {
                f.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_video_file)
            })
            .collect();
        debug!(
            name = ?name,
            files = files.len(),
            videos = videos.len(),
            "filing download"
        );

        let mut recognized = 0usize;
        let mut copied = 0usize;
        let mut show_dir = None;

        if videos.len() == 1 && !episodes.is_empty() {
            // The easy case: one payload video, and the download itself
            // tells us exactly which episodes it is.
            recognized += 1;
            match self.place_file(videos[0], episodes).await {
                Ok(true) => {
                    copied += 1;
                    show_dir = episodes
                        .first()
                        .map(|e| e.show.fs_path(Path::new(&self.config.new_show_path)));
                }
                Ok(false) => {}
                Err(e) => warn!(file = %videos[0].display(), error = %e, "filing file failed"),
            }
        } else {
            for video in &videos {
                let Some(filename) = video.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let target = match self.identify(filename, episodes).await {
                    Ok(target) => target,
                    Err(e) => {
                        warn!(file = %filename, error = %e, "identifying payload file failed");
                        continue;
                    }
                };
                match target {
                    FileTarget::Unknown => {
                        debug!(file = %filename, "could not identify payload file");
                    }
                    FileTarget::Episodes(file_episodes) => {
                        recognized += 1;
                        match self.place_file(video, &file_episodes).await {
                            Ok(true) => {
                                copied += 1;
                                show_dir = file_episodes.first().map(|e| {
                                    e.show.fs_path(Path::new(&self.config.new_show_path))
                                });
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!(file = %filename, error = %e, "filing file failed")
                            }
                        }
                    }
                    FileTarget::SeasonFolder(season) => {
                        recognized += 1;
                        match self.place_original(video, episodes, season).await {
                            Ok(Some(dir)) => {
                                copied += 1;
                                show_dir = Some(dir);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(file = %filename, error = %e, "filing file failed")
                            }
                        }
                    }
                }
            }
        }

        if copied == 0 {
            if recognized == 0 {
                warn!(name = ?name, "nothing recognizable in payload; blacklisting");
                for key in keys {
                    self.blacklist.add(key);
                }
            }
            return Ok(false);
        }

        let dir = show_dir.as_ref().map(|d| d.to_string_lossy().into_owned());
        if let Err(e) = self.library.rescan(dir.as_deref()).await {
            warn!(error = %e, "library rescan failed");
        }
        self.events.publish(EventKind::VideoLibraryUpdated);
        info!(name = ?name, copied = copied, "filed download");
        Ok(true)
    }

    /// Figure out what a payload file is from its own name, falling back
    /// to the download's season when the name carries episodes but no
    /// season (single-season packs name files "E01", "E02", ...). A name
    /// that parses to nothing at all still gets placed under the season
    /// folder, keeping its original filename, when the download spans
    /// exactly one season; spanning several seasons it is skipped, since
    /// there is no way to tell which one the file belongs to.
    async fn identify(
        &self,
        filename: &str,
        download_episodes: &[TvEpisode],
    ) -> Result<FileTarget> {
        let parsed = self.parser.parse(filename, true).await?;
        if parsed.is_bad {
            return Ok(FileTarget::Unknown);
        }
        if parsed.is_known() {
            return Ok(FileTarget::Episodes(parsed.episodes.clone()));
        }

        if parsed.season.is_none() && !parsed.episode_numbers.is_empty() {
            let mut seasons: Vec<u32> = download_episodes
                .iter()
                .flat_map(|e| e.scene_episodes.iter().map(|(s, _)| *s))
                .collect();
            seasons.sort_unstable();
            seasons.dedup();
            if let [season] = seasons.as_slice() {
                let episodes = self.parser.resolve_with_season(&parsed, *season).await?;
                if !episodes.is_empty() {
                    return Ok(FileTarget::Episodes(episodes));
                }
            }
        }

        let mut seasons: Vec<u32> = download_episodes
            .iter()
            .flat_map(|e| e.tvdb_episodes.iter().map(|&(s, _)| s))
            .collect();
        seasons.sort_unstable();
        seasons.dedup();
        if let [season] = seasons.as_slice() {
            return Ok(FileTarget::SeasonFolder(*season));
        }
        Ok(FileTarget::Unknown)
    }

    /// Copy a video we could not parse into the season folder under its
    /// original name.
    async fn place_original(
        &self,
        video: &Path,
        download_episodes: &[TvEpisode],
        season: u32,
    ) -> Result<Option<PathBuf>> {
        let Some(first) = download_episodes.first() else {
            return Ok(None);
        };
        let Some(filename) = video.file_name() else {
            return Ok(None);
        };

        let show_dir = first.show.fs_path(Path::new(&self.config.new_show_path));
        let season_dir = show_dir.join(format!("Season {season}"));
        let dest = season_dir.join(filename);

        tokio::fs::create_dir_all(&season_dir)
            .await
            .context("creating season directory")?;
        self.copy_with_retries(video, &dest).await?;
        info!(from = %video.display(), to = %dest.display(), "copied into library under original name");
        Ok(Some(show_dir))
    }

    /// Copy one video into `<show>/Season <N>/<Show> - SxxEyy - Title.ext`.
    async fn place_file(&self, video: &Path, episodes: &[TvEpisode]) -> Result<bool> {
        let Some(first) = episodes.first() else {
            return Ok(false);
        };
        let Some(&(season, _)) = first.tvdb_episodes.first() else {
            return Ok(false);
        };

        let show_dir = first.show.fs_path(Path::new(&self.config.new_show_path));
        let season_dir = show_dir.join(format!("Season {season}"));
        let filename = self.library_filename(video, episodes, season).await;
        let dest = season_dir.join(filename);

        tokio::fs::create_dir_all(&season_dir)
            .await
            .context("creating season directory")?;
        self.copy_with_retries(video, &dest).await?;
        info!(from = %video.display(), to = %dest.display(), "copied into library");
        Ok(true)
    }

    async fn library_filename(
        &self,
        video: &Path,
        episodes: &[TvEpisode],
        season: u32,
    ) -> String {
        let show = &episodes[0].show;
        let ext = video
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv");

        let mut numbers = format!("S{season:02}");
        let mut title = None;
        for ep in episodes {
            for &(s, e) in &ep.tvdb_episodes {
                numbers.push_str(&format!("E{e:02}"));
                if title.is_none() {
                    title = self
                        .db
                        .episodes()
                        .episode_name(show.tvdb_id, s, e)
                        .await
                        .unwrap_or(None);
                }
            }
        }

        let stem = match title {
            Some(title) => format!("{} - {} - {}", show.name, numbers, title),
            None => format!("{} - {}", show.name, numbers),
        };
        format!("{}.{}", sanitize_filename::sanitize(stem), ext)
    }

    async fn copy_with_retries(&self, from: &Path, to: &Path) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=COPY_ATTEMPTS {
            match tokio::time::timeout(COPY_TIMEOUT, tokio::fs::copy(from, to)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => {
                    warn!(
                        from = %from.display(),
                        attempt = attempt,
                        error = %e,
                        "copy attempt failed"
                    );
                    last_err = Some(anyhow::Error::from(e));
                }
                Err(_) => {
                    warn!(from = %from.display(), attempt = attempt, "copy attempt timed out");
                    last_err = Some(anyhow::anyhow!("copy timed out"));
                }
            }
            if attempt < COPY_ATTEMPTS {
                tokio::time::sleep(COPY_RETRY_DELAY).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("copy failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_file_detection() {
        assert!(is_video_file("House.S01E01.720p.HDTV.x264-GRP.mkv"));
        assert!(is_video_file("episode.avi"));
        assert!(is_video_file("show.ts"));

        assert!(!is_video_file("House.S01E01.sample.mkv"));
        assert!(!is_video_file("sample-House.S01E01.mkv"));
        assert!(!is_video_file("Sample2.of.show.mkv"));
        assert!(!is_video_file("._House.S01E01.mkv"));
        assert!(!is_video_file("House.S01E01.partial.mkv"));
        assert!(!is_video_file("House.S01E01.rar"));
        assert!(!is_video_file("House.S01E01.nfo"));
        assert!(!is_video_file("House.S01E01.srt"));
        assert!(!is_video_file("noextension"));
    }

    #[test]
    fn sample_must_be_a_word() {
        // "sample" inside a real word is fine.
        assert!(is_video_file("The.Sampler.S01E01.mkv"));
    }
}
