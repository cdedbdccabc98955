//! End-to-end coverage of dispatch, snapshot persistence, and filing.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use showrunner::blacklist::Blacklist;
use showrunner::catalog::{Catalog, TvEpisode, TvShow};
use showrunner::config::Config;
use showrunner::db::{Database, EpisodeRow};
use showrunner::downloader::{
    BackendRegistry, Download, DownloadBackend, DownloadStatus, dispatch, save_snapshots,
    snapshot_path, take_snapshots,
};
use showrunner::events::EventBus;
use showrunner::filer::Filer;
use showrunner::naming::SceneNameParser;
use showrunner::numbering::NumberingService;
use showrunner::release::quality::Quality;
use showrunner::release::{Downloadable, ReleaseKind};
use showrunner::services::library::{LibraryClient, NullLibrary};
use showrunner::services::metadata::MetadataClient;

const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

fn show(tvdb_id: u32, name: &str) -> Arc<TvShow> {
    Arc::new(TvShow {
        tvdb_id,
        library_id: None,
        name: name.to_string(),
        path: None,
        followed: true,
        wanted_quality: Quality::HD,
        status: Some("Running".to_string()),
    })
}

fn episode(show: Arc<TvShow>, season: u32, number: u32) -> TvEpisode {
    TvEpisode {
        show,
        library_id: None,
        tvdb_episodes: vec![(season, number)],
        scene_episodes: vec![(season, number)],
    }
}

fn candidate(name: &str, episodes: Vec<TvEpisode>) -> Downloadable {
    Downloadable::new(
        ReleaseKind::Torrent,
        vec![format!("magnet:?xt=urn:btih:{HASH}")],
        episodes,
        Some(name.to_string()),
        Quality::HDTV,
        Some("showrss".to_string()),
    )
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

enum Script {
    Accept,
    Decline,
    Fail,
}

struct ScriptedBackend {
    label: &'static str,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(label: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            label,
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn is_enabled(&self) -> bool {
        true
    }

    fn can_download(&self, _downloadable: &Downloadable) -> bool {
        true
    }

    async fn download(&self, _downloadable: Downloadable) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Accept => Ok(true),
            Script::Decline => Ok(false),
            Script::Fail => bail!("engine exploded"),
        }
    }

    fn downloads(&self) -> Vec<Arc<Download>> {
        Vec::new()
    }

    async fn restore_state(&self) {}

    async fn shutdown(&self) {}
}

#[tokio::test]
async fn dispatch_stops_at_first_accepting_backend() {
    let first = ScriptedBackend::new("first", Script::Accept);
    let second = ScriptedBackend::new("second", Script::Accept);
    let registry = BackendRegistry::new(vec![
        first.clone() as Arc<dyn DownloadBackend>,
        second.clone(),
    ]);

    let taken = dispatch(&registry, &candidate("Some.Show.S01E01.720p.HDTV.x264", vec![]))
        .await
        .unwrap();
    assert!(taken);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn dispatch_falls_through_declines_and_failures() {
    let declines = ScriptedBackend::new("declines", Script::Decline);
    let fails = ScriptedBackend::new("fails", Script::Fail);
    let accepts = ScriptedBackend::new("accepts", Script::Accept);
    let registry = BackendRegistry::new(vec![
        declines.clone() as Arc<dyn DownloadBackend>,
        fails.clone(),
        accepts.clone(),
    ]);

    let taken = dispatch(&registry, &candidate("Some.Show.S01E02.HDTV.x264", vec![]))
        .await
        .unwrap();
    assert!(taken);
    assert_eq!(declines.calls(), 1);
    assert_eq!(fails.calls(), 1);
    assert_eq!(accepts.calls(), 1);
}

#[tokio::test]
async fn dispatch_reports_when_nobody_takes_it() {
    let only = ScriptedBackend::new("only", Script::Decline);
    let registry = BackendRegistry::new(vec![only.clone() as Arc<dyn DownloadBackend>]);

    let taken = dispatch(&registry, &candidate("Some.Show.S01E03.HDTV.x264", vec![]))
        .await
        .unwrap();
    assert!(!taken);
    assert_eq!(only.calls(), 1);
}

// ---------------------------------------------------------------------------
// Snapshot persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshots_round_trip_and_consume_the_file() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(dir.path(), "rqbit");

    let ep = episode(show(73244, "The Office"), 2, 5);
    let download = Download::new(
        candidate("The.Office.S02E05.720p.HDTV.x264", vec![ep]),
        "rqbit",
    );
    let snapshots = vec![download.to_snapshot()];
    save_snapshots(&path, &snapshots).unwrap();
    assert!(path.exists());

    let restored = take_snapshots(&path);
    assert!(!path.exists(), "taking snapshots must consume the file");
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].key, HASH);
    assert_eq!(restored[0].backend, "rqbit");
    assert_eq!(restored[0].status, DownloadStatus::NOT_STARTED);

    let revived = Download::from_snapshot(restored.into_iter().next().unwrap());
    assert_eq!(revived.key(), download.key());
    assert_eq!(
        revived.downloadable().tvdb_keys(),
        download.downloadable().tvdb_keys()
    );
}

#[tokio::test]
async fn empty_snapshot_list_removes_stale_file() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(dir.path(), "transmission");
    std::fs::write(&path, "[]").unwrap();

    save_snapshots(&path, &[]).unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn unreadable_snapshot_file_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(dir.path(), "rqbit");
    std::fs::write(&path, "not json at all").unwrap();

    let restored = take_snapshots(&path);
    assert!(restored.is_empty());
    assert!(!path.exists());
}

// ---------------------------------------------------------------------------
// Filing
// ---------------------------------------------------------------------------

async fn build_filer(root: &Path, db: Database, blacklist: Arc<Blacklist>) -> Arc<Filer> {
    let config = Arc::new(Config::rooted_at(root));
    let library: Arc<dyn LibraryClient> = Arc::new(NullLibrary);
    let metadata = Arc::new(MetadataClient::new("http://127.0.0.1:9"));
    let numbering = NumberingService::new(db.clone(), "http://127.0.0.1:9");
    let active = showrunner::downloader::ActiveEpisodes::new();
    let catalog = Arc::new(Catalog::new(
        db.clone(),
        library.clone(),
        metadata,
        numbering,
        active,
        config.new_show_path.clone().into(),
    ));
    let parser = SceneNameParser::new(catalog, db.clone());
    let events = Arc::new(EventBus::new());
    Filer::new(config, db, library, blacklist, parser, events)
}

#[tokio::test]
async fn files_single_video_under_library_name() {
    let dir = TempDir::new().unwrap();
    let db = Database::connect_memory().await.unwrap();
    db.episodes()
        .replace_show(
            73244,
            &[EpisodeRow {
                tvdb_id: 73244,
                season: 2,
                episode: 5,
                name: Some("Halloween".to_string()),
                first_aired: None,
            }],
            Some("Ended"),
        )
        .await
        .unwrap();

    let blacklist = Arc::new(Blacklist::new());
    let filer = build_filer(dir.path(), db, blacklist.clone()).await;

    let payload = dir.path().join("The.Office.S02E05.720p.HDTV.x264.mkv");
    std::fs::write(&payload, b"video bytes").unwrap();

    let ep = episode(show(73244, "The Office"), 2, 5);
    let copied = filer
        .file_download(
            std::slice::from_ref(&ep),
            Some("The.Office.S02E05.720p.HDTV.x264"),
            &[HASH.to_string()],
            &[payload],
        )
        .await
        .unwrap();
    assert!(copied);

    let expected = dir
        .path()
        .join("tv")
        .join("The Office")
        .join("Season 2")
        .join("The Office - S02E05 - Halloween.mkv");
    assert!(expected.exists(), "missing {}", expected.display());
    assert!(!blacklist.contains(HASH));
}

#[tokio::test]
async fn payload_without_videos_gets_blacklisted() {
    let dir = TempDir::new().unwrap();
    let db = Database::connect_memory().await.unwrap();
    let blacklist = Arc::new(Blacklist::new());
    let filer = build_filer(dir.path(), db, blacklist.clone()).await;

    let junk = dir.path().join("readme.nfo");
    std::fs::write(&junk, b"greets").unwrap();

    let ep = episode(show(73244, "The Office"), 2, 5);
    let copied = filer
        .file_download(
            std::slice::from_ref(&ep),
            Some("The.Office.S02E05.720p.HDTV.x264"),
            &[HASH.to_string(), "http-key".to_string()],
            &[junk],
        )
        .await
        .unwrap();
    assert!(!copied);
    assert!(blacklist.contains(HASH));
    assert!(blacklist.contains("http-key"));
}

#[tokio::test]
async fn unparseable_files_keep_their_names_in_a_single_season_pack() {
    let dir = TempDir::new().unwrap();
    let db = Database::connect_memory().await.unwrap();
    let blacklist = Arc::new(Blacklist::new());
    let filer = build_filer(dir.path(), db, blacklist.clone()).await;

    let one = dir.path().join("disc-one.mkv");
    let two = dir.path().join("disc-two.mkv");
    std::fs::write(&one, b"a").unwrap();
    std::fs::write(&two, b"b").unwrap();

    let office = show(73244, "The Office");
    let eps = vec![episode(office.clone(), 2, 5), episode(office, 2, 6)];
    let copied = filer
        .file_download(
            &eps,
            Some("The.Office.Season.2.DVDRip"),
            &[HASH.to_string()],
            &[one, two],
        )
        .await
        .unwrap();
    assert!(copied);

    let season = dir
        .path()
        .join("tv")
        .join("The Office")
        .join("Season 2");
    assert!(season.join("disc-one.mkv").exists());
    assert!(season.join("disc-two.mkv").exists());
    assert!(!blacklist.contains(HASH));
}

#[tokio::test]
async fn unparseable_files_spanning_seasons_are_not_placed() {
    let dir = TempDir::new().unwrap();
    let db = Database::connect_memory().await.unwrap();
    let blacklist = Arc::new(Blacklist::new());
    let filer = build_filer(dir.path(), db, blacklist.clone()).await;

    let one = dir.path().join("disc-one.mkv");
    let two = dir.path().join("disc-two.mkv");
    std::fs::write(&one, b"a").unwrap();
    std::fs::write(&two, b"b").unwrap();

    // With episodes from two seasons there is no way to tell which folder
    // an unparseable file belongs to, so nothing may be copied.
    let office = show(73244, "The Office");
    let eps = vec![episode(office.clone(), 1, 1), episode(office, 2, 5)];
    let copied = filer
        .file_download(
            &eps,
            Some("The.Office.S01-S02.DVDRip"),
            &[HASH.to_string()],
            &[one, two],
        )
        .await
        .unwrap();

    assert!(!copied);
    assert!(
        !dir.path().join("tv").exists(),
        "nothing should have been copied"
    );
}

#[tokio::test]
async fn copy_failure_does_not_blacklist_the_download() {
    let dir = TempDir::new().unwrap();
    let db = Database::connect_memory().await.unwrap();
    let blacklist = Arc::new(Blacklist::new());
    let filer = build_filer(dir.path(), db, blacklist.clone()).await;

    // A file where the library root belongs makes every copy fail.
    std::fs::write(dir.path().join("tv"), b"not a directory").unwrap();

    let payload = dir.path().join("The.Office.S02E05.720p.HDTV.x264.mkv");
    std::fs::write(&payload, b"video bytes").unwrap();

    let ep = episode(show(73244, "The Office"), 2, 5);
    let copied = filer
        .file_download(
            std::slice::from_ref(&ep),
            Some("The.Office.S02E05.720p.HDTV.x264"),
            &[HASH.to_string()],
            &[payload],
        )
        .await
        .unwrap();

    assert!(!copied);
    assert!(!blacklist.contains(HASH));
}
