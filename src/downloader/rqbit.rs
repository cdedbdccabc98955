//! Embedded torrent engine backed by librqbit.
//!
//! The session is created lazily on first use and persists its own state
//! under the configured session directory, so restarts pick up partially
//! downloaded torrents without rechecking from scratch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session, SessionOptions};
use tracing::{debug, info, warn};

use super::{
    BackendContext, Download, DownloadBackend, DownloadStatus, LifecycleEvent, PollResult,
    RunningSet, save_snapshots, snapshot_path, take_snapshots,
};
use crate::filer::is_video_file;
use crate::release::{Downloadable, ReleaseKind};

const BACKEND_NAME: &str = "rqbit";
/// How long a fresh torrent gets to fetch metadata before we give up.
const START_TIMEOUT: Duration = Duration::from_secs(120);
const METADATA_POLL: Duration = Duration::from_secs(2);

pub struct RqbitBackend {
    ctx: Arc<BackendContext>,
    session: Arc<tokio::sync::RwLock<Option<Arc<Session>>>>,
    running: Arc<RunningSet>,
    add_lock: tokio::sync::Mutex<()>,
}

impl RqbitBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            session: Arc::new(tokio::sync::RwLock::new(None)),
            running: Arc::new(RunningSet::new()),
            add_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Get or create the librqbit session.
    async fn session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.clone() {
            return Ok(session);
        }

        let downloads = PathBuf::from(&self.ctx.config.downloads_path);
        let session_dir = PathBuf::from(&self.ctx.config.session_path);
        tokio::fs::create_dir_all(&downloads)
            .await
            .context("creating downloads directory")?;
        tokio::fs::create_dir_all(&session_dir)
            .await
            .context("creating session directory")?;

        let opts = SessionOptions {
            persistence: Some(librqbit::SessionPersistenceConfig::Json {
                folder: Some(session_dir),
            }),
            ..Default::default()
        };
        let session = Session::new_with_opts(downloads, opts)
            .await
            .context("creating torrent session")?;
        info!(path = %self.ctx.config.downloads_path, "torrent session started");
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Add the torrent and wait for metadata, rejecting payloads with no
    /// video file. Returns the engine's torrent id. A payload rejection
    /// blacklists the candidate; transient failures (slow tracker, no
    /// peers yet) are plain errors so the next pass can retry.
    async fn add_and_verify(
        &self,
        session: &Arc<Session>,
        url: &str,
        downloadable: &Downloadable,
    ) -> Result<usize> {
        let opts = AddTorrentOptions {
            overwrite: true,
            ..Default::default()
        };
        let response = session
            .add_torrent(AddTorrent::from_url(url), Some(opts))
            .await
            .context("adding torrent")?;
        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => (id, handle),
            AddTorrentResponse::ListOnly(_) => bail!("torrent was added in list-only mode"),
        };

        let metadata = tokio::time::timeout(START_TIMEOUT, async {
            loop {
                if let Some(metadata) = handle.metadata.load_full() {
                    return metadata;
                }
                tokio::time::sleep(METADATA_POLL).await;
            }
        })
        .await;
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(_) => {
                let _ = session.delete(TorrentIdOrHash::Id(id), true).await;
                bail!("torrent metadata did not arrive within {START_TIMEOUT:?}");
            }
        };

        let has_video = metadata.file_infos.iter().any(|fi| {
            fi.relative_filename
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_video_file)
        });
        if !has_video {
            let _ = session.delete(TorrentIdOrHash::Id(id), true).await;
            // A bad payload would fail again next pass; keep it out of
            // the feeds.
            self.ctx.blacklist.add(&downloadable.unique_key());
            for u in downloadable.urls() {
                self.ctx.blacklist.add(u);
            }
            bail!("torrent payload contains no video file");
        }
        Ok(id)
    }

    fn start_poller(&self, download: Arc<Download>, torrent_id: usize) {
        let ctx = self.ctx.clone();
        let session = self.session.clone();
        let running = self.running.clone();
        let d = download.clone();
        download.start_polling(move || {
            let ctx = ctx.clone();
            let session = session.clone();
            let running = running.clone();
            let download = d.clone();
            async move {
                let Some(session) = session.read().await.clone() else {
                    return Ok(());
                };
                let poll = poll_torrent(&session, torrent_id);
                let events = download.apply_poll(poll);
                handle_events(&ctx, &session, &running, &download, torrent_id, events).await;
                Ok(())
            }
        });
    }
}

#[async_trait]
impl DownloadBackend for RqbitBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn is_available(&self) -> bool {
        // Embedded engine, always reachable.
        true
    }

    async fn is_enabled(&self) -> bool {
        self.ctx
            .db
            .settings()
            .get_or_default("rqbit_enabled", true)
            .await
            .unwrap_or(true)
    }

    fn can_download(&self, downloadable: &Downloadable) -> bool {
        downloadable.kind() == ReleaseKind::Torrent
    }

    async fn download(&self, downloadable: Downloadable) -> Result<bool> {
        let key = downloadable.unique_key();
        let _guard = self.add_lock.lock().await;
        if self.running.contains(&key) {
            debug!(key = %key, "download already running, rejecting duplicate");
            return Ok(false);
        }

        let Some(url) = downloadable.magnet().or_else(|| downloadable.preferred_url()) else {
            return Ok(false);
        };

        let session = self.session().await?;
        let torrent_id = self.add_and_verify(&session, &url, &downloadable).await?;

        let download = Download::new(downloadable, BACKEND_NAME);
        self.ctx.active.mark(download.downloadable());
        self.running.insert(download.clone());
        self.ctx.record_started(&download).await;
        self.start_poller(download, torrent_id);
        Ok(true)
    }

    fn downloads(&self) -> Vec<Arc<Download>> {
        self.running.list()
    }

    async fn restore_state(&self) {
        let path = snapshot_path(&self.ctx.config.state_dir, BACKEND_NAME);
        let snapshots = take_snapshots(&path);
        if snapshots.is_empty() {
            return;
        }
        info!(count = snapshots.len(), "restoring rqbit downloads");

        for snap in snapshots {
            let download = Download::from_snapshot(snap);
            if download.status().is_final() {
                continue;
            }
            let d = download.downloadable();
            let Some(url) = d.magnet().or_else(|| d.preferred_url()) else {
                continue;
            };
            let session = match self.session().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot restore downloads without a session");
                    return;
                }
            };
            // The session's own persistence remembers the torrent; re-adding
            // is how we learn its id again.
            let opts = AddTorrentOptions {
                overwrite: true,
                ..Default::default()
            };
            let torrent_id = match session
                .add_torrent(AddTorrent::from_url(&url), Some(opts))
                .await
            {
                Ok(AddTorrentResponse::Added(id, _))
                | Ok(AddTorrentResponse::AlreadyManaged(id, _)) => id,
                Ok(AddTorrentResponse::ListOnly(_)) => continue,
                Err(e) => {
                    warn!(key = %download.key(), error = %e, "could not re-add torrent");
                    let events = download.apply_poll(PollResult {
                        status: DownloadStatus::FAILED,
                        downloaded_bytes: download.downloaded_bytes(),
                        total_bytes: download.total_bytes(),
                        rate_bps: 0.0,
                    });
                    for event in events {
                        if event == LifecycleEvent::Failed {
                            self.ctx.record_failed(&download).await;
                        }
                    }
                    continue;
                }
            };
            self.ctx.active.mark(download.downloadable());
            self.running.insert(download.clone());
            self.start_poller(download, torrent_id);
        }
    }

    async fn shutdown(&self) {
        let downloads = self.running.list();
        let mut snapshots = Vec::with_capacity(downloads.len());
        for download in &downloads {
            download.shutdown_polling().await;
            if !download.status().is_final() {
                snapshots.push(download.to_snapshot());
            }
        }
        let path = snapshot_path(&self.ctx.config.state_dir, BACKEND_NAME);
        if let Err(e) = save_snapshots(&path, &snapshots) {
            warn!(error = %e, "failed to save rqbit snapshots");
        }
        *self.session.write().await = None;
    }
}

/// One engine observation, translated into our lifecycle vocabulary.
fn poll_torrent(session: &Session, torrent_id: usize) -> PollResult {
    use librqbit::TorrentStatsState;

    let Some(handle) = session.get(TorrentIdOrHash::Id(torrent_id)) else {
        return PollResult {
            status: DownloadStatus::FAILED,
            downloaded_bytes: 0,
            total_bytes: 0,
            rate_bps: 0.0,
        };
    };
    let stats = handle.stats();
    let rate_bps = stats
        .live
        .as_ref()
        .map(|live| live.download_speed.mbps * 125000.0)
        .unwrap_or(0.0);
    let status = match &stats.state {
        TorrentStatsState::Error => DownloadStatus::FAILED,
        TorrentStatsState::Initializing => DownloadStatus::STARTING,
        TorrentStatsState::Paused if stats.finished => DownloadStatus::FINISHED,
        TorrentStatsState::Paused => DownloadStatus::PAUSED,
        TorrentStatsState::Live if stats.finished => DownloadStatus::POST_DOWNLOAD,
        TorrentStatsState::Live => DownloadStatus::DOWNLOADING,
    };
    PollResult {
        status,
        downloaded_bytes: stats.progress_bytes,
        total_bytes: stats.total_bytes,
        rate_bps,
    }
}

/// Absolute paths of the torrent's payload files on disk.
fn payload_files(downloads_dir: &str, session: &Session, torrent_id: usize) -> Vec<PathBuf> {
    let Some(handle) = session.get(TorrentIdOrHash::Id(torrent_id)) else {
        return Vec::new();
    };
    let Some(metadata) = handle.metadata.load_full() else {
        return Vec::new();
    };
    let base = PathBuf::from(downloads_dir);
    let multi = metadata.file_infos.len() > 1;
    metadata
        .file_infos
        .iter()
        .map(|fi| {
            if multi {
                let name = handle.name().unwrap_or_else(|| "unknown".to_string());
                base.join(name).join(&fi.relative_filename)
            } else {
                base.join(&fi.relative_filename)
            }
        })
        .collect()
}

async fn handle_events(
    ctx: &Arc<BackendContext>,
    session: &Arc<Session>,
    running: &Arc<RunningSet>,
    download: &Arc<Download>,
    torrent_id: usize,
    events: Vec<LifecycleEvent>,
) {
    for event in events {
        match event {
            LifecycleEvent::Started | LifecycleEvent::FirstData => {
                debug!(key = %download.key(), ?event, "download milestone");
            }
            LifecycleEvent::Paused | LifecycleEvent::Resumed => {
                info!(key = %download.key(), ?event, "download state change");
            }
            LifecycleEvent::Downloaded => {
                let files = payload_files(&ctx.config.downloads_path, session, torrent_id);
                let d = download.downloadable();
                let mut keys = vec![download.key().to_string()];
                keys.extend(d.urls().iter().cloned());
                match ctx
                    .filer
                    .file_download(d.episodes(), d.name(), &keys, &files)
                    .await
                {
                    Ok(copied) => download.set_copied_to_library(copied),
                    Err(e) => warn!(key = %download.key(), error = %e, "filing failed"),
                }
                // The torrent keeps seeding; the engine reports FINISHED
                // on its own once seeding stops.
            }
            LifecycleEvent::Finished => {
                ctx.record_finished(download).await;
                let delete_files = !download.copied_to_library();
                if let Err(e) = session
                    .delete(TorrentIdOrHash::Id(torrent_id), delete_files)
                    .await
                {
                    warn!(key = %download.key(), error = %e, "could not remove torrent");
                }
                ctx.active.unmark(download.downloadable());
                running.remove(download.key());
                download.stop_polling();
            }
            LifecycleEvent::Failed => {
                ctx.record_failed(download).await;
                if let Err(e) = session.delete(TorrentIdOrHash::Id(torrent_id), true).await {
                    debug!(key = %download.key(), error = %e, "could not remove failed torrent");
                }
                ctx.active.unmark(download.downloadable());
                running.remove(download.key());
                download.stop_polling();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;
    use crate::catalog::Catalog;
    use crate::config::Config;
    use crate::db::Database;
    use crate::downloader::ActiveEpisodes;
    use crate::events::EventBus;
    use crate::filer::Filer;
    use crate::naming::SceneNameParser;
    use crate::numbering::NumberingService;
    use crate::release::quality::Quality;
    use crate::services::library::{LibraryClient, NullLibrary};
    use crate::services::metadata::MetadataClient;
    use crate::services::notify::LogNotifier;
    use tempfile::TempDir;

    async fn context(config: Config) -> Arc<BackendContext> {
        let config = Arc::new(config);
        let db = Database::connect_memory().await.unwrap();
        let blacklist = Arc::new(Blacklist::new());
        let library: Arc<dyn LibraryClient> = Arc::new(NullLibrary);
        let metadata = Arc::new(MetadataClient::new("http://127.0.0.1:9"));
        let numbering = NumberingService::new(db.clone(), "http://127.0.0.1:9");
        let active = ActiveEpisodes::new();
        let catalog = Arc::new(Catalog::new(
            db.clone(),
            library.clone(),
            metadata,
            numbering,
            active.clone(),
            config.new_show_path.clone().into(),
        ));
        let parser = SceneNameParser::new(catalog, db.clone());
        let events = Arc::new(EventBus::new());
        let filer = Filer::new(
            config.clone(),
            db.clone(),
            library,
            blacklist.clone(),
            parser,
            events,
        );
        Arc::new(BackendContext {
            config,
            db,
            blacklist,
            filer,
            active,
            notifier: Arc::new(LogNotifier),
        })
    }

    fn candidate() -> Downloadable {
        Downloadable::new(
            ReleaseKind::Torrent,
            vec![
                "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a".to_string(),
            ],
            Vec::new(),
            Some("Show.S01E01.HDTV.x264".to_string()),
            Quality::HDTV,
            None,
        )
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let ctx = context(Config::rooted_at(dir.path())).await;
        let backend = RqbitBackend::new(ctx.clone());

        let downloadable = candidate();
        let key = downloadable.unique_key();
        backend
            .running
            .insert(Download::new(downloadable.clone(), BACKEND_NAME));

        let taken = backend.download(downloadable).await.unwrap();
        assert!(!taken);
        assert_eq!(backend.running.len(), 1);
        assert!(!ctx.blacklist.contains(&key));
    }

    #[tokio::test]
    async fn engine_startup_failure_does_not_blacklist() {
        let dir = TempDir::new().unwrap();
        let config = Config::rooted_at(dir.path());
        // A file where the downloads directory belongs makes session
        // creation fail the way an unreachable engine would.
        std::fs::write(&config.downloads_path, b"").unwrap();
        let ctx = context(config).await;
        let backend = RqbitBackend::new(ctx.clone());

        let downloadable = candidate();
        let key = downloadable.unique_key();
        assert!(backend.download(downloadable).await.is_err());
        assert!(!ctx.blacklist.contains(&key));
        assert!(backend.running.is_empty());
    }
}
