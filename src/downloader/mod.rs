//! Download backends: pluggable engines behind one trait.
//!
//! Candidates flow in through [`dispatch`], which walks the backends in
//! priority order and stops at the first one that accepts. Each backend
//! keeps its own running table and drives a per-download poll loop; the
//! shared pieces (active-episode table, history/notification bookkeeping,
//! snapshot files) live here.

pub mod download;
pub mod rqbit;
pub mod transmission;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::db::{Database, HistoryEntry};
use crate::filer::Filer;
use crate::release::Downloadable;
use crate::services::notify::{Notification, Notifier};
pub use download::{Download, DownloadSnapshot, DownloadStatus, LifecycleEvent, PollResult};

/// Episodes currently being downloaded, across all backends. The feed and
/// backlog passes consult this instead of asking every backend.
#[derive(Default)]
pub struct ActiveEpisodes {
    set: RwLock<HashMap<(u32, u32, u32), u32>>,
}

impl ActiveEpisodes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, tvdb_id: u32, season: u32, episode: u32) -> bool {
        self.set.read().contains_key(&(tvdb_id, season, episode))
    }

    pub fn mark(&self, downloadable: &Downloadable) {
        let mut set = self.set.write();
        for key in downloadable.tvdb_keys() {
            *set.entry(key).or_insert(0) += 1;
        }
    }

    pub fn unmark(&self, downloadable: &Downloadable) {
        let mut set = self.set.write();
        for key in downloadable.tvdb_keys() {
            if let Some(count) = set.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    set.remove(&key);
                }
            }
        }
    }
}

/// Per-backend running-download table, keyed by unique key.
#[derive(Default)]
pub struct RunningSet {
    map: RwLock<HashMap<String, Arc<Download>>>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Download>> {
        self.map.read().get(key).cloned()
    }

    pub fn insert(&self, download: Arc<Download>) {
        self.map
            .write()
            .insert(download.key().to_string(), download);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Download>> {
        self.map.write().remove(key)
    }

    /// All downloads, oldest first.
    pub fn list(&self) -> Vec<Arc<Download>> {
        let mut all: Vec<_> = self.map.read().values().cloned().collect();
        all.sort_by_key(|d| d.started_at());
        all
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[async_trait]
pub trait DownloadBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Static capability: is the engine reachable/configured at all?
    async fn is_available(&self) -> bool;

    /// Runtime enable flag from the settings table.
    async fn is_enabled(&self) -> bool;

    fn can_download(&self, downloadable: &Downloadable) -> bool;

    /// Start downloading. Idempotent by unique key: a candidate whose key
    /// is already in the running set is rejected with `Ok(false)` and no
    /// side effects. `Ok(false)` also declines a candidate the backend
    /// cannot take, so dispatch can try the next backend.
    async fn download(&self, downloadable: Downloadable) -> Result<bool>;

    fn downloads(&self) -> Vec<Arc<Download>>;

    /// Restore downloads from the snapshot written at last shutdown.
    async fn restore_state(&self);

    /// Snapshot running downloads and stop pollers.
    async fn shutdown(&self);
}

/// Dependencies every backend shares.
pub struct BackendContext {
    pub config: Arc<Config>,
    pub db: Database,
    pub blacklist: Arc<Blacklist>,
    pub filer: Arc<Filer>,
    pub active: Arc<ActiveEpisodes>,
    pub notifier: Arc<dyn Notifier>,
}

impl BackendContext {
    pub async fn record_started(&self, download: &Download) {
        let d = download.downloadable();
        let entry = HistoryEntry {
            key: download.key().to_string(),
            tvdb_id: d.episodes().first().map(|e| e.show.tvdb_id),
            name: d.name().map(String::from),
            source: d.feeder().map(String::from),
            quality: d.quality(),
            episodes: d.tvdb_keys(),
        };
        if let Err(e) = self.db.history().log_started(&entry).await {
            warn!(key = %download.key(), error = %e, "failed to record download start");
        }
        self.notifier
            .notify(
                Notification::DownloadStarted,
                d.name().unwrap_or_else(|| download.key()),
            )
            .await;
    }

    pub async fn record_finished(&self, download: &Download) {
        if let Err(e) = self
            .db
            .history()
            .log_finished(download.key(), "finished", Some(download.total_bytes()))
            .await
        {
            warn!(key = %download.key(), error = %e, "failed to record download finish");
        }
        self.notifier
            .notify(
                Notification::DownloadFinished,
                download.downloadable().name().unwrap_or_else(|| download.key()),
            )
            .await;
    }

    /// Failure bookkeeping: close the history row and blacklist the key so
    /// the next feed pass does not pick the same release again.
    pub async fn record_failed(&self, download: &Download) {
        if let Err(e) = self
            .db
            .history()
            .log_finished(download.key(), "failed", None)
            .await
        {
            warn!(key = %download.key(), error = %e, "failed to record download failure");
        }
        self.blacklist.add(download.key());
        for url in download.downloadable().urls() {
            self.blacklist.add(url);
        }
        self.notifier
            .notify(
                Notification::DownloadFailed,
                download.downloadable().name().unwrap_or_else(|| download.key()),
            )
            .await;
    }
}

pub struct BackendRegistry {
    backends: Vec<Arc<dyn DownloadBackend>>,
}

impl BackendRegistry {
    /// Backends in dispatch priority order.
    pub fn new(backends: Vec<Arc<dyn DownloadBackend>>) -> Arc<Self> {
        Arc::new(Self { backends })
    }

    pub fn in_priority_order(&self) -> &[Arc<dyn DownloadBackend>] {
        &self.backends
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn DownloadBackend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn all_downloads(&self) -> Vec<Arc<Download>> {
        let mut all: Vec<_> = self
            .backends
            .iter()
            .flat_map(|b| b.downloads())
            .collect();
        all.sort_by_key(|d| d.started_at());
        all
    }

    pub async fn restore_all(&self) {
        for backend in &self.backends {
            backend.restore_state().await;
        }
    }

    pub async fn shutdown_all(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
    }
}

/// Hand a candidate to the first willing backend. Returns whether anyone
/// took it.
pub async fn dispatch(registry: &BackendRegistry, downloadable: &Downloadable) -> Result<bool> {
    for backend in registry.in_priority_order() {
        if !backend.can_download(downloadable) {
            continue;
        }
        if !backend.is_enabled().await {
            continue;
        }
        if !backend.is_available().await {
            debug!(backend = backend.name(), "backend unavailable, trying next");
            continue;
        }
        match backend.download(downloadable.clone()).await {
            Ok(true) => {
                info!(
                    backend = backend.name(),
                    name = ?downloadable.name(),
                    key = %downloadable.unique_key(),
                    "download dispatched"
                );
                return Ok(true);
            }
            Ok(false) => continue,
            Err(e) => {
                warn!(
                    backend = backend.name(),
                    name = ?downloadable.name(),
                    error = %e,
                    "backend failed to start download, trying next"
                );
                continue;
            }
        }
    }
    Ok(false)
}

/// Where a backend's snapshot file lives.
pub fn snapshot_path(state_dir: &Path, backend: &str) -> PathBuf {
    state_dir.join(format!("{backend}_downloads.json"))
}

/// Write snapshots for one backend. An empty list removes the file.
pub fn save_snapshots(path: &Path, snapshots: &[DownloadSnapshot]) -> Result<()> {
    if snapshots.is_empty() {
        if path.exists() {
            std::fs::remove_file(path).context("removing empty snapshot file")?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating state directory")?;
    }
    let json = serde_json::to_string_pretty(snapshots)?;
    std::fs::write(path, json).context("writing snapshot file")?;
    info!(path = %path.display(), count = snapshots.len(), "saved download snapshots");
    Ok(())
}

/// Read and delete a backend's snapshot file. Any failure is logged and
/// yields an empty list; stale state must never prevent startup.
pub fn take_snapshots(path: &Path) -> Vec<DownloadSnapshot> {
    if !path.exists() {
        return Vec::new();
    }
    let result = std::fs::read_to_string(path)
        .context("reading snapshot file")
        .and_then(|text| serde_json::from_str(&text).context("parsing snapshot file"));
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not delete snapshot file");
    }
    match result {
        Ok(snapshots) => snapshots,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable snapshot file");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseKind;
    use crate::release::quality::Quality;

    fn candidate(hash: &str) -> Downloadable {
        Downloadable::new(
            ReleaseKind::Torrent,
            vec![format!("magnet:?xt=urn:btih:{hash}")],
            Vec::new(),
            Some("Show.S01E01.HDTV".to_string()),
            Quality::HDTV,
            None,
        )
    }

    #[test]
    fn snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "rqbit");

        let d = Download::new(
            candidate("c12fe1c06bba254a9dc9f519b335aa7c1367a88a"),
            "rqbit",
        );
        save_snapshots(&path, &[d.to_snapshot()]).unwrap();
        assert!(path.exists());

        let restored = take_snapshots(&path);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].key, d.key());
        // Read-and-delete: a second take sees nothing.
        assert!(!path.exists());
        assert!(take_snapshots(&path).is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "rqbit");
        std::fs::write(&path, "not json").unwrap();

        assert!(take_snapshots(&path).is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn active_episodes_counts_overlaps() {
        let active = ActiveEpisodes::new();
        let mut a = candidate("c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
        let mut b = candidate("ffffe1c06bba254a9dc9f519b335aa7c1367a88a");
        // Give both candidates the same episode via snapshots to avoid a
        // live catalog.
        let ep = crate::release::EpisodeSnapshot {
            tvdb_id: 73255,
            show_name: "House".to_string(),
            show_path: None,
            followed: true,
            wanted_quality: Quality::HD,
            library_id: None,
            tvdb_episodes: vec![(1, 1)],
            scene_episodes: vec![(1, 1)],
        };
        let mut snap_a = a.to_snapshot();
        snap_a.episodes = vec![ep.clone()];
        a = Downloadable::from_snapshot(snap_a);
        let mut snap_b = b.to_snapshot();
        snap_b.episodes = vec![ep];
        b = Downloadable::from_snapshot(snap_b);

        active.mark(&a);
        active.mark(&b);
        assert!(active.contains(73255, 1, 1));

        active.unmark(&a);
        // Still covered by the second download.
        assert!(active.contains(73255, 1, 1));
        active.unmark(&b);
        assert!(!active.contains(73255, 1, 1));
    }
}
