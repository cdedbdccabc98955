//! A single in-flight download and its status lifecycle.
//!
//! Status is a bitmask so that composite views (running, downloaded,
//! final) are cheap intersections. Transitions are edge-exact: each
//! lifecycle milestone fires exactly once per download no matter how often
//! the engine is polled or in what order statuses are observed, and a
//! download that has reached a final status never leaves it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::release::{Downloadable, DownloadableSnapshot};
use crate::schedule::RecurringTaskRunner;

/// How often each download polls its engine.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadStatus(pub u32);

impl DownloadStatus {
    pub const NOT_STARTED: DownloadStatus = DownloadStatus(1);
    pub const STARTING: DownloadStatus = DownloadStatus(1 << 1);
    pub const DOWNLOADING: DownloadStatus = DownloadStatus(1 << 2);
    pub const PAUSED: DownloadStatus = DownloadStatus(1 << 3);
    /// Payload complete, post-download work (seeding, filing) ongoing.
    pub const POST_DOWNLOAD: DownloadStatus = DownloadStatus(1 << 4);
    pub const FINISHED: DownloadStatus = DownloadStatus(1 << 5);
    pub const FAILED: DownloadStatus = DownloadStatus(1 << 15);

    pub const FINAL: DownloadStatus = DownloadStatus(Self::FINISHED.0 | Self::FAILED.0);
    pub const RUNNING: DownloadStatus =
        DownloadStatus(Self::STARTING.0 | Self::DOWNLOADING.0 | Self::POST_DOWNLOAD.0);
    pub const DOWNLOADED: DownloadStatus =
        DownloadStatus(Self::POST_DOWNLOAD.0 | Self::FINISHED.0);

    pub fn intersects(self, other: DownloadStatus) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_final(self) -> bool {
        self.intersects(Self::FINAL)
    }

    pub fn is_running(self) -> bool {
        self.intersects(Self::RUNNING)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match *self {
            Self::NOT_STARTED => "Not Started",
            Self::STARTING => "Starting",
            Self::DOWNLOADING => "Downloading",
            Self::PAUSED => "Paused",
            Self::POST_DOWNLOAD => "Post Download",
            Self::FINISHED => "Finished",
            Self::FAILED => "Failed",
            _ => return write!(f, "Status({:#x})", self.0),
        };
        f.write_str(label)
    }
}

/// One observation of the engine's view of a download.
#[derive(Debug, Clone, Copy)]
pub struct PollResult {
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub rate_bps: f64,
}

/// Milestones that fire exactly once each, in the order returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started,
    FirstData,
    Paused,
    Resumed,
    /// Payload complete; filing can begin.
    Downloaded,
    Finished,
    Failed,
}

// Ack bits: which exactly-once events have already fired.
const ACK_STARTED: u32 = 1;
const ACK_DOWNLOADED: u32 = 1 << 1;
const ACK_FINISHED: u32 = 1 << 2;
const ACK_FAILED: u32 = 1 << 3;

#[derive(Debug, Clone)]
struct Progress {
    status: DownloadStatus,
    downloaded_bytes: u64,
    total_bytes: u64,
    rate_bps: f64,
    copied_to_library: bool,
    saw_data: bool,
    acks: u32,
}

pub struct Download {
    downloadable: Downloadable,
    key: String,
    backend_name: String,
    started_at: DateTime<Utc>,
    state: Mutex<Progress>,
    poller: Mutex<Option<RecurringTaskRunner>>,
    cancel: CancellationToken,
}

impl Download {
    pub fn new(downloadable: Downloadable, backend_name: &str) -> Arc<Self> {
        let key = downloadable.unique_key();
        Arc::new(Self {
            downloadable,
            key,
            backend_name: backend_name.to_string(),
            started_at: Utc::now(),
            state: Mutex::new(Progress {
                status: DownloadStatus::NOT_STARTED,
                downloaded_bytes: 0,
                total_bytes: 0,
                rate_bps: 0.0,
                copied_to_library: false,
                saw_data: false,
                acks: 0,
            }),
            poller: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn downloadable(&self) -> &Downloadable {
        &self.downloadable
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().status
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.lock().downloaded_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn rate_bps(&self) -> f64 {
        self.state.lock().rate_bps
    }

    pub fn copied_to_library(&self) -> bool {
        self.state.lock().copied_to_library
    }

    pub fn set_copied_to_library(&self, copied: bool) {
        self.state.lock().copied_to_library = copied;
    }

    /// Fraction complete in [0, 1], when the total is known.
    pub fn progress(&self) -> Option<f64> {
        let state = self.state.lock();
        (state.total_bytes > 0)
            .then(|| state.downloaded_bytes as f64 / state.total_bytes as f64)
    }

    /// Fold one engine observation into the lifecycle. Returns the
    /// milestone events this observation triggered, in firing order.
    /// Final statuses are sticky: once finished or failed, later
    /// observations are ignored.
    pub fn apply_poll(&self, poll: PollResult) -> Vec<LifecycleEvent> {
        let mut state = self.state.lock();
        if state.status.is_final() {
            return Vec::new();
        }

        let old = state.status;
        let new = poll.status;
        let mut events = Vec::new();

        if state.acks & ACK_STARTED == 0 && new != DownloadStatus::NOT_STARTED {
            state.acks |= ACK_STARTED;
            events.push(LifecycleEvent::Started);
        }

        if !state.saw_data && poll.downloaded_bytes > 0 {
            state.saw_data = true;
            events.push(LifecycleEvent::FirstData);
        }

        if new == DownloadStatus::PAUSED && old != DownloadStatus::PAUSED {
            events.push(LifecycleEvent::Paused);
        }
        if old == DownloadStatus::PAUSED
            && new.intersects(DownloadStatus(
                DownloadStatus::STARTING.0 | DownloadStatus::DOWNLOADING.0,
            ))
        {
            events.push(LifecycleEvent::Resumed);
        }

        if state.acks & ACK_DOWNLOADED == 0 && new.intersects(DownloadStatus::DOWNLOADED) {
            state.acks |= ACK_DOWNLOADED;
            events.push(LifecycleEvent::Downloaded);
        }

        if new == DownloadStatus::FINISHED && state.acks & ACK_FINISHED == 0 {
            state.acks |= ACK_FINISHED;
            events.push(LifecycleEvent::Finished);
        }
        if new == DownloadStatus::FAILED && state.acks & ACK_FAILED == 0 {
            state.acks |= ACK_FAILED;
            events.push(LifecycleEvent::Failed);
        }

        state.status = new;
        state.downloaded_bytes = poll.downloaded_bytes;
        if poll.total_bytes > 0 {
            state.total_bytes = poll.total_bytes;
        }
        state.rate_bps = poll.rate_bps;

        events
    }

    /// Spawn this download's poll loop. `action` runs every
    /// [`POLL_INTERVAL`] until [`Download::stop_polling`].
    pub fn start_polling<F, Fut>(&self, action: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        let name = format!("poll-{}", &self.key[..self.key.len().min(12)]);
        let runner = RecurringTaskRunner::start_with_token(
            &name,
            POLL_INTERVAL,
            Duration::ZERO,
            self.cancel.clone(),
            action,
        );
        *self.poller.lock() = Some(runner);
    }

    /// Stop the poll loop. Safe from inside the poll action itself.
    pub fn stop_polling(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait (bounded) for the poll loop to wind down.
    pub async fn shutdown_polling(&self) {
        self.cancel.cancel();
        let runner = self.poller.lock().take();
        if let Some(runner) = runner {
            runner.shutdown().await;
        }
    }

    pub fn to_snapshot(&self) -> DownloadSnapshot {
        let state = self.state.lock();
        DownloadSnapshot {
            key: self.key.clone(),
            backend: self.backend_name.clone(),
            downloadable: self.downloadable.to_snapshot(),
            status: state.status,
            started_at: self.started_at,
            downloaded_bytes: state.downloaded_bytes,
            total_bytes: state.total_bytes,
            copied_to_library: state.copied_to_library,
            saw_data: state.saw_data,
            acks: state.acks,
        }
    }

    pub fn from_snapshot(snap: DownloadSnapshot) -> Arc<Self> {
        Arc::new(Self {
            downloadable: Downloadable::from_snapshot(snap.downloadable),
            key: snap.key,
            backend_name: snap.backend,
            started_at: snap.started_at,
            state: Mutex::new(Progress {
                status: snap.status,
                downloaded_bytes: snap.downloaded_bytes,
                total_bytes: snap.total_bytes,
                rate_bps: 0.0,
                copied_to_library: snap.copied_to_library,
                saw_data: snap.saw_data,
                acks: snap.acks,
            }),
            poller: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }
}

/// Serialized form of a download, written to disk at shutdown and read
/// back (then deleted) at the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub key: String,
    pub backend: String,
    pub downloadable: DownloadableSnapshot,
    pub status: DownloadStatus,
    pub started_at: DateTime<Utc>,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub copied_to_library: bool,
    pub saw_data: bool,
    pub acks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseKind;
    use crate::release::quality::Quality;

    fn download() -> Arc<Download> {
        let d = Downloadable::new(
            ReleaseKind::Torrent,
            vec!["magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a".to_string()],
            Vec::new(),
            Some("Show.S01E01.HDTV".to_string()),
            Quality::HDTV,
            None,
        );
        Download::new(d, "test")
    }

    fn poll(status: DownloadStatus, downloaded: u64) -> PollResult {
        PollResult {
            status,
            downloaded_bytes: downloaded,
            total_bytes: 1000,
            rate_bps: 0.0,
        }
    }

    #[test]
    fn straight_through_lifecycle() {
        let d = download();

        let ev = d.apply_poll(poll(DownloadStatus::STARTING, 0));
        assert_eq!(ev, vec![LifecycleEvent::Started]);

        let ev = d.apply_poll(poll(DownloadStatus::DOWNLOADING, 10));
        assert_eq!(ev, vec![LifecycleEvent::FirstData]);

        // Repeated observation of the same state fires nothing.
        let ev = d.apply_poll(poll(DownloadStatus::DOWNLOADING, 20));
        assert_eq!(ev, vec![]);

        let ev = d.apply_poll(poll(DownloadStatus::POST_DOWNLOAD, 1000));
        assert_eq!(ev, vec![LifecycleEvent::Downloaded]);

        let ev = d.apply_poll(poll(DownloadStatus::FINISHED, 1000));
        assert_eq!(ev, vec![LifecycleEvent::Finished]);
        assert_eq!(d.status(), DownloadStatus::FINISHED);
    }

    #[test]
    fn seeding_stays_post_download_until_engine_reports_finished() {
        let d = download();
        d.apply_poll(poll(DownloadStatus::DOWNLOADING, 10));

        let ev = d.apply_poll(poll(DownloadStatus::POST_DOWNLOAD, 1000));
        assert_eq!(ev, vec![LifecycleEvent::Downloaded]);

        // Filing happens on Downloaded while the torrent keeps seeding;
        // repeated seeding observations change nothing.
        for _ in 0..3 {
            let ev = d.apply_poll(poll(DownloadStatus::POST_DOWNLOAD, 1000));
            assert_eq!(ev, vec![]);
            assert_eq!(d.status(), DownloadStatus::POST_DOWNLOAD);
        }

        let ev = d.apply_poll(poll(DownloadStatus::FINISHED, 1000));
        assert_eq!(ev, vec![LifecycleEvent::Finished]);
    }

    #[test]
    fn skipping_post_download_still_fires_downloaded() {
        let d = download();
        d.apply_poll(poll(DownloadStatus::DOWNLOADING, 10));

        let ev = d.apply_poll(poll(DownloadStatus::FINISHED, 1000));
        assert_eq!(ev, vec![LifecycleEvent::Downloaded, LifecycleEvent::Finished]);
    }

    #[test]
    fn pause_and_resume() {
        let d = download();
        d.apply_poll(poll(DownloadStatus::DOWNLOADING, 10));

        let ev = d.apply_poll(poll(DownloadStatus::PAUSED, 10));
        assert_eq!(ev, vec![LifecycleEvent::Paused]);
        // Pause observed twice fires once per edge, not per poll.
        let ev = d.apply_poll(poll(DownloadStatus::PAUSED, 10));
        assert_eq!(ev, vec![]);

        let ev = d.apply_poll(poll(DownloadStatus::DOWNLOADING, 10));
        assert_eq!(ev, vec![LifecycleEvent::Resumed]);
    }

    #[test]
    fn final_status_is_sticky() {
        let d = download();
        d.apply_poll(poll(DownloadStatus::DOWNLOADING, 10));
        d.apply_poll(poll(DownloadStatus::FAILED, 10));
        assert_eq!(d.status(), DownloadStatus::FAILED);

        // A confused engine reporting progress later changes nothing.
        let ev = d.apply_poll(poll(DownloadStatus::DOWNLOADING, 500));
        assert_eq!(ev, vec![]);
        assert_eq!(d.status(), DownloadStatus::FAILED);
        assert_eq!(d.downloaded_bytes(), 10);
    }

    #[test]
    fn failure_straight_from_start() {
        let d = download();
        let ev = d.apply_poll(poll(DownloadStatus::FAILED, 0));
        assert_eq!(ev, vec![LifecycleEvent::Started, LifecycleEvent::Failed]);
    }

    #[test]
    fn snapshot_round_trip_preserves_lifecycle_position() {
        let d = download();
        d.apply_poll(poll(DownloadStatus::DOWNLOADING, 300));
        d.set_copied_to_library(false);

        let snap = d.to_snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let restored = Download::from_snapshot(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.key(), d.key());
        assert_eq!(restored.status(), DownloadStatus::DOWNLOADING);
        assert_eq!(restored.downloaded_bytes(), 300);

        // Milestones already fired must not fire again after restore.
        let ev = restored.apply_poll(poll(DownloadStatus::DOWNLOADING, 400));
        assert_eq!(ev, vec![]);
        let ev = restored.apply_poll(poll(DownloadStatus::FINISHED, 1000));
        assert_eq!(ev, vec![LifecycleEvent::Downloaded, LifecycleEvent::Finished]);
    }
}
