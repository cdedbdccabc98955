//! User-facing notifications for download lifecycle milestones.

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    DownloadStarted,
    DownloadFinished,
    DownloadFailed,
}

impl Notification {
    fn headline(self) -> &'static str {
        match self {
            Notification::DownloadStarted => "Download started",
            Notification::DownloadFinished => "Download finished",
            Notification::DownloadFailed => "Download failed",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: Notification, detail: &str);
}

/// Default notifier: milestones go to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: Notification, detail: &str) {
        info!(event = kind.headline(), detail = %detail, "notification");
    }
}
