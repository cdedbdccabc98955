//! Remote Transmission daemon backend, speaking its JSON RPC.
//!
//! Covers the CSRF handshake (a 409 carrying `X-Transmission-Session-Id`
//! means "retry with this header") and translates Transmission's numeric
//! status codes into our lifecycle vocabulary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    BackendContext, Download, DownloadBackend, DownloadStatus, LifecycleEvent, PollResult,
    RunningSet, save_snapshots, snapshot_path, take_snapshots,
};
use crate::release::{Downloadable, ReleaseKind};

const BACKEND_NAME: &str = "transmission";
const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

const POLL_FIELDS: &[&str] = &[
    "id",
    "hashString",
    "status",
    "isFinished",
    "downloadedEver",
    "totalSize",
    "rateDownload",
    "downloadDir",
    "files",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TorrentFields {
    id: i64,
    #[serde(default)]
    hash_string: Option<String>,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    is_finished: bool,
    #[serde(default)]
    downloaded_ever: u64,
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    rate_download: f64,
    #[serde(default)]
    download_dir: Option<String>,
    #[serde(default)]
    files: Vec<TorrentFileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TorrentFileEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: String,
    #[serde(default)]
    arguments: Value,
}

/// Thin RPC client with the session-id handshake baked in.
pub struct TransmissionClient {
    http: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    session_id: Mutex<Option<String>>,
}

impl TransmissionClient {
    pub fn new(url: String, user: Option<String>, password: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            url,
            user,
            password,
            session_id: Mutex::new(None),
        }
    }

    async fn call(&self, method: &str, arguments: Value) -> Result<Value> {
        let body = json!({ "method": method, "arguments": arguments });
        for _ in 0..2 {
            let mut request = self.http.post(&self.url).json(&body);
            if let Some(user) = &self.user {
                request = request.basic_auth(user, self.password.as_deref());
            }
            if let Some(id) = self.session_id.lock().clone() {
                request = request.header(SESSION_ID_HEADER, id);
            }
            let response = request.send().await.context("transmission unreachable")?;

            if response.status() == reqwest::StatusCode::CONFLICT {
                let id = response
                    .headers()
                    .get(SESSION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
                    .context("409 without a session id header")?;
                *self.session_id.lock() = Some(id);
                continue;
            }

            let envelope: RpcEnvelope = response
                .error_for_status()
                .context("transmission rpc error")?
                .json()
                .await
                .context("parsing transmission response")?;
            if envelope.result != "success" {
                bail!("transmission call {method} failed: {}", envelope.result);
            }
            return Ok(envelope.arguments);
        }
        bail!("transmission session handshake failed")
    }

    pub async fn ping(&self) -> bool {
        self.call("session-get", json!({})).await.is_ok()
    }

    async fn torrent_get(&self, ids: Option<Value>) -> Result<Vec<TorrentFields>> {
        let mut args = json!({ "fields": POLL_FIELDS });
        if let Some(ids) = ids {
            args["ids"] = ids;
        }
        let arguments = self.call("torrent-get", args).await?;
        let torrents = arguments
            .get("torrents")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(torrents).context("parsing torrent list")?)
    }

    /// Add a torrent by magnet or URL. Returns `(id, info_hash)`.
    async fn torrent_add(&self, url: &str) -> Result<(i64, Option<String>)> {
        let arguments = self
            .call("torrent-add", json!({ "filename": url }))
            .await?;
        let added = arguments
            .get("torrent-added")
            .or_else(|| arguments.get("torrent-duplicate"))
            .context("torrent-add returned nothing")?;
        let id = added
            .get("id")
            .and_then(Value::as_i64)
            .context("torrent-add without id")?;
        let hash = added
            .get("hashString")
            .and_then(Value::as_str)
            .map(|h| h.to_lowercase());
        Ok((id, hash))
    }

    async fn torrent_remove(&self, id: i64, delete_files: bool) -> Result<()> {
        self.call(
            "torrent-remove",
            json!({ "ids": [id], "delete-local-data": delete_files }),
        )
        .await?;
        Ok(())
    }
}

pub struct TransmissionBackend {
    ctx: Arc<BackendContext>,
    client: Option<Arc<TransmissionClient>>,
    running: Arc<RunningSet>,
    ids: Arc<RwLock<HashMap<String, i64>>>,
    add_lock: tokio::sync::Mutex<()>,
}

impl TransmissionBackend {
    pub fn new(ctx: Arc<BackendContext>) -> Arc<Self> {
        let client = ctx.config.transmission_url.clone().map(|url| {
            Arc::new(TransmissionClient::new(
                url,
                ctx.config.transmission_user.clone(),
                ctx.config.transmission_password.clone(),
            ))
        });
        Arc::new(Self {
            ctx,
            client,
            running: Arc::new(RunningSet::new()),
            ids: Arc::new(RwLock::new(HashMap::new())),
            add_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn start_poller(&self, download: Arc<Download>, client: Arc<TransmissionClient>) {
        let ctx = self.ctx.clone();
        let running = self.running.clone();
        let ids = self.ids.clone();
        let d = download.clone();
        download.start_polling(move || {
            let ctx = ctx.clone();
            let client = client.clone();
            let running = running.clone();
            let ids = ids.clone();
            let download = d.clone();
            async move {
                let Some(torrent_id) = ids.read().get(download.key()).copied() else {
                    return Ok(());
                };
                let fields = client.torrent_get(Some(json!([torrent_id]))).await.ok();
                let fields = fields.and_then(|mut v| {
                    if v.is_empty() { None } else { Some(v.remove(0)) }
                });
                let poll = translate_fields(fields.as_ref());
                let events = download.apply_poll(poll);
                handle_events(
                    &ctx,
                    &client,
                    &running,
                    &ids,
                    &download,
                    torrent_id,
                    fields.as_ref(),
                    events,
                )
                .await;
                Ok(())
            }
        });
    }
}

#[async_trait]
impl DownloadBackend for TransmissionBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn is_available(&self) -> bool {
        match &self.client {
            Some(client) => client.ping().await,
            None => false,
        }
    }

    async fn is_enabled(&self) -> bool {
        self.ctx
            .db
            .settings()
            .get_or_default("transmission_enabled", true)
            .await
            .unwrap_or(true)
    }

    fn can_download(&self, downloadable: &Downloadable) -> bool {
        downloadable.kind() == ReleaseKind::Torrent
    }

    async fn download(&self, downloadable: Downloadable) -> Result<bool> {
        let Some(client) = self.client.clone() else {
            return Ok(false);
        };
        let key = downloadable.unique_key();
        let _guard = self.add_lock.lock().await;
        if self.running.contains(&key) {
            debug!(key = %key, "download already running, rejecting duplicate");
            return Ok(false);
        }

        let Some(url) = downloadable.magnet().or_else(|| downloadable.preferred_url()) else {
            return Ok(false);
        };

        // The daemon may already know this torrent from a previous life.
        let torrent_id = match downloadable.info_hash() {
            Some(hash) => {
                let existing = client.torrent_get(None).await.unwrap_or_default();
                existing
                    .iter()
                    .find(|t| t.hash_string.as_deref() == Some(hash))
                    .map(|t| t.id)
            }
            None => None,
        };
        let torrent_id = match torrent_id {
            Some(id) => id,
            None => client.torrent_add(&url).await?.0,
        };

        let download = Download::new(downloadable, BACKEND_NAME);
        self.ids.write().insert(key, torrent_id);
        self.ctx.active.mark(download.downloadable());
        self.running.insert(download.clone());
        self.ctx.record_started(&download).await;
        self.start_poller(download, client);
        Ok(true)
    }

    fn downloads(&self) -> Vec<Arc<Download>> {
        self.running.list()
    }

    async fn restore_state(&self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let path = snapshot_path(&self.ctx.config.state_dir, BACKEND_NAME);
        let snapshots = take_snapshots(&path);
        if snapshots.is_empty() {
            return;
        }
        info!(count = snapshots.len(), "restoring transmission downloads");

        let existing = client.torrent_get(None).await.unwrap_or_default();
        for snap in snapshots {
            let download = Download::from_snapshot(snap);
            if download.status().is_final() {
                continue;
            }
            let hash = download.downloadable().info_hash().map(str::to_owned);
            let torrent_id = hash.as_deref().and_then(|h| {
                existing
                    .iter()
                    .find(|t| t.hash_string.as_deref() == Some(h))
                    .map(|t| t.id)
            });
            let Some(torrent_id) = torrent_id else {
                // The daemon lost it; we cannot resume.
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
            };
            self.ids
                .write()
                .insert(download.key().to_string(), torrent_id);
            self.ctx.active.mark(download.downloadable());
            self.running.insert(download.clone());
            self.start_poller(download, client.clone());
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
            warn!(error = %e, "failed to save transmission snapshots");
        }
    }
}

/// Transmission status codes: 0 stopped, 1 check-wait, 2 checking,
/// 3 download-wait, 4 downloading, 5 seed-wait, 6 seeding.
fn translate_fields(fields: Option<&TorrentFields>) -> PollResult {
    let Some(t) = fields else {
        return PollResult {
            status: DownloadStatus::FAILED,
            downloaded_bytes: 0,
            total_bytes: 0,
            rate_bps: 0.0,
        };
    };
    let status = match t.status {
        Some(1) | Some(2) | Some(3) => DownloadStatus::STARTING,
        Some(4) => DownloadStatus::DOWNLOADING,
        Some(5) | Some(6) => DownloadStatus::POST_DOWNLOAD,
        Some(0) if t.is_finished => DownloadStatus::FINISHED,
        Some(0) => DownloadStatus::PAUSED,
        _ => DownloadStatus::FAILED,
    };
    PollResult {
        status,
        downloaded_bytes: t.downloaded_ever,
        total_bytes: t.total_size,
        rate_bps: t.rate_download,
    }
}

fn payload_files(fields: Option<&TorrentFields>) -> Vec<PathBuf> {
    let Some(t) = fields else {
        return Vec::new();
    };
    let base = PathBuf::from(t.download_dir.clone().unwrap_or_default());
    t.files.iter().map(|f| base.join(&f.name)).collect()
}

#[allow(clippy::too_many_arguments)]
async fn handle_events(
    ctx: &Arc<BackendContext>,
    client: &Arc<TransmissionClient>,
    running: &Arc<RunningSet>,
    ids: &Arc<RwLock<HashMap<String, i64>>>,
    download: &Arc<Download>,
    torrent_id: i64,
    fields: Option<&TorrentFields>,
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
                let files = payload_files(fields);
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
                // The daemon keeps seeding; its own status codes report
                // FINISHED once seeding obligations lapse.
            }
            LifecycleEvent::Finished => {
                ctx.record_finished(download).await;
                let delete_files = !download.copied_to_library();
                if let Err(e) = client.torrent_remove(torrent_id, delete_files).await {
                    warn!(key = %download.key(), error = %e, "could not remove torrent");
                }
                ctx.active.unmark(download.downloadable());
                ids.write().remove(download.key());
                running.remove(download.key());
                download.stop_polling();
            }
            LifecycleEvent::Failed => {
                ctx.record_failed(download).await;
                if let Err(e) = client.torrent_remove(torrent_id, true).await {
                    debug!(key = %download.key(), error = %e, "could not remove failed torrent");
                }
                ctx.active.unmark(download.downloadable());
                ids.write().remove(download.key());
                running.remove(download.key());
                download.stop_polling();
            }
        }
    }
}
