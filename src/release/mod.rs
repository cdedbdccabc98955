//! Downloadable release candidates produced by feeders.

pub mod quality;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::catalog::{TvEpisode, TvShow};
use quality::Quality;

/// What kind of payload a candidate points at. Backends use this to decide
/// whether they can handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseKind {
    Torrent,
}

/// A single release candidate: one or more urls that all lead to the same
/// payload, plus everything the feeder could tell us about it.
#[derive(Debug, Clone)]
pub struct Downloadable {
    kind: ReleaseKind,
    urls: Vec<String>,
    episodes: Vec<TvEpisode>,
    name: Option<String>,
    quality: Quality,
    timestamp: DateTime<Utc>,
    feeder: Option<String>,
    // Derived lazily from the urls; None once computed means "not derivable".
    info_hash: OnceCell<Option<String>>,
}

impl Downloadable {
    pub fn new(
        kind: ReleaseKind,
        urls: Vec<String>,
        episodes: Vec<TvEpisode>,
        name: Option<String>,
        quality: Quality,
        feeder: Option<String>,
    ) -> Self {
        Self {
            kind,
            urls,
            episodes,
            name,
            quality,
            timestamp: Utc::now(),
            feeder,
            info_hash: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> ReleaseKind {
        self.kind
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn episodes(&self) -> &[TvEpisode] {
        &self.episodes
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn feeder(&self) -> Option<&str> {
        self.feeder.as_deref()
    }

    /// Set the detected quality. Only single qualities (or `UNKNOWN`) are
    /// accepted; composite masks are ignored with a warning.
    pub fn set_quality(&mut self, quality: Quality) {
        if quality.is_single() {
            self.quality = quality;
        } else {
            warn!(name = ?self.name, quality = %quality, "ignoring non-single quality");
        }
    }

    /// True when the candidate was first seen within `age`.
    pub fn is_newer_than(&self, age: Duration) -> bool {
        Utc::now() - self.timestamp < age
    }

    /// Every (tvdb_id, season, episode) triple this release covers.
    pub fn tvdb_keys(&self) -> Vec<(u32, u32, u32)> {
        let mut keys = Vec::new();
        for ep in &self.episodes {
            for (season, episode) in &ep.tvdb_episodes {
                keys.push((ep.show.tvdb_id, *season, *episode));
            }
        }
        keys
    }

    /// The torrent info-hash (lowercase hex), when any of the urls lets us
    /// derive it without fetching anything.
    pub fn info_hash(&self) -> Option<&str> {
        self.info_hash
            .get_or_init(|| self.urls.iter().find_map(|u| info_hash_from_url(u)))
            .as_deref()
    }

    /// Stable identity for dedupe, history, and engine matching: the
    /// info-hash when derivable, otherwise a hash of the first url.
    pub fn unique_key(&self) -> String {
        if let Some(hash) = self.info_hash() {
            return hash.to_string();
        }
        let first = self.urls.first().map(String::as_str).unwrap_or("");
        format!("{:x}", md5::compute(first))
    }

    /// A magnet link for this candidate: the first magnet url if one was
    /// supplied, otherwise synthesized from the info-hash.
    pub fn magnet(&self) -> Option<String> {
        if let Some(url) = self.urls.iter().find(|u| u.starts_with("magnet:")) {
            return Some(url.clone());
        }
        let hash = self.info_hash()?;
        let mut magnet = format!("magnet:?xt=urn:btih:{hash}");
        if let Some(name) = &self.name {
            magnet.push_str("&dn=");
            magnet.push_str(&urlencoding::encode(name));
        }
        Some(magnet)
    }

    /// The url a backend should hand to its engine: magnet first.
    pub fn preferred_url(&self) -> Option<String> {
        self.magnet().or_else(|| self.urls.first().cloned())
    }

    pub fn to_snapshot(&self) -> DownloadableSnapshot {
        DownloadableSnapshot {
            kind: self.kind,
            urls: self.urls.clone(),
            name: self.name.clone(),
            quality: self.quality,
            timestamp: self.timestamp,
            feeder: self.feeder.clone(),
            episodes: self
                .episodes
                .iter()
                .map(|ep| EpisodeSnapshot {
                    tvdb_id: ep.show.tvdb_id,
                    show_name: ep.show.name.clone(),
                    show_path: ep.show.path.clone(),
                    followed: ep.show.followed,
                    wanted_quality: ep.show.wanted_quality,
                    library_id: ep.library_id,
                    tvdb_episodes: ep.tvdb_episodes.clone(),
                    scene_episodes: ep.scene_episodes.clone(),
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snap: DownloadableSnapshot) -> Self {
        let episodes = snap
            .episodes
            .into_iter()
            .map(|ep| TvEpisode {
                show: std::sync::Arc::new(TvShow {
                    tvdb_id: ep.tvdb_id,
                    library_id: None,
                    name: ep.show_name,
                    path: ep.show_path,
                    followed: ep.followed,
                    wanted_quality: ep.wanted_quality,
                    status: None,
                }),
                library_id: ep.library_id,
                tvdb_episodes: ep.tvdb_episodes,
                scene_episodes: ep.scene_episodes,
            })
            .collect();
        Self {
            kind: snap.kind,
            urls: snap.urls,
            episodes,
            name: snap.name,
            quality: snap.quality,
            timestamp: snap.timestamp,
            feeder: snap.feeder,
            info_hash: OnceCell::new(),
        }
    }
}

/// Serialized form of a candidate, written into backend snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadableSnapshot {
    pub kind: ReleaseKind,
    pub urls: Vec<String>,
    pub name: Option<String>,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    pub feeder: Option<String>,
    pub episodes: Vec<EpisodeSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSnapshot {
    pub tvdb_id: u32,
    pub show_name: String,
    pub show_path: Option<std::path::PathBuf>,
    pub followed: bool,
    pub wanted_quality: Quality,
    pub library_id: Option<i64>,
    pub tvdb_episodes: Vec<(u32, u32)>,
    pub scene_episodes: Vec<(u32, u32)>,
}

static MAGNET_BTIH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)xt=urn:btih:([0-9a-z]+)").expect("btih regex"));

// Torrent caches encode the info-hash in the download path.
static CACHE_HASH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:torrage|torcache|zoink|itorrents)[^/]*/(?:torrent/)?([0-9a-f]{40})(?:\.torrent)?$")
        .expect("cache url regex")
});

/// Extract a lowercase hex info-hash from a magnet link, handling both the
/// 40-char hex and 32-char base32 encodings.
pub fn info_hash_from_magnet(url: &str) -> Option<String> {
    let caps = MAGNET_BTIH.captures(url)?;
    let raw = caps.get(1)?.as_str();
    match raw.len() {
        40 if raw.chars().all(|c| c.is_ascii_hexdigit()) => Some(raw.to_ascii_lowercase()),
        32 => {
            let bytes = base32::decode(
                base32::Alphabet::Rfc4648 { padding: false },
                &raw.to_ascii_uppercase(),
            )?;
            (bytes.len() == 20).then(|| hex::encode(bytes))
        }
        _ => None,
    }
}

/// Derive an info-hash from any url we understand: magnet links, or the
/// download paths of the well-known torrent caches.
pub fn info_hash_from_url(url: &str) -> Option<String> {
    if url.starts_with("magnet:") {
        return info_hash_from_magnet(url);
    }
    CACHE_HASH
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Compute the info-hash of a fetched .torrent payload: sha1 over the
/// re-encoded `info` dictionary.
pub fn info_hash_from_torrent_bytes(bytes: &[u8]) -> anyhow::Result<String> {
    use serde_bencode::value::Value;

    let value: Value = serde_bencode::from_bytes(bytes)?;
    let Value::Dict(dict) = value else {
        anyhow::bail!("torrent payload is not a bencoded dictionary");
    };
    let info = dict
        .get(b"info".as_slice())
        .ok_or_else(|| anyhow::anyhow!("torrent payload has no info dictionary"))?;
    let encoded = serde_bencode::to_bytes(info)?;

    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    fn torrent(urls: Vec<&str>) -> Downloadable {
        Downloadable::new(
            ReleaseKind::Torrent,
            urls.into_iter().map(String::from).collect(),
            Vec::new(),
            Some("House.S01E01.720p.HDTV.x264-GRP".to_string()),
            Quality::HDTV,
            Some("showrss".to_string()),
        )
    }

    #[test]
    fn magnet_hex_hash() {
        let url = format!("magnet:?xt=urn:btih:{}&dn=x", HEX_HASH.to_uppercase());
        assert_eq!(info_hash_from_magnet(&url).as_deref(), Some(HEX_HASH));
    }

    #[test]
    fn magnet_base32_hash() {
        // base32 of the HEX_HASH bytes.
        let bytes = hex::decode(HEX_HASH).unwrap();
        let b32 = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes);
        let url = format!("magnet:?xt=urn:btih:{b32}");
        assert_eq!(info_hash_from_magnet(&url).as_deref(), Some(HEX_HASH));
    }

    #[test]
    fn cache_url_hash() {
        let url = format!("http://torrage.com/torrent/{}.torrent", HEX_HASH.to_uppercase());
        assert_eq!(info_hash_from_url(&url).as_deref(), Some(HEX_HASH));
        assert_eq!(info_hash_from_url("http://example.com/file.torrent"), None);
    }

    #[test]
    fn unique_key_prefers_info_hash() {
        let magnet = format!("magnet:?xt=urn:btih:{HEX_HASH}");
        let t = torrent(vec!["http://example.com/a.torrent", &magnet]);
        assert_eq!(t.unique_key(), HEX_HASH);

        // Same payload advertised by a different feeder with the same
        // magnet collapses to the same key.
        let t2 = torrent(vec![&magnet]);
        assert_eq!(t.unique_key(), t2.unique_key());

        // No hash anywhere: key falls back to a url digest, still stable.
        let t3 = torrent(vec!["http://example.com/a.torrent"]);
        assert_eq!(t3.unique_key(), t3.unique_key());
        assert_ne!(t3.unique_key(), t.unique_key());
    }

    #[test]
    fn magnet_is_synthesized_when_missing() {
        let url = format!("http://torrage.com/torrent/{HEX_HASH}.torrent");
        let t = torrent(vec![&url]);
        let magnet = t.magnet().unwrap();
        assert!(magnet.starts_with(&format!("magnet:?xt=urn:btih:{HEX_HASH}")));
        assert!(magnet.contains("&dn=House.S01E01"));
        assert_eq!(t.preferred_url().unwrap(), magnet);
    }

    #[test]
    fn composite_quality_is_rejected() {
        let mut t = torrent(vec!["magnet:?xt=urn:btih:abc"]);
        t.set_quality(Quality::HD);
        assert_eq!(t.quality(), Quality::HDTV);
        t.set_quality(Quality::FULLHDTV);
        assert_eq!(t.quality(), Quality::FULLHDTV);
        t.set_quality(Quality::UNKNOWN);
        assert_eq!(t.quality(), Quality::UNKNOWN);
    }

    #[test]
    fn torrent_bytes_hash() {
        // Minimal single-file torrent structure.
        let payload = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let hash = info_hash_from_torrent_bytes(payload).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(&b"d6:lengthi1e4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaae"[..]);
        assert_eq!(hash, hex::encode(hasher.finalize()));
    }
}
