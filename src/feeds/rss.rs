//! RSS fetching and parsing shared by all feeders.
//!
//! Torrent feeds are plain RSS 2.0 with optional `torrent:*` extension
//! tags and `application/x-bittorrent` enclosures; entries surface every
//! url they carry plus a synthesized magnet when only a bare info-hash is
//! present.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, warn};

use crate::services::rate_limiter::RateLimitedClient;

/// One feed entry with everything a feeder needs to build a candidate.
#[derive(Debug, Clone, Default)]
pub struct FeedEntry {
    pub title: String,
    pub links: Vec<String>,
    pub enclosures: Vec<String>,
    /// Release filename when the feed carries one (`torrent:fileName`).
    pub filename: Option<String>,
    pub magnet_uri: Option<String>,
    pub info_hash: Option<String>,
    pub category: Option<String>,
    pub pub_date: Option<DateTime<Utc>>,
}

impl FeedEntry {
    /// All urls leading to this entry's payload, in preference order, with
    /// duplicates removed. A bare info-hash becomes a magnet link.
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();

        if let Some(magnet) = &self.magnet_uri {
            push_unique(&mut urls, magnet);
        }
        for url in &self.enclosures {
            push_unique(&mut urls, url);
        }
        for url in &self.links {
            push_unique(&mut urls, url);
        }
        if !urls.iter().any(|u| u.starts_with("magnet:")) {
            if let Some(hash) = &self.info_hash {
                let magnet = format!(
                    "magnet:?xt=urn:btih:{}&dn={}",
                    hash.to_lowercase(),
                    urlencoding::encode(&self.title)
                );
                push_unique(&mut urls, &magnet);
            }
        }
        urls
    }
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    let url = url.trim();
    if !url.is_empty() && !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}

pub async fn fetch_feed(client: &RateLimitedClient, url: &str) -> Result<Vec<FeedEntry>> {
    debug!(url = %url, "fetching feed");
    let response = client.get(url).await.context("fetching feed")?;
    if !response.status().is_success() {
        anyhow::bail!("feed returned error status: {}", response.status());
    }
    let content = response.text().await.context("reading feed body")?;
    parse_feed(&content)
}

/// Parse RSS XML into entries. Malformed XML ends the parse at the point
/// of the error; entries seen up to then are kept.
pub fn parse_feed(content: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut current_tag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "item" {
                    current = Some(FeedEntry::default());
                }
                current_tag = tag;
            }
            Ok(Event::Empty(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "enclosure"
                    && let Some(ref mut entry) = current
                {
                    let mut url = None;
                    let mut kind = None;
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr.unescape_value().unwrap_or_default().to_string();
                        match key.as_str() {
                            "url" => url = Some(value),
                            "type" => kind = Some(value),
                            _ => {}
                        }
                    }
                    let is_torrent = kind
                        .as_deref()
                        .is_none_or(|k| k == "application/x-bittorrent");
                    if let Some(url) = url
                        && is_torrent
                    {
                        entry.enclosures.push(url);
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "item"
                    && let Some(entry) = current.take()
                    && !entry.title.is_empty()
                {
                    entries.push(entry);
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                if let Some(ref mut entry) = current {
                    let text = e.unescape().unwrap_or_default().to_string();
                    apply_field(entry, &current_tag, text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(ref mut entry) = current {
                    let text = String::from_utf8_lossy(e.as_ref()).to_string();
                    apply_field(entry, &current_tag, text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = ?e, "feed XML error, keeping entries parsed so far");
                break;
            }
            _ => {}
        }
    }

    Ok(entries)
}

fn apply_field(entry: &mut FeedEntry, tag: &str, text: String) {
    match tag {
        "title" => entry.title = text,
        "link" => entry.links.push(text),
        "category" => entry.category = Some(text),
        "pubDate" => entry.pub_date = parse_feed_date(&text),
        "torrent:infoHash" | "infoHash" => entry.info_hash = Some(text),
        "torrent:magnetURI" | "magnetURI" => entry.magnet_uri = Some(text),
        "torrent:fileName" | "fileName" => entry.filename = Some(text),
        _ => {}
    }
}

fn parse_feed_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
