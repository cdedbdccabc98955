//! RPC method dispatch and property projection.

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::warn;

use super::RpcState;
use crate::catalog::TvShow;
use crate::db::HistoryRow;
use crate::downloader::Download;
use crate::events::EventKind;
use crate::jobs::housekeeper::refresh_episodes;
use crate::release::quality::Quality;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Ok { error: bool, result: Value },
    Err {
        error: bool,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl RpcResponse {
    fn ok(result: Value) -> Self {
        Self::Ok {
            error: false,
            result,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self::Err {
            error: true,
            error_message: message.into(),
        }
    }
}

pub async fn dispatch(state: &RpcState, request: RpcRequest) -> RpcResponse {
    let params = request.parameters;
    let result = match request.method.as_str() {
        "get_version" => Ok(json!(env!("CARGO_PKG_VERSION"))),
        "echo" => Ok(params),
        "get_all_shows" => get_all_shows(state).await,
        "get_shows" => get_shows(state, &params).await,
        "set_show_followed" => set_show_followed(state, &params).await,
        "set_show_wanted_quality" => set_show_wanted_quality(state, &params).await,
        "get_show_wanted_quality" => get_show_wanted_quality(state, &params).await,
        "get_running_downloads" => get_running_downloads(state, &params).await,
        "get_non_running_downloads" => get_non_running_downloads(state, &params).await,
        "search_series_by_name" => search_series_by_name(state, &params).await,
        "add_show" => add_show(state, &params).await,
        "get_episodes_on_date" => get_episodes_on_date(state, &params).await,
        "get_seasons" => get_seasons(state, &params).await,
        "get_episodes_in_season" => get_episodes_in_season(state, &params).await,
        "refresh_episodes" => rpc_refresh_episodes(state, &params).await,
        method => Err(anyhow!("unknown method: {method}")),
    };
    match result {
        Ok(value) => RpcResponse::ok(value),
        Err(e) => {
            warn!(method = %request.method, error = %e, "rpc call failed");
            RpcResponse::err(e.to_string())
        }
    }
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, key: &str) -> Result<T> {
    let value = params
        .get(key)
        .ok_or_else(|| anyhow!("missing parameter: {key}"))?;
    serde_json::from_value(value.clone()).with_context(|| format!("bad parameter: {key}"))
}

fn opt_param<T: serde::de::DeserializeOwned>(params: &Value, key: &str) -> Result<Option<T>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(
            serde_json::from_value(value.clone()).with_context(|| format!("bad parameter: {key}"))?,
        )),
    }
}

// ---------------------------------------------------------------------------
// Property projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowProperty {
    TvdbId,
    Name,
    Followed,
    WantedQuality,
    Path,
    Status,
    LibraryId,
}

const ALL_SHOW_PROPERTIES: &[ShowProperty] = &[
    ShowProperty::TvdbId,
    ShowProperty::Name,
    ShowProperty::Followed,
    ShowProperty::WantedQuality,
    ShowProperty::Path,
    ShowProperty::Status,
    ShowProperty::LibraryId,
];

fn project_show(show: &TvShow, properties: &[ShowProperty]) -> Value {
    let mut map = Map::new();
    for property in properties {
        let (key, value) = match property {
            ShowProperty::TvdbId => ("tvdb_id", json!(show.tvdb_id)),
            ShowProperty::Name => ("name", json!(show.name)),
            ShowProperty::Followed => ("followed", json!(show.followed)),
            ShowProperty::WantedQuality => ("wanted_quality", json!(show.wanted_quality.0)),
            ShowProperty::Path => ("path", json!(show.path)),
            ShowProperty::Status => ("status", json!(show.status)),
            ShowProperty::LibraryId => ("library_id", json!(show.library_id)),
        };
        map.insert(key.to_string(), value);
    }
    Value::Object(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadProperty {
    Key,
    Name,
    Backend,
    Status,
    Progress,
    DownloadedBytes,
    TotalBytes,
    RateBps,
    Quality,
    StartedAt,
}

const ALL_DOWNLOAD_PROPERTIES: &[DownloadProperty] = &[
    DownloadProperty::Key,
    DownloadProperty::Name,
    DownloadProperty::Backend,
    DownloadProperty::Status,
    DownloadProperty::Progress,
    DownloadProperty::DownloadedBytes,
    DownloadProperty::TotalBytes,
    DownloadProperty::RateBps,
    DownloadProperty::Quality,
    DownloadProperty::StartedAt,
];

fn project_download(download: &Download, properties: &[DownloadProperty]) -> Value {
    let mut map = Map::new();
    for property in properties {
        let (key, value) = match property {
            DownloadProperty::Key => ("key", json!(download.key())),
            DownloadProperty::Name => ("name", json!(download.downloadable().name())),
            DownloadProperty::Backend => ("backend", json!(download.backend_name())),
            DownloadProperty::Status => ("status", json!(download.status().to_string())),
            DownloadProperty::Progress => ("progress", json!(download.progress())),
            DownloadProperty::DownloadedBytes => {
                ("downloaded_bytes", json!(download.downloaded_bytes()))
            }
            DownloadProperty::TotalBytes => ("total_bytes", json!(download.total_bytes())),
            DownloadProperty::RateBps => ("rate_bps", json!(download.rate_bps())),
            DownloadProperty::Quality => {
                ("quality", json!(download.downloadable().quality().0))
            }
            DownloadProperty::StartedAt => {
                ("started_at", json!(download.started_at().to_rfc3339()))
            }
        };
        map.insert(key.to_string(), value);
    }
    Value::Object(map)
}

fn project_history_row(row: &HistoryRow, properties: &[DownloadProperty]) -> Value {
    let mut map = Map::new();
    for property in properties {
        let (key, value) = match property {
            DownloadProperty::Key => ("key", json!(row.key)),
            DownloadProperty::Name => ("name", json!(row.name)),
            DownloadProperty::Backend => ("backend", Value::Null),
            DownloadProperty::Status => (
                "status",
                json!(row.final_status.clone().unwrap_or_else(|| "unknown".to_string())),
            ),
            DownloadProperty::Progress => ("progress", Value::Null),
            DownloadProperty::DownloadedBytes => ("downloaded_bytes", json!(row.total_size)),
            DownloadProperty::TotalBytes => ("total_bytes", json!(row.total_size)),
            DownloadProperty::RateBps => ("rate_bps", json!(0.0)),
            DownloadProperty::Quality => ("quality", json!(row.quality.0)),
            DownloadProperty::StartedAt => ("started_at", json!(row.started_at.to_rfc3339())),
        };
        map.insert(key.to_string(), value);
    }
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

async fn get_all_shows(state: &RpcState) -> Result<Value> {
    let shows = state.catalog.all_shows().await?;
    let projected: Vec<Value> = shows
        .iter()
        .map(|s| project_show(s, ALL_SHOW_PROPERTIES))
        .collect();
    Ok(json!(projected))
}

async fn get_shows(state: &RpcState, params: &Value) -> Result<Value> {
    let properties: Vec<ShowProperty> = param(params, "properties")?;
    let tvdb_ids: Option<Vec<u32>> = opt_param(params, "tvdb_ids")?;

    let shows = state.catalog.all_shows().await?;
    let projected: Vec<Value> = shows
        .iter()
        .filter(|s| {
            tvdb_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&s.tvdb_id))
        })
        .map(|s| project_show(s, &properties))
        .collect();
    Ok(json!(projected))
}

async fn set_show_followed(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    let followed: bool = param(params, "followed")?;

    state.db.show_settings().set_followed(tvdb_id, followed).await?;
    if followed {
        // A followed show with an empty quality mask can never match
        // anything; default it to SD.
        let row = state.db.show_settings().get(tvdb_id).await?;
        if row.map(|r| r.wanted_quality.0).unwrap_or(0) == 0 {
            state
                .db
                .show_settings()
                .set_wanted_quality(tvdb_id, Quality::SD)
                .await?;
        }
    }
    state.events.publish(EventKind::SettingsChanged);
    Ok(json!(true))
}

async fn set_show_wanted_quality(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    let quality: u32 = param(params, "quality")?;
    if quality == 0 {
        return Err(anyhow!("quality mask must not be empty"));
    }
    state
        .db
        .show_settings()
        .set_wanted_quality(tvdb_id, Quality(quality))
        .await?;
    state.events.publish(EventKind::SettingsChanged);
    Ok(json!(true))
}

async fn get_show_wanted_quality(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    let row = state.db.show_settings().get(tvdb_id).await?;
    let quality = row
        .map(|r| r.wanted_quality)
        .unwrap_or(Quality::SD);
    Ok(json!(quality.0))
}

async fn get_running_downloads(state: &RpcState, params: &Value) -> Result<Value> {
    let properties: Vec<DownloadProperty> = opt_param(params, "properties")?
        .unwrap_or_else(|| ALL_DOWNLOAD_PROPERTIES.to_vec());
    let downloads = state.backends.all_downloads();
    let projected: Vec<Value> = downloads
        .iter()
        .filter(|d| !d.status().is_final())
        .map(|d| project_download(d, &properties))
        .collect();
    Ok(json!(projected))
}

async fn get_non_running_downloads(state: &RpcState, params: &Value) -> Result<Value> {
    let properties: Vec<DownloadProperty> = opt_param(params, "properties")?
        .unwrap_or_else(|| ALL_DOWNLOAD_PROPERTIES.to_vec());
    let limit: u32 = opt_param(params, "limit")?.unwrap_or(30);
    let rows = state.db.history().recent(limit).await?;
    let projected: Vec<Value> = rows
        .iter()
        .filter(|r| r.final_status.is_some())
        .map(|r| project_history_row(r, &properties))
        .collect();
    Ok(json!(projected))
}

async fn search_series_by_name(state: &RpcState, params: &Value) -> Result<Value> {
    let name: String = param(params, "name")?;
    let results = state.metadata.search_shows(&name).await?;
    let out: Vec<Value> = results
        .iter()
        .filter_map(|r| {
            // Only shows we can key by tvdb id are actionable.
            let tvdb_id = r.show.externals.as_ref()?.thetvdb?;
            Some(json!({
                "tvdb_id": tvdb_id,
                "name": r.show.name,
                "status": r.show.status,
                "premiered": r.show.premiered,
                "network": r.show.network.as_ref().map(|n| n.name.clone()),
            }))
        })
        .collect();
    Ok(json!(out))
}

async fn add_show(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    let quality: Option<u32> = opt_param(params, "quality")?;

    state.db.show_settings().set_followed(tvdb_id, true).await?;
    let wanted = quality.map(Quality).filter(|q| q.0 != 0).unwrap_or(Quality::SD);
    state
        .db
        .show_settings()
        .set_wanted_quality(tvdb_id, wanted)
        .await?;
    state.events.publish(EventKind::SettingsChanged);

    // Prime the episode cache so the show is searchable immediately; a
    // failure here fixes itself on the next housekeeper run.
    if let Err(e) = refresh_episodes(&state.db, &state.metadata, tvdb_id).await {
        warn!(tvdb_id = tvdb_id, error = %e, "episode prime failed");
    }
    Ok(json!(true))
}

async fn get_episodes_on_date(state: &RpcState, params: &Value) -> Result<Value> {
    let date: String = param(params, "date")?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").context("bad date, want YYYY-MM-DD")?;
    let rows = state.db.episodes().episodes_on_date(date).await?;
    let out: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "tvdb_id": r.tvdb_id,
                "season": r.season,
                "episode": r.episode,
                "name": r.name,
                "first_aired": r.first_aired.map(|d| d.to_string()),
            })
        })
        .collect();
    Ok(json!(out))
}

async fn get_seasons(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    Ok(json!(state.db.episodes().seasons(tvdb_id).await?))
}

async fn get_episodes_in_season(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    let season: u32 = param(params, "season")?;
    let rows = state.db.episodes().episodes_in_season(tvdb_id, season).await?;
    let out: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "season": r.season,
                "episode": r.episode,
                "name": r.name,
                "first_aired": r.first_aired.map(|d| d.to_string()),
            })
        })
        .collect();
    Ok(json!(out))
}

async fn rpc_refresh_episodes(state: &RpcState, params: &Value) -> Result<Value> {
    let tvdb_id: u32 = param(params, "tvdb_id")?;
    refresh_episodes(&state.db, &state.metadata, tvdb_id).await?;
    Ok(json!(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_show() -> TvShow {
        TvShow {
            tvdb_id: 73244,
            library_id: Some(12),
            name: "The Office".to_string(),
            path: None,
            followed: true,
            wanted_quality: Quality::HD720P,
            status: Some("Ended".to_string()),
        }
    }

    #[test]
    fn show_projection_honors_property_list() {
        let show = sample_show();
        let value = project_show(&show, &[ShowProperty::TvdbId, ShowProperty::Followed]);
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["tvdb_id"], json!(73244));
        assert_eq!(obj["followed"], json!(true));
    }

    #[test]
    fn full_show_projection_includes_every_field() {
        let value = project_show(&sample_show(), ALL_SHOW_PROPERTIES);
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), ALL_SHOW_PROPERTIES.len());
        assert_eq!(obj["wanted_quality"], json!(Quality::HD720P.0));
        assert_eq!(obj["status"], json!("Ended"));
    }

    #[test]
    fn error_response_wire_shape() {
        let response = RpcResponse::err("unknown method: bogus");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"error": true, "errorMessage": "unknown method: bogus"})
        );
    }

    #[test]
    fn ok_response_wire_shape() {
        let response = RpcResponse::ok(json!(42));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"error": false, "result": 42}));
    }

    #[test]
    fn property_names_deserialize_snake_case() {
        let props: Vec<DownloadProperty> =
            serde_json::from_value(json!(["key", "rate_bps", "started_at"])).unwrap();
        assert_eq!(
            props,
            vec![
                DownloadProperty::Key,
                DownloadProperty::RateBps,
                DownloadProperty::StartedAt
            ]
        );
    }
}
