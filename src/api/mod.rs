//! Loopback RPC server.
//!
//! One `POST /rpc` endpoint taking `{method, parameters}` and answering
//! `{error: false, result}` or `{error: true, errorMessage}`. Bound to
//! 127.0.0.1 only; this is a local control surface, not a public API.

pub mod client;
pub mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::catalog::Catalog;
use crate::db::Database;
use crate::downloader::BackendRegistry;
use crate::events::EventBus;
use crate::services::metadata::MetadataClient;
use rpc::{RpcRequest, RpcResponse};

#[derive(Clone)]
pub struct RpcState {
    pub db: Database,
    pub catalog: Arc<Catalog>,
    pub metadata: Arc<MetadataClient>,
    pub backends: Arc<BackendRegistry>,
    pub events: Arc<EventBus>,
}

async fn handle_rpc(
    axum::extract::State(state): axum::extract::State<RpcState>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    Json(rpc::dispatch(&state, request).await)
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: RpcState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("rpc server: bind failed")?;
    info!(addr = %addr, "rpc server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("rpc server")
}
