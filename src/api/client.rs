//! Client side of the loopback RPC surface.

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Distinguishes "server not reachable" from "server reachable but the
/// call failed", so callers know which errors are retry-worthy.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc server unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("rpc call failed: {0}")]
    Call(String),
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    error: bool,
    #[serde(default)]
    result: Value,
    #[serde(default, rename = "errorMessage")]
    error_message: String,
}

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("http://127.0.0.1:{port}/rpc"),
        }
    }

    pub async fn call(&self, method: &str, parameters: Value) -> Result<Value, RpcError> {
        let response: WireResponse = self
            .http
            .post(&self.url)
            .json(&json!({"method": method, "parameters": parameters}))
            .send()
            .await?
            .json()
            .await?;
        if response.error {
            return Err(RpcError::Call(response.error_message));
        }
        Ok(response.result)
    }

    pub async fn get_version(&self) -> Result<String, RpcError> {
        let value = self.call("get_version", Value::Null).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn is_reachable(&self) -> bool {
        self.get_version().await.is_ok()
    }
}
