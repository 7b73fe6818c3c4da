// Application server requests over an onion path (v4 request encoding)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::snode::penalise_path;
use super::{ApiError, ApiExecutor, ExecutorContext};
use crate::onion::encoding::encode_v4;
use crate::onion::{OnionDestination, OnionTransport, PathManager};

/// HTTP-style request for a server reached through the last hop
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub destination: OnionDestination,
    pub method: String,
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl ServerRequest {
    pub fn new(destination: OnionDestination, method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            destination,
            method: method.into(),
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// JSON body; sets the content type header
    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = Some(body.to_string().into_bytes());
        self.with_header("Content-Type", "application/json")
    }

    fn encode(&self) -> Result<Vec<u8>, ApiError> {
        let info = json!({
            "method": self.method,
            "endpoint": self.endpoint,
            "headers": self.headers,
        });
        encode_v4(&info, self.body.as_deref()).map_err(|e| ApiError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub status: u16,
    pub headers: Value,
    pub body: Option<Vec<u8>>,
}

impl ServerResponse {
    pub fn json_body(&self) -> Result<Value, ApiError> {
        match &self.body {
            Some(body) => serde_json::from_slice(body).map_err(|e| ApiError::Malformed(e.to_string())),
            None => Ok(Value::Null),
        }
    }
}

pub struct OnionServerClient {
    paths: Arc<PathManager>,
    transport: Arc<dyn OnionTransport>,
}

impl OnionServerClient {
    pub fn new(paths: Arc<PathManager>, transport: Arc<dyn OnionTransport>) -> Self {
        Self { paths, transport }
    }
}

#[async_trait]
impl ApiExecutor<ServerRequest, ServerResponse> for OnionServerClient {
    async fn send(&self, _ctx: &mut ExecutorContext, req: ServerRequest) -> Result<ServerResponse, ApiError> {
        let payload = req.encode()?;
        let path = self.paths.get_path(None).await?;

        tracing::debug!("{} {} on {}", req.method, req.endpoint, req.destination);
        let response = self
            .transport
            .send(&path, &req.destination, &payload)
            .await
            .map_err(|e| penalise_path(&self.paths, &path, e))?;

        Ok(ServerResponse {
            status: response.code,
            headers: response.info.get("headers").cloned().unwrap_or(Value::Null),
            body: response.body,
        })
    }
}
