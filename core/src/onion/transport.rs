// Onion transport: HTTP to the guard, v4 reply decryption, failure classification

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::builder;
use super::destination::OnionDestination;
use super::encoding::{decode_v4, encode_onion_payload};
use super::error::{ErrorStatus, OnionError};
use super::path::Path;
use crate::crypto::LayerCipher;
use crate::snode::Snode;

const NEXT_NODE_NOT_FOUND: &str = "Next node not found: ";
const NEXT_NODE_UNREACHABLE: &str = "Next node is currently unreachable: ";

/// 503 bodies: a named hop is not ready, or the guard itself is not
const SNODE_NOT_READY: &str = "Snode not ready: ";
const GUARD_NOT_READY: [&str; 2] = ["Service node is not ready:", "Server busy, try again later"];

/// Destination refused us for an account-level reason, not a path problem
const BLINDING_REQUIRED: &str =
    "Invalid authentication: this server requires the use of blinded ids";

/// Guard statuses that never indicate a broken path
const BENIGN_STATUSES: [u16; 4] = [403, 404, 406, 425];

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error)]
#[error("HTTP request failed: {0}")]
pub struct HttpError(pub String);

/// Minimal POST seam; everything network-facing goes through it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError>;
}

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Client with normal certificate validation (seed nodes)
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Client for snodes. Their storage servers present self-signed
    /// certificates; confidentiality comes from the onion layers.
    pub fn for_snodes(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| HttpError(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        let response = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(|e| HttpError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError(e.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Decrypted 2xx reply from the destination
#[derive(Debug, Clone)]
pub struct OnionResponse {
    pub code: u16,
    pub info: Value,
    pub body: Option<Vec<u8>>,
}

impl OnionResponse {
    /// Body parsed as JSON, `Null` when absent
    pub fn json_body(&self) -> Result<Value, serde_json::Error> {
        match &self.body {
            Some(body) => serde_json::from_slice(body),
            None => Ok(Value::Null),
        }
    }
}

#[async_trait]
pub trait OnionTransport: Send + Sync {
    async fn send(
        &self,
        path: &Path,
        destination: &OnionDestination,
        payload: &[u8],
    ) -> Result<OnionResponse, OnionError>;
}

pub struct HttpOnionTransport {
    http: Arc<dyn HttpClient>,
    cipher: Arc<dyn LayerCipher>,
}

impl HttpOnionTransport {
    pub fn new(http: Arc<dyn HttpClient>, cipher: Arc<dyn LayerCipher>) -> Self {
        Self { http, cipher }
    }

    fn handle_v4_response(
        &self,
        raw: &[u8],
        symmetric_key: &[u8; 32],
        destination: &OnionDestination,
    ) -> Result<OnionResponse, OnionError> {
        let decrypted =
            self.cipher
                .decrypt(raw, symmetric_key)
                .map_err(|e| OnionError::InvalidResponse {
                    reason: e.to_string(),
                })?;
        let (info, body) = decode_v4(&decrypted).map_err(|e| OnionError::InvalidResponse {
            reason: e.to_string(),
        })?;

        let code = info
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .ok_or_else(|| OnionError::InvalidResponse {
                reason: "response info has no status code".to_string(),
            })?;

        if code == 406 || code == 425 {
            tracing::warn!("⏰ Destination {} reports clock skew ({})", destination, code);
            return Err(OnionError::ClockOutOfSync {
                status: ErrorStatus::new(code),
            });
        }

        if !(200..300).contains(&code) {
            let keep_body = match destination {
                OnionDestination::Snode(_) => true,
                OnionDestination::Server { .. } => code == 400,
            };
            let mut status = ErrorStatus::new(code);
            if let Some(message) = info.get("message").and_then(Value::as_str) {
                status = status.with_message(message);
            }
            if keep_body {
                if let Some(body) = body {
                    status = status.with_body(body);
                }
            }
            tracing::debug!("Destination {} answered {}", destination, code);
            return Err(OnionError::DestinationError { status });
        }

        Ok(OnionResponse { code, info, body })
    }
}

/// Map an error reply from the guard (no onion response) to an `OnionError`
pub fn classify_guard_error(
    guard: &Snode,
    destination: &OnionDestination,
    status: u16,
    body: &[u8],
) -> OnionError {
    let text = String::from_utf8_lossy(body).into_owned();
    let error_status = ErrorStatus::new(status).with_message(text.clone());

    let failed_key = text
        .strip_prefix(NEXT_NODE_NOT_FOUND)
        .or_else(|| text.strip_prefix(NEXT_NODE_UNREACHABLE))
        .or_else(|| text.strip_prefix(SNODE_NOT_READY).filter(|_| status == 503))
        .map(|k| k.trim().to_string())
        .or_else(|| {
            let guard_not_ready = status == 503 && GUARD_NOT_READY.iter().any(|p| text.starts_with(p));
            guard_not_ready.then(|| guard.ed25519_key().to_string())
        });

    if let Some(failed_public_key) = failed_key {
        let is_destination = destination
            .snode()
            .is_some_and(|d| d.ed25519_key() == failed_public_key);
        if is_destination {
            return OnionError::DestinationUnreachable {
                status: error_status,
            };
        }
        return OnionError::IntermediateNodeFailed {
            reporting_node: guard.clone(),
            failed_public_key,
            status: error_status,
        };
    }

    if BENIGN_STATUSES.contains(&status) || text.contains(BLINDING_REQUIRED) {
        return OnionError::DestinationError {
            status: error_status,
        };
    }

    OnionError::GuardProtocolError {
        guard: guard.clone(),
        status: error_status,
    }
}

#[async_trait]
impl OnionTransport for HttpOnionTransport {
    async fn send(
        &self,
        path: &Path,
        destination: &OnionDestination,
        payload: &[u8],
    ) -> Result<OnionResponse, OnionError> {
        let built = builder::build(path, destination, payload, self.cipher.as_ref()).map_err(|e| {
            OnionError::Unknown {
                reason: format!("failed to build onion: {}", e),
            }
        })?;

        let url = format!("{}/onion_req/v2", built.guard.url());
        let params = json!({ "ephemeral_key": hex::encode(built.ephemeral_public_key) });
        let body = encode_onion_payload(&built.ciphertext, &params).map_err(|e| {
            OnionError::Unknown {
                reason: e.to_string(),
            }
        })?;

        tracing::debug!("🧅 Sending onion request to {} via {}", destination, path);
        let response = self
            .http
            .post(&url, body)
            .await
            .map_err(|e| OnionError::GuardConnectionFailed {
                guard: built.guard.clone(),
                reason: e.0,
            })?;

        if !response.is_success() {
            return Err(classify_guard_error(
                &built.guard,
                destination,
                response.status,
                &response.body,
            ));
        }

        self.handle_v4_response(&response.body, &built.destination_symmetric_key, destination)
    }
}
