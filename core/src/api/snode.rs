// Snode JSON-RPC through an onion path
//
// `OnionSnodeRpc` owns path penalisation: it knows which path carried the
// request. `SnodeApiExecutor` owns destination-level decisions (clock skew,
// faulty destination) and turns the reply into JSON.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{ApiError, ApiExecutor, ContextKey, ExecutorContext};
use crate::clock::ClockSync;
use crate::onion::{
    ErrorStatus, FailureDecision, OnionDestination, OnionError, OnionResponse, OnionTransport,
    Path, PathManager,
};
use crate::snode::Snode;

/// `{method, params}` body understood by a storage server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnodeRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl SnodeRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Seed node query for the active service node list
    pub fn get_n_service_nodes() -> Self {
        Self::new(
            "get_n_service_nodes",
            json!({
                "active_only": true,
                "fields": {
                    "public_ip": true,
                    "storage_port": true,
                    "pubkey_ed25519": true,
                    "pubkey_x25519": true,
                    "storage_server_version": true,
                },
            }),
        )
    }

    pub fn get_swarm(account_id: &str) -> Self {
        Self::new("get_snodes_for_pubkey", json!({ "pubkey": account_id }))
    }

    pub fn info() -> Self {
        Self::new("info", json!({}))
    }

    pub fn to_json(&self) -> Value {
        json!({ "method": self.method, "params": self.params })
    }
}

#[derive(Debug, Clone)]
pub struct SnodeApiRequest {
    pub snode: Snode,
    pub request: SnodeRequest,
}

/// One RPC to one snode
#[async_trait]
pub trait SnodeRpc: Send + Sync {
    async fn call(&self, snode: &Snode, request: &SnodeRequest) -> Result<OnionResponse, ApiError>;
}

pub struct OnionSnodeRpc {
    paths: Arc<PathManager>,
    transport: Arc<dyn OnionTransport>,
}

impl OnionSnodeRpc {
    pub fn new(paths: Arc<PathManager>, transport: Arc<dyn OnionTransport>) -> Self {
        Self { paths, transport }
    }
}

/// Penalise the path according to where the failure happened
pub(crate) fn penalise_path(paths: &PathManager, path: &Path, error: OnionError) -> ApiError {
    match &error {
        OnionError::IntermediateNodeFailed {
            failed_public_key, ..
        } => {
            tracing::warn!("Hop {} unreachable, dropping it", failed_public_key);
            match path.find_by_ed25519(failed_public_key) {
                Some(node) => paths.handle_bad_snode(node.ed25519_key()),
                None => {
                    paths.handle_bad_snode(failed_public_key);
                    paths.handle_bad_path(path);
                }
            }
            ApiError::from(error).with_decision(FailureDecision::Retry)
        }
        OnionError::GuardConnectionFailed { .. } | OnionError::InvalidResponse { .. } => {
            tracing::warn!("Path {} failed: {}", path, error);
            paths.handle_bad_path(path);
            ApiError::from(error).with_decision(FailureDecision::Retry)
        }
        OnionError::GuardProtocolError { .. } => {
            tracing::warn!("Guard misbehaved on {}: {}", path, error);
            paths.handle_bad_path(path);
            ApiError::from(error)
        }
        _ => ApiError::from(error),
    }
}

#[async_trait]
impl SnodeRpc for OnionSnodeRpc {
    async fn call(&self, snode: &Snode, request: &SnodeRequest) -> Result<OnionResponse, ApiError> {
        let path = self.paths.get_path(Some(snode)).await?;
        let payload = serde_json::to_vec(&request.to_json())
            .map_err(|e| ApiError::Malformed(e.to_string()))?;

        self.transport
            .send(&path, &OnionDestination::Snode(snode.clone()), &payload)
            .await
            .map_err(|e| penalise_path(&self.paths, &path, e))
    }
}

/// Marks that this logical call already saw a clock skew reply
struct ClockSkewSeen;

impl ContextKey for ClockSkewSeen {
    type Value = ();
}

/// Storage server cannot parse what oxend handed it
const UNPARSABLE_DATA: &str = "oxend returned unparsable data";
const SNODE_NOT_READY: &str = "Snode not ready";

pub struct SnodeApiExecutor {
    rpc: Arc<dyn SnodeRpc>,
    clock: Arc<dyn ClockSync>,
    paths: Option<Arc<PathManager>>,
}

impl SnodeApiExecutor {
    pub fn new(rpc: Arc<dyn SnodeRpc>, clock: Arc<dyn ClockSync>) -> Self {
        Self {
            rpc,
            clock,
            paths: None,
        }
    }

    /// Allow faulty destinations to be dropped from the pool
    pub fn with_path_manager(mut self, paths: Arc<PathManager>) -> Self {
        self.paths = Some(paths);
        self
    }

    async fn on_failure(&self, ctx: &mut ExecutorContext, snode: &Snode, error: ApiError) -> ApiError {
        let (clock_skew, faulty_code) = match error.onion() {
            Some(OnionError::ClockOutOfSync { .. }) => (true, None),
            Some(OnionError::DestinationError { status }) if is_faulty_destination(status) => {
                (false, Some(status.code))
            }
            _ => (false, None),
        };

        if clock_skew {
            if ctx.contains::<ClockSkewSeen>() {
                tracing::warn!("⏰ Clock still out of sync with {} after resync", snode);
                return error.with_decision(FailureDecision::Fail);
            }
            ctx.set::<ClockSkewSeen>(());
            let resynced = self.clock.resync().await;
            tracing::info!("⏰ Clock skew reported by {}, resync ok: {}", snode, resynced);
            let decision = if resynced {
                FailureDecision::Retry
            } else {
                FailureDecision::Fail
            };
            return error.with_decision(decision);
        }

        match (faulty_code, &self.paths) {
            (Some(code), Some(paths)) => {
                tracing::warn!("Destination {} faulty ({}), dropping it", snode, code);
                paths.handle_bad_snode(snode.ed25519_key());
                error.with_decision(FailureDecision::Retry)
            }
            _ => error,
        }
    }
}

fn is_faulty_destination(status: &ErrorStatus) -> bool {
    let text = status.body_text().unwrap_or_default();
    (status.code == 502 && text.contains(UNPARSABLE_DATA))
        || (status.code == 503 && text.contains(SNODE_NOT_READY))
}

#[async_trait]
impl ApiExecutor<SnodeApiRequest, Value> for SnodeApiExecutor {
    async fn send(&self, ctx: &mut ExecutorContext, req: SnodeApiRequest) -> Result<Value, ApiError> {
        match self.rpc.call(&req.snode, &req.request).await {
            Ok(response) => {
                ctx.remove::<ClockSkewSeen>();
                response
                    .json_body()
                    .map_err(|e| ApiError::Malformed(format!("{}: {}", req.request.method, e)))
            }
            Err(error) => Err(self.on_failure(ctx, &req.snode, error).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSync;
    use crate::snode::test_support::snode;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRpc {
        replies: Mutex<VecDeque<Result<OnionResponse, ApiError>>>,
    }

    impl ScriptedRpc {
        fn new(replies: Vec<Result<OnionResponse, ApiError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    #[async_trait]
    impl SnodeRpc for ScriptedRpc {
        async fn call(&self, _: &Snode, _: &SnodeRequest) -> Result<OnionResponse, ApiError> {
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Malformed("script exhausted".into())))
        }
    }

    struct FakeClock {
        resync_result: bool,
        resyncs: AtomicUsize,
    }

    #[async_trait]
    impl ClockSync for FakeClock {
        async fn resync(&self) -> bool {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            self.resync_result
        }

        fn now_ms(&self) -> u64 {
            0
        }
    }

    fn clock(resync_result: bool) -> Arc<FakeClock> {
        Arc::new(FakeClock {
            resync_result,
            resyncs: AtomicUsize::new(0),
        })
    }

    fn skew() -> Result<OnionResponse, ApiError> {
        Err(OnionError::ClockOutOfSync {
            status: ErrorStatus::new(406),
        }
        .into())
    }

    fn request() -> SnodeApiRequest {
        SnodeApiRequest {
            snode: snode(1),
            request: SnodeRequest::info(),
        }
    }

    #[test]
    fn test_request_bodies() {
        let seed = SnodeRequest::get_n_service_nodes().to_json();
        assert_eq!(seed["method"], "get_n_service_nodes");
        assert_eq!(seed["params"]["active_only"], true);
        assert_eq!(seed["params"]["fields"]["pubkey_x25519"], true);

        let swarm = SnodeRequest::get_swarm("05ab").to_json();
        assert_eq!(swarm["method"], "get_snodes_for_pubkey");
        assert_eq!(swarm["params"]["pubkey"], "05ab");
    }

    #[tokio::test]
    async fn test_success_parses_json_body() {
        let rpc = ScriptedRpc::new(vec![Ok(OnionResponse {
            code: 200,
            info: json!({"code": 200}),
            body: Some(br#"{"timestamp": 5}"#.to_vec()),
        })]);
        let executor = SnodeApiExecutor::new(Arc::new(rpc), clock(true));
        let value = executor
            .send(&mut ExecutorContext::new(), request())
            .await
            .unwrap();
        assert_eq!(value["timestamp"], 5);
    }

    #[tokio::test]
    async fn test_first_clock_skew_retries_after_resync() {
        let clock = clock(true);
        let executor = SnodeApiExecutor::new(Arc::new(ScriptedRpc::new(vec![skew()])), clock.clone());

        let err = executor
            .send(&mut ExecutorContext::new(), request())
            .await
            .unwrap_err();
        assert_eq!(err.decision(), Some(FailureDecision::Retry));
        assert_eq!(clock.resyncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_resync_fails() {
        let executor = SnodeApiExecutor::new(Arc::new(ScriptedRpc::new(vec![skew()])), clock(false));
        let err = executor
            .send(&mut ExecutorContext::new(), request())
            .await
            .unwrap_err();
        assert_eq!(err.decision(), Some(FailureDecision::Fail));
    }

    #[tokio::test]
    async fn test_second_clock_skew_in_same_call_fails() {
        let clock = clock(true);
        let executor =
            SnodeApiExecutor::new(Arc::new(ScriptedRpc::new(vec![skew(), skew()])), clock.clone());
        let mut ctx = ExecutorContext::new();

        let first = executor.send(&mut ctx, request()).await.unwrap_err();
        assert_eq!(first.decision(), Some(FailureDecision::Retry));
        let second = executor.send(&mut ctx, request()).await.unwrap_err();
        assert_eq!(second.decision(), Some(FailureDecision::Fail));
        assert_eq!(clock.resyncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_surface_unchanged() {
        let rpc = ScriptedRpc::new(vec![Err(OnionError::DestinationError {
            status: ErrorStatus::new(421),
        }
        .into())]);
        let executor = SnodeApiExecutor::new(Arc::new(rpc), clock(true));
        let err = executor
            .send(&mut ExecutorContext::new(), request())
            .await
            .unwrap_err();
        assert!(err.decision().is_none());
        assert_eq!(err.status_code(), Some(421));
    }
}
