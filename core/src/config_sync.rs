// Config sync: pushes dirty mutable configs to the account's own swarm
//
// Every dirty config becomes one `sequence` call (store the new blob, then
// delete the blobs it supersedes). All calls of a round go to the same swarm
// node so a later read from that node sees a consistent set.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::batch::sub_result;
use crate::api::storage::{self, Namespace, StoreMessage};
use crate::api::{ApiError, ApiExecutor, ExecutorContext, SwarmRequest};
use crate::clock::ClockSync;
use crate::crypto::SwarmAuth;
use crate::snode::{DirectoryError, SwarmDirectory};

#[derive(Debug, Clone, Error)]
pub enum ConfigSyncError {
    #[error("No swarm node for own account: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Push request failed: {0}")]
    Api(#[from] ApiError),
    #[error("Config {kind} could not produce a push: {reason}")]
    Config { kind: String, reason: String },
    #[error("Push of {kind} rejected: {reason}")]
    Rejected { kind: String, reason: String },
}

/// Everything needed to store one config revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPush {
    pub data: Vec<u8>,
    pub seq_no: i64,
    /// Server hashes of revisions this one replaces
    pub obsolete_hashes: Vec<String>,
}

/// A locally edited config object that is mirrored to the swarm
pub trait MutableConfig: Send + Sync {
    fn kind(&self) -> &str;
    fn namespace(&self) -> Namespace;
    fn needs_push(&self) -> bool;
    fn push(&self) -> Result<ConfigPush, String>;
    /// The server stored revision `seq_no` under `hash`
    fn confirm_pushed(&self, seq_no: i64, hash: &str);
}

pub trait ConfigStore: Send + Sync {
    fn configs(&self) -> Vec<Arc<dyn MutableConfig>>;
}

/// Outcome of one push round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
}

pub struct ConfigSync {
    auth: SwarmAuth,
    configs: Arc<dyn ConfigStore>,
    swarms: Arc<SwarmDirectory>,
    api: Arc<dyn ApiExecutor<SwarmRequest, Value>>,
    clock: Arc<dyn ClockSync>,
}

impl ConfigSync {
    pub fn new(
        auth: SwarmAuth,
        configs: Arc<dyn ConfigStore>,
        swarms: Arc<SwarmDirectory>,
        api: Arc<dyn ApiExecutor<SwarmRequest, Value>>,
        clock: Arc<dyn ClockSync>,
    ) -> Self {
        Self {
            auth,
            configs,
            swarms,
            api,
            clock,
        }
    }

    /// Push every dirty config once. Configs that fail stay dirty.
    pub async fn push_pending(&self) -> Result<PushReport, ConfigSyncError> {
        let dirty: Vec<Arc<dyn MutableConfig>> = self
            .configs
            .configs()
            .into_iter()
            .filter(|c| c.needs_push())
            .collect();
        if dirty.is_empty() {
            return Ok(PushReport::default());
        }

        let account_id = self.auth.account_id();
        let node = self.swarms.get_single_target_node(&account_id).await?;
        tracing::debug!("Pushing {} configs to {}", dirty.len(), node);

        let pushes = dirty.iter().map(|config| {
            let account_id = account_id.clone();
            let node = node.clone();
            async move {
                let push = config.push().map_err(|reason| ConfigSyncError::Config {
                    kind: config.kind().to_string(),
                    reason,
                })?;
                let request = self.push_request(config.as_ref(), &push);
                let response = self
                    .api
                    .send(
                        &mut ExecutorContext::new(),
                        SwarmRequest::new(account_id, request).pinned_to(node),
                    )
                    .await?;
                let hash = stored_hash(config.kind(), &response, !push.obsolete_hashes.is_empty())?;
                config.confirm_pushed(push.seq_no, &hash);
                Ok::<_, ConfigSyncError>(())
            }
        });

        let mut report = PushReport::default();
        for (config, result) in dirty.iter().zip(join_all(pushes).await) {
            match result {
                Ok(()) => {
                    tracing::info!("Config {} pushed", config.kind());
                    report.pushed += 1;
                }
                Err(e) => {
                    tracing::warn!("Config {} push failed: {}", config.kind(), e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn push_request(&self, config: &dyn MutableConfig, push: &ConfigPush) -> crate::api::SnodeRequest {
        let message = StoreMessage::new(config.namespace(), push.data.clone());
        let mut requests = vec![storage::store(&self.auth, &message, self.clock.now_ms())];
        if !push.obsolete_hashes.is_empty() {
            requests.push(storage::delete(&self.auth, &push.obsolete_hashes));
        }
        storage::sequence(&requests)
    }

    /// Push on every change notification until the sender side is dropped
    pub async fn run(self: Arc<Self>, mut changes: mpsc::Receiver<()>) {
        while changes.recv().await.is_some() {
            // Coalesce a burst of notifications into one round
            while changes.try_recv().is_ok() {}

            match self.push_pending().await {
                Ok(report) if report.failed > 0 => {
                    tracing::warn!("{} configs still dirty after push", report.failed)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Config push round failed: {}", e),
            }
        }
        tracing::debug!("Config sync stopped");
    }
}

/// Hash of the stored blob from a `sequence` reply; every sub-call must succeed
fn stored_hash(kind: &str, response: &Value, with_delete: bool) -> Result<String, ConfigSyncError> {
    let rejected = |reason: String| ConfigSyncError::Rejected {
        kind: kind.to_string(),
        reason,
    };

    let results = response
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| rejected("response has no results".to_string()))?;
    let expected = if with_delete { 2 } else { 1 };
    if results.len() != expected {
        return Err(rejected(format!("expected {} results, got {}", expected, results.len())));
    }

    let mut bodies = Vec::with_capacity(results.len());
    for entry in results {
        bodies.push(sub_result(entry).map_err(|e| rejected(e.to_string()))?);
    }

    bodies[0]
        .get("hash")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| rejected("store result has no hash".to_string()))
}
