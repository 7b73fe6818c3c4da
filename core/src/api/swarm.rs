// Swarm executor: binds an account-level call to one concrete swarm node

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::snode::{SnodeApiRequest, SnodeRequest};
use super::{ApiError, ApiExecutor, ContextKey, ExecutorContext};
use crate::onion::{FailureDecision, OnionError};
use crate::snode::{Snode, SwarmDirectory};

/// "Send this to the account's swarm"
#[derive(Debug, Clone)]
pub struct SwarmRequest {
    pub account_id: String,
    pub request: SnodeRequest,
    /// Force a specific node; it is never swapped for another on failure
    pub node_override: Option<Snode>,
}

impl SwarmRequest {
    pub fn new(account_id: impl Into<String>, request: SnodeRequest) -> Self {
        Self {
            account_id: account_id.into(),
            request,
            node_override: None,
        }
    }

    pub fn pinned_to(mut self, node: Snode) -> Self {
        self.node_override = Some(node);
        self
    }
}

/// Node chosen for the current logical call, reused across its retries
pub struct PinnedNode;

impl ContextKey for PinnedNode {
    type Value = Snode;
}

pub struct SwarmApiExecutor {
    snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>>,
    swarms: Arc<SwarmDirectory>,
}

impl SwarmApiExecutor {
    pub fn new(
        snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>>,
        swarms: Arc<SwarmDirectory>,
    ) -> Self {
        Self { snode_api, swarms }
    }

    async fn target_node(&self, ctx: &mut ExecutorContext, req: &SwarmRequest) -> Result<Snode, ApiError> {
        if let Some(pinned) = ctx.get::<PinnedNode>() {
            return Ok(pinned.clone());
        }
        if let Some(node) = &req.node_override {
            return Ok(node.clone());
        }
        let node = self.swarms.get_single_target_node(&req.account_id).await?;
        ctx.set::<PinnedNode>(node.clone());
        Ok(node)
    }
}

/// 401/421 from the destination: the node no longer serves this account
fn swarm_membership_body(error: &ApiError) -> Option<Option<&[u8]>> {
    match error.onion() {
        Some(OnionError::DestinationError { status }) if status.code == 401 || status.code == 421 => {
            Some(status.body.as_deref())
        }
        _ => None,
    }
}

#[async_trait]
impl ApiExecutor<SwarmRequest, Value> for SwarmApiExecutor {
    async fn send(&self, ctx: &mut ExecutorContext, req: SwarmRequest) -> Result<Value, ApiError> {
        let node = self.target_node(ctx, &req).await?;

        let result = self
            .snode_api
            .send(
                ctx,
                SnodeApiRequest {
                    snode: node.clone(),
                    request: req.request.clone(),
                },
            )
            .await;

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let Some(body) = swarm_membership_body(&error) else {
            return Err(error);
        };

        tracing::debug!("{} is no longer part of swarm {}", node, req.account_id);
        if !self.swarms.update_swarm_from_response(&req.account_id, body) {
            self.swarms.drop_node_if_present(&node, &req.account_id);
        }
        ctx.remove::<PinnedNode>();

        let decision = if req.node_override.is_some() {
            FailureDecision::Fail
        } else {
            FailureDecision::Retry
        };
        Err(error.with_decision(decision))
    }
}
