// Swarm directory: per-account replica sets, cached and refreshed on demand

use serde_json::Value;
use std::sync::Arc;

use super::{DirectoryError, Snode, SnodeDirectory, SwarmNodeSelector};
use crate::api::snode::{SnodeApiRequest, SnodeRequest};
use crate::api::{ApiExecutor, ExecutorContext};
use crate::store::snode_store::{Snapshot, SnodeStore};

pub struct SwarmDirectory {
    store: Arc<SnodeStore>,
    pool: Arc<SnodeDirectory>,
    snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>>,
    selector: SwarmNodeSelector,
    min_swarm_size: usize,
}

impl SwarmDirectory {
    pub fn new(
        store: Arc<SnodeStore>,
        pool: Arc<SnodeDirectory>,
        snode_api: Arc<dyn ApiExecutor<SnodeApiRequest, Value>>,
        min_swarm_size: usize,
    ) -> Self {
        Self {
            store,
            pool,
            snode_api,
            selector: SwarmNodeSelector::new(),
            min_swarm_size,
        }
    }

    /// Cached swarm if it is still viable, otherwise a freshly fetched one
    pub async fn get_swarm(&self, account_id: &str) -> Result<Snapshot, DirectoryError> {
        let cached = self.store.get_swarm(account_id);
        if cached.len() >= self.min_swarm_size {
            return Ok(cached);
        }

        let fetched = self.fetch_swarm(account_id).await?;
        if fetched.len() < self.min_swarm_size {
            return Err(DirectoryError::SwarmTooSmall {
                account_id: account_id.to_string(),
                size: fetched.len(),
            });
        }
        tracing::info!("Swarm for {} refreshed ({} nodes)", account_id, fetched.len());
        Ok(self.replace_swarm(account_id, fetched))
    }

    /// Ask a random pool node which nodes form the account's swarm
    pub async fn fetch_swarm(&self, account_id: &str) -> Result<Vec<Snode>, DirectoryError> {
        let snode = self.pool.get_random_node().await?;
        let request = SnodeApiRequest {
            snode,
            request: SnodeRequest::get_swarm(account_id),
        };
        let response = self
            .snode_api
            .send(&mut ExecutorContext::new(), request)
            .await
            .map_err(|e| DirectoryError::SwarmFetch(e.to_string()))?;

        parse_swarm(&response)
            .ok_or_else(|| DirectoryError::SwarmFetch("response has no snodes list".to_string()))
    }

    /// One node of the account's swarm, spread evenly across calls
    pub async fn get_single_target_node(&self, account_id: &str) -> Result<Snode, DirectoryError> {
        let swarm = self.get_swarm(account_id).await?;
        self.selector
            .select(account_id, &swarm)
            .ok_or_else(|| DirectoryError::EmptySwarm(account_id.to_string()))
    }

    /// Replace the cached swarm with the list carried in a 421 reply.
    /// Returns false, leaving the cache alone, when the body has no usable list.
    pub fn update_swarm_from_response(&self, account_id: &str, body: Option<&[u8]>) -> bool {
        let nodes = body
            .and_then(|b| serde_json::from_slice::<Value>(b).ok())
            .and_then(|json| parse_swarm(&json))
            .unwrap_or_default();
        if nodes.is_empty() {
            return false;
        }

        tracing::info!("Swarm for {} replaced from response ({} nodes)", account_id, nodes.len());
        self.replace_swarm(account_id, nodes);
        true
    }

    /// Remove one stale node from the cached swarm, without network I/O
    pub fn drop_node_if_present(&self, node: &Snode, account_id: &str) {
        let swarm = self.store.get_swarm(account_id);
        if !swarm.contains(node) {
            return;
        }
        let remaining: Vec<Snode> = swarm.iter().filter(|n| *n != node).cloned().collect();
        tracing::warn!("Dropping {} from swarm {} ({} left)", node, account_id, remaining.len());
        self.replace_swarm(account_id, remaining);
    }

    /// New snapshot for the account; the selector's round restarts with it
    fn replace_swarm(&self, account_id: &str, nodes: Vec<Snode>) -> Snapshot {
        let snapshot = self.store.set_swarm(account_id, nodes);
        self.selector.reset(account_id);
        snapshot
    }

    pub fn cached_swarm(&self, account_id: &str) -> Snapshot {
        self.store.get_swarm(account_id)
    }
}

fn parse_swarm(json: &Value) -> Option<Vec<Snode>> {
    let entries = json.get("snodes")?.as_array()?;
    Some(Snode::parse_list(entries))
}
