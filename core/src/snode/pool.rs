// Snode pool: global catalogue of nodes, bootstrapped from seed nodes

use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;

use super::{DirectoryError, Snode};
use crate::api::snode::SnodeRequest;
use crate::onion::transport::HttpClient;
use crate::store::snode_store::{Snapshot, SnodeStore};

pub struct SnodeDirectory {
    store: Arc<SnodeStore>,
    seed_http: Arc<dyn HttpClient>,
    seeds: Vec<String>,
    min_pool_size: usize,
    bootstrap_lock: tokio::sync::Mutex<()>,
}

impl SnodeDirectory {
    pub fn new(
        store: Arc<SnodeStore>,
        seed_http: Arc<dyn HttpClient>,
        seeds: Vec<String>,
        min_pool_size: usize,
    ) -> Self {
        Self {
            store,
            seed_http,
            seeds,
            min_pool_size,
            bootstrap_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn min_pool_size(&self) -> usize {
        self.min_pool_size
    }

    pub fn get_pool(&self) -> Snapshot {
        self.store.get_pool()
    }

    /// Replace the whole pool with a new snapshot
    pub fn replace_pool(&self, nodes: Vec<Snode>) -> Snapshot {
        tracing::info!("Snode pool replaced ({} nodes)", nodes.len());
        self.store.set_pool(nodes)
    }

    /// Current pool, repopulated from a seed first if it is below the viable size
    pub async fn ensure_pool(&self) -> Result<Snapshot, DirectoryError> {
        let pool = self.store.get_pool();
        if pool.len() >= self.min_pool_size {
            return Ok(pool);
        }

        let _guard = self.bootstrap_lock.lock().await;
        let pool = self.store.get_pool();
        if pool.len() >= self.min_pool_size {
            return Ok(pool);
        }
        tracing::info!(
            "Snode pool has {} nodes (need {}), bootstrapping from seed",
            pool.len(),
            self.min_pool_size
        );
        self.bootstrap().await
    }

    /// Fetch a fresh pool from a seed regardless of the current size
    pub async fn refresh(&self) -> Result<Snapshot, DirectoryError> {
        let _guard = self.bootstrap_lock.lock().await;
        self.bootstrap().await
    }

    async fn bootstrap(&self) -> Result<Snapshot, DirectoryError> {
        let seed = self
            .seeds
            .choose(&mut rand::thread_rng())
            .ok_or(DirectoryError::NoSeeds)?;

        let body = serde_json::to_vec(&SnodeRequest::get_n_service_nodes().to_json())
            .map_err(|e| DirectoryError::SeedBootstrap(e.to_string()))?;
        let response = self
            .seed_http
            .post(seed, body)
            .await
            .map_err(|e| DirectoryError::SeedBootstrap(format!("{}: {}", seed, e)))?;
        if !response.is_success() {
            return Err(DirectoryError::SeedBootstrap(format!(
                "{} returned {}",
                seed, response.status
            )));
        }

        let nodes = parse_seed_response(&response.body)?;
        tracing::info!("🌱 Bootstrapped {} snodes from {}", nodes.len(), seed);
        Ok(self.store.set_pool(nodes))
    }

    pub async fn get_random_node(&self) -> Result<Snode, DirectoryError> {
        let pool = self.ensure_pool().await?;
        pool.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(DirectoryError::EmptyPool)
    }

    /// Top `existing` up to `target_count` guards with distinct random pool nodes.
    /// At least one pool node must stay outside the guard set.
    pub fn get_guard_nodes(
        &self,
        existing: &[Snode],
        target_count: usize,
    ) -> Result<Vec<Snode>, DirectoryError> {
        if existing.len() >= target_count {
            return Ok(existing.to_vec());
        }

        let pool = self.store.get_pool();
        let unused: Vec<&Snode> = pool.iter().filter(|n| !existing.contains(n)).collect();
        let needed = target_count - existing.len();
        if unused.len() <= needed {
            return Err(DirectoryError::InsufficientNodes {
                needed: needed + 1,
                available: unused.len(),
            });
        }

        let mut guards = existing.to_vec();
        guards.extend(
            unused
                .choose_multiple(&mut rand::thread_rng(), needed)
                .map(|n| (*n).clone()),
        );
        Ok(guards)
    }

    /// Remove a node proven bad; writes a new snapshot without it
    pub fn drop_node(&self, ed25519_key: &str) {
        let pool = self.store.get_pool();
        if !pool.iter().any(|n| n.ed25519_key() == ed25519_key) {
            return;
        }
        let remaining: Vec<Snode> = pool
            .iter()
            .filter(|n| n.ed25519_key() != ed25519_key)
            .cloned()
            .collect();
        tracing::warn!("Dropping snode {} from pool ({} left)", ed25519_key, remaining.len());
        self.store.set_pool(remaining);
    }
}

/// Parse `result.service_node_states` from a seed reply
fn parse_seed_response(body: &[u8]) -> Result<Vec<Snode>, DirectoryError> {
    let json: Value = serde_json::from_slice(body)
        .map_err(|e| DirectoryError::SeedBootstrap(format!("invalid JSON: {}", e)))?;
    let states = json
        .get("result")
        .and_then(|r| r.get("service_node_states"))
        .and_then(Value::as_array)
        .ok_or_else(|| DirectoryError::SeedBootstrap("missing service_node_states".to_string()))?;

    let nodes = Snode::parse_list(states);
    if nodes.is_empty() {
        return Err(DirectoryError::SeedBootstrap(
            "seed returned no usable nodes".to_string(),
        ));
    }
    Ok(nodes)
}

#[cfg(test)]
impl SnodeDirectory {
    /// Directory over an in-memory store with a fixed pool and no seeds
    pub(crate) fn for_tests(pool: Vec<Snode>) -> Self {
        use crate::onion::transport::MockHttpClient;
        use crate::store::backend::MemoryStorage;

        let store = Arc::new(SnodeStore::new(Arc::new(MemoryStorage::new())));
        store.set_pool(pool);
        Self::new(store, Arc::new(MockHttpClient::new()), Vec::new(), 12)
    }
}
