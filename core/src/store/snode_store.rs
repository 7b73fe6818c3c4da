// Snode store: cached, persisted pool and swarm snapshots
//
// Readers get immutable `Arc` snapshots; writers swap a whole snapshot in.
// A failed write to the backend never loses the in-memory snapshot, it is
// logged and the cache stays authoritative for this process.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::backend::StorageBackend;
use crate::snode::Snode;

const POOL_KEY: &[u8] = b"snode_pool";
const SWARM_PREFIX: &str = "swarm:";

pub type Snapshot = Arc<Vec<Snode>>;

pub struct SnodeStore {
    backend: Arc<dyn StorageBackend>,
    pool: RwLock<Option<Snapshot>>,
    swarms: RwLock<HashMap<String, Snapshot>>,
}

impl SnodeStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            pool: RwLock::new(None),
            swarms: RwLock::new(HashMap::new()),
        }
    }

    fn swarm_key(account_id: &str) -> Vec<u8> {
        format!("{}{}", SWARM_PREFIX, account_id).into_bytes()
    }

    fn load(&self, key: &[u8]) -> Vec<Snode> {
        match self.backend.get(key) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(
                    "Discarding unreadable snode snapshot {}: {}",
                    String::from_utf8_lossy(key),
                    e
                );
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", String::from_utf8_lossy(key), e);
                Vec::new()
            }
        }
    }

    fn persist(&self, key: &[u8], nodes: &[Snode]) {
        let result = serde_json::to_vec(nodes)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.backend.put(key, &bytes))
            .and_then(|_| self.backend.flush());
        if let Err(e) = result {
            tracing::warn!("Failed to persist {}: {}", String::from_utf8_lossy(key), e);
        }
    }

    /// Current pool snapshot, loaded from the backend on first access
    pub fn get_pool(&self) -> Snapshot {
        if let Some(pool) = self.pool.read().as_ref() {
            return Arc::clone(pool);
        }
        let loaded = Arc::new(self.load(POOL_KEY));
        let mut slot = self.pool.write();
        Arc::clone(slot.get_or_insert(loaded))
    }

    pub fn set_pool(&self, nodes: Vec<Snode>) -> Snapshot {
        self.persist(POOL_KEY, &nodes);
        let snapshot = Arc::new(nodes);
        *self.pool.write() = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn get_swarm(&self, account_id: &str) -> Snapshot {
        if let Some(swarm) = self.swarms.read().get(account_id) {
            return Arc::clone(swarm);
        }
        let loaded = Arc::new(self.load(&Self::swarm_key(account_id)));
        let mut swarms = self.swarms.write();
        Arc::clone(swarms.entry(account_id.to_string()).or_insert(loaded))
    }

    pub fn set_swarm(&self, account_id: &str, nodes: Vec<Snode>) -> Snapshot {
        self.persist(&Self::swarm_key(account_id), &nodes);
        let snapshot = Arc::new(nodes);
        self.swarms
            .write()
            .insert(account_id.to_string(), Arc::clone(&snapshot));
        snapshot
    }

    /// Account ids with a persisted swarm
    pub fn swarm_accounts(&self) -> Vec<String> {
        match self.backend.scan_prefix(SWARM_PREFIX.as_bytes()) {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(k, _)| {
                    String::from_utf8(k)
                        .ok()
                        .and_then(|k| k.strip_prefix(SWARM_PREFIX).map(str::to_string))
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to scan swarms: {}", e);
                Vec::new()
            }
        }
    }
}
