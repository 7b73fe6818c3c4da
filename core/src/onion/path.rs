// Onion paths and the guard set they are built from

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::snode::{DirectoryError, Snode, SnodeDirectory};

#[derive(Debug, Clone, Error)]
pub enum PathError {
    #[error("Path must contain at least one hop")]
    Empty,
    #[error("Node {0} appears twice in path")]
    DuplicateHop(Snode),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Ordered, non-empty sequence of distinct hops; the first is the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    hops: Vec<Snode>,
}

impl Path {
    pub fn new(hops: Vec<Snode>) -> Result<Self, PathError> {
        if hops.is_empty() {
            return Err(PathError::Empty);
        }
        let mut seen = HashSet::with_capacity(hops.len());
        for hop in &hops {
            if !seen.insert(hop) {
                return Err(PathError::DuplicateHop(hop.clone()));
            }
        }
        Ok(Self { hops })
    }

    pub fn guard(&self) -> &Snode {
        &self.hops[0]
    }

    pub fn hops(&self) -> &[Snode] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, node: &Snode) -> bool {
        self.hops.contains(node)
    }

    pub fn find_by_ed25519(&self, key: &str) -> Option<&Snode> {
        self.hops.iter().find(|n| n.ed25519_key() == key)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hops: Vec<String> = self.hops.iter().map(|h| h.to_string()).collect();
        write!(f, "{}", hops.join(" -> "))
    }
}

/// Hands out paths that start at one of a small, stable set of guards
pub struct PathManager {
    directory: Arc<SnodeDirectory>,
    path_size: usize,
    guard_count: usize,
    guards: RwLock<Vec<Snode>>,
}

impl PathManager {
    pub fn new(directory: Arc<SnodeDirectory>, path_size: usize, guard_count: usize) -> Self {
        Self {
            directory,
            path_size: path_size.max(1),
            guard_count: guard_count.max(1),
            guards: RwLock::new(Vec::new()),
        }
    }

    pub fn guards(&self) -> Vec<Snode> {
        self.guards.read().clone()
    }

    /// Build a fresh path; `exclude` (usually the destination node) is never a hop
    pub async fn get_path(&self, exclude: Option<&Snode>) -> Result<Path, PathError> {
        let pool = self.directory.ensure_pool().await?;

        let guards = {
            let mut guards = self.guards.write();
            guards.retain(|g| pool.contains(g));
            if guards.len() < self.guard_count {
                let refreshed = self.directory.get_guard_nodes(&guards, self.guard_count)?;
                tracing::info!("🛡️ Guard set now {} nodes", refreshed.len());
                *guards = refreshed;
            }
            guards.clone()
        };

        let mut rng = rand::thread_rng();
        let usable_guards: Vec<&Snode> = guards.iter().filter(|g| Some(*g) != exclude).collect();
        let guard = usable_guards
            .choose(&mut rng)
            .map(|g| (*g).clone())
            .ok_or(DirectoryError::InsufficientNodes {
                needed: 1,
                available: 0,
            })?;

        let candidates: Vec<&Snode> = pool
            .iter()
            .filter(|n| !guards.contains(n) && Some(*n) != exclude)
            .collect();
        let needed = self.path_size - 1;
        if candidates.len() < needed {
            return Err(DirectoryError::InsufficientNodes {
                needed,
                available: candidates.len(),
            }
            .into());
        }

        let mut hops = Vec::with_capacity(self.path_size);
        hops.push(guard);
        hops.extend(candidates.choose_multiple(&mut rng, needed).map(|n| (*n).clone()));

        let path = Path::new(hops)?;
        tracing::debug!("Built onion path {}", path);
        Ok(path)
    }

    /// The path as a whole misbehaved; stop using its guard
    pub fn handle_bad_path(&self, path: &Path) {
        let guard = path.guard();
        let mut guards = self.guards.write();
        let before = guards.len();
        guards.retain(|g| g != guard);
        if guards.len() != before {
            tracing::warn!("Dropping guard {} after bad path", guard);
        }
    }

    /// A specific node is proven unreachable; remove it everywhere
    pub fn handle_bad_snode(&self, ed25519_key: &str) {
        self.directory.drop_node(ed25519_key);
        self.guards.write().retain(|g| g.ed25519_key() != ed25519_key);
    }
}
