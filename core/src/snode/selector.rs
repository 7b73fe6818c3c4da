// Even, non-repeating selection of one node per call from a swarm

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};

use super::Snode;

/// Remembers which nodes of each swarm have been handed out this round
#[derive(Default)]
pub struct SwarmNodeSelector {
    used: Mutex<HashMap<String, HashSet<Snode>>>,
}

impl SwarmNodeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a node not used since the last full round; `None` for an empty swarm.
    /// Once every member has been used the round starts over.
    pub fn select(&self, swarm_key: &str, swarm: &[Snode]) -> Option<Snode> {
        if swarm.is_empty() {
            return None;
        }

        let mut used = self.used.lock();
        let used_set = used.entry(swarm_key.to_string()).or_default();

        let unused: Vec<&Snode> = swarm.iter().filter(|n| !used_set.contains(*n)).collect();
        let pick = if unused.is_empty() {
            used_set.clear();
            swarm.choose(&mut rand::thread_rng())?.clone()
        } else {
            (*unused.choose(&mut rand::thread_rng())?).clone()
        };

        used_set.insert(pick.clone());
        tracing::debug!("Selected {} for swarm {}", pick, swarm_key);
        Some(pick)
    }

    /// Forget the round state of one swarm
    pub fn reset(&self, swarm_key: &str) {
        self.used.lock().remove(swarm_key);
    }

    #[cfg(test)]
    pub(crate) fn used_in_round(&self, swarm_key: &str) -> usize {
        self.used.lock().get(swarm_key).map_or(0, HashSet::len)
    }
}
