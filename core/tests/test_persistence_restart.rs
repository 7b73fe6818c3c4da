mod common;

use common::{sim_config, SimNetwork};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use swarmnet_core::{SledStorage, SwarmNetwork};

const ACCOUNT: &str = "05cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";

/// Sled holds a lock until every handle is gone, including the batch task's
async fn open_sled(path: &Path) -> SledStorage {
    let path = path.to_str().unwrap();
    for _ in 0..50 {
        if let Ok(storage) = SledStorage::new(path) {
            return storage;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("sled database at {} stayed locked", path);
}

#[tokio::test]
async fn test_pool_and_swarm_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("snodes");
    let sim = SimNetwork::new(20);

    // First instance: bootstrap and fetch a swarm
    {
        let storage = open_sled(&db).await;
        let network =
            SwarmNetwork::with_http(sim_config(), Arc::new(storage), sim.clone(), sim.clone()).unwrap();
        assert_eq!(network.refresh_pool().await.unwrap().len(), 20);
        assert_eq!(network.get_swarm(ACCOUNT).await.unwrap().len(), 5);
    }
    assert_eq!(sim.seed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.delivered_count("get_snodes_for_pubkey"), 1);

    // Second instance: everything comes from disk
    {
        let storage = open_sled(&db).await;
        let network =
            SwarmNetwork::with_http(sim_config(), Arc::new(storage), sim.clone(), sim.clone()).unwrap();
        assert_eq!(network.pool().get_pool().len(), 20);
        assert_eq!(network.get_swarm(ACCOUNT).await.unwrap().as_slice(), &sim.snodes()[..5]);
        assert_eq!(network.store().swarm_accounts(), vec![ACCOUNT.to_string()]);
    }
    assert_eq!(sim.seed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.delivered_count("get_snodes_for_pubkey"), 1);
}

#[tokio::test]
async fn test_open_creates_storage_layout() {
    let dir = tempfile::tempdir().unwrap();
    let network = SwarmNetwork::open(sim_config(), dir.path()).unwrap();
    assert!(network.pool().get_pool().is_empty());
    drop(network);

    let version = std::fs::read_to_string(dir.path().join("SCHEMA_VERSION")).unwrap();
    assert_eq!(version, "1");
    assert!(dir.path().join("snodes").exists());
}
