// Integration test: onion requests through a simulated three-hop network
//
// Verifies that:
// - each hop can only see its next hop
// - the destination's v4 reply decrypts at the client
// - server destinations receive a v4 request
// - failures penalise the right node

mod common;

use common::{init_tracing, sim_config, SimNetwork};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

use swarmnet_core::api::{RetryPolicy, ServerRequest, SnodeRequest};
use swarmnet_core::onion::{FailureDecision, OnionDestination, OnionError};
use swarmnet_core::{MemoryStorage, NetworkConfig, SwarmNetwork};

fn network(sim: &Arc<SimNetwork>, config: NetworkConfig) -> SwarmNetwork {
    SwarmNetwork::with_http(config, Arc::new(MemoryStorage::new()), sim.clone(), sim.clone())
        .expect("network should build")
}

#[tokio::test]
async fn test_three_hop_request_peels_every_layer() {
    init_tracing();
    let sim = SimNetwork::new(20);
    let network = network(&sim, sim_config());
    let destination = sim.node(7);

    let value = network
        .send_to_snode(destination.clone(), SnodeRequest::info())
        .await
        .unwrap();
    assert!(value["timestamp"].as_u64().is_some());
    assert_eq!(sim.seed_calls.load(Ordering::SeqCst), 1);

    let traces = sim.traces();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.len(), 3);

    for pair in trace.windows(2) {
        assert_eq!(pair[0].routing["destination"], pair[1].hop.keys.ed25519);
    }
    assert_eq!(trace[2].routing["destination"], destination.keys.ed25519);
    for view in trace {
        assert_ne!(view.hop, destination);
        assert!(view.routing.get("method").is_none());
    }

    let delivered = sim.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].node, destination);
    assert_eq!(delivered[0].method, "info");

    println!("✓ Request peeled through {} hops", trace.len());
}

#[tokio::test]
async fn test_server_destination_round_trip() {
    init_tracing();
    let server_secret = [200u8; 32];
    let server_key = PublicKey::from(&StaticSecret::from(server_secret));
    let sim = SimNetwork::with_server(
        20,
        server_secret,
        Arc::new(|info: &Value, body: Option<&[u8]>| {
            let received: Value = serde_json::from_slice(body.unwrap_or(b"null")).unwrap();
            let reply = json!({ "endpoint": info["endpoint"], "received": received });
            (200, reply.to_string().into_bytes())
        }),
    );
    let network = network(&sim, sim_config());

    let destination = OnionDestination::Server {
        host: "open.sim".into(),
        target: "/oxen/v4/lsrpc".into(),
        scheme: "https".into(),
        port: 443,
        x25519_key: hex::encode(server_key.to_bytes()),
    };
    let request = ServerRequest::new(destination, "POST", "/echo").with_json(&json!({ "ok": true }));
    let response = network.send_to_server(request).await.unwrap();

    assert_eq!(response.status, 200);
    let body = response.json_body().unwrap();
    assert_eq!(body["endpoint"], "/echo");
    assert_eq!(body["received"]["ok"], true);

    let trace = &sim.traces()[0];
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[2].routing["host"], "open.sim");
    assert!(sim.delivered().is_empty());
}

#[tokio::test]
async fn test_unreachable_destination_is_not_penalised() {
    init_tracing();
    let sim = SimNetwork::new(20);
    let network = network(&sim, sim_config());
    let destination = sim.node(3);
    sim.take_down(&destination);

    let err = network
        .send_to_snode(destination.clone(), SnodeRequest::info())
        .await
        .unwrap_err();
    assert!(matches!(err.onion(), Some(OnionError::DestinationUnreachable { .. })));

    // Not retried and the node stays known
    assert_eq!(sim.traces().len(), 1);
    assert!(network.pool().get_pool().contains(&destination));
}

#[tokio::test]
async fn test_guard_connection_failure_rotates_guard() {
    init_tracing();
    let sim = SimNetwork::new(20);
    let config = NetworkConfig {
        retry: RetryPolicy::no_retry(),
        ..sim_config()
    };
    let network = network(&sim, config);

    network.build_path().await.unwrap();
    let guards = network.paths().guards();
    assert_eq!(guards.len(), 2);
    for guard in &guards {
        sim.take_down(guard);
    }
    let destination = sim
        .snodes()
        .into_iter()
        .find(|n| !guards.contains(n))
        .unwrap();

    let err = network
        .send_to_snode(destination, SnodeRequest::info())
        .await
        .unwrap_err();
    assert!(matches!(err.onion(), Some(OnionError::GuardConnectionFailed { .. })));
    assert_eq!(err.decision(), Some(FailureDecision::Retry));
    assert_eq!(network.paths().guards().len(), 1);
}

#[tokio::test]
async fn test_unreachable_hop_is_dropped_from_pool() {
    init_tracing();
    // Four nodes, one guard, three hops: every non-guard node but the
    // destination must be on the path
    let sim = SimNetwork::new(4);
    let config = NetworkConfig {
        guard_count: 1,
        min_pool_size: 4,
        retry: RetryPolicy::no_retry(),
        ..sim_config()
    };
    let network = network(&sim, config);

    let guard = network.build_path().await.unwrap().guard().clone();
    let others: Vec<_> = sim.snodes().into_iter().filter(|n| *n != guard).collect();
    let destination = others[0].clone();
    let broken = others[1].clone();
    sim.take_down(&broken);

    let err = network
        .send_to_snode(destination, SnodeRequest::info())
        .await
        .unwrap_err();
    match err.onion() {
        Some(OnionError::IntermediateNodeFailed {
            failed_public_key, ..
        }) => assert_eq!(failed_public_key, &broken.keys.ed25519),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.decision(), Some(FailureDecision::Retry));
    assert!(!network.pool().get_pool().contains(&broken));
}
