// Simulated snode network for integration tests
//
// Every node owns a real X25519 secret. Requests posted to a guard are peeled
// layer by layer exactly as a node would, so the client's onion building and
// response decryption are exercised end to end without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey, StaticSecret};

use swarmnet_core::api::{Backoff, RetryPolicy};
use swarmnet_core::crypto::{open_layer, seal_with_key};
use swarmnet_core::onion::encoding::{decode_onion_payload, decode_v4, encode_v4};
use swarmnet_core::onion::{HttpClient, HttpError, HttpResponse};
use swarmnet_core::snode::{KeySet, Snode, SnodeVersion};
use swarmnet_core::{NetworkConfig, NetworkEnvironment};

pub const SEED_URL: &str = "https://seed.sim:4443/json_rpc";

/// Statuses a storage server reports for a whole request, not per sub-request
const REQUEST_LEVEL_STATUSES: [u16; 4] = [401, 406, 421, 425];

/// `(node, method, params) -> (status, body)`
pub type RpcHandler = dyn Fn(&Snode, &str, &Value) -> (u16, Value) + Send + Sync;
/// `(v4 info, body) -> (status, body)`
pub type ServerHandler = dyn Fn(&Value, Option<&[u8]>) -> (u16, Vec<u8>) + Send + Sync;

pub struct SimNode {
    pub snode: Snode,
    secret: StaticSecret,
}

pub fn sim_node(n: u8) -> SimNode {
    let secret = StaticSecret::from([n; 32]);
    let public = PublicKey::from(&secret);
    let snode = Snode::new(
        format!("https://10.2.0.{}", n),
        443,
        KeySet {
            ed25519: hex::encode([n; 32]),
            x25519: hex::encode(public.to_bytes()),
        },
        SnodeVersion([2, 8, 0]),
    );
    SimNode { snode, secret }
}

fn node_json(node: &Snode) -> Value {
    json!({
        "public_ip": node.address.trim_start_matches("https://"),
        "storage_port": node.port,
        "pubkey_ed25519": node.keys.ed25519,
        "pubkey_x25519": node.keys.x25519,
        "storage_server_version": node.version.0,
    })
}

pub fn swarm_body(nodes: &[Snode]) -> Value {
    let entries: Vec<Value> = nodes.iter().map(node_json).collect();
    json!({ "snodes": entries })
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What one hop learned while relaying
#[derive(Debug, Clone)]
pub struct HopView {
    pub hop: Snode,
    pub routing: Value,
}

/// One top-level RPC that reached a destination node
#[derive(Debug, Clone)]
pub struct Delivered {
    pub node: Snode,
    pub method: String,
    pub params: Value,
}

pub struct SimNetwork {
    nodes: Vec<SimNode>,
    handler: Mutex<Arc<RpcHandler>>,
    server: Option<(StaticSecret, Arc<ServerHandler>)>,
    unreachable: Mutex<HashSet<String>>,
    pub seed_calls: AtomicUsize,
    traces: Mutex<Vec<Vec<HopView>>>,
    delivered: Mutex<Vec<Delivered>>,
}

impl SimNetwork {
    /// Nodes `1..=count`, answering with `default_handler` until replaced
    pub fn new(count: u8) -> Arc<Self> {
        Self::build(count, None)
    }

    pub fn with_server(count: u8, server_secret: [u8; 32], handler: Arc<ServerHandler>) -> Arc<Self> {
        Self::build(count, Some((StaticSecret::from(server_secret), handler)))
    }

    fn build(count: u8, server: Option<(StaticSecret, Arc<ServerHandler>)>) -> Arc<Self> {
        let nodes: Vec<SimNode> = (1..=count).map(sim_node).collect();
        let swarm: Vec<Snode> = nodes.iter().take(5).map(|n| n.snode.clone()).collect();
        Arc::new(Self {
            nodes,
            handler: Mutex::new(default_handler(swarm)),
            server,
            unreachable: Mutex::new(HashSet::new()),
            seed_calls: AtomicUsize::new(0),
            traces: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn set_handler(&self, handler: Arc<RpcHandler>) {
        *self.handler.lock() = handler;
    }

    pub fn node(&self, n: u8) -> Snode {
        self.nodes[(n - 1) as usize].snode.clone()
    }

    pub fn snodes(&self) -> Vec<Snode> {
        self.nodes.iter().map(|n| n.snode.clone()).collect()
    }

    /// The node refuses connections and relays to it fail
    pub fn take_down(&self, node: &Snode) {
        self.unreachable.lock().insert(node.keys.ed25519.clone());
    }

    pub fn traces(&self) -> Vec<Vec<HopView>> {
        self.traces.lock().clone()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().clone()
    }

    pub fn delivered_count(&self, method: &str) -> usize {
        self.delivered.lock().iter().filter(|d| d.method == method).count()
    }

    fn is_down(&self, key: &str) -> bool {
        self.unreachable.lock().contains(key)
    }

    fn find_by_url(&self, url: &str) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.snode.url() == url)
    }

    fn find_by_key(&self, key: &str) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.snode.keys.ed25519 == key)
    }

    fn seed_response(&self) -> HttpResponse {
        self.seed_calls.fetch_add(1, Ordering::SeqCst);
        let states: Vec<Value> = self.nodes.iter().map(|n| node_json(&n.snode)).collect();
        HttpResponse {
            status: 200,
            body: serde_json::to_vec(&json!({ "result": { "service_node_states": states } }))
                .unwrap(),
        }
    }

    fn relay(&self, node: &SimNode, ciphertext: &[u8], ephemeral: [u8; 32], trace: &mut Vec<HopView>) -> HttpResponse {
        let Ok((plaintext, key)) = open_layer(&node.secret, &ephemeral, ciphertext) else {
            return text_response(400, "Failed to decrypt onion layer");
        };

        let onward = decode_onion_payload(&plaintext)
            .ok()
            .filter(|(_, routing)| routing.get("ephemeral_key").is_some());
        let Some((inner, routing)) = onward else {
            return self.answer_rpc(node, &plaintext, &key);
        };

        trace.push(HopView {
            hop: node.snode.clone(),
            routing: routing.clone(),
        });
        let next_ephemeral = decode_ephemeral(&routing);

        if let Some(next_key) = routing.get("destination").and_then(Value::as_str) {
            let Some(next) = self.find_by_key(next_key) else {
                return text_response(502, &format!("Next node not found: {}", next_key));
            };
            if self.is_down(next_key) {
                return text_response(502, &format!("Next node is currently unreachable: {}", next_key));
            }
            return self.relay(next, &inner, next_ephemeral, trace);
        }

        match &self.server {
            Some((secret, handler)) => {
                let Ok((request, key)) = open_layer(secret, &next_ephemeral, &inner) else {
                    return text_response(400, "Server could not decrypt request");
                };
                let (info, body) = decode_v4(&request).unwrap();
                let (status, reply) = handler(&info, body.as_deref());
                sealed_reply(&key, status, &reply)
            }
            None => text_response(502, "No server behind this node"),
        }
    }

    fn answer_rpc(&self, node: &SimNode, payload: &[u8], key: &[u8; 32]) -> HttpResponse {
        let request: Value = serde_json::from_slice(payload).unwrap();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        self.delivered.lock().push(Delivered {
            node: node.snode.clone(),
            method: method.clone(),
            params: params.clone(),
        });

        let handler = self.handler.lock().clone();
        let (status, body) = match method.as_str() {
            "batch" | "sequence" => run_sub_requests(handler.as_ref(), &node.snode, &method, &params),
            _ => handler(&node.snode, &method, &params),
        };
        sealed_reply(key, status, body.to_string().as_bytes())
    }
}

fn run_sub_requests(handler: &RpcHandler, node: &Snode, method: &str, params: &Value) -> (u16, Value) {
    let mut results = Vec::new();
    for sub in params["requests"].as_array().cloned().unwrap_or_default() {
        let sub_method = sub["method"].as_str().unwrap_or_default();
        let (code, body) = handler(node, sub_method, &sub["params"]);
        if REQUEST_LEVEL_STATUSES.contains(&code) {
            return (code, body);
        }
        results.push(json!({ "code": code, "body": body }));
        if method == "sequence" && !(200..300).contains(&code) {
            break;
        }
    }
    (200, json!({ "results": results }))
}

fn decode_ephemeral(routing: &Value) -> [u8; 32] {
    let hex_key = routing["ephemeral_key"].as_str().unwrap();
    hex::decode(hex_key).unwrap().try_into().unwrap()
}

fn text_response(status: u16, text: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: text.as_bytes().to_vec(),
    }
}

fn sealed_reply(key: &[u8; 32], status: u16, body: &[u8]) -> HttpResponse {
    let v4 = encode_v4(&json!({ "code": status }), Some(body)).unwrap();
    HttpResponse {
        status: 200,
        body: seal_with_key(key, &v4).unwrap(),
    }
}

/// Storage server behaviour good enough for the directory and executors
pub fn default_handler(swarm: Vec<Snode>) -> Arc<RpcHandler> {
    Arc::new(move |node: &Snode, method: &str, params: &Value| match method {
        "get_snodes_for_pubkey" => (200, swarm_body(&swarm)),
        "info" => (200, json!({ "timestamp": now_ms(), "version": node.version.0 })),
        "retrieve" => (200, json!({ "messages": [], "echo": params.clone() })),
        "store" => (200, json!({ "hash": format!("hash-{}", params["timestamp"]) })),
        "delete" => (200, json!({ "deleted": {} })),
        _ => (400, json!(format!("unknown method {}", method))),
    })
}

#[async_trait]
impl HttpClient for SimNetwork {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        if url == SEED_URL {
            return Ok(self.seed_response());
        }

        let guard_url = url
            .strip_suffix("/onion_req/v2")
            .ok_or_else(|| HttpError(format!("unexpected url {}", url)))?;
        let guard = self
            .find_by_url(guard_url)
            .ok_or_else(|| HttpError(format!("no route to {}", guard_url)))?;
        if self.is_down(&guard.snode.keys.ed25519) {
            return Err(HttpError("connection refused".to_string()));
        }

        let (ciphertext, envelope) =
            decode_onion_payload(&body).map_err(|e| HttpError(e.to_string()))?;
        let mut trace = Vec::new();
        let response = self.relay(guard, &ciphertext, decode_ephemeral(&envelope), &mut trace);
        self.traces.lock().push(trace);
        Ok(response)
    }
}

/// Fast config pointed at the simulated seed
pub fn sim_config() -> NetworkConfig {
    NetworkConfig {
        environment: NetworkEnvironment::Custom {
            seeds: vec![SEED_URL.to_string()],
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::None,
        },
        ..NetworkConfig::default()
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("swarmnet_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}
