// Signed storage RPCs: bodies for `store`, `delete`, `batch` and `sequence`

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};

use super::snode::SnodeRequest;
use crate::crypto::SwarmAuth;

/// Default message lifetime on the storage server (14 days)
pub const DEFAULT_TTL_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Namespace a message is stored under; configs use their own
pub type Namespace = i32;

/// Payload of a `store` call before signing
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub namespace: Namespace,
    pub data: Vec<u8>,
    pub ttl_ms: u64,
}

impl StoreMessage {
    pub fn new(namespace: Namespace, data: Vec<u8>) -> Self {
        Self {
            namespace,
            data,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

/// `"store" ‖ namespace ‖ timestamp`; namespace 0 is omitted
fn store_signature_payload(namespace: Namespace, timestamp_ms: u64) -> Vec<u8> {
    let mut payload = b"store".to_vec();
    if namespace != 0 {
        payload.extend_from_slice(namespace.to_string().as_bytes());
    }
    payload.extend_from_slice(timestamp_ms.to_string().as_bytes());
    payload
}

/// `timestamp_ms` must come from network time
pub fn store(auth: &SwarmAuth, message: &StoreMessage, timestamp_ms: u64) -> SnodeRequest {
    let signature = auth.sign(&store_signature_payload(message.namespace, timestamp_ms));
    SnodeRequest::new(
        "store",
        json!({
            "pubkey": auth.account_id(),
            "pubkey_ed25519": auth.ed25519_public_key_hex(),
            "namespace": message.namespace,
            "data": BASE64.encode(&message.data),
            "ttl": message.ttl_ms,
            "timestamp": timestamp_ms,
            "sig_timestamp": timestamp_ms,
            "signature": signature,
        }),
    )
}

pub fn delete(auth: &SwarmAuth, hashes: &[String]) -> SnodeRequest {
    let mut payload = b"delete".to_vec();
    for hash in hashes {
        payload.extend_from_slice(hash.as_bytes());
    }
    SnodeRequest::new(
        "delete",
        json!({
            "pubkey": auth.account_id(),
            "pubkey_ed25519": auth.ed25519_public_key_hex(),
            "messages": hashes,
            "signature": auth.sign(&payload),
        }),
    )
}

/// Independent sub-requests; the server runs all of them
pub fn batch(requests: &[SnodeRequest]) -> SnodeRequest {
    SnodeRequest::new("batch", sub_requests(requests))
}

/// Like `batch`, but the server stops at the first failing sub-request
pub fn sequence(requests: &[SnodeRequest]) -> SnodeRequest {
    SnodeRequest::new("sequence", sub_requests(requests))
}

fn sub_requests(requests: &[SnodeRequest]) -> Value {
    let requests: Vec<Value> = requests.iter().map(SnodeRequest::to_json).collect();
    json!({ "requests": requests })
}
