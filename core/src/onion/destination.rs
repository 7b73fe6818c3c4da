// Where an onion request ends up

use crate::snode::{DirectoryError, Snode};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnionDestination {
    /// A storage node; payload is a JSON-RPC body
    Snode(Snode),
    /// An application server behind the last hop; payload is a v4 request
    Server {
        host: String,
        target: String,
        scheme: String,
        port: u16,
        /// Hex X25519 key of the server
        x25519_key: String,
    },
}

impl OnionDestination {
    pub fn x25519_bytes(&self) -> Result<[u8; 32], DirectoryError> {
        match self {
            OnionDestination::Snode(node) => node.x25519_bytes(),
            OnionDestination::Server { x25519_key, .. } => crate::snode::decode_key(x25519_key),
        }
    }

    pub fn snode(&self) -> Option<&Snode> {
        match self {
            OnionDestination::Snode(node) => Some(node),
            OnionDestination::Server { .. } => None,
        }
    }

    /// Routing instructions the last hop receives for this destination
    pub fn routing_json(&self) -> Value {
        match self {
            OnionDestination::Snode(node) => json!({ "destination": node.ed25519_key() }),
            OnionDestination::Server {
                host,
                target,
                scheme,
                port,
                ..
            } => json!({
                "host": host,
                "target": target,
                "method": "POST",
                "protocol": scheme,
                "port": port,
            }),
        }
    }
}

impl std::fmt::Display for OnionDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnionDestination::Snode(node) => write!(f, "snode {}", node),
            OnionDestination::Server {
                host, port, scheme, ..
            } => write!(f, "server {}://{}:{}", scheme, host, port),
        }
    }
}
