// Snode model: service nodes that relay onion requests and store swarm data
//
// A node is identified on the wire by its Ed25519 key, but two entries are the
// same node when they share address and port. Key rotation on a node must not
// make the directories treat it as a second member.

pub mod pool;
pub mod selector;
pub mod swarm;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

pub use pool::SnodeDirectory;
pub use selector::SwarmNodeSelector;
pub use swarm::SwarmDirectory;

/// Length of a hex-encoded 32 byte public key
const HEX_KEY_LEN: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("Seed bootstrap failed: {0}")]
    SeedBootstrap(String),
    #[error("No seed nodes configured")]
    NoSeeds,
    #[error("Snode pool is empty")]
    EmptyPool,
    #[error("Not enough snodes: needed {needed}, available {available}")]
    InsufficientNodes { needed: usize, available: usize },
    #[error("Swarm for {0} is empty")]
    EmptySwarm(String),
    #[error("Swarm for {account_id} too small ({size} nodes)")]
    SwarmTooSmall { account_id: String, size: usize },
    #[error("Swarm fetch failed: {0}")]
    SwarmFetch(String),
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// Public keys of a snode, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// Ed25519 identity key, used for routing between hops
    pub ed25519: String,
    /// X25519 key onion layers are encrypted for
    pub x25519: String,
}

/// Storage server version, e.g. `[2, 8, 0]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnodeVersion(pub [u16; 3]);

impl SnodeVersion {
    fn from_json(value: Option<&Value>) -> Self {
        let Some(Value::Array(parts)) = value else {
            return Self::default();
        };
        let mut version = [0u16; 3];
        for (slot, part) in version.iter_mut().zip(parts) {
            *slot = part.as_u64().unwrap_or(0).min(u16::MAX as u64) as u16;
        }
        Self(version)
    }
}

impl fmt::Display for SnodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snode {
    /// Scheme and host, e.g. `https://1.2.3.4`
    pub address: String,
    pub port: u16,
    pub keys: KeySet,
    #[serde(default)]
    pub version: SnodeVersion,
}

impl PartialEq for Snode {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Snode {}

impl Hash for Snode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl Snode {
    pub fn new(address: impl Into<String>, port: u16, keys: KeySet, version: SnodeVersion) -> Self {
        Self {
            address: address.into(),
            port,
            keys,
            version,
        }
    }

    pub fn ed25519_key(&self) -> &str {
        &self.keys.ed25519
    }

    /// Base URL of the node's storage server
    pub fn url(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Raw X25519 key for onion layer encryption
    pub fn x25519_bytes(&self) -> Result<[u8; 32], DirectoryError> {
        decode_key(&self.keys.x25519)
    }

    /// Parse one node entry from a directory response.
    ///
    /// Accepts the `public_ip`/`storage_port` spelling used by seed nodes and
    /// the `ip`/`port` spelling used in swarm responses. Returns `None` for any
    /// entry that is incomplete or unroutable so callers can skip it.
    pub fn from_json(value: &Value) -> Option<Snode> {
        let obj = value.as_object()?;

        let ip = obj
            .get("public_ip")
            .or_else(|| obj.get("ip"))
            .and_then(Value::as_str)?
            .trim();
        if ip.is_empty() || ip == "0.0.0.0" || ip == "255.255.255.255" {
            return None;
        }

        let port = match obj.get("storage_port").or_else(|| obj.get("port"))? {
            Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
            Value::String(s) => s.trim().parse::<u16>().ok()?,
            _ => return None,
        };
        if port == 0 {
            return None;
        }

        let ed25519 = obj.get("pubkey_ed25519").and_then(Value::as_str)?;
        let x25519 = obj.get("pubkey_x25519").and_then(Value::as_str)?;
        if !is_hex_key(ed25519) || !is_hex_key(x25519) {
            return None;
        }

        let address = if ip.starts_with("http://") || ip.starts_with("https://") {
            ip.to_string()
        } else {
            format!("https://{}", ip)
        };

        Some(Snode {
            address,
            port,
            keys: KeySet {
                ed25519: ed25519.to_ascii_lowercase(),
                x25519: x25519.to_ascii_lowercase(),
            },
            version: SnodeVersion::from_json(obj.get("storage_server_version")),
        })
    }

    /// Parse a list of node entries, skipping malformed ones individually
    pub fn parse_list(entries: &[Value]) -> Vec<Snode> {
        let mut nodes: Vec<Snode> = Vec::with_capacity(entries.len());
        for entry in entries {
            match Snode::from_json(entry) {
                Some(node) if !nodes.contains(&node) => nodes.push(node),
                Some(_) => {}
                None => tracing::debug!("Skipping malformed snode entry: {}", entry),
            }
        }
        nodes
    }
}

fn is_hex_key(key: &str) -> bool {
    key.len() == HEX_KEY_LEN && key.bytes().all(|b| b.is_ascii_hexdigit())
}

pub(crate) fn decode_key(hex_key: &str) -> Result<[u8; 32], DirectoryError> {
    let bytes = hex::decode(hex_key).map_err(|e| DirectoryError::InvalidKey(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| DirectoryError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}
