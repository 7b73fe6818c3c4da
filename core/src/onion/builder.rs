// Onion construction: one encryption layer per hop, innermost for the destination

use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroize;

use super::destination::OnionDestination;
use super::encoding::{encode_onion_payload, EncodingError};
use super::path::Path;
use crate::crypto::{CryptoError, EncryptionResult, LayerCipher};
use crate::snode::{DirectoryError, Snode};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Key(#[from] DirectoryError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("Destination {0} is also a hop of the path")]
    DestinationInPath(Snode),
}

/// Fully layered request, ready to hand to the guard
pub struct BuiltOnion {
    pub guard: Snode,
    /// Outermost ciphertext (the guard's layer)
    pub ciphertext: Vec<u8>,
    pub ephemeral_public_key: [u8; 32],
    /// Key the destination seals its reply with
    pub destination_symmetric_key: [u8; 32],
}

impl Drop for BuiltOnion {
    fn drop(&mut self) {
        self.destination_symmetric_key.zeroize();
    }
}

/// Encrypt `payload` for `destination` and wrap it once per hop of `path`,
/// from the hop adjacent to the destination out to the guard.
pub fn build(
    path: &Path,
    destination: &OnionDestination,
    payload: &[u8],
    cipher: &dyn LayerCipher,
) -> Result<BuiltOnion, BuildError> {
    if let Some(node) = destination.snode() {
        if path.contains(node) {
            return Err(BuildError::DestinationInPath(node.clone()));
        }
    }

    let innermost = cipher.encrypt(payload, &destination.x25519_bytes()?)?;
    let destination_symmetric_key = innermost.symmetric_key;

    let mut previous: EncryptionResult = innermost;
    let mut next_routing = destination.routing_json();

    for hop in path.hops().iter().rev() {
        if let Value::Object(map) = &mut next_routing {
            map.insert(
                "ephemeral_key".to_string(),
                Value::String(hex::encode(previous.ephemeral_public_key)),
            );
        }
        let plaintext = encode_onion_payload(&previous.ciphertext, &next_routing)?;
        previous = cipher.encrypt(&plaintext, &hop.x25519_bytes()?)?;
        next_routing = OnionDestination::Snode(hop.clone()).routing_json();
    }

    Ok(BuiltOnion {
        guard: path.guard().clone(),
        ciphertext: std::mem::take(&mut previous.ciphertext),
        ephemeral_public_key: previous.ephemeral_public_key,
        destination_symmetric_key,
    })
}
