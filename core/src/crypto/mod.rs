// Cryptography module: onion layer encryption and swarm request signing

pub mod auth;
pub mod cipher;

use thiserror::Error;

pub use auth::SwarmAuth;
pub use cipher::{open_layer, seal_with_key, EncryptionResult, LayerCipher, XChaChaLayerCipher};

#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    Decryption,
    #[error("Ciphertext too short ({0} bytes)")]
    Truncated(usize),
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
}
