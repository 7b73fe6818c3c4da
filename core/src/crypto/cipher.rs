// Onion layer encryption: X25519 ECDH + XChaCha20-Poly1305
//
// Flow for each layer:
// 1. Generate ephemeral X25519 keypair
// 2. ECDH: ephemeral_secret × recipient_x25519_public → shared_secret
// 3. KDF: Blake3::derive_key(shared_secret) → symmetric_key
// 4. Encrypt: XChaCha20-Poly1305(symmetric_key, random_nonce, plaintext)
// 5. Output: nonce ‖ ciphertext, plus the ephemeral public key sent alongside
//
// The symmetric key of the destination layer is kept by the caller; the
// destination seals its reply with the same key.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::CryptoError;

/// KDF context string for onion layer keys.
/// Changing this breaks compatibility with every node on the network.
const KDF_CONTEXT: &str = "swarmnet v1 onion layer 2026-03-14";

/// Size of XChaCha20-Poly1305 nonce (bytes)
const NONCE_SIZE: usize = 24;

/// Size of Poly1305 authentication tag (bytes)
const TAG_SIZE: usize = 16;

/// Output of one layer encryption
#[derive(Clone)]
pub struct EncryptionResult {
    pub ciphertext: Vec<u8>,
    pub ephemeral_public_key: [u8; 32],
    /// Key the recipient derives too; used to decrypt its reply
    pub symmetric_key: [u8; 32],
}

impl std::fmt::Debug for EncryptionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionResult")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("ephemeral_public_key", &hex::encode(self.ephemeral_public_key))
            .finish_non_exhaustive()
    }
}

impl Drop for EncryptionResult {
    fn drop(&mut self) {
        self.symmetric_key.zeroize();
    }
}

/// Black-box encrypt/decrypt pair used to build onion layers
pub trait LayerCipher: Send + Sync {
    /// Encrypt `plaintext` for the holder of `recipient_x25519`
    fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_x25519: &[u8; 32],
    ) -> Result<EncryptionResult, CryptoError>;

    /// Decrypt a response sealed with a previously derived symmetric key
    fn decrypt(&self, ciphertext: &[u8], symmetric_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaLayerCipher;

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KDF_CONTEXT, shared_secret)
}

/// Encrypt with an already derived key; output is `nonce ‖ ciphertext`
pub fn seal_with_key(symmetric_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(symmetric_key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_with_key(symmetric_key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated(data.len()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new_from_slice(symmetric_key)
        .map_err(|_| CryptoError::Decryption)?;
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Node side of a layer: derive the key from our static secret and the
/// sender's ephemeral key, then decrypt. Returns the plaintext and the key
/// so the node can seal its reply.
pub fn open_layer(
    secret: &StaticSecret,
    ephemeral_public_key: &[u8; 32],
    ciphertext: &[u8],
) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*ephemeral_public_key));
    let key = derive_key(shared.as_bytes());
    let plaintext = open_with_key(&key, ciphertext)?;
    Ok((plaintext, key))
}

impl LayerCipher for XChaChaLayerCipher {
    fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_x25519: &[u8; 32],
    ) -> Result<EncryptionResult, CryptoError> {
        let recipient = X25519PublicKey::from(*recipient_x25519);

        let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let shared_secret = ephemeral_secret.diffie_hellman(&recipient);
        if !shared_secret.was_contributory() {
            return Err(CryptoError::InvalidKey("low-order X25519 key".to_string()));
        }
        let symmetric_key = derive_key(shared_secret.as_bytes());
        let ciphertext = seal_with_key(&symmetric_key, plaintext)?;

        Ok(EncryptionResult {
            ciphertext,
            ephemeral_public_key: ephemeral_public.to_bytes(),
            symmetric_key,
        })
    }

    fn decrypt(&self, ciphertext: &[u8], symmetric_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        open_with_key(symmetric_key, ciphertext)
    }
}
