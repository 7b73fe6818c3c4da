// Swarm request signing: Ed25519 identity of the account whose swarm we talk to

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

use super::CryptoError;

/// Account id prefix for standard (non-blinded) accounts
const ACCOUNT_PREFIX: &str = "05";

/// Signing identity for authenticated swarm calls
#[derive(Clone)]
pub struct SwarmAuth {
    signing_key: SigningKey,
}

impl std::fmt::Debug for SwarmAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmAuth")
            .field("account_id", &self.account_id())
            .finish_non_exhaustive()
    }
}

impl SwarmAuth {
    /// Generate a new random identity
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Secret key bytes, wiped on drop
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    pub fn ed25519_public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// `05` followed by the hex X25519 form of our Ed25519 public key
    pub fn account_id(&self) -> String {
        let montgomery = self.signing_key.verifying_key().to_montgomery();
        format!("{}{}", ACCOUNT_PREFIX, hex::encode(montgomery.to_bytes()))
    }

    /// Sign `data`; returns the signature base64 encoded as the storage RPCs expect
    pub fn sign(&self, data: &[u8]) -> String {
        let signature = self.signing_key.sign(data);
        BASE64.encode(signature.to_bytes())
    }

    /// Verify a base64 signature against a hex Ed25519 public key
    pub fn verify(data: &[u8], signature_b64: &str, public_key_hex: &str) -> Result<bool, CryptoError> {
        let key_bytes: [u8; 32] = hex::decode(public_key_hex)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32 bytes".to_string()))?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let sig_bytes: [u8; 64] = BASE64
            .decode(signature_b64)
            .map_err(|_| CryptoError::Decryption)?
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;
        let signature = Signature::from_bytes(&sig_bytes);

        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}
