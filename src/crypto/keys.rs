/// Custody keypairs and the sealed at-rest format.
///
/// A sealed key is the only persisted form of a private key. The AAD binds
/// it to the key id it was sealed under.
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::aead::{self, NONCE_LEN};
use crate::crypto::hash;
use crate::crypto::sensitive::{PrivateKey, SensitiveBytes32, SensitiveVec};
use crate::error::{CustodyError, Result};
use crate::model::KeyId;

/// A freshly generated signing keypair.
pub struct Keypair {
    pub address: String,
    pub public_key: [u8; 32],
    pub private_key: PrivateKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Generate an Ed25519 keypair from the OS random source.
pub fn generate_keypair() -> Keypair {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = signing_key.verifying_key().to_bytes();

    let mut secret = signing_key.to_bytes();
    let private_key = PrivateKey::new(SensitiveVec::new(secret.to_vec()));
    secret.zeroize();

    Keypair {
        address: hash::address_from_public_key(&public_key),
        public_key,
        private_key,
    }
}

/// Encrypted private key, serialized to the key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Version of the sealed format.
    pub version: u32,
    /// XChaCha20 nonce (hex-encoded).
    pub nonce: String,
    /// Ciphertext with Poly1305 tag (hex-encoded).
    pub ciphertext: String,
}

impl SealedKey {
    pub const CURRENT_VERSION: u32 = 1;

    /// Encrypt `private_key` under `master_key`, bound to `id`.
    pub fn seal(master_key: &SensitiveBytes32, id: &KeyId, private_key: &PrivateKey) -> Result<Self> {
        let (nonce, ciphertext) =
            aead::encrypt(master_key, private_key.expose_bytes(), &aad_for(id))?;
        Ok(Self {
            version: Self::CURRENT_VERSION,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt. Any tampering, wrong key or wrong id yields `Decryption`.
    pub fn open(&self, master_key: &SensitiveBytes32, id: &KeyId) -> Result<PrivateKey> {
        let fail = |reason: &str| CustodyError::Decryption {
            key_id: id.clone(),
            reason: reason.to_string(),
        };

        if self.version != Self::CURRENT_VERSION {
            return Err(fail(&format!("unsupported sealed key version {}", self.version)));
        }
        let nonce: [u8; NONCE_LEN] = hex::decode(&self.nonce)
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or_else(|| fail("malformed nonce"))?;
        let ciphertext = hex::decode(&self.ciphertext).map_err(|_| fail("malformed ciphertext"))?;

        let plaintext = aead::decrypt(master_key, &nonce, &ciphertext, &aad_for(id))
            .map_err(|_| fail("authentication failed (wrong master key or tampered ciphertext)"))?;

        Ok(PrivateKey::new(plaintext))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn aad_for(id: &KeyId) -> Vec<u8> {
    format!("custody-vault:key:{id}").into_bytes()
}
