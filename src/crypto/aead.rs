/// XChaCha20-Poly1305 AEAD sealing of private key material.
///
/// Every seal uses a fresh random 24-byte nonce, which is large enough
/// for random generation without practical collision risk. Callers bind
/// the ciphertext to its key id through the AAD so that a blob copied
/// under a different id fails authentication.
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::crypto::sensitive::{SensitiveBytes32, SensitiveVec};
use crate::error::{CustodyError, Result};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;

/// Generate a random 256-bit symmetric key.
pub fn generate_key() -> SensitiveBytes32 {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    SensitiveBytes32::new(key)
}

/// Generate a random 24-byte nonce for XChaCha20-Poly1305.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt plaintext with XChaCha20-Poly1305.
///
/// Returns (nonce, ciphertext_with_tag).
pub fn encrypt(
    key: &SensitiveBytes32,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CustodyError::Encryption(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CustodyError::Encryption(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt ciphertext with XChaCha20-Poly1305.
///
/// Fails on a wrong key, wrong AAD or any tampering. The error carries no
/// detail beyond the authentication failure itself.
pub fn decrypt(
    key: &SensitiveBytes32,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> std::result::Result<SensitiveVec, chacha20poly1305::Error> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| chacha20poly1305::Error)?;

    let plaintext = cipher.decrypt(
        XNonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad,
        },
    )?;

    Ok(SensitiveVec::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG_LEN: usize = 16;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let plaintext = b"0123456789abcdef0123456789abcdef";
        let aad = b"custody:key:0xabc";

        let (nonce, ciphertext) = encrypt(&key, plaintext, aad).unwrap();
        let decrypted = decrypt(&key, &nonce, &ciphertext, aad).unwrap();

        assert_eq!(decrypted.as_bytes(), plaintext);
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, ciphertext) = encrypt(&generate_key(), b"secret", b"").unwrap();
        assert!(decrypt(&generate_key(), &nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = generate_key();
        let (nonce, ciphertext) = encrypt(&key, b"secret", b"custody:key:a").unwrap();
        assert!(decrypt(&key, &nonce, &ciphertext, b"custody:key:b").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_key();
        let (nonce, mut ciphertext) = encrypt(&key, b"secret", b"").unwrap();
        ciphertext[0] ^= 0xFF; // flip a byte
        assert!(decrypt(&key, &nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = generate_key();
        let (n1, c1) = encrypt(&key, b"same", b"").unwrap();
        let (n2, c2) = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }
}
