/// Cryptographic primitives for custody.
///
/// - `aead`: XChaCha20-Poly1305 sealing of private keys at rest
/// - `hash`: BLAKE3 address derivation and backup checksums
/// - `kdf`: Argon2id master key derivation
/// - `keys`: keypair generation and the sealed key format
/// - `sensitive`: zeroize-on-drop containers for secret bytes
pub mod aead;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod sensitive;
