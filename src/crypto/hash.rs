/// BLAKE3 hashing utilities.
///
/// Used for:
/// - Deriving a key's public address from its verifying key
/// - Backup checksums over ciphertext and metadata snapshot

const ADDRESS_CONTEXT: &str = "custody-vault 2024 address v1";
const BACKUP_CONTEXT: &str = "custody-vault 2024 backup checksum v1";

/// Derive a key from input keying material using BLAKE3's key derivation mode.
/// Context should be a unique, hardcoded string identifying the usage.
pub fn derive_key(context: &str, ikm: &[u8]) -> [u8; 32] {
    let mut output = [0u8; 32];
    let mut deriver = blake3::Hasher::new_derive_key(context);
    deriver.update(ikm);
    let mut reader = deriver.finalize_xof();
    reader.fill(&mut output);
    output
}

/// 20-byte address for a public key, rendered as `0x`-prefixed hex.
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let digest = derive_key(ADDRESS_CONTEXT, public_key);
    format!("0x{}", hex::encode(&digest[..20]))
}

/// Checksum binding a backup's ciphertext to its metadata snapshot.
///
/// Each part is length-prefixed so that moving bytes between them
/// changes the result.
pub fn backup_checksum(ciphertext: &[u8], metadata: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(BACKUP_CONTEXT);
    hasher.update(&(ciphertext.len() as u64).to_le_bytes());
    hasher.update(ciphertext);
    hasher.update(&(metadata.len() as u64).to_le_bytes());
    hasher.update(metadata);
    hasher.finalize().into()
}
