/// Argon2id derivation of the process-wide master key.
///
/// Parameters: t=3, m=256MB, p=4
/// Produces a 256-bit (32-byte) key from a passphrase and salt.
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CustodyError, Result};

const ARGON2_TIME_COST: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 262_144; // 256 MiB
const ARGON2_PARALLELISM: u32 = 4;
pub const SALT_LEN: usize = 32;
/// Argon2 rejects shorter salts.
pub const MIN_SALT_LEN: usize = 8;

/// Generate a random 32-byte salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte master key from a passphrase using Argon2id.
pub fn derive_master_key(passphrase: &[u8], salt: &[u8]) -> Result<SensitiveBytes32> {
    derive_with(
        passphrase,
        salt,
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
    )
}

/// Derive with reduced parameters for testing (fast but insecure).
#[cfg(test)]
pub fn derive_master_key_test(passphrase: &[u8], salt: &[u8]) -> Result<SensitiveBytes32> {
    derive_with(passphrase, salt, 1024, 1, 1)
}

fn derive_with(
    passphrase: &[u8],
    salt: &[u8],
    memory_kib: u32,
    time_cost: u32,
    parallelism: u32,
) -> Result<SensitiveBytes32> {
    if passphrase.is_empty() {
        return Err(CustodyError::KeyDerivation("empty passphrase".into()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(CustodyError::KeyDerivation(format!(
            "salt must be at least {MIN_SALT_LEN} bytes"
        )));
    }

    let params = Params::new(memory_kib, time_cost, parallelism, Some(32))
        .map_err(|e| CustodyError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CustodyError::KeyDerivation(e.to_string()))?;

    Ok(SensitiveBytes32::new(output))
}
