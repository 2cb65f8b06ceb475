/// Wrappers for sensitive key material that is automatically zeroized on drop.
///
/// Neither type implements `Debug` or `Serialize`, so secrets cannot end
/// up in logs or persisted metadata by accident.
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 32-byte sensitive value that is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveBytes32([u8; 32]);

impl SensitiveBytes32 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    /// Parse 64 hex characters. Intermediate buffers are zeroized.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut decoded = hex::decode(s.trim()).ok()?;
        let out = Self::from_slice(&decoded);
        decoded.zeroize();
        out
    }
}

/// A variable-length sensitive buffer that is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveVec(Vec<u8>);

impl SensitiveVec {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Plaintext private key handed to an authorized caller.
///
/// Zeroized on drop. The only way to see the bytes is through the
/// explicit `expose_*` accessors.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(SensitiveVec);

impl PrivateKey {
    pub fn new(bytes: SensitiveVec) -> Self {
        Self(bytes)
    }

    pub fn expose_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn expose_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose_bytes() == other.expose_bytes()
    }
}

impl Eq for PrivateKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_bytes32() {
        let key = SensitiveBytes32::new([0xAA; 32]);
        assert_eq!(key.as_bytes(), &[0xAA; 32]);
    }

    #[test]
    fn test_sensitive_bytes32_from_slice() {
        assert!(SensitiveBytes32::from_slice(&[0u8; 32]).is_some());
        assert!(SensitiveBytes32::from_slice(&[0u8; 16]).is_none());
    }

    #[test]
    fn test_sensitive_bytes32_from_hex() {
        let key = SensitiveBytes32::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key.as_bytes(), &[0xAB; 32]);
        assert!(SensitiveBytes32::from_hex("abcd").is_none());
        assert!(SensitiveBytes32::from_hex("not hex").is_none());
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::new(SensitiveVec::new(vec![0x11; 32]));
        let shown = format!("{key:?}");
        assert!(!shown.contains("11"));
        assert_eq!(key.expose_hex(), "11".repeat(32));
    }
}
