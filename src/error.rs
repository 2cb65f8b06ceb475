use thiserror::Error;
use uuid::Uuid;

use crate::model::{KeyId, Tier};

#[derive(Error, Debug)]
pub enum CustodyError {
    #[error("Key not found: {0}")]
    KeyNotFound(KeyId),

    #[error("Backup not found: {0}")]
    BackupNotFound(Uuid),

    #[error("Permission denied: {principal} is not granted access to key {key_id}")]
    PermissionDenied { principal: String, key_id: KeyId },

    #[error("{tier} wallet quota exceeded ({limit} allowed)")]
    QuotaExceeded { tier: Tier, limit: usize },

    #[error("Compliance rejected: purpose contains forbidden term '{term}'")]
    ComplianceRejected { term: String },

    #[error("Purpose requires manual compliance review: no approved term matched")]
    RequiresManualReview,

    #[error("Decryption failed for key {key_id}: {reason}")]
    Decryption { key_id: KeyId, reason: String },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Backup integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Feature disabled by configuration: {0}")]
    FeatureDisabled(&'static str),

    #[error("Key already exists: {0}")]
    AlreadyExists(KeyId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CustodyError {
    /// Only transient infrastructure failures may be retried by the caller.
    /// Every other variant is a deterministic validation or authorization
    /// outcome and will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CustodyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(CustodyError::StorageUnavailable("pool timed out".into()).is_retryable());
        assert!(!CustodyError::Storage("constraint".into()).is_retryable());
        assert!(!CustodyError::RequiresManualReview.is_retryable());
        assert!(!CustodyError::PermissionDenied {
            principal: "alice".into(),
            key_id: KeyId::new("0xabc"),
        }
        .is_retryable());
    }

    #[test]
    fn test_quota_message_names_tier() {
        let err = CustodyError::QuotaExceeded {
            tier: Tier::Hot,
            limit: 1,
        };
        assert_eq!(err.to_string(), "hot wallet quota exceeded (1 allowed)");
    }
}
