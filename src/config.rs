/// Custody configuration.
///
/// Loaded from JSON (camelCase keys) or built in code from `Default`.
/// Unknown keys are rejected so that a misspelled quota cannot silently
/// fall back to its default.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CustodyError, Result};
use crate::model::{Role, Tier};

/// Upper bound on `auditLogRetentionDays` (100 years).
pub const MAX_AUDIT_RETENTION_DAYS: u32 = 36_500;

/// What `restore_wallet` does when a live record already has the
/// backup's key id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreOverwrite {
    /// Replace the live record (logged as a warning).
    #[default]
    Allow,
    /// Fail with `AlreadyExists`.
    Reject,
}

/// Term lists driving compliance classification. Matching is
/// case-insensitive substring search; deny terms take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ComplianceConfig {
    pub deny_terms: Vec<String>,
    pub allow_terms: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        let terms = |list: &[&str]| -> Vec<String> { list.iter().map(|t| t.to_string()).collect() };
        Self {
            deny_terms: terms(&[
                "riba", "interest", "usury", "gharar", "maysir", "gambling", "alcohol", "tobacco",
            ]),
            allow_terms: terms(&[
                "musharaka", "mudaraba", "murabaha", "ijara", "sukuk", "wakala", "istisna",
                "salam", "takaful",
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CustodyConfig {
    /// Quota for live Hot keys.
    pub max_hot_wallets: usize,
    /// Quota for live Warm keys.
    pub max_warm_wallets: usize,
    /// Enables `create_multisig_wallet`.
    pub require_multi_sig: bool,
    /// Gates `get_private_key` on classification of the access purpose.
    #[serde(alias = "requireShariaApproval")]
    pub require_compliance_approval: bool,
    /// Read by the external retention job; never enforced here.
    pub audit_log_retention_days: u32,
    /// Period of the optional backup scheduler.
    pub backup_frequency_hours: u32,
    pub compliance: ComplianceConfig,
    /// Callers holding this role may read any key.
    pub admin_role: Role,
    pub restore_overwrite: RestoreOverwrite,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            max_hot_wallets: 5,
            max_warm_wallets: 20,
            require_multi_sig: true,
            require_compliance_approval: true,
            audit_log_retention_days: 2555, // 7 years
            backup_frequency_hours: 24,
            compliance: ComplianceConfig::default(),
            admin_role: Role::Admin,
            restore_overwrite: RestoreOverwrite::Allow,
        }
    }
}

impl CustodyConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_frequency_hours == 0 {
            return Err(CustodyError::InvalidInput(
                "backupFrequencyHours must be at least 1".into(),
            ));
        }
        if self.audit_log_retention_days > MAX_AUDIT_RETENTION_DAYS {
            return Err(CustodyError::InvalidInput(format!(
                "auditLogRetentionDays must be at most {MAX_AUDIT_RETENTION_DAYS}, got {}",
                self.audit_log_retention_days
            )));
        }
        let blank = self
            .compliance
            .deny_terms
            .iter()
            .chain(&self.compliance.allow_terms)
            .any(|t| t.trim().is_empty());
        if blank {
            // An empty term would match every purpose.
            return Err(CustodyError::InvalidInput(
                "compliance terms must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Configured maximum for a tier; `None` means unbounded.
    pub fn quota_for(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Hot => Some(self.max_hot_wallets),
            Tier::Warm => Some(self.max_warm_wallets),
            Tier::Cold => None,
        }
    }

    pub fn backup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.backup_frequency_hours) * 3600)
    }
}
