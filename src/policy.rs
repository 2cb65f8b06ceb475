/// Policy engine: quotas, compliance classification and permission checks.
///
/// Everything here is pure and cheap. The registry calls these functions
/// without holding any lock.
use std::fmt;

use crate::config::{ComplianceConfig, CustodyConfig};
use crate::error::{CustodyError, Result};
use crate::model::{Caller, Grant, PermissionSet, Role, Tier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny(String),
}

/// Check whether one more key of `tier` fits. Cold is unbounded; Hot and
/// Warm deny once the count has reached the maximum.
pub fn check_tier_quota(
    tier: Tier,
    current_count: usize,
    max_hot: usize,
    max_warm: usize,
) -> QuotaDecision {
    let max = match tier {
        Tier::Hot => max_hot,
        Tier::Warm => max_warm,
        Tier::Cold => return QuotaDecision::Allow,
    };
    if current_count >= max {
        QuotaDecision::Deny(format!(
            "{tier} tier holds {current_count} of {max} allowed keys"
        ))
    } else {
        QuotaDecision::Allow
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceDecision {
    Approved { term: String },
    Rejected { term: String },
    RequiresReview,
}

impl ComplianceDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// Only `Approved` passes. The other outcomes map to distinct errors so
    /// callers can route review cases to a human.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Approved { .. } => Ok(()),
            Self::Rejected { term } => Err(CustodyError::ComplianceRejected { term }),
            Self::RequiresReview => Err(CustodyError::RequiresManualReview),
        }
    }
}

impl fmt::Display for ComplianceDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved { term } => write!(f, "approved ({term})"),
            Self::Rejected { term } => write!(f, "rejected ({term})"),
            Self::RequiresReview => write!(f, "requires review"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    deny_terms: Vec<String>,
    allow_terms: Vec<String>,
    admin_role: Role,
}

impl PolicyEngine {
    pub fn new(compliance: &ComplianceConfig, admin_role: Role) -> Self {
        let lower = |terms: &[String]| -> Vec<String> {
            terms.iter().map(|t| t.trim().to_lowercase()).collect()
        };
        Self {
            deny_terms: lower(&compliance.deny_terms),
            allow_terms: lower(&compliance.allow_terms),
            admin_role,
        }
    }

    pub fn from_config(config: &CustodyConfig) -> Self {
        Self::new(&config.compliance, config.admin_role.clone())
    }

    /// Classify a stated purpose. First match wins: any deny term rejects,
    /// then any allow term approves, otherwise the purpose needs review.
    ///
    /// `permissions` is the permission set the purpose is being evaluated
    /// under; it is reported for tracing but does not change the verdict.
    pub fn classify_compliance(
        &self,
        purpose: &str,
        permissions: &PermissionSet,
    ) -> ComplianceDecision {
        let purpose = purpose.to_lowercase();

        let decision = if let Some(term) = self.deny_terms.iter().find(|t| purpose.contains(t.as_str())) {
            ComplianceDecision::Rejected { term: term.clone() }
        } else if let Some(term) = self.allow_terms.iter().find(|t| purpose.contains(t.as_str())) {
            ComplianceDecision::Approved { term: term.clone() }
        } else {
            ComplianceDecision::RequiresReview
        };

        tracing::debug!(
            grants = permissions.len(),
            decision = %decision,
            "compliance classified"
        );
        decision
    }

    /// True if the caller is granted directly, holds a role granted on the
    /// key, or holds the configured admin role.
    pub fn has_permission(&self, caller: &Caller, permissions: &PermissionSet) -> bool {
        if caller.roles.contains(&self.admin_role) {
            return true;
        }
        permissions.iter().any(|grant| match grant {
            Grant::Principal(p) => *p == caller.principal,
            Grant::Role(r) => caller.roles.contains(r),
        })
    }
}
