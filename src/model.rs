/// Core custody types: key identifiers, tiers, principals and key records.
///
/// A `KeyRecord` holds metadata only. Key material lives in the encrypted
/// key store and is never a field of any type in this module.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditTrail, SourceContext};
use crate::error::CustodyError;

/// Stable key identifier, derived from the public address at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Custody tier, reflecting how exposed the key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

impl FromStr for Tier {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            other => Err(CustodyError::InvalidInput(format!("unknown tier: {other}"))),
        }
    }
}

/// Identity of a user or service acting on the vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role token that may be granted on a key and held by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    MultisigAdmin,
    Custom(String),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::MultisigAdmin => write!(f, "multisig_admin"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for Role {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CustodyError::InvalidInput("empty role name".into()));
        }
        Ok(match s.to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "multisig_admin" => Self::MultisigAdmin,
            _ => Self::Custom(s.to_string()),
        })
    }
}

/// One entry of a key's permission set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    Principal(Principal),
    Role(Role),
}

pub type PermissionSet = BTreeSet<Grant>;

/// The authenticated caller, as supplied by the host's auth layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub principal: Principal,
    pub roles: BTreeSet<Role>,
    pub context: SourceContext,
}

impl Caller {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: Principal::new(principal),
            roles: BTreeSet::new(),
            context: SourceContext::default(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn with_context(mut self, context: SourceContext) -> Self {
        self.context = context;
        self
    }
}

/// Signing policy attached to a multi-signature custody key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultisigPolicy {
    pub owners: Vec<Principal>,
    pub required_signatures: usize,
}

/// Registry metadata for one custody key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub id: KeyId,
    pub name: String,
    /// Public address the key id was derived from.
    pub address: String,
    pub tier: Tier,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub permissions: PermissionSet,
    /// Computed once from `purpose` at creation.
    pub compliance_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multisig: Option<MultisigPolicy>,
    pub audit_trail: AuditTrail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse() {
        assert_eq!("HOT".parse::<Tier>().unwrap(), Tier::Hot);
        assert_eq!("cold".parse::<Tier>().unwrap(), Tier::Cold);
        assert!("lukewarm".parse::<Tier>().is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("Multisig_Admin".parse::<Role>().unwrap(), Role::MultisigAdmin);
        assert_eq!(
            "treasury".parse::<Role>().unwrap(),
            Role::Custom("treasury".into())
        );
        assert!("  ".parse::<Role>().is_err());
    }

    #[test]
    fn test_grant_serde_shape() {
        let grant = Grant::Principal(Principal::new("alice"));
        let json = serde_json::to_string(&grant).unwrap();
        assert_eq!(json, r#"{"principal":"alice"}"#);

        let role: Grant = serde_json::from_str(r#"{"role":"admin"}"#).unwrap();
        assert_eq!(role, Grant::Role(Role::Admin));
    }
}
