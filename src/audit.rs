/// Append-only audit trail for custody keys.
///
/// Each key carries its own ordered trail. Entries are never reordered or
/// pruned here; retention is enforced by an external job that can ask a
/// trail which entries are past the configured window.
///
/// A copy of every entry may be forwarded to an external `AuditSink`
/// (SIEM, structured log pipeline). Forwarding never blocks the custody
/// operation that produced the entry.
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{KeyId, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Accessed,
    AccessDenied,
    BackedUp,
    Restored,
}

/// Best-effort origin of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub principal: Principal,
    pub details: String,
    #[serde(default)]
    pub source_context: SourceContext,
}

/// Ordered entries for a single key. Timestamps are strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditTrail(Vec<AuditEntry>);

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped `now`, nudged forward if the clock has not
    /// advanced past the previous entry.
    pub fn append(
        &mut self,
        now: DateTime<Utc>,
        action: AuditAction,
        principal: Principal,
        details: impl Into<String>,
        source_context: SourceContext,
    ) -> &AuditEntry {
        let timestamp = match self.0.last() {
            Some(prev) if now <= prev.timestamp => prev.timestamp + Duration::microseconds(1),
            _ => now,
        };
        self.0.push(AuditEntry {
            timestamp,
            action,
            principal,
            details: details.into(),
            source_context,
        });
        &self.0[self.0.len() - 1]
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.0
    }

    pub fn last(&self) -> Option<&AuditEntry> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.0.iter().filter(|e| e.action == action).count()
    }

    /// Entries older than `retention_days` relative to `now`. Reporting only.
    /// A window reaching before the earliest representable time covers
    /// every entry, so nothing is reported.
    pub fn past_retention(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> impl Iterator<Item = &AuditEntry> {
        let cutoff = Duration::try_days(i64::from(retention_days))
            .and_then(|window| now.checked_sub_signed(window));
        self.0
            .iter()
            .filter(move |e| cutoff.is_some_and(|cutoff| e.timestamp < cutoff))
    }
}

/// An audit entry tagged with the key it belongs to, as sent to sinks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub key_id: KeyId,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// External receiver of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn forward(&self, event: &AuditEvent) -> Result<()>;
}

/// Emits every audit event as a structured tracing event on the
/// `custody_audit` target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn forward(&self, event: &AuditEvent) -> Result<()> {
        tracing::info!(
            target: "custody_audit",
            key_id = %event.key_id,
            action = ?event.entry.action,
            principal = %event.entry.principal,
            timestamp = %event.entry.timestamp,
            ip = event.entry.source_context.ip.as_deref().unwrap_or("-"),
            details = %event.entry.details,
            "audit"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_append_preserves_order() {
        let mut trail = AuditTrail::new();
        trail.append(ts(10), AuditAction::Created, Principal::new("a"), "", SourceContext::default());
        trail.append(ts(20), AuditAction::Accessed, Principal::new("b"), "", SourceContext::default());

        let actions: Vec<_> = trail.entries().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::Accessed]);
    }

    #[test]
    fn test_append_is_strictly_monotonic() {
        let mut trail = AuditTrail::new();
        trail.append(ts(100), AuditAction::Created, Principal::new("a"), "", SourceContext::default());
        // Clock went backwards
        trail.append(ts(50), AuditAction::Accessed, Principal::new("a"), "", SourceContext::default());
        // Clock did not move
        trail.append(ts(50), AuditAction::Accessed, Principal::new("a"), "", SourceContext::default());

        let entries = trail.entries();
        assert!(entries[1].timestamp > entries[0].timestamp);
        assert!(entries[2].timestamp > entries[1].timestamp);
    }

    #[test]
    fn test_past_retention_reports_without_pruning() {
        let mut trail = AuditTrail::new();
        let now = ts(100 * 86_400);
        trail.append(now - Duration::days(40), AuditAction::Created, Principal::new("a"), "", SourceContext::default());
        trail.append(now - Duration::days(5), AuditAction::Accessed, Principal::new("a"), "", SourceContext::default());

        assert_eq!(trail.past_retention(now, 30).count(), 1);
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn test_past_retention_with_huge_window_reports_nothing() {
        let mut trail = AuditTrail::new();
        trail.append(ts(1), AuditAction::Created, Principal::new("a"), "", SourceContext::default());

        assert_eq!(trail.past_retention(Utc::now(), u32::MAX).count(), 0);
        assert_eq!(trail.past_retention(DateTime::<Utc>::MIN_UTC, 1).count(), 0);
    }

    #[test]
    fn test_count_by_action() {
        let mut trail = AuditTrail::new();
        trail.append(ts(1), AuditAction::Created, Principal::new("a"), "", SourceContext::default());
        trail.append(ts(2), AuditAction::Accessed, Principal::new("a"), "", SourceContext::default());
        trail.append(ts(3), AuditAction::Accessed, Principal::new("a"), "", SourceContext::default());
        assert_eq!(trail.count(AuditAction::Accessed), 2);
        assert_eq!(trail.count(AuditAction::BackedUp), 0);
    }

    #[test]
    fn test_event_serializes_flat() {
        let mut trail = AuditTrail::new();
        let entry = trail
            .append(ts(1), AuditAction::BackedUp, Principal::new("ops"), "backup", SourceContext::default())
            .clone();
        let event = AuditEvent {
            key_id: KeyId::new("0x01"),
            entry,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["keyId"], "0x01");
        assert_eq!(json["action"], "backed_up");
        assert_eq!(json["principal"], "ops");
    }
}
