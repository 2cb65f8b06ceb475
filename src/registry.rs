/// Custody registry: the authoritative catalog of custody keys and the
/// only writer of key record state.
///
/// Every lifecycle operation follows the same shape:
/// 1. Policy checks (quota, permission, compliance), lock-free
/// 2. Take the per-key lock
/// 3. Key store / backup store work
/// 4. Persist the updated record (audit entry included)
/// 5. Publish the record to the in-memory catalog
/// 6. Queue the audit entry for the sink, off the operation path
///
/// Steps 2-5 run in a spawned task. A caller that drops the returned
/// future does not interrupt them: the operation either completes and is
/// recorded, or fails before anything is published.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditEvent, AuditSink, AuditTrail};
use crate::backup::{BackupRecord, BackupStore};
use crate::config::{CustodyConfig, RestoreOverwrite};
use crate::crypto::sensitive::{PrivateKey, SensitiveBytes32};
use crate::error::{CustodyError, Result};
use crate::keystore::EncryptedKeyStore;
use crate::model::{
    Caller, Grant, KeyId, KeyRecord, MultisigPolicy, PermissionSet, Principal, Role, Tier,
};
use crate::policy::{self, PolicyEngine, QuotaDecision};
use crate::storage::{KeyValueStore, RECORD_PREFIX};

/// Source of audit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parameters for `Custody::create_wallet`.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub name: String,
    pub tier: Tier,
    pub purpose: String,
    pub permissions: PermissionSet,
}

/// Parameters for `Custody::create_multisig_wallet`.
#[derive(Debug, Clone)]
pub struct NewMultisigWallet {
    pub owners: Vec<Principal>,
    pub required_signatures: usize,
    pub purpose: String,
}

/// Audit events waiting for the sink. A full queue counts as a failed
/// forward.
const AUDIT_QUEUE_CAPACITY: usize = 1024;

type LockTable = Mutex<HashMap<KeyId, Arc<tokio::sync::Mutex<()>>>>;

/// Outcome of `Custody::backup_all`.
#[derive(Debug, Default)]
pub struct BackupSweep {
    pub succeeded: Vec<(KeyId, Uuid)>,
    pub failed: Vec<(KeyId, CustodyError)>,
}

pub struct CustodyBuilder {
    config: CustodyConfig,
    master_key: Option<SensitiveBytes32>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl Default for CustodyBuilder {
    fn default() -> Self {
        Self {
            config: CustodyConfig::default(),
            master_key: None,
            store: None,
            clock: Arc::new(SystemClock),
            sink: None,
        }
    }
}

impl CustodyBuilder {
    pub fn config(mut self, config: CustodyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn master_key(mut self, key: SensitiveBytes32) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate configuration and load every persisted key record.
    pub async fn open(self) -> Result<Custody> {
        self.config.validate()?;
        let master_key = self
            .master_key
            .ok_or_else(|| CustodyError::InvalidInput("master key not configured".into()))?;
        let store = self
            .store
            .ok_or_else(|| CustodyError::InvalidInput("storage backend not configured".into()))?;

        let sink_failures = Arc::new(AtomicU64::new(0));
        let audit_tx = self
            .sink
            .map(|sink| spawn_forwarder(sink, sink_failures.clone()));

        let inner = Inner {
            policy: PolicyEngine::from_config(&self.config),
            config: self.config,
            master_key,
            keys: EncryptedKeyStore::new(store.clone()),
            backups: BackupStore::new(store.clone()),
            store,
            clock: self.clock,
            audit_tx,
            sink_failures,
            records: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            tiers: TierCounters::default(),
        };
        inner.load_records().await?;

        Ok(Custody {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to the custody subsystem. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Custody {
    inner: Arc<Inner>,
}

impl Custody {
    pub fn builder() -> CustodyBuilder {
        CustodyBuilder::default()
    }

    /// Generate a keypair and register it at `request.tier`.
    ///
    /// Fails with `QuotaExceeded` when the tier is full; the tier is never
    /// downgraded or escalated.
    pub async fn create_wallet(
        &self,
        request: NewWallet,
        caller: &Caller,
    ) -> Result<(KeyId, KeyRecord)> {
        let inner = self.inner.clone();
        let caller = caller.clone();
        run(async move {
            let approved = inner
                .policy
                .classify_compliance(&request.purpose, &request.permissions)
                .is_approved();
            inner
                .provision(
                    request.name,
                    request.tier,
                    request.purpose,
                    request.permissions,
                    approved,
                    None,
                    &caller,
                )
                .await
        })
        .await
    }

    /// Register a cold-custody key governed by a multi-signature policy.
    ///
    /// Requires `requireMultiSig` and a purpose that classifies as
    /// approved under the multisig admin role.
    pub async fn create_multisig_wallet(
        &self,
        request: NewMultisigWallet,
        caller: &Caller,
    ) -> Result<(KeyId, KeyRecord)> {
        let inner = self.inner.clone();
        let caller = caller.clone();
        run(async move {
            if !inner.config.require_multi_sig {
                return Err(CustodyError::FeatureDisabled("multi-signature wallets"));
            }
            let NewMultisigWallet {
                owners,
                required_signatures,
                purpose,
            } = request;
            validate_multisig(&owners, required_signatures)?;

            let elevated: PermissionSet = [Grant::Role(Role::MultisigAdmin)].into_iter().collect();
            let decision = inner.policy.classify_compliance(&purpose, &elevated);
            if !decision.is_approved() {
                warn!(
                    principal = %caller.principal,
                    decision = %decision,
                    "Multisig wallet refused by compliance"
                );
            }
            decision.into_result()?;

            let mut permissions: PermissionSet =
                owners.iter().cloned().map(Grant::Principal).collect();
            permissions.insert(Grant::Role(Role::MultisigAdmin));

            let name = format!("multisig {}-of-{}", required_signatures, owners.len());
            let policy = MultisigPolicy {
                owners,
                required_signatures,
            };
            inner
                .provision(name, Tier::Cold, purpose, permissions, true, Some(policy), &caller)
                .await
        })
        .await
    }

    /// Decrypt and return a key's private key.
    ///
    /// The caller must be granted on the key (or hold the admin role) and,
    /// when compliance approval is required, `access_purpose` must itself
    /// classify as approved. A successful read appends exactly one
    /// `Accessed` entry before returning; a refused read appends an
    /// `AccessDenied` entry and decrypts nothing.
    pub async fn get_private_key(
        &self,
        key_id: &KeyId,
        caller: &Caller,
        access_purpose: &str,
    ) -> Result<PrivateKey> {
        let inner = self.inner.clone();
        let key_id = key_id.clone();
        let caller = caller.clone();
        let access_purpose = access_purpose.to_string();
        run(async move { inner.read_private_key(&key_id, &caller, &access_purpose).await }).await
    }

    /// Snapshot a key's sealed material and metadata into a new backup.
    pub async fn backup_wallet(&self, key_id: &KeyId, caller: &Caller) -> Result<Uuid> {
        let inner = self.inner.clone();
        let key_id = key_id.clone();
        let caller = caller.clone();
        run(async move { inner.backup(&key_id, &caller).await }).await
    }

    /// Reinstate a key from a backup under its original id.
    ///
    /// With `restoreOverwrite = allow` an existing live record is replaced;
    /// with `reject` the restore fails with `AlreadyExists`.
    pub async fn restore_wallet(
        &self,
        backup_id: Uuid,
        caller: &Caller,
    ) -> Result<(KeyId, KeyRecord)> {
        let inner = self.inner.clone();
        let caller = caller.clone();
        run(async move { inner.restore(backup_id, &caller).await }).await
    }

    /// Back up every live key. Failures are collected, not fatal.
    pub async fn backup_all(&self, caller: &Caller) -> BackupSweep {
        let mut sweep = BackupSweep::default();
        for record in self.records() {
            match self.backup_wallet(&record.id, caller).await {
                Ok(backup_id) => sweep.succeeded.push((record.id, backup_id)),
                Err(e) => {
                    warn!(key_id = %record.id, error = %e, "Scheduled backup failed");
                    sweep.failed.push((record.id, e));
                }
            }
        }
        info!(
            succeeded = sweep.succeeded.len(),
            failed = sweep.failed.len(),
            "Backup sweep complete"
        );
        sweep
    }

    pub fn record(&self, key_id: &KeyId) -> Result<KeyRecord> {
        self.inner.current(key_id)
    }

    /// All live records, oldest first.
    pub fn records(&self) -> Vec<KeyRecord> {
        let mut out: Vec<KeyRecord> = self
            .inner
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn audit_trail(&self, key_id: &KeyId) -> Result<Vec<AuditEntry>> {
        Ok(self.inner.current(key_id)?.audit_trail.entries().to_vec())
    }

    pub async fn backups_for(&self, key_id: &KeyId) -> Result<Vec<BackupRecord>> {
        self.inner.backups.list_for(key_id).await
    }

    /// Live keys at `tier`.
    pub fn tier_count(&self, tier: Tier) -> usize {
        self.inner.tiers.get(tier)
    }

    /// Audit events the sink failed to accept since startup. Non-zero
    /// means the external audit copy is degraded.
    pub fn audit_sink_failures(&self) -> u64 {
        self.inner.sink_failures.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CustodyConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.inner.policy
    }
}

/// Drive an operation to completion on its own task.
async fn run<T, F>(operation: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(operation).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(CustodyError::Storage(format!("custody task aborted: {e}"))),
    }
}

fn validate_multisig(owners: &[Principal], required: usize) -> Result<()> {
    if owners.is_empty() {
        return Err(CustodyError::InvalidInput(
            "multisig wallet needs at least one owner".into(),
        ));
    }
    let mut seen = std::collections::BTreeSet::new();
    if let Some(dup) = owners.iter().find(|o| !seen.insert(*o)) {
        return Err(CustodyError::InvalidInput(format!(
            "duplicate multisig owner: {dup}"
        )));
    }
    if required == 0 || required > owners.len() {
        return Err(CustodyError::InvalidInput(format!(
            "required signatures must be between 1 and {}, got {required}",
            owners.len()
        )));
    }
    Ok(())
}

/// Deliver audit events to `sink` one at a time, in queue order. Ends
/// when the registry is dropped.
fn spawn_forwarder(
    sink: Arc<dyn AuditSink>,
    failures: Arc<AtomicU64>,
) -> mpsc::Sender<AuditEvent> {
    let (tx, mut rx) = mpsc::channel::<AuditEvent>(AUDIT_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = sink.forward(&event).await {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sink = sink.name(),
                    key_id = %event.key_id,
                    error = %e,
                    "Audit sink degraded: event not forwarded"
                );
            }
        }
    });
    tx
}

struct Inner {
    config: CustodyConfig,
    policy: PolicyEngine,
    master_key: SensitiveBytes32,
    store: Arc<dyn KeyValueStore>,
    keys: EncryptedKeyStore,
    backups: BackupStore,
    clock: Arc<dyn Clock>,
    audit_tx: Option<mpsc::Sender<AuditEvent>>,
    sink_failures: Arc<AtomicU64>,
    records: RwLock<HashMap<KeyId, KeyRecord>>,
    locks: LockTable,
    tiers: TierCounters,
}

impl Inner {
    async fn load_records(&self) -> Result<()> {
        let keys = self.store.list(RECORD_PREFIX).await?;
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let record: KeyRecord = serde_json::from_slice(&bytes).map_err(|e| {
                CustodyError::Serialization(format!("unreadable key record {key}: {e}"))
            })?;
            self.tiers.add(record.tier);
            loaded.insert(record.id.clone(), record);
        }

        info!(
            backend = self.store.name(),
            keys = loaded.len(),
            hot = self.tiers.get(Tier::Hot),
            warm = self.tiers.get(Tier::Warm),
            cold = self.tiers.get(Tier::Cold),
            "Custody registry loaded"
        );
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(())
    }

    fn current(&self, key_id: &KeyId) -> Result<KeyRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_id)
            .cloned()
            .ok_or_else(|| CustodyError::KeyNotFound(key_id.clone()))
    }

    fn exists(&self, key_id: &KeyId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key_id)
    }

    fn publish(&self, record: KeyRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record);
    }

    /// Wait for exclusive access to `key_id`.
    async fn lock_key(&self, key_id: &KeyId) -> KeyGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key_id.clone())
            .or_default()
            .clone();
        KeyGuard {
            locks: &self.locks,
            key_id: key_id.clone(),
            _held: lock.lock_owned().await,
        }
    }

    async fn persist(&self, record: &KeyRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .put(&format!("{RECORD_PREFIX}{}", record.id), &bytes)
            .await
    }

    /// Queue the newest entry of `record` for the sink without waiting on
    /// it. Called with the key lock held, so one key's events are queued
    /// in trail order.
    fn forward(&self, record: &KeyRecord) {
        let (Some(tx), Some(entry)) = (&self.audit_tx, record.audit_trail.last()) else {
            return;
        };
        let event = AuditEvent {
            key_id: record.id.clone(),
            entry: entry.clone(),
        };
        if let Err(e) = tx.try_send(event) {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key_id = %record.id, error = %e, "Audit sink degraded: event dropped");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        name: String,
        tier: Tier,
        purpose: String,
        permissions: PermissionSet,
        compliance_approved: bool,
        multisig: Option<MultisigPolicy>,
        caller: &Caller,
    ) -> Result<(KeyId, KeyRecord)> {
        let slot = self.tiers.reserve(tier, &self.config).map_err(|current| {
            warn!(
                tier = %tier,
                current,
                principal = %caller.principal,
                "Tier quota exceeded"
            );
            CustodyError::QuotaExceeded {
                tier,
                limit: self.config.quota_for(tier).unwrap_or(current),
            }
        })?;

        let keypair = self.keys.generate_keypair();
        let id = KeyId::new(keypair.address.clone());

        let _guard = self.lock_key(&id).await;
        if self.exists(&id) {
            return Err(CustodyError::AlreadyExists(id));
        }

        self.keys
            .encrypt_and_store(&id, &keypair.private_key, &self.master_key)
            .await?;

        let now = self.clock.now();
        let mut audit_trail = AuditTrail::new();
        let details = match &multisig {
            Some(m) => format!(
                "created {tier} multisig wallet ({}-of-{})",
                m.required_signatures,
                m.owners.len()
            ),
            None => format!("created {tier} wallet '{name}'"),
        };
        audit_trail.append(
            now,
            AuditAction::Created,
            caller.principal.clone(),
            details,
            caller.context.clone(),
        );

        let record = KeyRecord {
            id: id.clone(),
            name,
            address: keypair.address.clone(),
            tier,
            purpose,
            created_at: now,
            last_used_at: None,
            permissions,
            compliance_approved,
            multisig,
            audit_trail,
        };

        if let Err(e) = self.persist(&record).await {
            if let Err(cleanup) = self.keys.remove(&id).await {
                error!(key_id = %id, error = %cleanup, "Failed to remove orphaned sealed key");
            }
            return Err(e);
        }

        self.publish(record.clone());
        slot.commit();
        self.forward(&record);

        info!(
            key_id = %id,
            tier = %tier,
            principal = %caller.principal,
            compliance_approved,
            "Custody key created"
        );
        Ok((id, record))
    }

    async fn read_private_key(
        &self,
        key_id: &KeyId,
        caller: &Caller,
        access_purpose: &str,
    ) -> Result<PrivateKey> {
        let _guard = self.lock_key(key_id).await;
        let mut record = self.current(key_id)?;

        if !self.policy.has_permission(caller, &record.permissions) {
            warn!(key_id = %key_id, principal = %caller.principal, "Key access denied: no permission");
            self.record_denial(record, caller, "denied: principal not granted on key")
                .await;
            return Err(CustodyError::PermissionDenied {
                principal: caller.principal.to_string(),
                key_id: key_id.clone(),
            });
        }

        if self.config.require_compliance_approval {
            let decision = self
                .policy
                .classify_compliance(access_purpose, &record.permissions);
            if let Err(e) = decision.clone().into_result() {
                warn!(
                    key_id = %key_id,
                    principal = %caller.principal,
                    decision = %decision,
                    "Key access denied: access purpose not approved"
                );
                self.record_denial(record, caller, format!("denied: access purpose {decision}"))
                    .await;
                return Err(e);
            }
        }

        let private_key = self.keys.decrypt(key_id, &self.master_key).await?;

        let entry_time = record
            .audit_trail
            .append(
                self.clock.now(),
                AuditAction::Accessed,
                caller.principal.clone(),
                format!("accessed for: {access_purpose}"),
                caller.context.clone(),
            )
            .timestamp;
        record.last_used_at = Some(entry_time);

        // Nothing is published and the key is dropped (zeroized) if the
        // access cannot be recorded.
        self.persist(&record).await?;
        self.publish(record.clone());
        self.forward(&record);

        info!(key_id = %key_id, principal = %caller.principal, "Private key accessed");
        Ok(private_key)
    }

    /// Append and persist an `AccessDenied` entry. The denial itself is
    /// returned to the caller regardless of whether this write succeeds.
    async fn record_denial(&self, mut record: KeyRecord, caller: &Caller, details: impl Into<String>) {
        record.audit_trail.append(
            self.clock.now(),
            AuditAction::AccessDenied,
            caller.principal.clone(),
            details,
            caller.context.clone(),
        );
        match self.persist(&record).await {
            Ok(()) => {
                self.publish(record.clone());
                self.forward(&record);
            }
            Err(e) => {
                error!(key_id = %record.id, error = %e, "Failed to record access denial");
            }
        }
    }

    async fn backup(&self, key_id: &KeyId, caller: &Caller) -> Result<Uuid> {
        let _guard = self.lock_key(key_id).await;
        let mut record = self.current(key_id)?;

        let sealed = self.keys.load_sealed(key_id).await?;
        let now = self.clock.now();
        let backup = BackupRecord::new(sealed, record.clone(), now)?;
        self.backups.save(&backup).await?;

        record.audit_trail.append(
            now,
            AuditAction::BackedUp,
            caller.principal.clone(),
            format!("backup {}", backup.backup_id),
            caller.context.clone(),
        );
        if let Err(e) = self.persist(&record).await {
            if let Err(cleanup) = self.backups.remove(backup.backup_id).await {
                error!(backup_id = %backup.backup_id, error = %cleanup, "Failed to remove unrecorded backup");
            }
            return Err(e);
        }
        self.publish(record.clone());
        self.forward(&record);

        info!(
            key_id = %key_id,
            backup_id = %backup.backup_id,
            principal = %caller.principal,
            "Custody key backed up"
        );
        Ok(backup.backup_id)
    }

    async fn restore(&self, backup_id: Uuid, caller: &Caller) -> Result<(KeyId, KeyRecord)> {
        let backup = self.backups.load(backup_id).await?;
        backup.verify_integrity().map_err(|e| {
            error!(backup_id = %backup_id, error = %e, "Backup failed integrity check");
            e
        })?;

        let key_id = backup.key_id.clone();
        let _guard = self.lock_key(&key_id).await;

        let replacing = self.exists(&key_id);
        if replacing {
            match self.config.restore_overwrite {
                RestoreOverwrite::Reject => return Err(CustodyError::AlreadyExists(key_id)),
                RestoreOverwrite::Allow => warn!(
                    key_id = %key_id,
                    backup_id = %backup_id,
                    "Restore overwrites the live key record"
                ),
            }
        }

        let mut record = backup.metadata_snapshot;
        record.audit_trail.append(
            self.clock.now(),
            AuditAction::Restored,
            caller.principal.clone(),
            format!(
                "restored from backup {backup_id} taken {}",
                backup.backup_timestamp.to_rfc3339()
            ),
            caller.context.clone(),
        );

        self.keys
            .store_sealed(&key_id, &backup.encrypted_key_material)
            .await?;
        self.persist(&record).await?;
        self.publish(record.clone());
        if !replacing {
            self.tiers.add(record.tier);
        }
        self.forward(&record);

        info!(
            key_id = %key_id,
            backup_id = %backup_id,
            principal = %caller.principal,
            replaced = replacing,
            "Custody key restored"
        );
        Ok((key_id, record))
    }
}

/// Exclusive hold on one key. On drop the key's lock-table entry is
/// removed unless another task holds or waits on it.
struct KeyGuard<'a> {
    locks: &'a LockTable,
    key_id: KeyId,
    _held: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one in `_held`.
        let idle = locks
            .get(&self.key_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            locks.remove(&self.key_id);
        }
    }
}

/// Live key counts per tier.
#[derive(Default)]
struct TierCounters {
    hot: AtomicUsize,
    warm: AtomicUsize,
    cold: AtomicUsize,
}

impl TierCounters {
    fn counter(&self, tier: Tier) -> &AtomicUsize {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    fn get(&self, tier: Tier) -> usize {
        self.counter(tier).load(Ordering::SeqCst)
    }

    fn add(&self, tier: Tier) {
        self.counter(tier).fetch_add(1, Ordering::SeqCst);
    }

    /// Atomically claim one slot at `tier` if the quota allows it. On
    /// refusal returns the count that was observed.
    fn reserve(&self, tier: Tier, config: &CustodyConfig) -> std::result::Result<TierSlot<'_>, usize> {
        let counter = self.counter(tier);
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match policy::check_tier_quota(
                    tier,
                    current,
                    config.max_hot_wallets,
                    config.max_warm_wallets,
                ) {
                    QuotaDecision::Allow => Some(current + 1),
                    QuotaDecision::Deny(_) => None,
                }
            })
            .map(|_| TierSlot {
                counter,
                committed: false,
            })
    }
}

/// A reserved tier slot. Released on drop unless committed.
struct TierSlot<'a> {
    counter: &'a AtomicUsize,
    committed: bool,
}

impl TierSlot<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TierSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::generate_key;
    use crate::storage::MemoryStore;

    async fn custody(config: CustodyConfig) -> (Custody, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let custody = Custody::builder()
            .config(config)
            .master_key(generate_key())
            .store(store.clone())
            .open()
            .await
            .unwrap();
        (custody, store)
    }

    fn wallet(tier: Tier, owner: &str) -> NewWallet {
        NewWallet {
            name: format!("{tier} wallet"),
            tier,
            purpose: "murabaha settlement".into(),
            permissions: [Grant::Principal(Principal::new(owner))].into_iter().collect(),
        }
    }

    #[test]
    fn test_tier_slot_released_unless_committed() {
        let counters = TierCounters::default();
        let config = CustodyConfig {
            max_hot_wallets: 1,
            ..CustodyConfig::default()
        };

        let slot = counters.reserve(Tier::Hot, &config).unwrap();
        assert!(counters.reserve(Tier::Hot, &config).is_err());
        drop(slot);
        assert_eq!(counters.get(Tier::Hot), 0);

        counters.reserve(Tier::Hot, &config).unwrap().commit();
        assert_eq!(counters.get(Tier::Hot), 1);
        assert_eq!(counters.reserve(Tier::Hot, &config).err(), Some(1));
    }

    #[test]
    fn test_validate_multisig() {
        let owners = vec![Principal::new("a"), Principal::new("b")];
        assert!(validate_multisig(&owners, 2).is_ok());
        assert!(validate_multisig(&owners, 0).is_err());
        assert!(validate_multisig(&owners, 3).is_err());
        assert!(validate_multisig(&[], 1).is_err());
        let dup = vec![Principal::new("a"), Principal::new("a")];
        assert!(validate_multisig(&dup, 1).is_err());
    }

    #[tokio::test]
    async fn test_create_records_created_entry() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let caller = Caller::new("alice");
        let (id, record) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &caller)
            .await
            .unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.address, id.as_str());
        assert!(record.compliance_approved);
        assert_eq!(record.audit_trail.len(), 1);
        assert_eq!(record.audit_trail.entries()[0].action, AuditAction::Created);
        assert_eq!(custody.tier_count(Tier::Warm), 1);
    }

    #[tokio::test]
    async fn test_create_with_unclassified_purpose_is_not_approved() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let mut request = wallet(Tier::Cold, "alice");
        request.purpose = "generic investment".into();
        let (_, record) = custody
            .create_wallet(request, &Caller::new("alice"))
            .await
            .unwrap();
        assert!(!record.compliance_approved);
    }

    #[tokio::test]
    async fn test_failed_persist_releases_quota_slot() {
        let config = CustodyConfig {
            max_hot_wallets: 1,
            ..CustodyConfig::default()
        };
        let (custody, store) = custody(config).await;
        let caller = Caller::new("alice");

        store.fail_writes(true);
        let err = custody
            .create_wallet(wallet(Tier::Hot, "alice"), &caller)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(custody.tier_count(Tier::Hot), 0);

        store.fail_writes(false);
        custody
            .create_wallet(wallet(Tier::Hot, "alice"), &caller)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reopen_restores_catalog_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let master = generate_key();
        let open = || {
            Custody::builder()
                .master_key(master.clone())
                .store(store.clone())
                .open()
        };

        let first = open().await.unwrap();
        let (id, _) = first
            .create_wallet(wallet(Tier::Hot, "alice"), &Caller::new("alice"))
            .await
            .unwrap();
        drop(first);

        let second = open().await.unwrap();
        assert_eq!(second.tier_count(Tier::Hot), 1);
        let key = second
            .get_private_key(&id, &Caller::new("alice"), "ijara rent collection")
            .await
            .unwrap();
        assert_eq!(key.expose_bytes().len(), 32);
    }

    #[tokio::test]
    async fn test_open_requires_master_key_and_store() {
        assert!(matches!(
            Custody::builder().store(Arc::new(MemoryStore::new())).open().await,
            Err(CustodyError::InvalidInput(_))
        ));
        assert!(matches!(
            Custody::builder().master_key(generate_key()).open().await,
            Err(CustodyError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_compliance_gate_on_access_purpose() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let caller = Caller::new("alice");
        let (id, _) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &caller)
            .await
            .unwrap();

        let err = custody
            .get_private_key(&id, &caller, "generic investment")
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::RequiresManualReview));

        let err = custody
            .get_private_key(&id, &caller, "sukuk with riba")
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::ComplianceRejected { .. }));

        let trail = custody.audit_trail(&id).unwrap();
        assert_eq!(
            trail.iter().filter(|e| e.action == AuditAction::AccessDenied).count(),
            2
        );
        assert!(trail.iter().all(|e| e.action != AuditAction::Accessed));
        assert!(custody.record(&id).unwrap().last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_compliance_gate_disabled() {
        let config = CustodyConfig {
            require_compliance_approval: false,
            ..CustodyConfig::default()
        };
        let (custody, _) = custody(config).await;
        let caller = Caller::new("alice");
        let (id, _) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &caller)
            .await
            .unwrap();

        custody
            .get_private_key(&id, &caller, "generic investment")
            .await
            .unwrap();
        assert!(custody.record(&id).unwrap().last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_access_not_recorded_when_persist_fails() {
        let (custody, store) = custody(CustodyConfig::default()).await;
        let caller = Caller::new("alice");
        let (id, _) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &caller)
            .await
            .unwrap();

        store.fail_writes(true);
        let err = custody
            .get_private_key(&id, &caller, "ijara")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        store.fail_writes(false);

        let record = custody.record(&id).unwrap();
        assert_eq!(record.audit_trail.count(AuditAction::Accessed), 0);
        assert!(record.last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_multisig_feature_flag() {
        let config = CustodyConfig {
            require_multi_sig: false,
            ..CustodyConfig::default()
        };
        let (custody, _) = custody(config).await;
        let request = NewMultisigWallet {
            owners: vec![Principal::new("a"), Principal::new("b")],
            required_signatures: 2,
            purpose: "musharaka escrow".into(),
        };
        let err = custody
            .create_multisig_wallet(request, &Caller::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::FeatureDisabled(_)));
    }

    #[tokio::test]
    async fn test_multisig_is_cold_and_grants_owners() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let request = NewMultisigWallet {
            owners: vec![Principal::new("a"), Principal::new("b"), Principal::new("c")],
            required_signatures: 2,
            purpose: "musharaka escrow".into(),
        };
        let (id, record) = custody
            .create_multisig_wallet(request, &Caller::new("a"))
            .await
            .unwrap();

        assert_eq!(record.tier, Tier::Cold);
        assert!(record.compliance_approved);
        assert_eq!(record.multisig.as_ref().unwrap().required_signatures, 2);
        assert!(record
            .permissions
            .contains(&Grant::Role(Role::MultisigAdmin)));
        assert_eq!(custody.tier_count(Tier::Cold), 1);

        custody
            .get_private_key(&id, &Caller::new("c"), "musharaka distribution")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_multisig_compliance_outcomes() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let request = |purpose: &str| NewMultisigWallet {
            owners: vec![Principal::new("a"), Principal::new("b")],
            required_signatures: 1,
            purpose: purpose.into(),
        };

        let err = custody
            .create_multisig_wallet(request("riba lending pool"), &Caller::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::ComplianceRejected { .. }));

        let err = custody
            .create_multisig_wallet(request("treasury"), &Caller::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::RequiresManualReview));
        assert_eq!(custody.tier_count(Tier::Cold), 0);
    }

    #[tokio::test]
    async fn test_restore_reject_mode() {
        let config = CustodyConfig {
            restore_overwrite: RestoreOverwrite::Reject,
            ..CustodyConfig::default()
        };
        let (custody, _) = custody(config).await;
        let caller = Caller::new("alice");
        let (id, _) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &caller)
            .await
            .unwrap();
        let backup_id = custody.backup_wallet(&id, &caller).await.unwrap();

        let err = custody.restore_wallet(backup_id, &caller).await.unwrap_err();
        assert!(matches!(err, CustodyError::AlreadyExists(ref k) if *k == id));
    }

    #[tokio::test]
    async fn test_restore_overwrite_keeps_tier_count() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let caller = Caller::new("alice");
        let (id, _) = custody
            .create_wallet(wallet(Tier::Hot, "alice"), &caller)
            .await
            .unwrap();
        let backup_id = custody.backup_wallet(&id, &caller).await.unwrap();
        custody
            .get_private_key(&id, &caller, "ijara")
            .await
            .unwrap();

        let (restored_id, record) = custody.restore_wallet(backup_id, &caller).await.unwrap();
        assert_eq!(restored_id, id);
        assert_eq!(custody.tier_count(Tier::Hot), 1);
        // The snapshot predates the access, so the restored trail has no Accessed entry.
        assert_eq!(record.audit_trail.count(AuditAction::Accessed), 0);
        assert_eq!(
            record.audit_trail.last().map(|e| e.action),
            Some(AuditAction::Restored)
        );
    }

    fn lock_table_len(custody: &Custody) -> usize {
        custody.inner.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let caller = Caller::new("alice");

        for i in 0..1000 {
            let err = custody
                .get_private_key(&KeyId::new(format!("0xmissing{i}")), &caller, "ijara")
                .await
                .unwrap_err();
            assert!(matches!(err, CustodyError::KeyNotFound(_)));
            let err = custody
                .backup_wallet(&KeyId::new(format!("0xmissing{i}")), &caller)
                .await
                .unwrap_err();
            assert!(matches!(err, CustodyError::KeyNotFound(_)));
        }
        assert_eq!(lock_table_len(&custody), 0);

        let (id, _) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &caller)
            .await
            .unwrap();
        custody.get_private_key(&id, &caller, "ijara").await.unwrap();
        custody.backup_wallet(&id, &caller).await.unwrap();
        assert_eq!(lock_table_len(&custody), 0);
    }

    #[tokio::test]
    async fn test_key_lock_serializes_and_prunes() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let id = KeyId::new("0xabc");

        let first = custody.inner.lock_key(&id).await;
        let inner = custody.inner.clone();
        let waiter_id = id.clone();
        let waiter = tokio::spawn(async move {
            let _second = inner.lock_key(&waiter_id).await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // The waiter keeps the entry alive past the first release.
        drop(first);
        waiter.await.unwrap();
        assert_eq!(lock_table_len(&custody), 0);
    }

    #[tokio::test]
    async fn test_denial_still_returned_when_it_cannot_be_recorded() {
        let (custody, store) = custody(CustodyConfig::default()).await;
        let (id, _) = custody
            .create_wallet(wallet(Tier::Warm, "alice"), &Caller::new("alice"))
            .await
            .unwrap();

        store.fail_writes(true);
        let err = custody
            .get_private_key(&id, &Caller::new("mallory"), "ijara")
            .await
            .unwrap_err();
        store.fail_writes(false);

        assert!(matches!(err, CustodyError::PermissionDenied { .. }));
        let record = custody.record(&id).unwrap();
        assert_eq!(record.audit_trail.count(AuditAction::AccessDenied), 0);
        assert_eq!(record.audit_trail.count(AuditAction::Accessed), 0);
    }

    #[tokio::test]
    async fn test_backup_all_sweeps_every_key() {
        let (custody, _) = custody(CustodyConfig::default()).await;
        let caller = Caller::new("alice");
        for tier in Tier::ALL {
            custody
                .create_wallet(wallet(tier, "alice"), &caller)
                .await
                .unwrap();
        }

        let sweep = custody.backup_all(&Caller::new("system:scheduler")).await;
        assert_eq!(sweep.succeeded.len(), 3);
        assert!(sweep.failed.is_empty());
    }
}
