//! Synchronization orchestrator.
//!
//! `SyncEngine` owns the local snapshot of one player and drives merge cycles
//! against documents handed over by the cloud transport. A cycle moves
//! through three phases:
//!
//! ```text
//! Idle ──remote document──▶ Merging ──merged snapshot──▶ Complete
//! ```
//!
//! The merge itself is the pure `merge_snapshot`. The engine only applies the
//! result, keeps the local cache current and pushes the merged snapshot back
//! when the cloud copy is stale. Cloud and disk access go through the
//! injected `CloudTransport` and `LocalCache`, so hosts and tests can supply
//! their own.

mod cache;

#[cfg(test)]
mod tests;

pub use cache::{FileCache, LocalCache};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{truncate_to_millis, TypedValue};
use crate::currency::CurrencyLedger;
use crate::error::{SyncError, SyncResult};
use crate::registry::{CurrencyDeclaration, Registry};
use crate::snapshot::{
    decode_snapshot_with_report, encode_snapshot, extend_unique, merge_snapshot, MergeStats,
    Snapshot, SnapshotMerge, SCHEMA_VERSION,
};
use crate::variable::MergePolicy;

/// Access to the cloud key-value store.
pub trait CloudTransport {
    /// Fetch the document stored under `key`, if any.
    fn fetch(&mut self, key: &str) -> SyncResult<Option<String>>;
    fn store(&mut self, key: &str, document: &str) -> SyncResult<()>;
    fn delete(&mut self, key: &str) -> SyncResult<()>;
}

/// Why the cloud store reported an external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// Another device wrote new data
    ServerChange,
    /// First download after the store became available
    InitialSyncChange,
    /// The store is over quota; the remote data is unchanged
    QuotaViolationChange,
    /// The signed-in account changed
    AccountChange,
}

impl ChangeReason {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ChangeReason::ServerChange),
            1 => Some(ChangeReason::InitialSyncChange),
            2 => Some(ChangeReason::QuotaViolationChange),
            3 => Some(ChangeReason::AccountChange),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeReason::ServerChange => "server_change",
            ChangeReason::InitialSyncChange => "initial_sync_change",
            ChangeReason::QuotaViolationChange => "quota_violation_change",
            ChangeReason::AccountChange => "account_change",
        })
    }
}

impl FromStr for ChangeReason {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "serverchange" => Ok(ChangeReason::ServerChange),
            "initialsyncchange" => Ok(ChangeReason::InitialSyncChange),
            "quotaviolationchange" => Ok(ChangeReason::QuotaViolationChange),
            "accountchange" => Ok(ChangeReason::AccountChange),
            _ => Err(SyncError::General(format!("Unknown change reason: {}", s))),
        }
    }
}

/// Phase of the current merge cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Merging,
    Complete,
}

/// What a merge cycle did to the local snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Whether the local snapshot changed
    pub changed: bool,
    pub changed_keys: Vec<String>,
    /// Keys that kept or fell back to a local value because they could not be merged
    pub degraded_keys: Vec<String>,
    pub policy_mismatches: Vec<String>,
    /// Whether the cloud copy differs from the merged snapshot
    pub remote_stale: bool,
    /// Whether the merged snapshot was pushed to the cloud
    pub uploaded: bool,
    pub stats: MergeStats,
}

/// A fresh random device identifier.
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

/// Owns the local snapshot and runs merge cycles for one player.
pub struct SyncEngine<T: CloudTransport, C: LocalCache> {
    registry: Registry,
    transport: T,
    cache: C,
    device_id: String,
    snapshot: Snapshot,
    dirty: bool,
    phase: SyncPhase,
}

impl<T: CloudTransport, C: LocalCache> SyncEngine<T, C> {
    /// Create an engine whose snapshot holds every declaration at its default.
    pub fn new(
        registry: Registry,
        transport: T,
        cache: C,
        device_id: impl Into<String>,
    ) -> SyncResult<Self> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(SyncError::General("device ID must not be empty".to_string()));
        }

        let snapshot = registry.default_snapshot()?;
        Ok(Self {
            registry,
            transport,
            cache,
            device_id,
            snapshot,
            dirty: false,
            phase: SyncPhase::Idle,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Whether the snapshot has changes not yet written to the local cache.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn storage_key(&self) -> String {
        self.registry.storage_key().to_string()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Local cache
    // ═══════════════════════════════════════════════════════════════════════════

    /// Replace the local snapshot with the cached one.
    ///
    /// Returns false if nothing is cached. A cached document that cannot be
    /// decoded leaves the current snapshot untouched.
    pub fn load_from_cache(&mut self) -> SyncResult<bool> {
        let Some(document) = self.cache.read(&self.storage_key())? else {
            debug!("No local cache");
            return Ok(false);
        };

        let decoded = decode_snapshot_with_report(&document)?;
        let mut snapshot = decoded.snapshot;
        self.registry.materialize(&mut snapshot)?;
        let sanitized = self.registry.sanitize_values(&mut snapshot)?;

        self.dirty = !decoded.degraded_keys.is_empty()
            || !sanitized.is_empty()
            || snapshot.version != SCHEMA_VERSION;
        snapshot.version = SCHEMA_VERSION;
        self.snapshot = snapshot;

        info!(keys = self.snapshot.all_keys().len(), "Loaded snapshot from local cache");
        Ok(true)
    }

    /// Write the snapshot to the local cache if it has unsaved changes.
    /// Returns whether anything was written.
    pub fn save_to_cache(&mut self) -> SyncResult<bool> {
        if !self.dirty {
            return Ok(false);
        }

        let document = encode_snapshot(&self.snapshot)?;
        self.cache.write(&self.storage_key(), &document)?;
        self.dirty = false;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Merge cycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start a merge cycle and return a copy of the local snapshot to merge.
    ///
    /// Hosts that merge off their main thread call this, run
    /// `merge_snapshot` themselves and hand the result to `finish_cycle`.
    pub fn begin_cycle(&mut self) -> SyncResult<Snapshot> {
        if self.phase == SyncPhase::Merging {
            return Err(SyncError::MergeInProgress);
        }
        self.phase = SyncPhase::Merging;
        Ok(self.snapshot.clone())
    }

    /// Abandon the running cycle. The local snapshot is left as it was.
    pub fn abort_cycle(&mut self) {
        if self.phase == SyncPhase::Merging {
            self.phase = SyncPhase::Idle;
        }
    }

    /// Apply the result of a merge started with `begin_cycle`.
    pub fn finish_cycle(&mut self, merge: SnapshotMerge) -> SyncResult<SyncOutcome> {
        if self.phase != SyncPhase::Merging {
            return Err(SyncError::General("no merge cycle in progress".to_string()));
        }

        let mut snapshot = merge.snapshot;
        let applied = self
            .registry
            .materialize(&mut snapshot)
            .and_then(|_| self.registry.sanitize_values(&mut snapshot));
        let sanitized = match applied {
            Ok(sanitized) => sanitized,
            Err(err) => {
                self.abort_cycle();
                return Err(err);
            }
        };

        let mut degraded_keys = merge.degraded_keys;
        extend_unique(&mut degraded_keys, sanitized);

        let changed = snapshot != self.snapshot;
        if changed {
            self.snapshot = snapshot;
            self.dirty = true;
        }
        self.phase = SyncPhase::Complete;

        Ok(SyncOutcome {
            changed,
            changed_keys: merge.changed_keys,
            degraded_keys,
            policy_mismatches: merge.policy_mismatches,
            remote_stale: false,
            uploaded: false,
            stats: merge.stats,
        })
    }

    /// Merge a remote document into the local snapshot. Performs no I/O.
    ///
    /// On error the cycle is aborted and the local snapshot is unchanged.
    pub fn merge_remote(&mut self, document: &str) -> SyncResult<SyncOutcome> {
        let local = self.begin_cycle()?;

        let merged = decode_snapshot_with_report(document).and_then(|remote| {
            let mut merge = merge_snapshot(&local, &remote.snapshot)?;
            extend_unique(&mut merge.degraded_keys, remote.degraded_keys);
            Ok((remote.snapshot, merge))
        });
        let (remote, merge) = match merged {
            Ok(merged) => merged,
            Err(err) => {
                warn!(error = %err, "Merge cycle aborted");
                self.abort_cycle();
                return Err(err);
            }
        };

        let mut outcome = self.finish_cycle(merge)?;
        outcome.remote_stale = remote != self.snapshot;

        debug!(
            changed = outcome.changed,
            remote_stale = outcome.remote_stale,
            degraded = outcome.degraded_keys.len(),
            "Merge cycle complete"
        );
        Ok(outcome)
    }

    /// Fetch the cloud document, merge it, then persist and push back as needed.
    ///
    /// Without a cloud document the local snapshot is uploaded as is.
    pub fn sync(&mut self) -> SyncResult<SyncOutcome> {
        match self.transport.fetch(&self.storage_key())? {
            Some(document) => self.reconcile(&document),
            None => {
                info!("No cloud data, uploading local snapshot");
                self.save_to_cache()?;
                self.upload()?;
                self.phase = SyncPhase::Complete;
                Ok(SyncOutcome {
                    remote_stale: true,
                    uploaded: true,
                    ..SyncOutcome::default()
                })
            }
        }
    }

    fn reconcile(&mut self, document: &str) -> SyncResult<SyncOutcome> {
        let mut outcome = self.merge_remote(document)?;
        self.save_to_cache()?;
        if outcome.remote_stale {
            self.upload()?;
            outcome.uploaded = true;
        }
        Ok(outcome)
    }

    /// Replace the local snapshot with a remote document, discarding local data.
    ///
    /// Used when the signed-in account changes. An absent or empty document
    /// resets everything to the declared defaults.
    pub fn replace_local_with(&mut self, document: Option<&str>) -> SyncResult<SyncOutcome> {
        let decoded = decode_snapshot_with_report(document.unwrap_or_default())?;
        let mut snapshot = decoded.snapshot;
        let mut degraded_keys = decoded.degraded_keys;
        self.registry.materialize(&mut snapshot)?;
        extend_unique(&mut degraded_keys, self.registry.sanitize_values(&mut snapshot)?);
        snapshot.version = SCHEMA_VERSION;

        let changed_keys = snapshot.all_keys();
        self.snapshot = snapshot;
        self.dirty = true;
        self.phase = SyncPhase::Complete;
        self.save_to_cache()?;

        info!(keys = changed_keys.len(), "Replaced local snapshot");
        Ok(SyncOutcome {
            changed: true,
            changed_keys,
            degraded_keys,
            ..SyncOutcome::default()
        })
    }

    /// Handle a change notification from the cloud store.
    ///
    /// `document` is the new cloud document if the notification carried one;
    /// otherwise it is fetched. Returns `None` when nothing was applied.
    pub fn on_external_change(
        &mut self,
        reason: ChangeReason,
        document: Option<&str>,
    ) -> SyncResult<Option<SyncOutcome>> {
        info!(%reason, "External change");

        if reason == ChangeReason::QuotaViolationChange {
            warn!("Cloud store is over quota, ignoring change notification");
            return Ok(None);
        }

        let document = match document {
            Some(document) => Some(document.to_string()),
            None => self.transport.fetch(&self.storage_key())?,
        };

        if reason == ChangeReason::AccountChange {
            return self.replace_local_with(document.as_deref()).map(Some);
        }

        match document {
            Some(document) => self.reconcile(&document).map(Some),
            None => Ok(None),
        }
    }

    /// Push the local snapshot to the cloud.
    pub fn upload(&mut self) -> SyncResult<()> {
        let document = encode_snapshot(&self.snapshot)?;
        self.transport.store(&self.storage_key(), &document)?;
        debug!(bytes = document.len(), "Uploaded snapshot");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Variables
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current value of a declared variable.
    ///
    /// A stored value that does not parse yields the declared default.
    pub fn get(&self, key: &str) -> SyncResult<TypedValue> {
        let declaration = self
            .registry
            .variable(key)
            .ok_or_else(|| SyncError::UnknownKey(key.to_string()))?;

        match self.snapshot.variables.get(key) {
            Some(record) => record.typed_value().or_else(|err| {
                warn!(key, error = %err, "Unreadable value, using default");
                declaration.default_typed()
            }),
            None => declaration.default_typed(),
        }
    }

    /// Write a declared variable.
    ///
    /// Highest and Lowest variables only accept an improvement. Returns
    /// whether the value was stored.
    pub fn set(&mut self, key: &str, value: TypedValue) -> SyncResult<bool> {
        let declaration = self
            .registry
            .variable(key)
            .ok_or_else(|| SyncError::UnknownKey(key.to_string()))?;
        if value.data_type() != declaration.data_type {
            return Err(SyncError::TypeMismatch {
                key: key.to_string(),
                declared: declaration.data_type,
                requested: value.data_type(),
            });
        }

        if !self.snapshot.variables.contains_key(key) {
            self.snapshot.insert_variable(declaration.default_record()?);
        }
        let Some(record) = self.snapshot.variables.get_mut(key) else {
            return Err(SyncError::UnknownKey(key.to_string()));
        };

        if record.value == value.encode() || !record.accepts(&value) {
            return Ok(false);
        }

        record.set_value_at(&value, Utc::now())?;
        self.dirty = true;
        Ok(true)
    }

    /// Remove a key from the snapshot. Declared variables and currencies
    /// return to their defaults.
    pub fn delete_variable(&mut self, key: &str) -> SyncResult<bool> {
        if !self.snapshot.remove(key) {
            return Ok(false);
        }
        self.registry.materialize(&mut self.snapshot)?;
        self.dirty = true;
        Ok(true)
    }

    /// Remove every stored key that nothing declares. Returns the removed keys.
    pub fn clear_stowaways(&mut self) -> Vec<String> {
        let stowaways = self.registry.stowaway_keys(&self.snapshot);
        for key in &stowaways {
            self.snapshot.remove(key);
        }
        if !stowaways.is_empty() {
            info!(count = stowaways.len(), "Removed undeclared keys");
            self.dirty = true;
        }
        stowaways
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.snapshot.all_keys()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Currencies
    // ═══════════════════════════════════════════════════════════════════════════

    fn currency_declaration(&self, id: &str) -> SyncResult<CurrencyDeclaration> {
        self.registry
            .currency(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownKey(id.to_string()))
    }

    /// Balance of a declared currency, including its default.
    /// Clamped at zero unless negative balances are allowed.
    pub fn currency_balance(&self, id: &str) -> SyncResult<i64> {
        let declaration = self.currency_declaration(id)?;
        let stored = self
            .snapshot
            .currencies
            .get(id)
            .map(|ledger| ledger.effective_balance())
            .unwrap_or(0);

        let balance = stored.saturating_add(declaration.default_value);
        Ok(if declaration.allow_negative { balance } else { balance.max(0) })
    }

    pub fn add_currency(&mut self, id: &str, amount: i64) -> SyncResult<i64> {
        self.currency_declaration(id)?;
        let device_id = self.device_id.clone();
        self.snapshot
            .currencies
            .entry(id.to_string())
            .or_insert_with(|| CurrencyLedger::new(id))
            .add(&device_id, amount);
        self.dirty = true;
        self.currency_balance(id)
    }

    pub fn subtract_currency(&mut self, id: &str, amount: i64) -> SyncResult<i64> {
        self.currency_declaration(id)?;
        let device_id = self.device_id.clone();
        self.snapshot
            .currencies
            .entry(id.to_string())
            .or_insert_with(|| CurrencyLedger::new(id))
            .subtract(&device_id, amount);
        self.dirty = true;
        self.currency_balance(id)
    }

    /// Set the balance to `target` by recording the difference on this device.
    pub fn set_currency_balance(&mut self, id: &str, target: i64) -> SyncResult<i64> {
        let declaration = self.currency_declaration(id)?;
        let device_id = self.device_id.clone();
        let balance = self
            .snapshot
            .currencies
            .entry(id.to_string())
            .or_insert_with(|| CurrencyLedger::new(id))
            .set_balance(
                &device_id,
                target,
                declaration.default_value,
                declaration.allow_negative,
            );
        self.dirty = true;
        Ok(balance)
    }

    /// Zero every device's counters, returning the balance to its default.
    pub fn reset_currency(&mut self, id: &str) -> SyncResult<()> {
        self.currency_declaration(id)?;
        if let Some(ledger) = self.snapshot.currencies.get_mut(id) {
            ledger.reset();
            self.dirty = true;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reset and delete
    // ═══════════════════════════════════════════════════════════════════════════

    /// Return every declared variable and currency to its default.
    ///
    /// Latest variables get a fresh timestamp so the reset reaches other
    /// devices on the next sync.
    pub fn reset_all(&mut self) -> SyncResult<()> {
        let now = truncate_to_millis(Utc::now());
        for declaration in self.registry.variables() {
            let mut record = declaration.default_record()?;
            if record.merge_policy == MergePolicy::Latest {
                record.last_modified = Some(now);
            }
            self.snapshot.insert_variable(record);
        }
        for declaration in self.registry.currencies() {
            if let Some(ledger) = self.snapshot.currencies.get_mut(&declaration.id) {
                ledger.reset();
            }
        }
        self.dirty = true;
        info!("Reset all cloud data to defaults");
        Ok(())
    }

    /// Delete the cloud document and the local cache, and start over from the
    /// declared defaults. Undeclared keys are dropped.
    pub fn delete_all(&mut self) -> SyncResult<()> {
        let key = self.storage_key();
        self.transport.delete(&key)?;
        self.cache.clear(&key)?;
        self.snapshot = self.registry.default_snapshot()?;
        self.dirty = false;
        self.phase = SyncPhase::Idle;
        info!("Deleted all cloud data");
        Ok(())
    }
}
