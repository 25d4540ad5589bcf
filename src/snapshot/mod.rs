//! Snapshot model and whole-snapshot merge.
//!
//! A snapshot holds every cloud variable and currency ledger of one player.
//! Merging is a pure function of (local, remote): each matching variable goes
//! through the variable reconciler, each matching ledger through the currency
//! merge, remote-only entries are adopted and local-only entries are kept.
//!
//! This module also provides the JSON-string entry point used by the platform
//! bindings, mirroring how the cloud transport hands over raw documents.


use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::currency::{merge_currency, CurrencyLedger};
use crate::error::{SyncError, SyncResult};
use crate::serializer::{as_object, empty_object, parse_document, write_document, FieldSpec, FieldTree};
use crate::variable::{merge_variable, CloudVariableRecord};

/// Schema version written by this library.
pub const SCHEMA_VERSION: u32 = 2;

/// Documents written before versioning carry no version field.
const UNVERSIONED: u32 = 1;

fn unversioned() -> Value {
    json!(UNVERSIONED)
}

const SNAPSHOT_VERSION: FieldSpec = FieldSpec::new("ver").with_default(unversioned);
const SNAPSHOT_VARIABLES: FieldSpec = FieldSpec::new("i")
    .with_legacy(&["SIs"])
    .with_default(empty_object);
const SNAPSHOT_CURRENCIES: FieldSpec = FieldSpec::new("c")
    .with_legacy(&["SCs"])
    .with_default(empty_object);

/// The complete persisted state of one player.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Schema version the snapshot was read with
    pub version: u32,
    /// Cloud variables keyed by variable key
    pub variables: BTreeMap<String, CloudVariableRecord>,
    /// Currency ledgers keyed by currency ID
    pub currencies: BTreeMap<String, CurrencyLedger>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            variables: BTreeMap::new(),
            currencies: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_variable(&mut self, record: CloudVariableRecord) {
        self.variables.insert(record.key.clone(), record);
    }

    pub fn insert_currency(&mut self, ledger: CurrencyLedger) {
        self.currencies.insert(ledger.currency_id.clone(), ledger);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.variables.contains_key(key) || self.currencies.contains_key(key)
    }

    /// Remove a variable or currency. Returns true if anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.variables.remove(key).is_some() || self.currencies.remove(key).is_some()
    }

    /// Variable keys followed by currency IDs.
    pub fn all_keys(&self) -> Vec<String> {
        self.variables
            .keys()
            .chain(self.currencies.keys())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.currencies.is_empty()
    }

    pub fn to_tree(&self) -> FieldTree {
        let variables: FieldTree = self
            .variables
            .iter()
            .map(|(key, record)| (key.clone(), record.to_tree()))
            .collect();
        let currencies: FieldTree = self
            .currencies
            .iter()
            .map(|(id, ledger)| (id.clone(), ledger.to_tree()))
            .collect();

        let mut tree = FieldTree::new();
        tree.insert(SNAPSHOT_VERSION.alias.to_string(), json!(SCHEMA_VERSION));
        tree.insert(SNAPSHOT_VARIABLES.alias.to_string(), Value::Object(variables));
        tree.insert(SNAPSHOT_CURRENCIES.alias.to_string(), Value::Object(currencies));
        tree
    }

    pub fn from_tree(tree: &FieldTree) -> SyncResult<Self> {
        Self::read_tree(tree).map(|decoded| decoded.snapshot)
    }

    /// Read a snapshot, recovering from problems in single entries.
    ///
    /// A variable record whose value, codes or timestamp cannot be read is
    /// skipped. A currency counter that cannot be read counts as 0. Both are
    /// reported in `degraded_keys`. A missing required field still fails the
    /// whole document.
    pub fn read_tree(tree: &FieldTree) -> SyncResult<DecodedSnapshot> {
        let version_value = SNAPSHOT_VERSION.read(tree, "Snapshot")?;
        let version = version_value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| SyncError::JsonError(format!("Invalid snapshot version: {}", version_value)))?;
        if version > SCHEMA_VERSION {
            warn!(version, supported = SCHEMA_VERSION, "Snapshot written by a newer schema");
        }

        let mut snapshot = Snapshot {
            version,
            ..Snapshot::default()
        };
        let mut degraded_keys = Vec::new();

        let variables_value = SNAPSHOT_VARIABLES.read(tree, "Snapshot")?;
        for (key, value) in as_object(&variables_value, "Snapshot")? {
            match CloudVariableRecord::from_tree(key, value) {
                Ok(record) => {
                    snapshot.variables.insert(key.clone(), record);
                }
                Err(err @ SyncError::Deserialization { .. }) => return Err(err),
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping unreadable variable record");
                    degraded_keys.push(key.clone());
                }
            }
        }

        let currencies_value = SNAPSHOT_CURRENCIES.read(tree, "Snapshot")?;
        for (id, value) in as_object(&currencies_value, "Snapshot")? {
            match CurrencyLedger::read_tree(value) {
                Ok((ledger, recovered)) => {
                    if recovered {
                        degraded_keys.push(id.clone());
                    }
                    snapshot.currencies.insert(id.clone(), ledger);
                }
                Err(err @ SyncError::Deserialization { .. }) => return Err(err),
                Err(err) => {
                    warn!(currency = %id, error = %err, "Skipping unreadable currency ledger");
                    degraded_keys.push(id.clone());
                }
            }
        }

        Ok(DecodedSnapshot {
            snapshot,
            degraded_keys,
        })
    }
}

/// A decoded snapshot with the keys that had to be recovered while reading it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedSnapshot {
    pub snapshot: Snapshot,
    /// Keys that were skipped or had counters read as 0
    pub degraded_keys: Vec<String>,
}

/// Serialize a snapshot into a document. Always writes current aliases.
pub fn encode_snapshot(snapshot: &Snapshot) -> SyncResult<String> {
    write_document(&snapshot.to_tree())
}

/// Decode a document into a snapshot. An empty document is an empty snapshot.
pub fn decode_snapshot(document: &str) -> SyncResult<Snapshot> {
    decode_snapshot_with_report(document).map(|decoded| decoded.snapshot)
}

/// Decode a document and report the keys recovered along the way.
pub fn decode_snapshot_with_report(document: &str) -> SyncResult<DecodedSnapshot> {
    if document.trim().is_empty() {
        return Ok(DecodedSnapshot::default());
    }
    Snapshot::read_tree(&parse_document(document)?)
}

/// Append the keys not already present in `target`.
pub(crate) fn extend_unique(target: &mut Vec<String>, keys: impl IntoIterator<Item = String>) {
    for key in keys {
        if !target.contains(&key) {
            target.push(key);
        }
    }
}

/// Statistics about what was merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "uniffi", derive(uniffi::Record))]
pub struct MergeStats {
    /// Variables present on both sides
    pub variables_merged: u32,
    /// Variables only present remotely (adopted verbatim)
    pub variables_adopted: u32,
    /// Variables only present locally
    pub variables_local_only: u32,
    /// Currencies present on both sides
    pub currencies_merged: u32,
    /// Currencies only present remotely (adopted verbatim)
    pub currencies_adopted: u32,
    /// Currencies only present locally
    pub currencies_local_only: u32,
}

/// Result of merging two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMerge {
    /// The merged snapshot
    pub snapshot: Snapshot,
    /// Whether anything differs from the local snapshot
    pub changed: bool,
    /// Keys whose local value changed
    pub changed_keys: Vec<String>,
    /// Keys that could not be merged and kept their local value
    pub degraded_keys: Vec<String>,
    /// Keys stored remotely under a different merge policy
    pub policy_mismatches: Vec<String>,
    pub stats: MergeStats,
}

/// Merge a local snapshot with a remote one.
///
/// Recoverable problems with single variables are reported in
/// `degraded_keys` and never stop the merge. Two ledgers with different
/// currency IDs abort the whole merge; `local` is never modified.
pub fn merge_snapshot(local: &Snapshot, remote: &Snapshot) -> SyncResult<SnapshotMerge> {
    let mut merged = Snapshot {
        version: SCHEMA_VERSION,
        ..local.clone()
    };
    let mut stats = MergeStats::default();
    let mut changed_keys = Vec::new();
    let mut degraded_keys = Vec::new();
    let mut policy_mismatches = Vec::new();

    for (key, remote_record) in &remote.variables {
        let Some(local_record) = local.variables.get(key) else {
            merged.variables.insert(key.clone(), remote_record.clone());
            changed_keys.push(key.clone());
            stats.variables_adopted += 1;
            continue;
        };

        stats.variables_merged += 1;
        if local_record.merge_policy != remote_record.merge_policy {
            policy_mismatches.push(key.clone());
        }
        if local_record.data_type != remote_record.data_type {
            degraded_keys.push(key.clone());
        }

        match merge_variable(local_record, remote_record) {
            Ok((record, true)) => {
                merged.variables.insert(key.clone(), record);
                changed_keys.push(key.clone());
            }
            Ok((_, false)) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "Variable could not be merged, keeping local value");
                degraded_keys.push(key.clone());
            }
        }
    }
    stats.variables_local_only = local
        .variables
        .keys()
        .filter(|key| !remote.variables.contains_key(*key))
        .count() as u32;

    for (id, remote_ledger) in &remote.currencies {
        let Some(local_ledger) = local.currencies.get(id) else {
            merged.currencies.insert(id.clone(), remote_ledger.clone());
            changed_keys.push(id.clone());
            stats.currencies_adopted += 1;
            continue;
        };

        stats.currencies_merged += 1;
        let (ledger, changed) = merge_currency(local_ledger, remote_ledger)?;
        if changed {
            merged.currencies.insert(id.clone(), ledger);
            changed_keys.push(id.clone());
        }
    }
    stats.currencies_local_only = local
        .currencies
        .keys()
        .filter(|id| !remote.currencies.contains_key(*id))
        .count() as u32;

    debug!(
        changed = changed_keys.len(),
        degraded = degraded_keys.len(),
        "Merged snapshots"
    );

    Ok(SnapshotMerge {
        snapshot: merged,
        changed: !changed_keys.is_empty(),
        changed_keys,
        degraded_keys,
        policy_mismatches,
        stats,
    })
}

/// Input for the document-level merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeInput {
    /// Local snapshot document
    pub local: String,
    /// Remote snapshot document
    pub remote: String,
}

/// Output of the document-level merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutput {
    /// Whether the merge was successful
    pub success: bool,
    /// Merged snapshot document, to be persisted when `changed` is set
    pub snapshot: String,
    /// Whether the local data changed
    pub changed: bool,
    pub changed_keys: Vec<String>,
    pub degraded_keys: Vec<String>,
    pub policy_mismatches: Vec<String>,
    /// Overall statistics
    pub stats: MergeStats,
}

/// Decode both documents, merge them and re-encode the result.
pub fn merge_documents(input: MergeInput) -> SyncResult<MergeOutput> {
    let local = decode_snapshot_with_report(&input.local)?;
    let remote = decode_snapshot_with_report(&input.remote)?;
    let mut merge = merge_snapshot(&local.snapshot, &remote.snapshot)?;
    extend_unique(&mut merge.degraded_keys, local.degraded_keys);
    extend_unique(&mut merge.degraded_keys, remote.degraded_keys);

    Ok(MergeOutput {
        success: true,
        snapshot: encode_snapshot(&merge.snapshot)?,
        changed: merge.changed,
        changed_keys: merge.changed_keys,
        degraded_keys: merge.degraded_keys,
        policy_mismatches: merge.policy_mismatches,
        stats: merge.stats,
    })
}

/// Merge a JSON string input and return JSON string output.
/// Convenience function for FFI.
pub fn merge_snapshots_json(input_json: &str) -> SyncResult<String> {
    let input: MergeInput = serde_json::from_str(input_json)?;
    let output = merge_documents(input)?;
    let output_json = serde_json::to_string(&output)?;
    Ok(output_json)
}
