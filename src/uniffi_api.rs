//! UniFFI API module for Swift and Kotlin bindings.
//!
//! This module exposes the document-level operations via UniFFI for mobile
//! platforms. Documents cross the boundary as JSON strings.

use crate::error::SyncError;
use crate::legacy::PlatformIds;

/// Get the version of the cloudsave-core library.
#[uniffi::export]
pub fn get_core_version() -> String {
    crate::get_core_version().to_string()
}

/// Schema version of the documents this library writes.
#[uniffi::export]
pub fn get_schema_version() -> u32 {
    crate::snapshot::SCHEMA_VERSION
}

/// Merge a local and a remote snapshot document.
///
/// # Arguments
/// * `input_json` - JSON string with format:
///   ```json
///   {"local": "<snapshot document>", "remote": "<snapshot document>"}
///   ```
///
/// # Returns
/// JSON string with format:
///   ```json
///   {
///     "success": true,
///     "snapshot": "<merged snapshot document>",
///     "changed": true,
///     "changed_keys": ["gems"],
///     "degraded_keys": [],
///     "policy_mismatches": [],
///     "stats": {"variables_merged": 0, "currencies_merged": 1, ...}
///   }
///   ```
#[uniffi::export]
pub fn merge_snapshots_json(input_json: String) -> Result<String, SyncError> {
    crate::snapshot::merge_snapshots_json(&input_json)
}

/// Upgrade a flat `internalId,appleId,googleId` record.
#[uniffi::export]
pub fn upgrade_legacy_format(flat: String) -> Result<PlatformIds, SyncError> {
    crate::legacy::upgrade_legacy_format(&flat)
}
