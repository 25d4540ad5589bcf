//! CloudSave Core Library
//!
//! Cross-platform synchronization engine for cloud-saved game data:
//! - **codec**: canonical string encoding of typed variable values
//! - **serializer**: alias-tolerant field trees, so older documents stay readable
//! - **currency**: per-device currency ledgers with a conflict-free merge
//! - **variable**: cloud variables reconciled by Latest/Highest/Lowest policies
//! - **snapshot**: whole-snapshot encode, decode and merge
//! - **registry**: declarations of every variable and currency, loaded from JSON
//! - **sync**: the orchestrator that drives merge cycles over an injected
//!   cloud transport and local cache
//! - **legacy**: one-shot upgrade of the flat platform ID record
//!
//! Merging is a pure function of two documents. Platforms that do their own
//! I/O can call `merge_snapshots_json` directly; hosts that want the full
//! cycle implement `CloudTransport` and `LocalCache` and drive a `SyncEngine`.
//!
//! # Example (conceptual)
//! ```ignore
//! let registry = Registry::from_json(&read_config())?;
//! let mut engine = SyncEngine::new(registry, transport, FileCache::new(save_dir), device_id)?;
//! engine.load_from_cache()?;
//! engine.add_currency("gems", 50)?;
//! let outcome = engine.sync()?;
//! if outcome.changed {
//!     refresh_ui(&outcome.changed_keys);
//! }
//! ```

pub mod codec;
pub mod currency;
pub mod error;
pub mod legacy;
pub mod registry;
pub mod serializer;
pub mod snapshot;
pub mod sync;
pub mod variable;

pub use codec::{decode, encode, DataType, TypedValue};
pub use currency::{merge_currency, CurrencyLedger, CurrencyValue};
pub use error::{SyncError, SyncResult};
pub use legacy::{upgrade_legacy_format, upgrade_legacy_format_json, PlatformIds};
pub use registry::{CurrencyDeclaration, Registry, RegistryConfig, VariableDeclaration};
pub use snapshot::{
    decode_snapshot, decode_snapshot_with_report, encode_snapshot, merge_documents,
    merge_snapshot, merge_snapshots_json, DecodedSnapshot, MergeInput, MergeOutput, MergeStats,
    Snapshot, SnapshotMerge, SCHEMA_VERSION,
};
pub use sync::{
    generate_device_id, ChangeReason, CloudTransport, FileCache, LocalCache, SyncEngine,
    SyncOutcome, SyncPhase,
};
pub use variable::{merge_variable, CloudVariableRecord, MergePolicy};

/// Version of this library.
pub fn get_core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// WASM bindings
#[cfg(feature = "wasm")]
pub mod wasm;

#[cfg(feature = "wasm")]
pub use wasm::*;

// C FFI exports for P/Invoke hosts
#[cfg(feature = "ffi")]
pub mod ffi;

// UniFFI bindings for Swift/Kotlin
#[cfg(feature = "uniffi")]
pub mod uniffi_api;

// UniFFI scaffolding - generates the FFI glue code
#[cfg(feature = "uniffi")]
uniffi::setup_scaffolding!();
