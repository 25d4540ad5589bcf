//! WASM bindings for WebGL players.

use wasm_bindgen::prelude::*;

use crate::legacy::{upgrade_legacy_format, PlatformIds};
use crate::snapshot::{merge_documents, MergeInput, MergeOutput};

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    pub fn log(s: &str);
}

/// Initialize panic hook for better error messages.
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Get the library version.
#[wasm_bindgen(js_name = getCoreVersion)]
pub fn get_core_version_js() -> String {
    crate::get_core_version().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot Merge WASM Bindings
// ═══════════════════════════════════════════════════════════════════════════════

/// Merge a local and a remote snapshot document.
///
/// Takes a JsValue (MergeInput) and returns a JsValue (MergeOutput).
#[wasm_bindgen(js_name = mergeSnapshots)]
pub fn merge_snapshots_js(input: JsValue) -> Result<JsValue, JsValue> {
    let input: MergeInput = serde_wasm_bindgen::from_value(input)
        .map_err(|e| JsValue::from_str(&format!("Failed to parse input: {}", e)))?;

    let output: MergeOutput = merge_documents(input)
        .map_err(|e| JsValue::from_str(&format!("Merge failed: {}", e)))?;

    serde_wasm_bindgen::to_value(&output)
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize output: {}", e)))
}

/// Merge snapshots using JSON strings (alternative API).
#[wasm_bindgen(js_name = mergeSnapshotsJson)]
pub fn merge_snapshots_json_js(input_json: &str) -> Result<String, JsValue> {
    crate::snapshot::merge_snapshots_json(input_json)
        .map_err(|e| JsValue::from_str(&format!("Merge failed: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Legacy Upgrade WASM Bindings
// ═══════════════════════════════════════════════════════════════════════════════

/// Upgrade a flat `internalId,appleId,googleId` record.
///
/// Returns a JsValue (PlatformIds).
#[wasm_bindgen(js_name = upgradeLegacyFormat)]
pub fn upgrade_legacy_format_js(flat: &str) -> Result<JsValue, JsValue> {
    let ids: PlatformIds = upgrade_legacy_format(flat)
        .map_err(|e| JsValue::from_str(&format!("Upgrade failed: {}", e)))?;

    serde_wasm_bindgen::to_value(&ids)
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize output: {}", e)))
}
