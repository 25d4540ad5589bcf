//! C FFI exports for P/Invoke hosts (game engines, .NET).
//!
//! All functions take and return JSON (or plain) strings to keep marshalling
//! trivial. Every returned pointer must be released with `free_string`.

use serde_json::json;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

use crate::legacy::upgrade_legacy_format_json;
use crate::snapshot::{merge_documents, MergeInput};

/// Merge a local and a remote snapshot document.
///
/// # Safety
///
/// - `input_json` must be a valid null-terminated C string holding a
///   `{"local": "...", "remote": "..."}` object
/// - The returned pointer must be freed by calling `free_string`
///
/// # Returns
///
/// A null-terminated C string containing the JSON result (MergeOutput), or
/// `{"success": false, "error": "..."}`. Returns null on a null or non-UTF-8 input.
#[no_mangle]
pub unsafe extern "C" fn merge_snapshots_ffi(input_json: *const c_char) -> *mut c_char {
    let Some(c_str) = read_c_str(input_json) else {
        return ptr::null_mut();
    };

    let input: MergeInput = match serde_json::from_str(c_str) {
        Ok(i) => i,
        Err(e) => {
            return create_error_response(&format!("Failed to parse input: {}", e));
        }
    };

    let output = match merge_documents(input) {
        Ok(o) => o,
        Err(e) => {
            return create_error_response(&format!("Merge failed: {}", e));
        }
    };

    match serde_json::to_string(&output) {
        Ok(json) => string_to_c_char(json),
        Err(e) => create_error_response(&format!("Failed to serialize output: {}", e)),
    }
}

/// Upgrade a flat `internalId,appleId,googleId` record.
///
/// # Safety
///
/// - `flat` must be a valid null-terminated C string
/// - The returned pointer must be freed by calling `free_string`
///
/// # Returns
///
/// A null-terminated C string containing the field tree document, or an
/// error response. Returns null on a null or non-UTF-8 input.
#[no_mangle]
pub unsafe extern "C" fn upgrade_legacy_format_ffi(flat: *const c_char) -> *mut c_char {
    let Some(c_str) = read_c_str(flat) else {
        return ptr::null_mut();
    };

    match upgrade_legacy_format_json(c_str) {
        Ok(json) => string_to_c_char(json),
        Err(e) => create_error_response(&format!("Upgrade failed: {}", e)),
    }
}

/// Get the library version.
///
/// The returned pointer must be freed by calling `free_string`.
#[no_mangle]
pub extern "C" fn get_core_version_ffi() -> *mut c_char {
    string_to_c_char(crate::get_core_version().to_string())
}

/// Free a string that was allocated by Rust.
///
/// # Safety
///
/// - `s` must be a pointer that was returned by one of the FFI functions
/// - This function must only be called once per pointer
/// - After calling this function, the pointer is invalid
#[no_mangle]
pub unsafe extern "C" fn free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// # Safety
///
/// `s` must be null or a valid null-terminated C string.
unsafe fn read_c_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

/// Convert a Rust string to a C string pointer.
fn string_to_c_char(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c_string) => c_string.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn create_error_response(message: &str) -> *mut c_char {
    string_to_c_char(json!({"success": false, "error": message}).to_string())
}
