//! Upgrade of the pre-versioning platform ID record.
//!
//! Before documents were versioned, the player's platform identities were
//! stored as one flat string `internalId,appleId,googleId`. This adapter reads
//! that string once and lifts it into a field tree; nothing ever writes the
//! flat form again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::serializer::{as_text, decode_fields, FieldSpec, FieldTree};

const INTERNAL_ID: FieldSpec = FieldSpec::new("InternalID");
const APPLE_ID: FieldSpec = FieldSpec::new("AppleID");
const GOOGLE_ID: FieldSpec = FieldSpec::new("GoogleID");

const PLATFORM_ID_FIELDS: [FieldSpec; 3] = [INTERNAL_ID, APPLE_ID, GOOGLE_ID];

/// The player's identities on each platform. Empty when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "uniffi", derive(uniffi::Record))]
pub struct PlatformIds {
    pub internal_id: String,
    pub apple_id: String,
    pub google_id: String,
}

impl PlatformIds {
    pub fn to_field_tree(&self) -> FieldTree {
        let mut tree = FieldTree::new();
        tree.insert(INTERNAL_ID.alias.to_string(), Value::String(self.internal_id.clone()));
        tree.insert(APPLE_ID.alias.to_string(), Value::String(self.apple_id.clone()));
        tree.insert(GOOGLE_ID.alias.to_string(), Value::String(self.google_id.clone()));
        tree
    }

    pub fn from_field_tree(tree: &FieldTree) -> SyncResult<Self> {
        let fields = decode_fields(tree, &PLATFORM_ID_FIELDS, "PlatformIds")?;
        let text = |spec: &FieldSpec| -> SyncResult<String> {
            fields
                .get(spec.alias)
                .and_then(as_text)
                .ok_or_else(|| SyncError::JsonError(format!("PlatformIds: invalid {}", spec.alias)))
        };

        Ok(Self {
            internal_id: text(&INTERNAL_ID)?,
            apple_id: text(&APPLE_ID)?,
            google_id: text(&GOOGLE_ID)?,
        })
    }
}

/// Parse the flat `internalId,appleId,googleId` string.
///
/// Exactly three comma-separated parts are required; any of them may be empty.
pub fn upgrade_legacy_format(flat: &str) -> SyncResult<PlatformIds> {
    let parts: Vec<&str> = flat.split(',').collect();
    let [internal_id, apple_id, google_id] = parts.as_slice() else {
        return Err(SyncError::General(format!(
            "Legacy platform ID record must have 3 parts, found {}",
            parts.len()
        )));
    };

    debug!("Upgraded legacy platform ID record");

    Ok(PlatformIds {
        internal_id: internal_id.trim().to_string(),
        apple_id: apple_id.trim().to_string(),
        google_id: google_id.trim().to_string(),
    })
}

/// JSON wrapper for the bindings: flat string in, field tree document out.
pub fn upgrade_legacy_format_json(flat: &str) -> SyncResult<String> {
    let ids = upgrade_legacy_format(flat)?;
    Ok(serde_json::to_string(&ids.to_field_tree())?)
}
