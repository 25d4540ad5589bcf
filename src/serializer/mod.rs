//! Alias-tolerant object serializer.
//!
//! Persisted documents are JSON object-of-objects. Each logical field has a
//! short current alias that every write uses, plus any number of legacy
//! aliases it was stored under in older versions. Reads try the current alias
//! first, then the legacy aliases in declaration order. Because writes always
//! use the current alias, old data is upgraded on its first read-write cycle
//! and never downgraded.

use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// A decoded document: field names mapped to JSON values.
pub type FieldTree = Map<String, Value>;

/// Declaration of one logical field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Alias used for all new writes
    pub alias: &'static str,
    /// Prior names this field was stored under, in lookup order
    pub legacy_aliases: &'static [&'static str],
    /// Value used when no alias is present. Fields without one are required.
    pub default: Option<fn() -> Value>,
}

impl FieldSpec {
    pub const fn new(alias: &'static str) -> Self {
        Self {
            alias,
            legacy_aliases: &[],
            default: None,
        }
    }

    pub const fn with_legacy(mut self, aliases: &'static [&'static str]) -> Self {
        self.legacy_aliases = aliases;
        self
    }

    pub const fn with_default(mut self, default: fn() -> Value) -> Self {
        self.default = Some(default);
        self
    }

    /// All aliases in lookup order, current alias first.
    pub fn aliases(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.alias).chain(self.legacy_aliases.iter().copied())
    }

    /// Find the field under the first alias present in `tree`.
    pub fn resolve<'a>(&self, tree: &'a FieldTree) -> Option<(&'static str, &'a Value)> {
        self.aliases()
            .find_map(|alias| tree.get(alias).map(|value| (alias, value)))
    }

    /// Read the field, falling back to the default.
    /// Fails when no alias is present and the field has no default.
    pub fn read(&self, tree: &FieldTree, owner: &str) -> SyncResult<Value> {
        if let Some((_, value)) = self.resolve(tree) {
            return Ok(value.clone());
        }

        match self.default {
            Some(default) => Ok(default()),
            None => Err(SyncError::Deserialization {
                owner: owner.to_string(),
                alias: self.alias.to_string(),
            }),
        }
    }
}

/// Default for fields holding a nested object.
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Parse a document into its top-level field tree.
pub fn parse_document(document: &str) -> SyncResult<FieldTree> {
    let value: Value = serde_json::from_str(document)?;
    match value {
        Value::Object(tree) => Ok(tree),
        other => Err(SyncError::JsonError(format!(
            "Expected a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

/// Write a field tree as a compact document.
pub fn write_document(tree: &FieldTree) -> SyncResult<String> {
    Ok(serde_json::to_string(tree)?)
}

/// Decode `tree` against `specs`, returning a tree keyed only by current aliases.
///
/// Fields not named in `specs` are dropped.
pub fn decode_fields(tree: &FieldTree, specs: &[FieldSpec], owner: &str) -> SyncResult<FieldTree> {
    let mut decoded = FieldTree::new();
    for spec in specs {
        decoded.insert(spec.alias.to_string(), spec.read(tree, owner)?);
    }
    Ok(decoded)
}

/// View a nested field as an object.
pub fn as_object<'a>(value: &'a Value, owner: &str) -> SyncResult<&'a FieldTree> {
    value.as_object().ok_or_else(|| {
        SyncError::JsonError(format!(
            "{}: expected a JSON object, found {}",
            owner,
            json_kind(value)
        ))
    })
}

/// Read a scalar field as text. Numbers and booleans are stringified.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
