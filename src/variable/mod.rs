//! Cloud variable records and their reconciliation.
//!
//! Each variable is declared with one of three merge policies:
//! - **Latest**: the record with the newer `last_modified` wins, ties keep local
//! - **Highest**: the larger value wins
//! - **Lowest**: the smaller value wins
//!
//! Highest and Lowest compare decoded native values, so they are only valid
//! for ordered types (numbers, decimals, timestamps).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::codec::{self, timestamp_from_millis, truncate_to_millis, DataType, TypedValue};
use crate::error::{SyncError, SyncResult};
use crate::serializer::{as_object, as_text, FieldSpec};

const RECORD_VALUE: FieldSpec = FieldSpec::new("v").with_legacy(&["_vs"]);
const RECORD_METADATA: FieldSpec = FieldSpec::new("m").with_legacy(&["_md"]);
const META_DATA_TYPE: FieldSpec = FieldSpec::new("d").with_legacy(&["dT"]);
const META_POLICY: FieldSpec = FieldSpec::new("p").with_legacy(&["pT"]);
const META_TIMESTAMP: FieldSpec = FieldSpec::new("t").with_legacy(&["tS"]);

/// `last_modified` of a Latest record that was never written: 2014-06-30T00:00:00Z.
pub const BASELINE_TIMESTAMP_MILLIS: i64 = 1_404_086_400_000;

pub fn baseline_timestamp() -> DateTime<Utc> {
    timestamp_from_millis(BASELINE_TIMESTAMP_MILLIS).unwrap_or_default()
}

/// Conflict resolution rule for a variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    Latest,
    Highest,
    Lowest,
}

impl MergePolicy {
    /// Persisted numeric code.
    pub const fn code(self) -> i64 {
        match self {
            MergePolicy::Latest => 0,
            MergePolicy::Highest => 1,
            MergePolicy::Lowest => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MergePolicy::Latest),
            1 => Some(MergePolicy::Highest),
            2 => Some(MergePolicy::Lowest),
            _ => None,
        }
    }

    /// Check that this policy can be applied to `data_type`.
    pub fn validate_for(self, key: &str, data_type: DataType) -> SyncResult<()> {
        if self != MergePolicy::Latest && !data_type.is_ordered() {
            return Err(SyncError::UnsupportedPolicy {
                key: key.to_string(),
                policy: self,
                data_type,
            });
        }
        Ok(())
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergePolicy::Latest => "latest",
            MergePolicy::Highest => "highest",
            MergePolicy::Lowest => "lowest",
        })
    }
}

impl FromStr for MergePolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(MergePolicy::Latest),
            "highest" => Ok(MergePolicy::Highest),
            "lowest" => Ok(MergePolicy::Lowest),
            other => Err(SyncError::General(format!("Unknown merge policy: {}", other))),
        }
    }
}

/// One declared, persisted scalar value.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudVariableRecord {
    /// Unique identifier, stable across versions
    pub key: String,
    pub data_type: DataType,
    /// Canonical string encoding of the value
    pub value: String,
    pub merge_policy: MergePolicy,
    /// Only tracked for Latest records
    pub last_modified: Option<DateTime<Utc>>,
}

impl CloudVariableRecord {
    pub fn new(
        key: impl Into<String>,
        data_type: DataType,
        value: impl Into<String>,
        merge_policy: MergePolicy,
    ) -> Self {
        let last_modified = match merge_policy {
            MergePolicy::Latest => Some(baseline_timestamp()),
            _ => None,
        };

        Self {
            key: key.into(),
            data_type,
            value: value.into(),
            merge_policy,
            last_modified,
        }
    }

    pub fn from_value(key: impl Into<String>, value: &TypedValue, merge_policy: MergePolicy) -> Self {
        Self::new(key, value.data_type(), value.encode(), merge_policy)
    }

    /// Decode the stored value as the declared type.
    pub fn typed_value(&self) -> SyncResult<TypedValue> {
        codec::decode(self.data_type, &self.value)
    }

    /// `last_modified`, or the baseline when none was recorded.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.last_modified.unwrap_or_else(baseline_timestamp)
    }

    /// Store `value`, refreshing `last_modified` for Latest records.
    pub fn set_value(&mut self, value: &TypedValue) -> SyncResult<()> {
        self.set_value_at(value, Utc::now())
    }

    pub fn set_value_at(&mut self, value: &TypedValue, now: DateTime<Utc>) -> SyncResult<()> {
        if value.data_type() != self.data_type {
            return Err(SyncError::TypeMismatch {
                key: self.key.clone(),
                declared: self.data_type,
                requested: value.data_type(),
            });
        }

        let encoded = value.encode();
        codec::decode(self.data_type, &encoded)?;

        self.value = encoded;
        if self.merge_policy == MergePolicy::Latest {
            self.last_modified = Some(truncate_to_millis(now));
        }
        Ok(())
    }

    /// Whether a local write of `candidate` is allowed under this record's policy.
    ///
    /// Highest only accepts larger values and Lowest only smaller ones.
    /// An unreadable current value accepts anything.
    pub fn accepts(&self, candidate: &TypedValue) -> bool {
        let wanted = match self.merge_policy {
            MergePolicy::Latest => return true,
            MergePolicy::Highest => Ordering::Greater,
            MergePolicy::Lowest => Ordering::Less,
        };

        match self.typed_value() {
            Ok(current) => candidate.compare(&current) == Some(wanted),
            Err(_) => true,
        }
    }

    pub fn to_tree(&self) -> Value {
        let mut metadata = Map::new();
        metadata.insert(META_DATA_TYPE.alias.to_string(), json!(self.data_type.code()));
        metadata.insert(META_POLICY.alias.to_string(), json!(self.merge_policy.code()));
        if self.merge_policy == MergePolicy::Latest {
            metadata.insert(
                META_TIMESTAMP.alias.to_string(),
                json!(self.effective_timestamp().timestamp_millis().to_string()),
            );
        }

        json!({
            RECORD_VALUE.alias: self.value,
            RECORD_METADATA.alias: metadata,
        })
    }

    pub fn from_tree(key: &str, value: &Value) -> SyncResult<Self> {
        let owner = format!("CloudVariableRecord '{}'", key);
        let tree = as_object(value, &owner)?;

        let raw_value = RECORD_VALUE.read(tree, &owner)?;
        let value = match raw_value {
            Value::Null => String::new(),
            other => as_text(&other)
                .ok_or_else(|| SyncError::JsonError(format!("{}: invalid value {}", owner, other)))?,
        };

        let metadata_value = RECORD_METADATA.read(tree, &owner)?;
        let metadata = as_object(&metadata_value, &owner)?;

        let data_type = read_enum(
            &META_DATA_TYPE.read(metadata, &owner)?,
            DataType::from_code,
            &owner,
        )?;
        let merge_policy = read_enum(
            &META_POLICY.read(metadata, &owner)?,
            MergePolicy::from_code,
            &owner,
        )?;

        let last_modified = match (merge_policy, META_TIMESTAMP.resolve(metadata)) {
            (MergePolicy::Latest, Some((_, raw))) => Some(read_timestamp(raw, &owner)?),
            (MergePolicy::Latest, None) => Some(baseline_timestamp()),
            _ => None,
        };

        Ok(Self {
            key: key.to_string(),
            data_type,
            value,
            merge_policy,
            last_modified,
        })
    }
}

/// Enums are written as numeric codes; older clients wrote names.
fn read_enum<T: FromStr<Err = SyncError>>(
    value: &Value,
    from_code: fn(i64) -> Option<T>,
    owner: &str,
) -> SyncResult<T> {
    if let Some(code) = value.as_i64() {
        return from_code(code)
            .ok_or_else(|| SyncError::JsonError(format!("{}: unknown code {}", owner, code)));
    }
    if let Some(name) = value.as_str() {
        if let Ok(code) = name.trim().parse::<i64>() {
            return from_code(code)
                .ok_or_else(|| SyncError::JsonError(format!("{}: unknown code {}", owner, code)));
        }
        return name.parse();
    }
    Err(SyncError::JsonError(format!("{}: invalid enum value {}", owner, value)))
}

fn read_timestamp(value: &Value, owner: &str) -> SyncResult<DateTime<Utc>> {
    let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    millis
        .and_then(timestamp_from_millis)
        .ok_or_else(|| SyncError::JsonError(format!("{}: invalid timestamp {}", owner, value)))
}

/// Merge the local and remote copy of one variable.
///
/// The locally declared policy always applies. A policy or data type that
/// differs on the remote side is logged; a data type mismatch keeps local.
/// Returns the merged record and whether it differs from `local`.
pub fn merge_variable(
    local: &CloudVariableRecord,
    remote: &CloudVariableRecord,
) -> SyncResult<(CloudVariableRecord, bool)> {
    if local.data_type != remote.data_type {
        warn!(
            key = %local.key,
            local = %local.data_type,
            remote = %remote.data_type,
            "Data type differs between devices, keeping local value"
        );
        return Ok((local.clone(), false));
    }

    if local.merge_policy != remote.merge_policy {
        let mismatch = SyncError::MergePolicyMismatch {
            key: local.key.clone(),
            local: local.merge_policy,
            remote: remote.merge_policy,
        };
        warn!(error = %mismatch, "Applying locally declared merge policy");
    }

    let merged = match local.merge_policy {
        MergePolicy::Latest => merge_latest(local, remote),
        MergePolicy::Highest => merge_ordered(local, remote, Ordering::Greater)?,
        MergePolicy::Lowest => merge_ordered(local, remote, Ordering::Less)?,
    };

    let changed = merged != *local;
    Ok((merged, changed))
}

fn merge_latest(local: &CloudVariableRecord, remote: &CloudVariableRecord) -> CloudVariableRecord {
    if remote.effective_timestamp() > local.effective_timestamp() {
        CloudVariableRecord {
            key: local.key.clone(),
            merge_policy: local.merge_policy,
            data_type: local.data_type,
            value: remote.value.clone(),
            last_modified: Some(remote.effective_timestamp()),
        }
    } else {
        local.clone()
    }
}

/// Take the remote value if it compares as `wanted` against local.
fn merge_ordered(
    local: &CloudVariableRecord,
    remote: &CloudVariableRecord,
    wanted: Ordering,
) -> SyncResult<CloudVariableRecord> {
    local.merge_policy.validate_for(&local.key, local.data_type)?;

    let take_remote = match (local.typed_value(), remote.typed_value()) {
        (Ok(l), Ok(r)) => match r.compare(&l) {
            Some(ordering) => ordering == wanted,
            None => {
                warn!(key = %local.key, "Values are not comparable, keeping local value");
                false
            }
        },
        (Err(err), Ok(_)) => {
            warn!(key = %local.key, error = %err, "Local value unreadable, taking remote value");
            true
        }
        (_, Err(err)) => {
            warn!(key = %local.key, error = %err, "Remote value unreadable, keeping local value");
            false
        }
    };

    let mut merged = local.clone();
    if take_remote {
        merged.value = remote.value.clone();
    }
    Ok(merged)
}
