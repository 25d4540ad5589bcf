//! Declaration registry.
//!
//! Every cloud variable and currency a game uses is declared up front, in a
//! JSON configuration the host loads at startup. The registry validates the
//! declarations once and is then the single source of truth for a key's data
//! type, merge policy and default value. Remote data never changes a
//! declaration; it only supplies values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::codec::{self, DataType, TypedValue};
use crate::currency::CurrencyLedger;
use crate::error::{SyncError, SyncResult};
use crate::snapshot::Snapshot;
use crate::variable::{baseline_timestamp, CloudVariableRecord, MergePolicy};

/// Storage key used when the configuration does not name one.
pub const DEFAULT_STORAGE_KEY: &str = "GameData";

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

/// Declaration of one cloud variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub key: String,
    pub data_type: DataType,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Canonical string of the starting value. The type's zero value if absent.
    #[serde(default)]
    pub default_value: Option<String>,
}

impl VariableDeclaration {
    pub fn default_typed(&self) -> SyncResult<TypedValue> {
        match &self.default_value {
            Some(raw) => codec::decode(self.data_type, raw),
            None => Ok(self.data_type.zero_value()),
        }
    }

    /// A fresh record holding the default value.
    pub fn default_record(&self) -> SyncResult<CloudVariableRecord> {
        Ok(CloudVariableRecord::from_value(
            self.key.clone(),
            &self.default_typed()?,
            self.merge_policy,
        ))
    }
}

/// Declaration of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyDeclaration {
    pub id: String,
    /// Starting balance every player has. Never stored in the ledger.
    #[serde(default)]
    pub default_value: i64,
    /// Whether the balance may go below zero
    #[serde(default)]
    pub allow_negative: bool,
}

/// Registry configuration as loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Key the snapshot is stored under, both in the cloud and in the local cache
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default)]
    pub currencies: Vec<CurrencyDeclaration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            variables: Vec::new(),
            currencies: Vec::new(),
        }
    }
}

/// Validated declarations, keyed by variable key and currency ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    storage_key: String,
    variables: BTreeMap<String, VariableDeclaration>,
    currencies: BTreeMap<String, CurrencyDeclaration>,
}

impl Registry {
    pub fn from_json(config_json: &str) -> SyncResult<Self> {
        let config: RegistryConfig = serde_json::from_str(config_json)?;
        Self::from_config(config)
    }

    /// Validate `config` and build the registry.
    ///
    /// Keys must be non-empty and unique across variables and currencies,
    /// defaults must parse as the declared type, and Highest/Lowest are only
    /// allowed on ordered types.
    pub fn from_config(config: RegistryConfig) -> SyncResult<Self> {
        if config.storage_key.trim().is_empty() {
            return Err(SyncError::Declaration("storage key must not be empty".to_string()));
        }

        let mut variables = BTreeMap::new();
        for declaration in config.variables {
            check_key(&declaration.key, &variables, &BTreeMap::new())?;
            declaration
                .merge_policy
                .validate_for(&declaration.key, declaration.data_type)?;
            declaration.default_typed().map_err(|err| {
                SyncError::Declaration(format!("default of '{}': {}", declaration.key, err))
            })?;
            variables.insert(declaration.key.clone(), declaration);
        }

        let mut currencies = BTreeMap::new();
        for declaration in config.currencies {
            check_key(&declaration.id, &variables, &currencies)?;
            if declaration.default_value < 0 && !declaration.allow_negative {
                return Err(SyncError::Declaration(format!(
                    "currency '{}' has a negative default but does not allow negative balances",
                    declaration.id
                )));
            }
            currencies.insert(declaration.id.clone(), declaration);
        }

        debug!(
            variables = variables.len(),
            currencies = currencies.len(),
            storage_key = %config.storage_key,
            "Loaded declaration registry"
        );

        Ok(Self {
            storage_key: config.storage_key,
            variables,
            currencies,
        })
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn variable(&self, key: &str) -> Option<&VariableDeclaration> {
        self.variables.get(key)
    }

    pub fn currency(&self, id: &str) -> Option<&CurrencyDeclaration> {
        self.currencies.get(id)
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableDeclaration> {
        self.variables.values()
    }

    pub fn currencies(&self) -> impl Iterator<Item = &CurrencyDeclaration> {
        self.currencies.values()
    }

    pub fn is_declared(&self, key: &str) -> bool {
        self.variables.contains_key(key) || self.currencies.contains_key(key)
    }

    /// Fresh record for a declared variable.
    pub fn declared_record(&self, key: &str) -> SyncResult<CloudVariableRecord> {
        self.variable(key)
            .ok_or_else(|| SyncError::UnknownKey(key.to_string()))?
            .default_record()
    }

    /// A snapshot holding every declaration at its default.
    pub fn default_snapshot(&self) -> SyncResult<Snapshot> {
        let mut snapshot = Snapshot::new();
        self.materialize(&mut snapshot)?;
        Ok(snapshot)
    }

    /// Bring `snapshot` in line with the declarations.
    ///
    /// Missing variables and currencies are added at their defaults. Stored
    /// records take the declared data type and merge policy, so the local
    /// declaration is what every later merge applies.
    pub fn materialize(&self, snapshot: &mut Snapshot) -> SyncResult<()> {
        for declaration in self.variables.values() {
            let Some(record) = snapshot.variables.get_mut(&declaration.key) else {
                snapshot.insert_variable(declaration.default_record()?);
                continue;
            };

            if record.data_type != declaration.data_type {
                warn!(
                    key = %declaration.key,
                    stored = %record.data_type,
                    declared = %declaration.data_type,
                    "Stored data type differs from declaration"
                );
                record.data_type = declaration.data_type;
            }

            if record.merge_policy != declaration.merge_policy {
                warn!(
                    key = %declaration.key,
                    stored = %record.merge_policy,
                    declared = %declaration.merge_policy,
                    "Stored merge policy differs from declaration"
                );
                record.merge_policy = declaration.merge_policy;
                record.last_modified = match declaration.merge_policy {
                    MergePolicy::Latest => Some(record.last_modified.unwrap_or_else(baseline_timestamp)),
                    _ => None,
                };
            }
        }

        for declaration in self.currencies.values() {
            if !snapshot.currencies.contains_key(&declaration.id) {
                snapshot.insert_currency(CurrencyLedger::new(declaration.id.clone()));
            }
        }

        Ok(())
    }

    /// Replace declared values that do not parse as their type with the default.
    ///
    /// Returns the keys that were replaced.
    pub fn sanitize_values(&self, snapshot: &mut Snapshot) -> SyncResult<Vec<String>> {
        let mut degraded = Vec::new();

        for declaration in self.variables.values() {
            let Some(record) = snapshot.variables.get_mut(&declaration.key) else {
                continue;
            };
            if let Err(err) = record.typed_value() {
                warn!(key = %declaration.key, error = %err, "Substituting declared default");
                record.value = declaration.default_typed()?.encode();
                degraded.push(declaration.key.clone());
            }
        }

        Ok(degraded)
    }

    /// Keys stored in `snapshot` that nothing declares.
    pub fn stowaway_keys(&self, snapshot: &Snapshot) -> Vec<String> {
        snapshot
            .all_keys()
            .into_iter()
            .filter(|key| !self.is_declared(key))
            .collect()
    }
}

fn check_key(
    key: &str,
    variables: &BTreeMap<String, VariableDeclaration>,
    currencies: &BTreeMap<String, CurrencyDeclaration>,
) -> SyncResult<()> {
    if key.trim().is_empty() {
        return Err(SyncError::Declaration("keys must not be empty".to_string()));
    }
    if variables.contains_key(key) || currencies.contains_key(key) {
        return Err(SyncError::Declaration(format!("key '{}' is declared twice", key)));
    }
    Ok(())
}
