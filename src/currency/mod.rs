//! Virtual currency ledger.
//!
//! A currency is never stored as a single balance. Every device keeps its own
//! running totals: `additions` only ever grows and `subtractions` only ever
//! shrinks (more negative). Merging two copies of a ledger takes, per device,
//! the largest additions and the smallest subtractions, which is idempotent and
//! commutative. The balance is always derived from the counters.


use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::codec::DataType;
use crate::error::{SyncError, SyncResult};
use crate::serializer::{as_object, empty_object, FieldSpec, FieldTree};

const LEDGER_ID: FieldSpec = FieldSpec::new("i").with_legacy(&["cID"]);
const LEDGER_DEVICES: FieldSpec = FieldSpec::new("d")
    .with_legacy(&["cData"])
    .with_default(empty_object);
const ADDITIONS: FieldSpec = FieldSpec::new("a").with_legacy(&["cdAdd"]);
const SUBTRACTIONS: FieldSpec = FieldSpec::new("s").with_legacy(&["cdSub"]);

/// Running totals recorded by one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "uniffi", derive(uniffi::Record))]
pub struct CurrencyValue {
    /// Total ever added on this device (never negative)
    pub additions: i64,
    /// Total ever subtracted on this device (never positive)
    pub subtractions: i64,
}

impl CurrencyValue {
    pub fn new(additions: i64, subtractions: i64) -> Self {
        Self {
            additions: additions.saturating_abs(),
            subtractions: subtractions.saturating_abs().saturating_neg(),
        }
    }

    /// Net value contributed by this device.
    pub fn value(&self) -> i64 {
        self.additions.saturating_add(self.subtractions)
    }

    /// Record a signed change. Positive deltas are additions, negative deltas subtractions.
    pub fn apply_delta(&mut self, delta: i64) {
        if delta > 0 {
            self.additions = self.additions.saturating_add(delta);
        } else {
            self.subtractions = self.subtractions.saturating_add(delta);
        }
    }

    /// Move the net value to `value` by recording the difference.
    pub fn adjust_to(&mut self, value: i64) {
        let delta = value.saturating_sub(self.value());
        self.apply_delta(delta);
    }

    pub fn to_tree(&self) -> Value {
        json!({
            ADDITIONS.alias: self.additions,
            SUBTRACTIONS.alias: self.subtractions,
        })
    }

    pub fn from_tree(value: &Value) -> SyncResult<Self> {
        let tree = as_object(value, "CurrencyValue")?;
        let additions = read_counter(&ADDITIONS.read(tree, "CurrencyValue")?)?;
        let subtractions = read_counter(&SUBTRACTIONS.read(tree, "CurrencyValue")?)?;
        Ok(Self::from_counters(additions, subtractions))
    }

    /// Like `from_tree`, but a counter that does not parse reads as 0.
    ///
    /// Returns the value and whether any counter had to be replaced.
    pub fn from_tree_recovering(value: &Value) -> SyncResult<(Self, bool)> {
        let tree = as_object(value, "CurrencyValue")?;
        let additions = read_counter(&ADDITIONS.read(tree, "CurrencyValue")?);
        let subtractions = read_counter(&SUBTRACTIONS.read(tree, "CurrencyValue")?);

        let mut recovered = false;
        for err in [&additions, &subtractions].into_iter().filter_map(|r| r.as_ref().err()) {
            warn!(error = %err, "Unreadable currency counter, reading it as 0");
            recovered = true;
        }

        let value = Self::from_counters(additions.unwrap_or(0), subtractions.unwrap_or(0));
        Ok((value, recovered))
    }

    fn from_counters(additions: i64, subtractions: i64) -> Self {
        if additions < 0 || subtractions > 0 {
            warn!(
                additions,
                subtractions, "Currency counters have the wrong sign, normalizing"
            );
        }
        Self::new(additions, subtractions)
    }
}

/// Counters are whole numbers. Older clients may have written them as
/// integral floats or as strings; a fractional counter is a format error.
fn read_counter(value: &Value) -> SyncResult<i64> {
    let format_error = || SyncError::Format {
        data_type: DataType::Long,
        value: value.to_string(),
    };

    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(f) = value.as_f64() {
        if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
            return Ok(f as i64);
        }
        return Err(format_error());
    }
    if let Some(s) = value.as_str() {
        return s.trim().parse::<i64>().map_err(|_| format_error());
    }
    Err(format_error())
}

/// Per-device record of one currency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyLedger {
    /// Unique identifier for this currency
    pub currency_id: String,
    /// Running totals keyed by device ID
    pub device_balances: BTreeMap<String, CurrencyValue>,
}

impl CurrencyLedger {
    pub fn new(currency_id: impl Into<String>) -> Self {
        Self {
            currency_id: currency_id.into(),
            device_balances: BTreeMap::new(),
        }
    }

    /// Sum of all additions and subtractions across every device.
    pub fn effective_balance(&self) -> i64 {
        self.device_balances
            .values()
            .fold(0i64, |total, v| total.saturating_add(v.value()))
    }

    /// Net value contributed by every device except `device_id`.
    pub fn balance_excluding(&self, device_id: &str) -> i64 {
        self.device_balances
            .iter()
            .filter(|(id, _)| id.as_str() != device_id)
            .fold(0i64, |total, (_, v)| total.saturating_add(v.value()))
    }

    pub fn device_value(&self, device_id: &str) -> CurrencyValue {
        self.device_balances
            .get(device_id)
            .copied()
            .unwrap_or_default()
    }

    /// Record `amount` as earned on `device_id`.
    pub fn add(&mut self, device_id: &str, amount: i64) {
        self.entry(device_id).apply_delta(amount.saturating_abs());
    }

    /// Record `amount` as spent on `device_id`.
    pub fn subtract(&mut self, device_id: &str, amount: i64) {
        self.entry(device_id)
            .apply_delta(amount.saturating_abs().saturating_neg());
    }

    /// Make the balance equal `target` by adjusting only `device_id`'s counters.
    ///
    /// `default_value` is the declared starting balance, which is part of the
    /// balance but never stored. Without `allow_negative` the target is
    /// clamped at zero. Returns the resulting balance.
    pub fn set_balance(
        &mut self,
        device_id: &str,
        target: i64,
        default_value: i64,
        allow_negative: bool,
    ) -> i64 {
        let target = if allow_negative { target } else { target.max(0) };
        let others = self.balance_excluding(device_id);
        let device_target = target.saturating_sub(others).saturating_sub(default_value);
        self.entry(device_id).adjust_to(device_target);
        self.effective_balance().saturating_add(default_value)
    }

    /// Zero every device's counters, keeping the devices listed.
    pub fn reset(&mut self) {
        for value in self.device_balances.values_mut() {
            *value = CurrencyValue::default();
        }
    }

    fn entry(&mut self, device_id: &str) -> &mut CurrencyValue {
        self.device_balances
            .entry(device_id.to_string())
            .or_default()
    }

    pub fn to_tree(&self) -> Value {
        let devices: FieldTree = self
            .device_balances
            .iter()
            .map(|(device, value)| (device.clone(), value.to_tree()))
            .collect();

        json!({
            LEDGER_ID.alias: self.currency_id,
            LEDGER_DEVICES.alias: devices,
        })
    }

    pub fn from_tree(value: &Value) -> SyncResult<Self> {
        Self::read_tree(value).map(|(ledger, _)| ledger)
    }

    /// Read a ledger, reading unparsable counters as 0.
    ///
    /// Returns the ledger and whether any counter had to be replaced.
    pub fn read_tree(value: &Value) -> SyncResult<(Self, bool)> {
        let tree = as_object(value, "CurrencyLedger")?;

        let id_value = LEDGER_ID.read(tree, "CurrencyLedger")?;
        let currency_id = id_value
            .as_str()
            .ok_or_else(|| SyncError::JsonError(format!("Invalid currency id: {}", id_value)))?
            .to_string();

        let devices_value = LEDGER_DEVICES.read(tree, "CurrencyLedger")?;
        let mut device_balances = BTreeMap::new();
        let mut recovered = false;
        for (device, value) in as_object(&devices_value, "CurrencyLedger")? {
            let (device_value, replaced) = CurrencyValue::from_tree_recovering(value)?;
            if replaced {
                warn!(currency = %currency_id, device = %device, "Recovered currency counters");
                recovered = true;
            }
            device_balances.insert(device.clone(), device_value);
        }

        let ledger = Self {
            currency_id,
            device_balances,
        };
        Ok((ledger, recovered))
    }
}

/// Merge a local and a remote copy of the same currency.
///
/// Per device, the merged additions are the maximum of both sides and the
/// merged subtractions the minimum. Returns the merged ledger and whether it
/// differs from `local`. Merging two different currencies is an error.
pub fn merge_currency(
    local: &CurrencyLedger,
    remote: &CurrencyLedger,
) -> SyncResult<(CurrencyLedger, bool)> {
    if local.currency_id != remote.currency_id {
        return Err(SyncError::CurrencyIdentityMismatch {
            local: local.currency_id.clone(),
            remote: remote.currency_id.clone(),
        });
    }

    let mut merged = local.clone();
    let mut changed = false;

    for (device, remote_value) in &remote.device_balances {
        match merged.device_balances.get_mut(device) {
            Some(local_value) => {
                if remote_value.additions > local_value.additions {
                    local_value.additions = remote_value.additions;
                    changed = true;
                }
                if remote_value.subtractions < local_value.subtractions {
                    local_value.subtractions = remote_value.subtractions;
                    changed = true;
                }
            }
            None => {
                merged.device_balances.insert(device.clone(), *remote_value);
                changed = true;
            }
        }
    }

    debug!(
        currency = %merged.currency_id,
        changed,
        balance = merged.effective_balance(),
        "Merged currency ledger"
    );

    Ok((merged, changed))
}
