//! Tests for the synchronization orchestrator.

use super::*;
use crate::codec::DataType;
use crate::currency::CurrencyValue;
use crate::snapshot::decode_snapshot;
use crate::variable::CloudVariableRecord;
use std::collections::HashMap;

const CONFIG: &str = r#"{
    "variables": [
        {"key": "level", "data_type": "int", "merge_policy": "highest", "default_value": "1"},
        {"key": "best_time", "data_type": "double", "merge_policy": "lowest", "default_value": "999"},
        {"key": "player_name", "data_type": "string"}
    ],
    "currencies": [
        {"id": "gems", "default_value": 10},
        {"id": "debt", "allow_negative": true}
    ]
}"#;

/// In-memory cloud store that counts writes.
#[derive(Debug, Default)]
struct MemoryTransport {
    documents: HashMap<String, String>,
    stores: u32,
    deletes: u32,
}

impl CloudTransport for MemoryTransport {
    fn fetch(&mut self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.documents.get(key).cloned())
    }

    fn store(&mut self, key: &str, document: &str) -> SyncResult<()> {
        self.stores += 1;
        self.documents.insert(key.to_string(), document.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> SyncResult<()> {
        self.deletes += 1;
        self.documents.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryCache {
    documents: HashMap<String, String>,
}

impl LocalCache for MemoryCache {
    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.documents.get(key).cloned())
    }

    fn write(&mut self, key: &str, document: &str) -> SyncResult<()> {
        self.documents.insert(key.to_string(), document.to_string());
        Ok(())
    }

    fn clear(&mut self, key: &str) -> SyncResult<()> {
        self.documents.remove(key);
        Ok(())
    }
}

type TestEngine = SyncEngine<MemoryTransport, MemoryCache>;

fn engine(device_id: &str) -> TestEngine {
    engine_with_cloud(device_id, MemoryTransport::default())
}

fn engine_with_cloud(device_id: &str, transport: MemoryTransport) -> TestEngine {
    let registry = Registry::from_json(CONFIG).unwrap();
    SyncEngine::new(registry, transport, MemoryCache::default(), device_id).unwrap()
}

fn cloud_with(snapshot: &Snapshot) -> MemoryTransport {
    let mut transport = MemoryTransport::default();
    transport
        .documents
        .insert("GameData".to_string(), encode_snapshot(snapshot).unwrap());
    transport
}

fn cloud_snapshot(engine: &TestEngine) -> Snapshot {
    decode_snapshot(&engine.transport().documents["GameData"]).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Construction and typed access
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_new_engine_holds_defaults() {
    let engine = engine("A");

    assert_eq!(engine.phase(), SyncPhase::Idle);
    assert!(!engine.is_dirty());
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(1));
    assert_eq!(engine.get("player_name").unwrap(), TypedValue::String(String::new()));
    assert_eq!(engine.currency_balance("gems").unwrap(), 10);
    assert_eq!(
        engine.all_keys(),
        vec!["best_time", "level", "player_name", "debt", "gems"]
    );
}

#[test]
fn test_empty_device_id_is_rejected() {
    let registry = Registry::from_json(CONFIG).unwrap();
    let result = SyncEngine::new(registry, MemoryTransport::default(), MemoryCache::default(), " ");
    assert!(result.is_err());
}

#[test]
fn test_generated_device_ids_are_unique() {
    let a = generate_device_id();
    let b = generate_device_id();
    assert_ne!(a, b);
    assert_eq!(a.len(), 36);
}

#[test]
fn test_set_honours_policy() {
    let mut engine = engine("A");

    assert!(engine.set("level", TypedValue::Int(5)).unwrap());
    assert!(!engine.set("level", TypedValue::Int(3)).unwrap());
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(5));

    assert!(engine.set("best_time", TypedValue::Double(42.5)).unwrap());
    assert!(!engine.set("best_time", TypedValue::Double(50.0)).unwrap());

    assert!(engine.set("player_name", TypedValue::String("Ada".to_string())).unwrap());
    assert!(!engine.set("player_name", TypedValue::String("Ada".to_string())).unwrap());
    assert!(engine.snapshot().variables["player_name"].last_modified > Some(crate::variable::baseline_timestamp()));
    assert!(engine.is_dirty());
}

#[test]
fn test_typed_access_errors() {
    let mut engine = engine("A");

    assert_eq!(engine.get("nope").unwrap_err(), SyncError::UnknownKey("nope".to_string()));
    let err = engine.set("level", TypedValue::String("9".to_string())).unwrap_err();
    assert_eq!(
        err,
        SyncError::TypeMismatch {
            key: "level".to_string(),
            declared: DataType::Int,
            requested: DataType::String,
        }
    );
    assert!(engine.add_currency("coins", 1).is_err());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Currencies
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_currency_operations_record_on_this_device() {
    let mut engine = engine("A");

    assert_eq!(engine.add_currency("gems", 50).unwrap(), 60);
    assert_eq!(engine.subtract_currency("gems", 20).unwrap(), 40);
    assert_eq!(
        engine.snapshot().currencies["gems"].device_value("A"),
        CurrencyValue::new(50, -20)
    );

    assert_eq!(engine.set_currency_balance("gems", 25).unwrap(), 25);
    assert_eq!(engine.currency_balance("gems").unwrap(), 25);

    engine.reset_currency("gems").unwrap();
    assert_eq!(engine.currency_balance("gems").unwrap(), 10);
}

#[test]
fn test_currency_balance_clamps_unless_negative_allowed() {
    let mut engine = engine("A");

    assert_eq!(engine.subtract_currency("gems", 30).unwrap(), 0);
    assert_eq!(engine.subtract_currency("debt", 30).unwrap(), -30);
    assert_eq!(engine.set_currency_balance("gems", -5).unwrap(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Merge cycles
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_first_sync_uploads_local_snapshot() {
    let mut engine = engine("A");
    engine.add_currency("gems", 5).unwrap();

    let outcome = engine.sync().unwrap();

    assert!(outcome.uploaded);
    assert!(!outcome.changed);
    assert_eq!(engine.phase(), SyncPhase::Complete);
    assert_eq!(cloud_snapshot(&engine), *engine.snapshot());
}

#[test]
fn test_first_sync_also_saves_to_cache() {
    let mut engine = engine("A");
    engine.add_currency("gems", 5).unwrap();
    assert!(engine.is_dirty());

    engine.sync().unwrap();

    assert!(!engine.is_dirty());
    let cached = decode_snapshot(&engine.cache().documents["GameData"]).unwrap();
    assert_eq!(cached, *engine.snapshot());
}

#[test]
fn test_sync_merges_and_pushes_back() {
    let mut remote = Registry::from_json(CONFIG).unwrap().default_snapshot().unwrap();
    remote
        .currencies
        .get_mut("gems")
        .unwrap()
        .device_balances
        .insert("B".to_string(), CurrencyValue::new(50, 0));
    remote.variables.get_mut("level").unwrap().value = "7".to_string();

    let mut engine = engine_with_cloud("A", cloud_with(&remote));
    engine.add_currency("gems", 100).unwrap();
    engine.subtract_currency("gems", 30).unwrap();

    let outcome = engine.sync().unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.changed_keys, vec!["level".to_string(), "gems".to_string()]);
    assert!(outcome.remote_stale);
    assert!(outcome.uploaded);
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(7));
    assert_eq!(engine.currency_balance("gems").unwrap(), 10 + 70 + 50);
    assert!(!engine.is_dirty());
    assert!(engine.cache().documents.contains_key("GameData"));
    assert_eq!(cloud_snapshot(&engine), *engine.snapshot());
}

#[test]
fn test_sync_with_identical_cloud_writes_nothing() {
    let mut engine = engine("A");
    engine.sync().unwrap();
    assert_eq!(engine.transport().stores, 1);

    let outcome = engine.sync().unwrap();
    assert!(!outcome.changed);
    assert!(!outcome.remote_stale);
    assert!(!outcome.uploaded);
    assert_eq!(engine.transport().stores, 1);
}

#[test]
fn test_two_devices_converge() {
    let mut a = engine("A");
    let mut b = engine("B");

    a.add_currency("gems", 30).unwrap();
    a.set("level", TypedValue::Int(4)).unwrap();
    a.sync().unwrap();

    b.add_currency("gems", 12).unwrap();
    b.set("level", TypedValue::Int(2)).unwrap();
    let cloud = a.transport().documents["GameData"].clone();
    b.on_external_change(ChangeReason::ServerChange, Some(&cloud))
        .unwrap();
    let b_cloud = b.transport().documents["GameData"].clone();

    a.merge_remote(&b_cloud).unwrap();

    assert_eq!(a.snapshot(), b.snapshot());
    assert_eq!(a.currency_balance("gems").unwrap(), 10 + 30 + 12);
    assert_eq!(b.get("level").unwrap(), TypedValue::Int(4));
}

#[test]
fn test_fatal_merge_error_leaves_local_untouched() {
    let mut engine = engine("A");
    engine.add_currency("gems", 5).unwrap();
    let before = engine.snapshot().clone();

    let bad = r#"{"c": {"gems": {"i": "coins", "d": {}}}}"#;
    let err = engine.merge_remote(bad).unwrap_err();

    assert!(matches!(err, SyncError::CurrencyIdentityMismatch { .. }));
    assert_eq!(*engine.snapshot(), before);
    assert_eq!(engine.phase(), SyncPhase::Idle);

    let err = engine.merge_remote(r#"{"i": {"level": {"v": "3"}}}"#).unwrap_err();
    assert!(matches!(err, SyncError::Deserialization { .. }));
    assert_eq!(*engine.snapshot(), before);
}

#[test]
fn test_unreadable_remote_value_keeps_local() {
    let mut remote = Snapshot::new();
    remote.insert_variable(CloudVariableRecord::new("best_time", DataType::Double, "fast", MergePolicy::Lowest));
    let mut engine = engine("A");

    let outcome = engine.merge_remote(&encode_snapshot(&remote).unwrap()).unwrap();

    assert!(!outcome.changed);
    assert_eq!(engine.get("best_time").unwrap(), TypedValue::Double(999.0));
}

#[test]
fn test_malformed_remote_fields_do_not_block_sync() {
    let mut transport = MemoryTransport::default();
    transport.documents.insert(
        "GameData".to_string(),
        r#"{"ver":2,
            "i":{
                "future":{"v":"x","m":{"d":9,"p":0}},
                "level":{"v":"7","m":{"d":3,"p":1}}
            },
            "c":{"gems":{"i":"gems","d":{"B":{"a":"lots","s":0},"C":{"a":4,"s":0}}}}
        }"#
        .to_string(),
    );
    let mut engine = engine_with_cloud("A", transport);

    let outcome = engine.sync().unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.degraded_keys, vec!["future".to_string(), "gems".to_string()]);
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(7));
    assert_eq!(engine.currency_balance("gems").unwrap(), 14);
    assert!(!engine.snapshot().contains_key("future"));
    assert!(outcome.uploaded);
    assert_eq!(cloud_snapshot(&engine), *engine.snapshot());
}

#[test]
fn test_unreadable_cached_record_is_restored_from_declaration() {
    let mut engine = engine("A");
    engine.cache.documents.insert(
        "GameData".to_string(),
        r#"{"ver":2,"i":{"level":{"v":"4","m":{"d":"Quaternion","p":1}}},"c":{"gems":{"i":"gems","d":{"A":{"a":3,"s":0}}}}}"#
            .to_string(),
    );

    assert!(engine.load_from_cache().unwrap());
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(1));
    assert_eq!(engine.currency_balance("gems").unwrap(), 13);
    assert!(engine.is_dirty());
}

#[test]
fn test_unreadable_cached_value_falls_back_to_default() {
    let mut cached = Registry::from_json(CONFIG).unwrap().default_snapshot().unwrap();
    cached.variables.get_mut("level").unwrap().value = "lots".to_string();

    let mut engine = engine("A");
    engine
        .cache
        .documents
        .insert("GameData".to_string(), encode_snapshot(&cached).unwrap());

    assert!(engine.load_from_cache().unwrap());
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(1));
    assert_eq!(engine.snapshot().variables["level"].value, "1");
    assert!(engine.is_dirty());
}

#[test]
fn test_remote_stowaways_are_adopted_then_cleared() {
    let mut remote = Snapshot::new();
    remote.insert_variable(CloudVariableRecord::new("old_flag", DataType::Bool, "1", MergePolicy::Latest));
    let mut engine = engine("A");

    let outcome = engine.merge_remote(&encode_snapshot(&remote).unwrap()).unwrap();
    assert_eq!(outcome.changed_keys, vec!["old_flag".to_string()]);
    assert!(engine.snapshot().contains_key("old_flag"));

    assert_eq!(engine.clear_stowaways(), vec!["old_flag".to_string()]);
    assert!(!engine.snapshot().contains_key("old_flag"));
    assert!(engine.clear_stowaways().is_empty());
}

#[test]
fn test_cycle_cannot_start_twice() {
    let mut engine = engine("A");

    let local = engine.begin_cycle().unwrap();
    assert_eq!(engine.phase(), SyncPhase::Merging);
    assert_eq!(engine.begin_cycle().unwrap_err(), SyncError::MergeInProgress);
    assert_eq!(engine.merge_remote("{}").unwrap_err(), SyncError::MergeInProgress);

    let merge = merge_snapshot(&local, &Snapshot::new()).unwrap();
    let outcome = engine.finish_cycle(merge).unwrap();
    assert!(!outcome.changed);
    assert_eq!(engine.phase(), SyncPhase::Complete);
    assert!(engine.finish_cycle(merge_snapshot(&local, &local).unwrap()).is_err());
}

// ═══════════════════════════════════════════════════════════════════════════════
// External changes
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_quota_violation_is_ignored() {
    let mut engine = engine("A");
    let outcome = engine
        .on_external_change(ChangeReason::QuotaViolationChange, Some("not even json"))
        .unwrap();
    assert!(outcome.is_none());
}

#[test]
fn test_account_change_replaces_local_data() {
    let mut other_account = Registry::from_json(CONFIG).unwrap().default_snapshot().unwrap();
    other_account.variables.get_mut("level").unwrap().value = "3".to_string();

    let mut engine = engine_with_cloud("A", cloud_with(&other_account));
    engine.set("level", TypedValue::Int(40)).unwrap();
    engine.add_currency("gems", 500).unwrap();

    let outcome = engine
        .on_external_change(ChangeReason::AccountChange, None)
        .unwrap()
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(3));
    assert_eq!(engine.currency_balance("gems").unwrap(), 10);
    assert!(engine.cache().documents.contains_key("GameData"));
}

#[test]
fn test_server_change_without_document_fetches() {
    let mut remote = Registry::from_json(CONFIG).unwrap().default_snapshot().unwrap();
    remote.variables.get_mut("level").unwrap().value = "9".to_string();
    let mut engine = engine_with_cloud("A", cloud_with(&remote));

    let outcome = engine
        .on_external_change(ChangeReason::ServerChange, None)
        .unwrap()
        .unwrap();

    assert_eq!(outcome.changed_keys, vec!["level".to_string()]);
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(9));
}

#[test]
fn test_change_reason_parsing() {
    assert_eq!("ServerChange".parse::<ChangeReason>().unwrap(), ChangeReason::ServerChange);
    assert_eq!("account_change".parse::<ChangeReason>().unwrap(), ChangeReason::AccountChange);
    assert_eq!(ChangeReason::from_code(2), Some(ChangeReason::QuotaViolationChange));
    assert!("weather".parse::<ChangeReason>().is_err());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache, reset and delete
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_save_to_cache_only_when_dirty() {
    let mut engine = engine("A");
    assert!(!engine.save_to_cache().unwrap());

    engine.add_currency("gems", 1).unwrap();
    assert!(engine.save_to_cache().unwrap());
    assert!(!engine.save_to_cache().unwrap());
}

#[test]
fn test_load_from_cache_restores_snapshot() {
    let mut first = engine("A");
    first.set("level", TypedValue::Int(8)).unwrap();
    first.save_to_cache().unwrap();
    let cached = first.cache().documents.clone();

    let mut restarted = engine("A");
    assert!(!restarted.load_from_cache().unwrap());
    restarted.cache.documents = cached;
    assert!(restarted.load_from_cache().unwrap());

    assert_eq!(restarted.get("level").unwrap(), TypedValue::Int(8));
    assert!(!restarted.is_dirty());
}

#[test]
fn test_reset_all_restores_defaults() {
    let mut engine = engine("A");
    engine.set("level", TypedValue::Int(8)).unwrap();
    engine.add_currency("gems", 5).unwrap();

    engine.reset_all().unwrap();

    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(1));
    assert_eq!(engine.currency_balance("gems").unwrap(), 10);
    assert!(engine.snapshot().variables["player_name"].last_modified > Some(crate::variable::baseline_timestamp()));
}

#[test]
fn test_delete_all_clears_cloud_and_cache() {
    let mut engine = engine("A");
    engine.add_currency("gems", 5).unwrap();
    engine.sync().unwrap();
    engine.save_to_cache().unwrap();

    engine.delete_all().unwrap();

    assert_eq!(engine.transport().deletes, 1);
    assert!(engine.transport().documents.is_empty());
    assert!(engine.cache().documents.is_empty());
    assert_eq!(engine.currency_balance("gems").unwrap(), 10);
    assert!(!engine.is_dirty());
}

#[test]
fn test_delete_variable() {
    let mut engine = engine("A");
    engine.set("level", TypedValue::Int(8)).unwrap();

    assert!(engine.delete_variable("level").unwrap());
    assert_eq!(engine.get("level").unwrap(), TypedValue::Int(1));
    assert!(!engine.delete_variable("missing").unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════════
// File cache
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_file_cache_writes_base64() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = FileCache::new(dir.path().join("saves"));

    assert_eq!(cache.read("GameData").unwrap(), None);
    cache.write("GameData", r#"{"ver":2}"#).unwrap();

    let raw = std::fs::read_to_string(dir.path().join("saves").join("GameData.sav")).unwrap();
    assert_eq!(raw, "eyJ2ZXIiOjJ9");
    assert_eq!(cache.read("GameData").unwrap().as_deref(), Some(r#"{"ver":2}"#));

    cache.clear("GameData").unwrap();
    cache.clear("GameData").unwrap();
    assert_eq!(cache.read("GameData").unwrap(), None);
}

#[test]
fn test_file_cache_reads_plain_json() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("GameData.sav"), "  {\"i\":{}}\n").unwrap();

    let cache = FileCache::new(dir.path());
    assert_eq!(cache.read("GameData").unwrap().as_deref(), Some(r#"{"i":{}}"#));
}

#[test]
fn test_file_cache_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("GameData.sav"), "%%%").unwrap();

    let err = FileCache::new(dir.path()).read("GameData").unwrap_err();
    assert!(matches!(err, SyncError::Io(_)));
}

#[test]
fn test_engine_with_file_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::from_json(CONFIG).unwrap();
    let mut engine = SyncEngine::new(
        registry.clone(),
        MemoryTransport::default(),
        FileCache::new(dir.path()),
        "A",
    )
    .unwrap();
    engine.add_currency("gems", 7).unwrap();
    assert!(engine.save_to_cache().unwrap());

    let mut restarted =
        SyncEngine::new(registry, MemoryTransport::default(), FileCache::new(dir.path()), "A").unwrap();
    assert!(restarted.load_from_cache().unwrap());
    assert_eq!(restarted.currency_balance("gems").unwrap(), 17);
}
