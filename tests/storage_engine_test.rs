use wren_db::{
    error::ErrorKind,
    record::Record,
    schema::{Column, DataType, Schema, Value},
    utils::init_log,
    StorageConfig, StorageEngine,
};

fn test_config(name: &str) -> StorageConfig {
    let mut dir = std::env::temp_dir();
    dir.push(format!("wren_db_integration_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    StorageConfig::default()
        .with_data_dir(dir)
        .with_buffer_pool_capacity(16)
        .with_btree_max_keys(4)
}

fn accounts_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", DataType::Int).unwrap(),
        Column::new("owner", DataType::Str(24)).unwrap(),
    ])
    .unwrap()
}

#[test]
fn committed_writes_are_visible_to_later_transactions() {
    init_log();
    let engine = StorageEngine::new(test_config("commit_visible")).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();

    let tx = engine.begin();
    engine
        .insert(tx, "accounts", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
        .unwrap();
    engine.commit(tx).unwrap();

    let reader = engine.begin();
    let row = engine.get(reader, "accounts", 1).unwrap().unwrap();
    assert_eq!(row.key().unwrap(), 1);
    engine.commit(reader).unwrap();
}

#[test]
fn rolled_back_writes_are_never_visible() {
    init_log();
    let engine = StorageEngine::new(test_config("rollback_invisible")).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();

    let tx = engine.begin();
    engine
        .insert(tx, "accounts", Record::new(vec![Value::Int(1), Value::Str(b"bob".to_vec())]))
        .unwrap();
    engine.abort(tx).unwrap();

    let reader = engine.begin();
    assert!(engine.get(reader, "accounts", 1).unwrap().is_none());
    engine.commit(reader).unwrap();
}

#[test]
fn second_writer_gets_lock_conflict_instead_of_blocking() {
    init_log();
    let engine = StorageEngine::new(test_config("lock_conflict")).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();

    let tx1 = engine.begin();
    engine
        .insert(tx1, "accounts", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
        .unwrap();

    let tx2 = engine.begin();
    let err = engine
        .insert(tx2, "accounts", Record::new(vec![Value::Int(2), Value::Str(b"bob".to_vec())]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockConflict);

    // tx2 never acquired anything, so it is safe to just drop it; tx1
    // finishes on its own.
    engine.commit(tx1).unwrap();
}

#[test]
fn deleted_slot_is_reused_by_a_later_insert_of_the_same_width() {
    init_log();
    let engine = StorageEngine::new(test_config("tombstone_reuse")).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();

    let tx = engine.begin();
    engine
        .insert(tx, "accounts", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
        .unwrap();
    engine.delete(tx, "accounts", 1).unwrap();
    engine
        .insert(tx, "accounts", Record::new(vec![Value::Int(2), Value::Str(b"carol".to_vec())]))
        .unwrap();
    engine.commit(tx).unwrap();

    let reader = engine.begin();
    assert!(engine.get(reader, "accounts", 1).unwrap().is_none());
    assert!(engine.get(reader, "accounts", 2).unwrap().is_some());
    engine.commit(reader).unwrap();
}

#[test]
fn index_survives_repeated_splits_at_a_small_fanout() {
    init_log();
    let engine = StorageEngine::new(test_config("btree_split")).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();

    let tx = engine.begin();
    for id in 0..100 {
        engine
            .insert(tx, "accounts", Record::new(vec![Value::Int(id), Value::Str(b"x".to_vec())]))
            .unwrap();
    }
    engine.commit(tx).unwrap();

    let reader = engine.begin();
    for id in 0..100 {
        assert!(engine.get(reader, "accounts", id).unwrap().is_some());
    }
    engine.commit(reader).unwrap();
}

#[test]
fn recovery_truncates_the_log_so_a_second_crash_does_not_replay_it_twice() {
    init_log();
    let config = test_config("recovery_idempotent");

    {
        let engine = StorageEngine::new(config.clone()).unwrap();
        engine.register_table("accounts", accounts_schema()).unwrap();

        let tx = engine.begin();
        engine
            .insert(tx, "accounts", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
            .unwrap();
        engine.commit(tx).unwrap();
    }

    // First restart: recovers and truncates the log.
    {
        let engine = StorageEngine::new(config.clone()).unwrap();
        engine.register_table("accounts", accounts_schema()).unwrap();
        engine.recover().unwrap();

        let tx = engine.begin();
        engine
            .insert(tx, "accounts", Record::new(vec![Value::Int(2), Value::Str(b"bob".to_vec())]))
            .unwrap();
        engine.commit(tx).unwrap();
    }

    // Second restart: recover() must only replay what the second engine
    // itself wrote, not re-apply the first restart's already-durable work.
    let engine = StorageEngine::new(config).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();
    engine.recover().unwrap();

    let reader = engine.begin();
    assert!(engine.get(reader, "accounts", 1).unwrap().is_some());
    assert!(engine.get(reader, "accounts", 2).unwrap().is_some());
    engine.commit(reader).unwrap();
}

#[test]
fn scan_table_returns_every_row_inserted_across_pages() {
    init_log();
    let engine = StorageEngine::new(test_config("scan_table_integration")).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();

    let tx = engine.begin();
    for id in 0..50 {
        engine
            .insert(tx, "accounts", Record::new(vec![Value::Int(id), Value::Str(b"x".to_vec())]))
            .unwrap();
    }
    engine.commit(tx).unwrap();

    let reader = engine.begin();
    let rids = engine.scan_table(reader, "accounts").unwrap();
    assert_eq!(rids.len(), 50);
    engine.commit(reader).unwrap();
}

#[test]
fn recovery_redoes_committed_work_and_undoes_the_loser() {
    init_log();
    let config = test_config("recovery_scenario");

    {
        let engine = StorageEngine::new(config.clone()).unwrap();
        engine.register_table("accounts", accounts_schema()).unwrap();

        let winner = engine.begin();
        engine
            .insert(winner, "accounts", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
            .unwrap();
        engine.commit(winner).unwrap();

        // Simulate a crash: this transaction's insert is logged but
        // never committed or aborted before the engine goes away.
        let loser = engine.begin();
        engine
            .insert(loser, "accounts", Record::new(vec![Value::Int(2), Value::Str(b"mallory".to_vec())]))
            .unwrap();
    }

    let engine = StorageEngine::new(config).unwrap();
    engine.register_table("accounts", accounts_schema()).unwrap();
    engine.recover().unwrap();

    let reader = engine.begin();
    assert!(engine.get(reader, "accounts", 1).unwrap().is_some());
    assert!(engine.get(reader, "accounts", 2).unwrap().is_none());
    engine.commit(reader).unwrap();
}
