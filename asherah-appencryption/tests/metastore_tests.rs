use asherah_appencryption::{
    AsherahError, EnvelopeKeyRecord, InMemoryMetastore, KeyMeta, Metastore, SqlMetastore,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;

fn record(created: i64, fill: u8) -> EnvelopeKeyRecord {
    EnvelopeKeyRecord {
        revoked: None,
        created,
        encrypted_key: vec![fill; 60],
        parent_key_meta: Some(KeyMeta::new("_SK_svc_prod", 60)),
    }
}

fn exercise(store: &dyn Metastore) {
    let id = "_IK_p1_svc_prod";
    assert_eq!(store.load(id, 120).unwrap(), None);
    assert_eq!(store.load_latest(id).unwrap(), None);

    store.store(id, 120, &record(120, 1)).unwrap();
    store.store(id, 240, &record(240, 2)).unwrap();
    store.store(id, 180, &record(180, 3)).unwrap();

    assert_eq!(store.load(id, 180).unwrap(), Some(record(180, 3)));
    assert_eq!(store.load_latest(id).unwrap(), Some(record(240, 2)));
    assert_eq!(store.load_latest("_IK_other_svc_prod").unwrap(), None);

    match store.store(id, 240, &record(240, 9)) {
        Err(AsherahError::AlreadyExists { id: dup, created }) => {
            assert_eq!(dup, id);
            assert_eq!(created, 240);
        }
        other => panic!("expected AlreadyExists, got {other:?}"),
    }
    // The losing write must not have replaced the stored record.
    assert_eq!(store.load(id, 240).unwrap(), Some(record(240, 2)));

    assert!(store.mark_revoked(id, 240).unwrap());
    let revoked = store.load_latest(id).unwrap().unwrap();
    assert!(revoked.is_revoked());
    assert_eq!(revoked.encrypted_key, vec![2; 60]);
    assert!(!store.load(id, 120).unwrap().unwrap().is_revoked());

    assert!(!store.mark_revoked(id, 999).unwrap());
}

#[test]
fn in_memory_metastore_contract() {
    let store = InMemoryMetastore::new();
    assert!(store.is_empty());
    exercise(&store);
    assert_eq!(store.len(), 3);
}

#[test]
fn sql_metastore_contract() {
    let store = SqlMetastore::open_in_memory().unwrap();
    exercise(&store);
}

#[test]
fn sql_metastore_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.duckdb");
    let path = path.to_str().unwrap();

    {
        let store = SqlMetastore::open(path).unwrap();
        store.store("_SK_svc_prod", 60, &record(60, 4)).unwrap();
        store.mark_revoked("_SK_svc_prod", 60).unwrap();
    }

    let reopened = SqlMetastore::open(path).unwrap();
    let loaded = reopened.load_latest("_SK_svc_prod").unwrap().unwrap();
    assert_eq!(loaded.created, 60);
    assert!(loaded.is_revoked());
    assert!(format!("{reopened:?}").contains("keys.duckdb"));
}

#[test]
fn sql_metastore_rejects_unopenable_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("nested").join("keys.duckdb");
    let err = SqlMetastore::open(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, AsherahError::MetastoreUnavailable(_)));
}

fn race_store(store: Arc<dyn Metastore>) {
    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.store("_SK_svc_prod", 600, &record(600, i)))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(AsherahError::AlreadyExists { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(losers, 7);
}

#[test]
fn concurrent_create_has_one_winner_in_memory() {
    race_store(Arc::new(InMemoryMetastore::new()));
}

#[test]
fn concurrent_create_has_one_winner_in_sql() {
    race_store(Arc::new(SqlMetastore::open_in_memory().unwrap()));
}
