#![cfg(feature = "db-tests")]
//! PostgreSQL collaborators against a live server.
//!
//! The server is the one named by the `TRELLIS_DB_*` variables.

use trellis_cache::{Database, InvalidationTable, PgConfig, PostgresDatabase};
use trellis_core::{BackendError, TrellisError};

fn connect(config: PgConfig) -> PostgresDatabase {
    PostgresDatabase::connect(config).expect("TRELLIS_DB_* names a reachable server")
}

#[test]
fn test_null_module_name_is_an_error() {
    let db = connect(PgConfig::from_env().with_modules_query("SELECT NULL::text"));
    match db.active_modules() {
        Err(TrellisError::Backend(BackendError::ConnectionFailed { database, .. })) => {
            assert_eq!(database, db.name());
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_mistyped_module_name_is_an_error() {
    let db = connect(PgConfig::from_env().with_modules_query("SELECT 1"));
    assert!(matches!(
        db.active_modules(),
        Err(TrellisError::Backend(BackendError::ConnectionFailed { .. }))
    ));
}

#[test]
fn test_module_names_are_read() {
    let db = connect(
        PgConfig::from_env().with_modules_query("SELECT unnest(ARRAY['ir', 'res'])"),
    );
    assert_eq!(db.active_modules().unwrap(), vec!["ir".to_string(), "res".to_string()]);
}

#[test]
fn test_upsert_then_select() {
    let db = connect(PgConfig::from_env());
    let stamped = db.table().upsert("trellis.db_tests").unwrap();
    let selected = db.table().select("trellis.db_tests").unwrap();
    assert!(selected.is_some_and(|timestamp| timestamp >= stamped));
    assert!(db
        .table()
        .select_all()
        .unwrap()
        .iter()
        .any(|record| record.name == "trellis.db_tests"));
}
