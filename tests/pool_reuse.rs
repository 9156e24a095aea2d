//! Pooled connection reuse through the public open/close path.

use litebridge::{Connection, ConnectionConfig, ConnectionPool};
use std::sync::Arc;

fn pooled_config(dir: &tempfile::TempDir) -> ConnectionConfig {
    let path = dir.path().join("pooled.db");
    ConnectionConfig::new(path.to_string_lossy().into_owned()).pooled()
}

#[test]
fn closed_connection_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(ConnectionPool::new());
    let config = pooled_config(&dir);
    let path = config.path.clone();

    let conn = Connection::open_with_pool(config.clone(), Arc::clone(&pool)).unwrap();
    conn.execute("CREATE TABLE t (x INTEGER)").unwrap();
    conn.close();
    assert_eq!(pool.counts(&path).total_count, 1);

    // The reused handle still sees the schema created above.
    let conn = Connection::open_with_pool(config, Arc::clone(&pool)).unwrap();
    conn.execute("INSERT INTO t VALUES (1)").unwrap();
    conn.close();

    let counts = pool.counts(&path);
    assert_eq!(counts.open_count, 1);
    assert_eq!(counts.close_count, 2);
    assert_eq!(counts.total_count, 1);
}

#[test]
fn dirty_connection_is_not_pooled_uncleaned() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(ConnectionPool::new());
    let config = pooled_config(&dir);
    let path = config.path.clone();

    let conn = Connection::open_with_pool(config.clone(), Arc::clone(&pool)).unwrap();
    conn.execute("CREATE TABLE t (x INTEGER)").unwrap();
    conn.execute("BEGIN; INSERT INTO t VALUES (1);").unwrap();
    assert!(!conn.is_autocommit().unwrap());
    conn.close();
    // The open transaction was rolled back before pooling.
    assert_eq!(pool.counts(&path).total_count, 1);

    let conn = Connection::open_with_pool(config, Arc::clone(&pool)).unwrap();
    assert!(conn.is_autocommit().unwrap());
    let (stmt, _) = conn
        .prepare("SELECT count(*) FROM t", std::time::Duration::from_secs(5))
        .unwrap();
    let mut stmt = stmt.unwrap();
    assert!(stmt.step().unwrap());
    assert_eq!(stmt.column_i64(0).unwrap(), 0);
}

#[test]
fn version_bump_retires_pooled_handles() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(ConnectionPool::new());
    let config = pooled_config(&dir);
    let path = config.path.clone();

    Connection::open_with_pool(config.clone(), Arc::clone(&pool))
        .unwrap()
        .close();
    assert_eq!(pool.counts(&path).total_count, 1);

    pool.bump_version();
    // The stale handle is discarded, not reused; a fresh one is opened.
    let conn = Connection::open_with_pool(config, Arc::clone(&pool)).unwrap();
    assert!(conn.is_open());
    assert_eq!(pool.counts(&path).total_count, 0);
}
