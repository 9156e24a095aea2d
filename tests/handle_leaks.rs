//! Every native handle opened during a workload must be released by the
//! time the owning wrappers are gone. These assertions rely on the
//! process-wide live counters, so they live in their own test binary.

use litebridge::handle::{
    live_backup_handles, live_connection_handles, live_statement_handles,
};
use litebridge::{Connection, ConnectionConfig, ConnectionPool};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn workload_releases_every_handle() {
    let conn_before = live_connection_handles();
    let stmt_before = live_statement_handles();
    let backup_before = live_backup_handles();

    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaks.db");
        let pool = Arc::new(ConnectionPool::new());
        let config = ConnectionConfig::new(path.to_string_lossy().into_owned()).pooled();

        let conn = Connection::open_with_pool(config.clone(), Arc::clone(&pool)).unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").unwrap();

        for i in 0..10 {
            let (stmt, _) = conn
                .prepare("INSERT INTO t VALUES (?1)", Duration::from_secs(5))
                .unwrap();
            let mut stmt = stmt.unwrap();
            stmt.bind(1, i as i64).unwrap();
            assert!(!stmt.step().unwrap());
        }

        let dest = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        let mut backup = dest.backup_init("main", &conn, "main").unwrap();
        backup.run_to_completion(-1).unwrap();
        backup.finish().unwrap();

        // Returning to the pool keeps the native handle alive on purpose;
        // clearing the pool must release it.
        conn.close();
        assert_eq!(live_connection_handles(), conn_before + 2);
        pool.clear_all();
        drop(dest);
    }

    assert_eq!(live_connection_handles(), conn_before);
    assert_eq!(live_statement_handles(), stmt_before);
    assert_eq!(live_backup_handles(), backup_before);
}
