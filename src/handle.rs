//! Scoped-lifetime wrappers around raw native pointers.
//!
//! Each wrapper owns exactly one native resource and releases it exactly
//! once. Release failures are logged and swallowed; cleanup paths must be
//! unconditionally safe.

use libsqlite3_sys as ffi;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

// libsqlite3-sys omits this binding, but the bundled library exports it.
extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> std::os::raw::c_int;
}

static LIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static LIVE_STATEMENTS: AtomicUsize = AtomicUsize::new(0);
static LIVE_BACKUPS: AtomicUsize = AtomicUsize::new(0);

/// Number of connection handles currently alive in this process.
pub fn live_connection_handles() -> usize {
    LIVE_CONNECTIONS.load(Ordering::SeqCst)
}

/// Number of statement handles currently alive in this process.
pub fn live_statement_handles() -> usize {
    LIVE_STATEMENTS.load(Ordering::SeqCst)
}

/// Number of backup handles currently alive in this process.
pub fn live_backup_handles() -> usize {
    LIVE_BACKUPS.load(Ordering::SeqCst)
}

/// Owns one native database connection pointer.
///
/// A null pointer is the invalid sentinel; a non-null pointer with
/// `owned == false` is a borrowed handle whose release is a no-op.
pub struct ConnectionHandle {
    db: *mut ffi::sqlite3,
    owned: bool,
}

// The bundled SQLite build runs in serialized threading mode, and the pool
// moves closed handles between threads. No aliasing occurs because a pooled
// handle has exactly one owner at a time.
unsafe impl Send for ConnectionHandle {}

impl ConnectionHandle {
    /// Takes ownership of a raw connection pointer.
    ///
    /// # Safety
    /// `db` must be a valid pointer returned by `sqlite3_open_v2` (or null),
    /// and no other owner may close it while this wrapper is alive.
    pub unsafe fn from_raw(db: *mut ffi::sqlite3, owned: bool) -> Self {
        if !db.is_null() {
            LIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        }
        ConnectionHandle { db, owned }
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3 {
        self.db
    }

    pub fn is_invalid(&self) -> bool {
        self.db.is_null()
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Releases the native connection. Idempotent; never panics.
    pub fn close(&mut self) {
        if self.db.is_null() {
            return;
        }
        let db = self.db;
        self.db = std::ptr::null_mut();
        LIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
        if !self.owned {
            return;
        }
        let rc = unsafe { ffi::sqlite3_close(db) };
        if rc != ffi::SQLITE_OK {
            // Outstanding statements keep the connection alive; close_v2
            // defers the actual free until they are finalized.
            warn!(rc, "sqlite3_close failed, falling back to close_v2");
            unsafe {
                sqlite3_close_v2(db);
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("db", &self.db)
            .field("owned", &self.owned)
            .finish()
    }
}

/// Owns one native prepared-statement pointer.
///
/// Logically owned by exactly one `Statement`, which itself borrows the
/// connection that produced it; a statement handle never outlives its
/// connection.
pub struct StatementHandle {
    stmt: *mut ffi::sqlite3_stmt,
}

impl StatementHandle {
    /// Takes ownership of a raw statement pointer.
    ///
    /// # Safety
    /// `stmt` must come from `sqlite3_prepare_v2` on a live connection and
    /// must not be finalized elsewhere.
    pub unsafe fn from_raw(stmt: *mut ffi::sqlite3_stmt) -> Self {
        if !stmt.is_null() {
            LIVE_STATEMENTS.fetch_add(1, Ordering::SeqCst);
        }
        StatementHandle { stmt }
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.stmt
    }

    pub fn is_invalid(&self) -> bool {
        self.stmt.is_null()
    }

    /// Finalizes the native statement. Idempotent; never panics.
    ///
    /// A failing finalize only reports the error of the most recent step
    /// and still frees the statement, so the result is ignored.
    pub fn finalize(&mut self) {
        if self.stmt.is_null() {
            return;
        }
        let stmt = self.stmt;
        self.stmt = std::ptr::null_mut();
        LIVE_STATEMENTS.fetch_sub(1, Ordering::SeqCst);
        unsafe {
            ffi::sqlite3_finalize(stmt);
        }
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl std::fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StatementHandle").field(&self.stmt).finish()
    }
}

/// Owns one native backup object pointer.
pub struct BackupHandle {
    backup: *mut ffi::sqlite3_backup,
}

impl BackupHandle {
    /// Takes ownership of a raw backup pointer.
    ///
    /// # Safety
    /// `backup` must come from `sqlite3_backup_init` and both participating
    /// connections must outlive this wrapper.
    pub unsafe fn from_raw(backup: *mut ffi::sqlite3_backup) -> Self {
        if !backup.is_null() {
            LIVE_BACKUPS.fetch_add(1, Ordering::SeqCst);
        }
        BackupHandle { backup }
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3_backup {
        self.backup
    }

    pub fn is_invalid(&self) -> bool {
        self.backup.is_null()
    }

    /// Releases the native backup object and reports the finish code.
    /// Idempotent: a second call returns `SQLITE_OK` without touching
    /// native state.
    pub fn finish(&mut self) -> std::os::raw::c_int {
        if self.backup.is_null() {
            return ffi::SQLITE_OK;
        }
        let backup = self.backup;
        self.backup = std::ptr::null_mut();
        LIVE_BACKUPS.fetch_sub(1, Ordering::SeqCst);
        unsafe { ffi::sqlite3_backup_finish(backup) }
    }
}

impl Drop for BackupHandle {
    fn drop(&mut self) {
        let rc = self.finish();
        if rc != ffi::SQLITE_OK {
            warn!(rc, "sqlite3_backup_finish failed during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_handles_are_noop() {
        let mut conn = unsafe { ConnectionHandle::from_raw(std::ptr::null_mut(), true) };
        assert!(conn.is_invalid());
        conn.close();
        conn.close();

        let mut stmt = unsafe { StatementHandle::from_raw(std::ptr::null_mut()) };
        assert!(stmt.is_invalid());
        stmt.finalize();
        stmt.finalize();

        let mut backup = unsafe { BackupHandle::from_raw(std::ptr::null_mut()) };
        assert!(backup.is_invalid());
        assert_eq!(backup.finish(), ffi::SQLITE_OK);
    }

    #[test]
    fn borrowed_connection_skips_native_close() {
        // A fabricated non-null pointer is never dereferenced for a
        // borrowed handle, so close must be a pure bookkeeping operation.
        let before = live_connection_handles();
        let fake = 0x1000 as *mut ffi::sqlite3;
        let mut conn = unsafe { ConnectionHandle::from_raw(fake, false) };
        assert_eq!(live_connection_handles(), before + 1);
        assert!(!conn.is_owned());
        conn.close();
        assert!(conn.is_invalid());
        assert_eq!(live_connection_handles(), before);
    }
}
