//! Database connections: native open, pool lookup, and connection-scoped
//! native services (interrupt, busy timeout, extension loading).

use crate::error::{last_error_string, Error, Result, ResultCode};
use crate::handle::ConnectionHandle;
use crate::pool::ConnectionPool;
use crate::retry::{Clock, RetryPolicy, SystemClock};
use crate::value::DateTimeFormat;
use libsqlite3_sys as ffi;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connection-wide configuration.
///
/// This is deliberately a plain data struct; connection-string parsing
/// belongs to the caller-facing layer, not the interop layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database file path, or `:memory:`.
    pub path: String,
    /// Raw `SQLITE_OPEN_*` flags. Defaults to read-write + create.
    pub open_flags: i32,
    /// Reuse pooled handles for this path.
    pub use_pool: bool,
    /// Upper bound on pooled handles per path.
    pub max_pool_size: usize,
    /// Default per-command wall-clock budget for prepare/step retries.
    pub command_timeout: Duration,
    /// Encoding applied to bound and extracted date/time values.
    pub datetime_format: DateTimeFormat,
    /// Route 32-bit unsigned values through the 64-bit bind path to avoid
    /// sign-extension surprises.
    pub bind_u32_as_i64: bool,
}

impl ConnectionConfig {
    pub fn new(path: impl Into<String>) -> Self {
        ConnectionConfig {
            path: path.into(),
            open_flags: ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
            use_pool: false,
            max_pool_size: 100,
            command_timeout: Duration::from_secs(30),
            datetime_format: DateTimeFormat::default(),
            bind_u32_as_i64: false,
        }
    }

    pub fn pooled(mut self) -> Self {
        self.use_pool = true;
        self
    }

    pub fn with_datetime_format(mut self, format: DateTimeFormat) -> Self {
        self.datetime_format = format;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_u32_as_i64(mut self) -> Self {
        self.bind_u32_as_i64 = true;
        self
    }
}

/// One native database connection.
///
/// Statement lifecycle calls on a connection must be issued by a single
/// logical owner at a time; the only cross-connection shared structure is
/// the pool.
pub struct Connection {
    handle: ConnectionHandle,
    config: ConnectionConfig,
    pool: Arc<ConnectionPool>,
    pool_version: u64,
    use_pool: Cell<bool>,
    clock: Arc<dyn Clock>,
}

// The bundled library runs in serialized threading mode; a Connection has
// one logical owner at a time.
unsafe impl Send for Connection {}

impl Connection {
    /// Opens a connection using the process-wide default pool.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        Self::open_with_pool(config, ConnectionPool::shared())
    }

    /// Opens a connection against an explicit pool instance.
    pub fn open_with_pool(config: ConnectionConfig, pool: Arc<ConnectionPool>) -> Result<Self> {
        let (pooled, pool_version) = if config.use_pool {
            pool.remove(&config.path, config.max_pool_size)
        } else {
            (None, pool.version())
        };

        let handle = match pooled {
            Some(handle) => {
                debug!(path = %config.path, "opened from pool");
                handle
            }
            None => Self::open_native(&config)?,
        };

        let conn = Connection {
            handle,
            use_pool: Cell::new(config.use_pool),
            config,
            pool,
            pool_version,
            clock: Arc::new(SystemClock),
        };
        // Retry discipline lives in this layer, not in the native busy
        // handler.
        conn.busy_timeout(Duration::ZERO)?;
        Ok(conn)
    }

    fn open_native(config: &ConnectionConfig) -> Result<ConnectionHandle> {
        let path = CString::new(config.path.as_str())?;
        let mut db: *mut ffi::sqlite3 = std::ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                path.as_ptr(),
                &mut db,
                config.open_flags as c_int,
                std::ptr::null(),
            )
        };
        if rc != ffi::SQLITE_OK {
            let err = Error::from_handle(rc, db);
            if !db.is_null() {
                // A failed open can still allocate a handle that must be freed.
                unsafe { ffi::sqlite3_close(db) };
            }
            return Err(err);
        }
        debug!(path = %config.path, "opened native connection");
        Ok(unsafe { ConnectionHandle::from_raw(db, true) })
    }

    /// Wraps a foreign (borrowed) native handle. The wrapper never closes it.
    ///
    /// # Safety
    /// `db` must stay valid for the lifetime of the returned connection.
    pub unsafe fn from_borrowed(db: *mut ffi::sqlite3, config: ConnectionConfig) -> Self {
        Connection {
            handle: ConnectionHandle::from_raw(db, false),
            use_pool: Cell::new(false),
            config,
            pool: ConnectionPool::shared(),
            pool_version: 0,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_invalid()
    }

    pub(crate) fn db(&self) -> Result<*mut ffi::sqlite3> {
        if self.handle.is_invalid() {
            Err(Error::InvalidHandle("connection is closed"))
        } else {
            Ok(self.handle.as_ptr())
        }
    }

    pub(crate) fn datetime_format(&self) -> DateTimeFormat {
        self.config.datetime_format
    }

    pub(crate) fn bind_u32_as_i64(&self) -> bool {
        self.config.bind_u32_as_i64
    }

    pub(crate) fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::with_clock(timeout, Arc::clone(&self.clock))
    }

    /// Replaces the time source used by retry loops. Intended for tests.
    pub fn set_retry_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    /// Registering a virtual table module makes the connection ineligible
    /// for pooling: a pooled handle must carry no leftover modules.
    pub(crate) fn disable_pooling(&self) {
        if self.use_pool.replace(false) {
            debug!(path = %self.config.path, "pooling disabled for this connection");
        }
    }

    /// Last error string reported by the native library for this connection.
    pub fn last_error(&self) -> String {
        last_error_string(self.handle.as_ptr())
    }

    /// Requests that the next native step/prepare observe an interrupted
    /// status. Does not preempt an in-progress native call.
    pub fn interrupt(&self) -> Result<()> {
        unsafe { ffi::sqlite3_interrupt(self.db()?) };
        Ok(())
    }

    /// Sets the native busy handler timeout. The retry loops in this crate
    /// normally keep this at zero and do their own bounded backoff.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_busy_timeout(db, timeout.as_millis() as c_int) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_handle(rc, db));
        }
        Ok(())
    }

    pub fn last_insert_rowid(&self) -> Result<i64> {
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(self.db()?) })
    }

    /// Rows changed by the most recent INSERT/UPDATE/DELETE.
    pub fn changes(&self) -> Result<i64> {
        Ok(i64::from(unsafe { ffi::sqlite3_changes(self.db()?) }))
    }

    /// True when no explicit transaction is open.
    pub fn is_autocommit(&self) -> Result<bool> {
        Ok(unsafe { ffi::sqlite3_get_autocommit(self.db()?) } != 0)
    }

    /// Enables or disables extended result codes on this connection.
    pub fn set_extended_result_codes(&self, enabled: bool) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_extended_result_codes(db, enabled as c_int) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_handle(rc, db));
        }
        Ok(())
    }

    /// Enables or disables native extension loading.
    pub fn enable_load_extension(&self, enabled: bool) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_enable_load_extension(db, enabled as c_int) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_handle(rc, db));
        }
        Ok(())
    }

    /// Loads a native extension library, using the default entry point when
    /// `entry_point` is `None`.
    pub fn load_extension(&self, file_name: &str, entry_point: Option<&str>) -> Result<()> {
        let db = self.db()?;
        let file = CString::new(file_name)?;
        let entry = entry_point.map(CString::new).transpose()?;
        let mut err_msg: *mut std::os::raw::c_char = std::ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_load_extension(
                db,
                file.as_ptr(),
                entry.as_ref().map_or(std::ptr::null(), |e| e.as_ptr()),
                &mut err_msg,
            )
        };
        if rc != ffi::SQLITE_OK {
            let message = if err_msg.is_null() {
                last_error_string(db)
            } else {
                let msg = unsafe { CStr::from_ptr(err_msg) }
                    .to_string_lossy()
                    .into_owned();
                unsafe { ffi::sqlite3_free(err_msg as *mut std::os::raw::c_void) };
                msg
            };
            return Err(Error::Sqlite {
                code: ResultCode::from_raw(rc),
                message,
            });
        }
        Ok(())
    }

    /// Runs every statement in `sql` to completion, returning the total
    /// number of rows changed.
    pub fn execute(&self, sql: &str) -> Result<i64> {
        let before = unsafe { ffi::sqlite3_total_changes(self.db()?) };
        let mut remaining = sql.to_owned();
        while !remaining.trim().is_empty() {
            let (stmt, rest) = self.prepare(&remaining, self.config.command_timeout)?;
            remaining = rest;
            let Some(mut stmt) = stmt else { continue };
            while stmt.step()? {}
            stmt.finalize();
        }
        let after = unsafe { ffi::sqlite3_total_changes(self.db()?) };
        Ok(i64::from(after - before))
    }

    /// Rolls the connection back to a clean, poolable state.
    fn reset_to_clean_state(&self) -> bool {
        let Ok(db) = self.db() else { return false };
        let in_transaction = unsafe { ffi::sqlite3_get_autocommit(db) } == 0;
        if in_transaction {
            let rc = unsafe {
                ffi::sqlite3_exec(
                    db,
                    b"ROLLBACK\0".as_ptr() as *const std::os::raw::c_char,
                    None,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if rc != ffi::SQLITE_OK {
                return false;
            }
        }
        true
    }

    /// Closes the connection, returning the handle to the pool when
    /// eligible. Also runs on drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.handle.is_invalid() {
            return;
        }
        if !self.handle.is_owned() {
            self.handle.close();
            return;
        }
        if self.use_pool.get() && self.reset_to_clean_state() {
            let handle = std::mem::replace(&mut self.handle, unsafe {
                ConnectionHandle::from_raw(std::ptr::null_mut(), false)
            });
            self.pool.add(&self.config.path, handle, self.pool_version);
            debug!(path = %self.config.path, "connection returned to pool");
        } else {
            self.handle.close();
            debug!(path = %self.config.path, "connection closed");
        }
    }

    /// Native library version string.
    pub fn library_version() -> String {
        unsafe {
            CStr::from_ptr(ffi::sqlite3_libversion())
                .to_string_lossy()
                .into_owned()
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.config.path)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_close_in_memory() {
        let conn = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        assert!(conn.is_open());
        assert!(conn.is_autocommit().unwrap());
        conn.close();
    }

    #[test]
    fn execute_reports_changes() {
        let conn = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").unwrap();
        let changed = conn
            .execute("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);")
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(conn.last_insert_rowid().unwrap(), 2);
    }

    #[test]
    fn library_version_is_nonempty() {
        assert!(Connection::library_version().starts_with('3'));
    }

    #[test]
    fn closed_connection_rejects_operations() {
        let mut conn = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        conn.release();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.interrupt(),
            Err(Error::InvalidHandle(_))
        ));
    }
}
