//! Online backup sessions between two open connections.

use crate::connection::Connection;
use crate::error::{Error, Result, ResultCode};
use crate::handle::BackupHandle;
use libsqlite3_sys as ffi;
use std::ffi::CString;
use std::os::raw::c_int;
use tracing::debug;

impl Connection {
    /// Starts a backup that copies `source_name` of `source` into
    /// `dest_name` of this connection. Database names are usually `main`.
    pub fn backup_init<'a>(
        &'a self,
        dest_name: &str,
        source: &'a Connection,
        source_name: &str,
    ) -> Result<Backup<'a>> {
        let dest_db = self.db()?;
        let source_db = source.db()?;
        let dest_name = CString::new(dest_name)?;
        let source_name = CString::new(source_name)?;
        let raw = unsafe {
            ffi::sqlite3_backup_init(
                dest_db,
                dest_name.as_ptr(),
                source_db,
                source_name.as_ptr(),
            )
        };
        if raw.is_null() {
            // Init failures leave their error on the destination handle.
            let rc = unsafe { ffi::sqlite3_errcode(dest_db) };
            return Err(Error::from_handle(rc, dest_db));
        }
        Ok(Backup {
            handle: unsafe { BackupHandle::from_raw(raw) },
            dest: self,
            last_step: None,
        })
    }
}

/// One in-progress backup.
///
/// The source and destination connections must outlive the session; the
/// borrow makes the compiler enforce what the native API only documents.
pub struct Backup<'a> {
    handle: BackupHandle,
    dest: &'a Connection,
    // Raw result of the most recent step, for finish reconciliation.
    last_step: Option<c_int>,
}

impl Backup<'_> {
    fn raw(&self) -> Result<*mut ffi::sqlite3_backup> {
        if self.handle.is_invalid() {
            Err(Error::InvalidHandle("backup is finished"))
        } else {
            Ok(self.handle.as_ptr())
        }
    }

    /// Copies up to `pages` pages (negative copies everything remaining).
    ///
    /// Returns `true` while the backup should be stepped again; that
    /// includes transient `Busy`/`Locked` outcomes, which the caller may
    /// retry after backing off. Returns `false` once the copy is complete.
    pub fn step(&mut self, pages: i32) -> Result<bool> {
        let raw = self.raw()?;
        let rc = unsafe { ffi::sqlite3_backup_step(raw, pages as c_int) };
        self.last_step = Some(rc);
        match ResultCode::from_raw(rc) {
            ResultCode::Done => Ok(false),
            ResultCode::Ok => Ok(true),
            code if code.is_contended() => Ok(true),
            _ => Err(Error::from_handle(rc, self.dest.db()?)),
        }
    }

    /// Pages still to be copied, as of the last step.
    pub fn remaining(&self) -> Result<i32> {
        Ok(unsafe { ffi::sqlite3_backup_remaining(self.raw()?) })
    }

    /// Total pages in the source database, as of the last step.
    pub fn page_count(&self) -> Result<i32> {
        Ok(unsafe { ffi::sqlite3_backup_pagecount(self.raw()?) })
    }

    /// Steps until the copy completes, backing off on a contended source
    /// within the destination connection's command timeout.
    pub fn run_to_completion(&mut self, pages: i32) -> Result<()> {
        let budget = self
            .dest
            .retry_policy(self.dest.config().command_timeout)
            .begin();
        while self.step(pages)? {
            let contended = match self.last_step {
                Some(rc) => ResultCode::from_raw(rc).is_contended(),
                None => false,
            };
            if contended && !budget.backoff() {
                let rc = self.last_step.unwrap_or(ffi::SQLITE_BUSY);
                return Err(Error::sqlite(
                    ResultCode::from_raw(rc),
                    "backup source stayed locked past the command timeout",
                ));
            }
        }
        Ok(())
    }

    /// Releases the session and surfaces any error the copy left behind.
    ///
    /// Finish re-reports the error of the last failed step; an error
    /// already seen there is not raised a second time.
    pub fn finish(mut self) -> Result<()> {
        let rc = self.handle.finish();
        if rc != ffi::SQLITE_OK && Some(rc) != self.last_step {
            return Err(Error::from_handle(rc, self.dest.db()?));
        }
        debug!("backup finished");
        Ok(())
    }
}

impl std::fmt::Debug for Backup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("finished", &self.handle.is_invalid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use std::time::Duration;

    fn seeded_source() -> Connection {
        let conn = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").unwrap();
        conn.execute("INSERT INTO t VALUES (1), (2), (3)").unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        let (stmt, _) = conn
            .prepare("SELECT count(*) FROM t", Duration::from_secs(5))
            .unwrap();
        let mut stmt = stmt.unwrap();
        assert!(stmt.step().unwrap());
        stmt.column_i64(0).unwrap()
    }

    #[test]
    fn full_copy_in_one_step() {
        let source = seeded_source();
        let dest = Connection::open(ConnectionConfig::new(":memory:")).unwrap();

        let mut backup = dest.backup_init("main", &source, "main").unwrap();
        assert!(!backup.step(-1).unwrap());
        assert_eq!(backup.remaining().unwrap(), 0);
        assert!(backup.page_count().unwrap() > 0);
        backup.finish().unwrap();

        assert_eq!(count(&dest), 3);
    }

    #[test]
    fn incremental_steps_make_progress() {
        let source = seeded_source();
        // Spread the content over enough pages for more than one step.
        source
            .execute("CREATE TABLE bulk (data BLOB)")
            .unwrap();
        for _ in 0..20 {
            source
                .execute("INSERT INTO bulk VALUES (randomblob(4096))")
                .unwrap();
        }
        let dest = Connection::open(ConnectionConfig::new(":memory:")).unwrap();

        let mut backup = dest.backup_init("main", &source, "main").unwrap();
        assert!(backup.step(1).unwrap());
        let after_first = backup.remaining().unwrap();
        assert!(after_first > 0);
        backup.run_to_completion(4).unwrap();
        assert_eq!(backup.remaining().unwrap(), 0);
        backup.finish().unwrap();

        assert_eq!(count(&dest), 3);
    }

    #[test]
    fn init_failure_reports_destination_error() {
        let source = seeded_source();
        let dest = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        let err = dest
            .backup_init("no_such_db", &source, "main")
            .unwrap_err();
        assert!(matches!(err, Error::Sqlite { .. }), "got {err:?}");
    }

    #[test]
    fn drop_without_finish_releases_the_handle() {
        let source = seeded_source();
        let dest = Connection::open(ConnectionConfig::new(":memory:")).unwrap();
        let before = crate::handle::live_backup_handles();
        {
            let _backup = dest.backup_init("main", &source, "main").unwrap();
            assert_eq!(crate::handle::live_backup_handles(), before + 1);
        }
        assert_eq!(crate::handle::live_backup_handles(), before);
    }
}
