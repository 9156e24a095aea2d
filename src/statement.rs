//! Prepared statements and the prepare/step/reset state machine.
//!
//! Prepare and step both absorb transient `Busy`/`Locked` contention with
//! randomized backoff inside a per-command wall-clock budget, and recover
//! from `Schema` invalidation by re-preparing (and re-binding) the same SQL.
//! A leading `TYPES` pseudo-clause supplies per-column declared-type
//! overrides and is stripped before the real SQL reaches the library.

use crate::connection::Connection;
use crate::error::{last_error_string, Error, Result, ResultCode};
use crate::handle::StatementHandle;
use crate::retry::RetryPolicy;
use crate::value::{bind_value, refine_value, DateTimeFormat, TypeAffinity, Value};
use chrono::{DateTime, Utc};
use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Maximum number of re-prepare attempts after `SQLITE_SCHEMA`.
const SCHEMA_RETRIES: u32 = 3;

/// What a successful reset had to do to get the statement back to the
/// start of its row sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The native reset succeeded directly.
    Clean,
    /// The schema changed underneath the statement; it was re-prepared
    /// against the current schema and recorded bindings were re-applied.
    Reprepared,
}

enum ResetState {
    Clean,
    Contended(ResultCode),
    Reprepared,
}

enum RawPrepared {
    Statement(StatementHandle, usize),
    Empty(usize),
    TypesClause,
}

fn is_types_clause(sql: &str, message: &str) -> bool {
    message.contains("near \"TYPES\"")
        && sql
            .trim_start()
            .get(..5)
            .is_some_and(|head| head.eq_ignore_ascii_case("TYPES"))
}

/// Parses the comma-separated type list of a `TYPES` clause. Empty slots
/// leave the corresponding column's declared type untouched.
fn parse_type_overrides(clause: &str) -> Vec<Option<String>> {
    let body = clause.trim_start();
    let body = &body[5..]; // past "TYPES"
    body.split(',')
        .map(|item| {
            let name = item.trim().trim_matches(|c| c == '[' || c == ']').trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_owned())
            }
        })
        .collect()
}

/// One prepare attempt loop: handles Schema and Busy/Locked retries, and
/// reports an unparsed leading `TYPES` clause to the caller when allowed.
fn raw_prepare(
    conn: &Connection,
    sql: &str,
    policy: &RetryPolicy,
    allow_types: bool,
) -> Result<RawPrepared> {
    let db = conn.db()?;
    let budget = policy.begin();
    let mut schema_retries = 0u32;
    loop {
        let mut stmt: *mut ffi::sqlite3_stmt = std::ptr::null_mut();
        let mut tail: *const c_char = std::ptr::null();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                sql.as_ptr() as *const c_char,
                sql.len() as c_int,
                &mut stmt,
                &mut tail,
            )
        };
        if rc == ffi::SQLITE_OK {
            let consumed = if tail.is_null() {
                sql.len()
            } else {
                tail as usize - sql.as_ptr() as usize
            };
            if stmt.is_null() {
                // Whitespace or comments only.
                return Ok(RawPrepared::Empty(consumed));
            }
            return Ok(RawPrepared::Statement(
                unsafe { StatementHandle::from_raw(stmt) },
                consumed,
            ));
        }
        match ResultCode::from_raw(rc) {
            ResultCode::Schema if schema_retries < SCHEMA_RETRIES => {
                schema_retries += 1;
                trace!(schema_retries, "re-preparing after schema change");
            }
            code if code.is_contended() => {
                if !budget.backoff() {
                    return Err(Error::sqlite(code, last_error_string(db)));
                }
            }
            ResultCode::Error if allow_types && is_types_clause(sql, &last_error_string(db)) => {
                return Ok(RawPrepared::TypesClause);
            }
            _ => return Err(Error::from_handle(rc, db)),
        }
    }
}

impl Connection {
    /// Prepares the first statement in `sql`, returning it together with
    /// the unconsumed remainder of the input.
    ///
    /// Returns `None` for the statement when the consumed prefix held only
    /// whitespace or comments. A leading `TYPES t1, t2, ...;` clause is
    /// consumed here and turned into declared-type overrides on the
    /// statement that follows it.
    pub fn prepare<'conn>(
        &'conn self,
        sql: &str,
        timeout: Duration,
    ) -> Result<(Option<Statement<'conn>>, String)> {
        let policy = self.retry_policy(timeout);
        let mut overrides: Vec<Option<String>> = Vec::new();
        let mut input = sql.to_owned();
        loop {
            match raw_prepare(self, &input, &policy, true)? {
                RawPrepared::Empty(consumed) => {
                    return Ok((None, input[consumed..].to_owned()));
                }
                RawPrepared::Statement(handle, consumed) => {
                    let text = unsafe {
                        let ptr = ffi::sqlite3_sql(handle.as_ptr());
                        if ptr.is_null() {
                            String::new()
                        } else {
                            CStr::from_ptr(ptr).to_string_lossy().into_owned()
                        }
                    };
                    let remainder = input[consumed..].to_owned();
                    debug!(sql = %text, "prepared statement");
                    let stmt = Statement {
                        conn: self,
                        handle,
                        sql: text,
                        type_overrides: std::mem::take(&mut overrides),
                        bindings: Vec::new(),
                        timeout,
                    };
                    return Ok((Some(stmt), remainder));
                }
                RawPrepared::TypesClause => {
                    // Strip the pseudo-clause and prepare what follows it.
                    let (clause, rest) = match input.find(';') {
                        Some(pos) => (input[..pos].to_owned(), input[pos + 1..].to_owned()),
                        None => (input.clone(), String::new()),
                    };
                    overrides = parse_type_overrides(&clause);
                    debug!(columns = overrides.len(), "applied TYPES clause overrides");
                    input = rest;
                }
            }
        }
    }
}

/// A prepared statement bound to the connection that produced it.
///
/// Bindings are recorded managed-side so a schema-invalidated statement can
/// be transparently re-prepared and re-bound.
pub struct Statement<'conn> {
    conn: &'conn Connection,
    handle: StatementHandle,
    sql: String,
    type_overrides: Vec<Option<String>>,
    // 0-based slot per 1-based parameter ordinal.
    bindings: Vec<Option<Value>>,
    timeout: Duration,
}

impl<'conn> Statement<'conn> {
    fn stmt(&self) -> Result<*mut ffi::sqlite3_stmt> {
        if self.handle.is_invalid() {
            Err(Error::InvalidHandle("statement is finalized"))
        } else {
            Ok(self.handle.as_ptr())
        }
    }

    fn format(&self) -> DateTimeFormat {
        self.conn.datetime_format()
    }

    /// The SQL text this statement was compiled from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Advances to the next row. `Ok(true)` means a row is available,
    /// `Ok(false)` means the statement ran to completion.
    ///
    /// Transient contention is absorbed with randomized backoff until the
    /// per-command budget runs out; a schema change triggers a transparent
    /// re-prepare and the step is retried from the start of the statement.
    pub fn step(&mut self) -> Result<bool> {
        let budget = self.conn.retry_policy(self.timeout).begin();
        loop {
            let stmt = self.stmt()?;
            let rc = unsafe { ffi::sqlite3_step(stmt) };
            match ResultCode::from_raw(rc) {
                ResultCode::Row => return Ok(true),
                ResultCode::Done => return Ok(false),
                _ => match self.try_reset()? {
                    // Reset succeeding means the step error was genuine.
                    ResetState::Clean => {
                        return Err(Error::from_handle(rc, self.conn.db()?));
                    }
                    ResetState::Contended(code) => {
                        if !budget.backoff() {
                            return Err(Error::sqlite(
                                code,
                                last_error_string(self.conn.db()?),
                            ));
                        }
                    }
                    ResetState::Reprepared => {
                        trace!("statement re-prepared mid-step, retrying");
                    }
                },
            }
        }
    }

    /// Rewinds the statement so it can be stepped again. Bindings are
    /// preserved (and re-applied if a re-prepare was needed).
    pub fn reset(&mut self) -> Result<ResetOutcome> {
        let budget = self.conn.retry_policy(self.timeout).begin();
        loop {
            match self.try_reset()? {
                ResetState::Clean => return Ok(ResetOutcome::Clean),
                ResetState::Reprepared => return Ok(ResetOutcome::Reprepared),
                ResetState::Contended(code) => {
                    if !budget.backoff() {
                        return Err(Error::sqlite(code, last_error_string(self.conn.db()?)));
                    }
                }
            }
        }
    }

    fn try_reset(&mut self) -> Result<ResetState> {
        let stmt = self.stmt()?;
        let rc = unsafe { ffi::sqlite3_reset(stmt) };
        match ResultCode::from_raw(rc) {
            ResultCode::Ok => Ok(ResetState::Clean),
            code if code.is_contended() => Ok(ResetState::Contended(code)),
            ResultCode::Schema => {
                self.reprepare()?;
                Ok(ResetState::Reprepared)
            }
            _ => Err(Error::from_handle(rc, self.conn.db()?)),
        }
    }

    /// Compiles the stored SQL against the current schema and re-applies
    /// every recorded binding, then swaps the new handle in.
    fn reprepare(&mut self) -> Result<()> {
        let policy = self.conn.retry_policy(self.timeout);
        let handle = match raw_prepare(self.conn, &self.sql, &policy, false)? {
            RawPrepared::Statement(handle, _) => handle,
            RawPrepared::Empty(_) | RawPrepared::TypesClause => {
                return Err(Error::sqlite(
                    ResultCode::Schema,
                    "statement vanished during re-prepare",
                ));
            }
        };
        let format = self.format();
        for (slot, binding) in self.bindings.iter().enumerate() {
            if let Some(value) = binding {
                let rc =
                    unsafe { bind_value(handle.as_ptr(), (slot + 1) as c_int, value, format) };
                if rc != ffi::SQLITE_OK {
                    return Err(Error::from_handle(rc, self.conn.db()?));
                }
            }
        }
        debug!(sql = %self.sql, "statement re-prepared after schema change");
        self.handle = handle;
        Ok(())
    }

    /// Number of SQL parameters in the statement.
    pub fn parameter_count(&self) -> Result<usize> {
        Ok(unsafe { ffi::sqlite3_bind_parameter_count(self.stmt()?) } as usize)
    }

    /// Resolves a named parameter (e.g. `:id`) to its 1-based ordinal.
    pub fn parameter_index(&self, name: &str) -> Result<Option<usize>> {
        let stmt = self.stmt()?;
        let name = std::ffi::CString::new(name)?;
        let index = unsafe { ffi::sqlite3_bind_parameter_index(stmt, name.as_ptr()) };
        Ok((index > 0).then_some(index as usize))
    }

    /// Binds a value to a 1-based parameter ordinal, recording it for
    /// re-binding after a schema-driven re-prepare.
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let stmt = self.stmt()?;
        let rc = unsafe { bind_value(stmt, index as c_int, &value, self.format()) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_handle(rc, self.conn.db()?));
        }
        if self.bindings.len() < index {
            self.bindings.resize(index, None);
        }
        self.bindings[index - 1] = Some(value);
        Ok(())
    }

    /// Binds a value by parameter name.
    pub fn bind_named(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        match self.parameter_index(name)? {
            Some(index) => self.bind(index, value),
            None => Err(Error::sqlite(
                ResultCode::Range,
                format!("no parameter named {name:?}"),
            )),
        }
    }

    /// Binds a 32-bit unsigned value. By default this goes through the
    /// 32-bit signed path and large values wrap negative; the connection's
    /// `bind_u32_as_i64` option routes it through the 64-bit path instead.
    pub fn bind_u32(&mut self, index: usize, value: u32) -> Result<()> {
        let stored = if self.conn.bind_u32_as_i64() {
            i64::from(value)
        } else {
            i64::from(value as i32)
        };
        self.bind(index, stored)
    }

    /// Clears every parameter back to NULL and drops the recorded bindings.
    pub fn clear_bindings(&mut self) -> Result<()> {
        let stmt = self.stmt()?;
        unsafe { ffi::sqlite3_clear_bindings(stmt) };
        self.bindings.clear();
        Ok(())
    }

    pub fn column_count(&self) -> Result<usize> {
        Ok(unsafe { ffi::sqlite3_column_count(self.stmt()?) } as usize)
    }

    pub fn column_name(&self, index: usize) -> Result<String> {
        let stmt = self.stmt()?;
        let ptr = unsafe { ffi::sqlite3_column_name(stmt, index as c_int) };
        if ptr.is_null() {
            return Err(Error::sqlite(
                ResultCode::Range,
                format!("column index {index} out of range"),
            ));
        }
        Ok(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    /// Declared type of a result column. A `TYPES` clause override takes
    /// precedence over what the schema declares.
    pub fn column_decltype(&self, index: usize) -> Result<Option<String>> {
        if let Some(Some(decl)) = self.type_overrides.get(index) {
            return Ok(Some(decl.clone()));
        }
        let stmt = self.stmt()?;
        let ptr = unsafe { ffi::sqlite3_column_decltype(stmt, index as c_int) };
        if ptr.is_null() {
            return Ok(None);
        }
        Ok(Some(
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned(),
        ))
    }

    /// Storage class of the value in the current row.
    pub fn column_affinity(&self, index: usize) -> Result<TypeAffinity> {
        let stmt = self.stmt()?;
        Ok(TypeAffinity::from_raw(unsafe {
            ffi::sqlite3_column_type(stmt, index as c_int)
        }))
    }

    pub fn column_is_null(&self, index: usize) -> Result<bool> {
        Ok(self.column_affinity(index)? == TypeAffinity::Null)
    }

    pub fn column_i64(&self, index: usize) -> Result<i64> {
        Ok(unsafe { ffi::sqlite3_column_int64(self.stmt()?, index as c_int) })
    }

    pub fn column_f64(&self, index: usize) -> Result<f64> {
        Ok(unsafe { ffi::sqlite3_column_double(self.stmt()?, index as c_int) })
    }

    pub fn column_text(&self, index: usize) -> Result<String> {
        let stmt = self.stmt()?;
        unsafe {
            let ptr = ffi::sqlite3_column_text(stmt, index as c_int);
            if ptr.is_null() {
                return Ok(String::new());
            }
            let len = ffi::sqlite3_column_bytes(stmt, index as c_int) as usize;
            let bytes = std::slice::from_raw_parts(ptr, len);
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    pub fn column_blob(&self, index: usize) -> Result<Vec<u8>> {
        let stmt = self.stmt()?;
        unsafe {
            let len = ffi::sqlite3_column_bytes(stmt, index as c_int) as usize;
            let ptr = ffi::sqlite3_column_blob(stmt, index as c_int);
            if ptr.is_null() || len == 0 {
                return Ok(Vec::new());
            }
            Ok(std::slice::from_raw_parts(ptr as *const u8, len).to_vec())
        }
    }

    /// Copies part of a blob column into `buf`, starting at `data_offset`
    /// within the blob, and returns the number of bytes copied. Passing no
    /// buffer queries the blob's total size instead.
    pub fn column_blob_chunk(
        &self,
        index: usize,
        data_offset: usize,
        buf: Option<&mut [u8]>,
    ) -> Result<usize> {
        let stmt = self.stmt()?;
        unsafe {
            let len = ffi::sqlite3_column_bytes(stmt, index as c_int) as usize;
            let Some(buf) = buf else {
                return Ok(len);
            };
            if data_offset >= len {
                return Ok(0);
            }
            let ptr = ffi::sqlite3_column_blob(stmt, index as c_int);
            if ptr.is_null() {
                return Ok(0);
            }
            let count = buf.len().min(len - data_offset);
            std::ptr::copy_nonoverlapping(
                (ptr as *const u8).add(data_offset),
                buf.as_mut_ptr(),
                count,
            );
            Ok(count)
        }
    }

    /// Partial read over the UTF-8 bytes of a text column, with the same
    /// offset/buffer/size-query contract as [`column_blob_chunk`](Self::column_blob_chunk).
    pub fn column_text_chunk(
        &self,
        index: usize,
        data_offset: usize,
        buf: Option<&mut [u8]>,
    ) -> Result<usize> {
        let stmt = self.stmt()?;
        unsafe {
            // column_text must run before column_bytes so the length
            // reflects the text representation.
            let ptr = ffi::sqlite3_column_text(stmt, index as c_int);
            let len = ffi::sqlite3_column_bytes(stmt, index as c_int) as usize;
            let Some(buf) = buf else {
                return Ok(len);
            };
            if ptr.is_null() || data_offset >= len {
                return Ok(0);
            }
            let count = buf.len().min(len - data_offset);
            std::ptr::copy_nonoverlapping(ptr.add(data_offset), buf.as_mut_ptr(), count);
            Ok(count)
        }
    }

    /// Extracts the value in the current row with declared-type
    /// refinements applied: GUID columns yield [`Value::Guid`], date/time
    /// columns decode through the connection's [`DateTimeFormat`].
    pub fn column_value(&self, index: usize) -> Result<Value> {
        let raw = match self.column_affinity(index)? {
            TypeAffinity::Null => Value::Null,
            TypeAffinity::Integer => Value::Integer(self.column_i64(index)?),
            TypeAffinity::Float => Value::Real(self.column_f64(index)?),
            TypeAffinity::Text => Value::Text(self.column_text(index)?),
            TypeAffinity::Blob => Value::Blob(self.column_blob(index)?),
        };
        let decl = self.column_decltype(index)?;
        refine_value(raw, decl.as_deref(), self.format())
    }

    /// Reads a date/time column through the connection's format.
    pub fn column_datetime(&self, index: usize) -> Result<DateTime<Utc>> {
        match self.column_value(index)? {
            Value::DateTime(t) => Ok(t),
            raw => self.format().decode(&raw),
        }
    }

    /// Reads a GUID column, accepting a 16-byte blob or canonical text.
    pub fn column_guid(&self, index: usize) -> Result<Uuid> {
        match refine_value(self.column_value(index)?, Some("guid"), self.format())? {
            Value::Guid(id) => Ok(id),
            other => Err(Error::Conversion(format!(
                "column {index} holds {:?}, not a GUID",
                other.affinity()
            ))),
        }
    }

    /// Releases the native statement. Also happens on drop.
    pub fn finalize(mut self) {
        self.handle.finalize();
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("finalized", &self.handle.is_invalid())
            .finish()
    }
}
