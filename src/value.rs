//! Typed value marshaling across the native boundary.
//!
//! Covers parameter binding, result-column extraction, and the value/result
//! families used by the virtual table bridge. Date/time values travel under
//! a connection-wide [`DateTimeFormat`]; GUIDs are special-cased when the
//! declared column type says so.

use crate::error::{Error, Result, ResultCode};
use chrono::{DateTime, TimeZone, Utc};
use libsqlite3_sys as ffi;
use serde::{Deserialize, Serialize};
use std::os::raw::{c_char, c_int};
use uuid::Uuid;

/// Storage-class affinity reported by the native library for a column or
/// function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeAffinity {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl TypeAffinity {
    pub fn from_raw(code: c_int) -> Self {
        match code {
            ffi::SQLITE_INTEGER => TypeAffinity::Integer,
            ffi::SQLITE_FLOAT => TypeAffinity::Float,
            ffi::SQLITE_TEXT => TypeAffinity::Text,
            ffi::SQLITE_BLOB => TypeAffinity::Blob,
            _ => TypeAffinity::Null,
        }
    }
}

/// The connection-wide encoding for date/time values, applied symmetrically
/// to binding and extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateTimeFormat {
    /// 100-nanosecond intervals since 0001-01-01T00:00:00 UTC, stored as
    /// INTEGER.
    Ticks,
    /// Fractional Julian day number, stored as REAL.
    JulianDay,
    /// Whole seconds since the Unix epoch, stored as INTEGER.
    UnixEpoch,
    /// `YYYY-MM-DD HH:MM:SS.fff` text, stored as TEXT.
    #[default]
    Iso8601,
}

/// Days between the Julian epoch and the Unix epoch, times seconds per day.
const JULIAN_UNIX_OFFSET: f64 = 2_440_587.5;
/// 100-nanosecond intervals between 0001-01-01 and the Unix epoch.
const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;
const SECONDS_PER_DAY: f64 = 86_400.0;
const ISO8601_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl DateTimeFormat {
    /// Encodes a timestamp into the storage value this format uses.
    pub fn encode(self, value: DateTime<Utc>) -> Value {
        match self {
            DateTimeFormat::Ticks => {
                let nanos = value.timestamp_nanos_opt().unwrap_or(0);
                Value::Integer(nanos / 100 + TICKS_AT_UNIX_EPOCH)
            }
            DateTimeFormat::JulianDay => {
                let secs = value.timestamp() as f64
                    + f64::from(value.timestamp_subsec_nanos()) / 1_000_000_000.0;
                Value::Real(JULIAN_UNIX_OFFSET + secs / SECONDS_PER_DAY)
            }
            DateTimeFormat::UnixEpoch => Value::Integer(value.timestamp()),
            DateTimeFormat::Iso8601 => Value::Text(value.format(ISO8601_FORMAT).to_string()),
        }
    }

    /// Decodes a storage value previously produced by [`encode`](Self::encode).
    pub fn decode(self, value: &Value) -> Result<DateTime<Utc>> {
        match (self, value) {
            (DateTimeFormat::Ticks, Value::Integer(ticks)) => {
                let nanos = ticks
                    .checked_sub(TICKS_AT_UNIX_EPOCH)
                    .and_then(|rel| rel.checked_mul(100))
                    .ok_or_else(|| {
                        Error::Conversion(format!("tick count {ticks} out of range"))
                    })?;
                Ok(Utc
                    .timestamp_opt(nanos.div_euclid(1_000_000_000), (nanos.rem_euclid(1_000_000_000)) as u32)
                    .single()
                    .ok_or_else(|| Error::Conversion(format!("tick count {ticks} out of range")))?)
            }
            (DateTimeFormat::JulianDay, Value::Real(jd)) => {
                let secs = (jd - JULIAN_UNIX_OFFSET) * SECONDS_PER_DAY;
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
                Utc.timestamp_opt(whole as i64, nanos.min(999_999_999))
                    .single()
                    .ok_or_else(|| Error::Conversion(format!("Julian day {jd} out of range")))
            }
            (DateTimeFormat::UnixEpoch, Value::Integer(secs)) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| Error::Conversion(format!("epoch seconds {secs} out of range"))),
            (DateTimeFormat::Iso8601, Value::Text(text)) => {
                let naive = chrono::NaiveDateTime::parse_from_str(text, ISO8601_FORMAT)
                    .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
                    .map_err(|e| Error::Conversion(format!("bad datetime text {text:?}: {e}")))?;
                Ok(Utc.from_utc_datetime(&naive))
            }
            (_, other) => Err(Error::Conversion(format!(
                "storage class {:?} does not match datetime format {self:?}",
                other.affinity()
            ))),
        }
    }
}

/// A managed value crossing the native boundary.
///
/// The first five variants mirror the native storage classes; `DateTime`
/// and `Guid` are managed-side refinements produced by declared-type-aware
/// extraction and accepted by binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
}

impl Value {
    pub fn affinity(&self) -> TypeAffinity {
        match self {
            Value::Null => TypeAffinity::Null,
            Value::Integer(_) | Value::DateTime(_) => TypeAffinity::Integer,
            Value::Real(_) => TypeAffinity::Float,
            Value::Text(_) => TypeAffinity::Text,
            Value::Blob(_) | Value::Guid(_) => TypeAffinity::Blob,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // Reinterpreted through two's complement; extraction reverses it.
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Guid(v)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Value::from(v),
            None => Value::Null,
        }
    }
}

/// Binds a value into a statement parameter by 1-based ordinal.
///
/// # Safety
/// `stmt` must be a valid prepared-statement pointer and `index` within the
/// statement's parameter count (the native library range-checks too).
pub(crate) unsafe fn bind_value(
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
    value: &Value,
    format: DateTimeFormat,
) -> c_int {
    match value {
        Value::Null => ffi::sqlite3_bind_null(stmt, index),
        Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
        Value::Real(v) => ffi::sqlite3_bind_double(stmt, index, *v),
        Value::Text(v) => ffi::sqlite3_bind_text(
            stmt,
            index,
            v.as_ptr() as *const c_char,
            v.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        ),
        Value::Blob(v) => ffi::sqlite3_bind_blob(
            stmt,
            index,
            v.as_ptr() as *const std::os::raw::c_void,
            v.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        ),
        Value::DateTime(v) => bind_value(stmt, index, &format.encode(*v), format),
        Value::Guid(v) => {
            let bytes = v.as_bytes();
            ffi::sqlite3_bind_blob(
                stmt,
                index,
                bytes.as_ptr() as *const std::os::raw::c_void,
                bytes.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        }
    }
}

/// Publishes a managed value as the result of a function or column
/// callback.
///
/// # Safety
/// `ctx` must be the live `sqlite3_context` of the executing callback.
pub(crate) unsafe fn result_value(
    ctx: *mut ffi::sqlite3_context,
    value: &Value,
    format: DateTimeFormat,
) {
    match value {
        Value::Null => ffi::sqlite3_result_null(ctx),
        Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
        Value::Real(v) => ffi::sqlite3_result_double(ctx, *v),
        Value::Text(v) => ffi::sqlite3_result_text(
            ctx,
            v.as_ptr() as *const c_char,
            v.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        ),
        Value::Blob(v) => ffi::sqlite3_result_blob(
            ctx,
            v.as_ptr() as *const std::os::raw::c_void,
            v.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        ),
        Value::DateTime(v) => result_value(ctx, &format.encode(*v), format),
        Value::Guid(v) => {
            let bytes = v.as_bytes();
            ffi::sqlite3_result_blob(
                ctx,
                bytes.as_ptr() as *const std::os::raw::c_void,
                bytes.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            )
        }
    }
}

/// Copies a protected `sqlite3_value` into a managed [`Value`].
///
/// # Safety
/// `value` must be a valid protected value pointer, e.g. an xFilter or
/// xUpdate argument, used before the enclosing callback returns.
pub(crate) unsafe fn value_from_raw(value: *mut ffi::sqlite3_value) -> Value {
    match TypeAffinity::from_raw(ffi::sqlite3_value_type(value)) {
        TypeAffinity::Null => Value::Null,
        TypeAffinity::Integer => Value::Integer(ffi::sqlite3_value_int64(value)),
        TypeAffinity::Float => Value::Real(ffi::sqlite3_value_double(value)),
        TypeAffinity::Text => {
            let ptr = ffi::sqlite3_value_text(value);
            let len = ffi::sqlite3_value_bytes(value) as usize;
            if ptr.is_null() {
                Value::Text(String::new())
            } else {
                let bytes = std::slice::from_raw_parts(ptr, len);
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
        TypeAffinity::Blob => {
            let len = ffi::sqlite3_value_bytes(value) as usize;
            let ptr = ffi::sqlite3_value_blob(value);
            if ptr.is_null() || len == 0 {
                Value::Blob(Vec::new())
            } else {
                Value::Blob(std::slice::from_raw_parts(ptr as *const u8, len).to_vec())
            }
        }
    }
}

/// True when a declared column type denotes a GUID.
pub(crate) fn declared_type_is_guid(decl: &str) -> bool {
    decl.eq_ignore_ascii_case("guid") || decl.eq_ignore_ascii_case("uniqueidentifier")
}

/// True when a declared column type denotes a date/time column.
pub(crate) fn declared_type_is_datetime(decl: &str) -> bool {
    matches!(
        decl.to_ascii_lowercase().as_str(),
        "date" | "datetime" | "timestamp" | "smalldate"
    )
}

/// Applies the declared-type refinements the façade relies on: GUID from a
/// 16-byte blob or canonical text, DateTime via the connection format.
pub(crate) fn refine_value(raw: Value, declared: Option<&str>, format: DateTimeFormat) -> Result<Value> {
    let Some(decl) = declared else {
        return Ok(raw);
    };
    if declared_type_is_guid(decl) {
        return match &raw {
            // Already refined; refinement is idempotent.
            Value::Guid(_) => Ok(raw),
            Value::Blob(bytes) if bytes.len() == 16 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(bytes);
                Ok(Value::Guid(Uuid::from_bytes(buf)))
            }
            Value::Text(text) => Uuid::parse_str(text)
                .map(Value::Guid)
                .map_err(|e| Error::Conversion(format!("bad GUID text {text:?}: {e}"))),
            Value::Null => Ok(Value::Null),
            _ => Err(Error::sqlite(
                ResultCode::Mismatch,
                format!("column declared GUID holds {:?}", raw.affinity()),
            )),
        };
    }
    if declared_type_is_datetime(decl) && raw != Value::Null {
        if matches!(raw, Value::DateTime(_)) {
            return Ok(raw);
        }
        return format.decode(&raw).map(Value::DateTime);
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 45).unwrap()
    }

    #[test]
    fn datetime_formats_round_trip() {
        let t = sample_time();
        for format in [
            DateTimeFormat::Ticks,
            DateTimeFormat::JulianDay,
            DateTimeFormat::UnixEpoch,
            DateTimeFormat::Iso8601,
        ] {
            let encoded = format.encode(t);
            let decoded = format.decode(&encoded).unwrap();
            let delta = (decoded - t).num_milliseconds().abs();
            assert!(delta <= 1, "{format:?} drifted by {delta}ms");
        }
    }

    #[test]
    fn ticks_count_from_year_one() {
        let unix_epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            DateTimeFormat::Ticks.encode(unix_epoch),
            Value::Integer(TICKS_AT_UNIX_EPOCH)
        );
    }

    #[test]
    fn datetime_storage_classes() {
        let t = sample_time();
        assert_eq!(
            DateTimeFormat::Ticks.encode(t).affinity(),
            TypeAffinity::Integer
        );
        assert_eq!(
            DateTimeFormat::JulianDay.encode(t).affinity(),
            TypeAffinity::Float
        );
        assert_eq!(
            DateTimeFormat::UnixEpoch.encode(t).affinity(),
            TypeAffinity::Integer
        );
        assert_eq!(
            DateTimeFormat::Iso8601.encode(t).affinity(),
            TypeAffinity::Text
        );
    }

    #[test]
    fn datetime_mismatched_storage_class_rejected() {
        let err = DateTimeFormat::UnixEpoch
            .decode(&Value::Text("not a number".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[test]
    fn unsigned_64_reinterprets_through_signed() {
        let v = Value::from(u64::MAX);
        assert_eq!(v, Value::Integer(-1));
    }

    #[test]
    fn guid_refinement_from_blob_and_text() {
        let id = Uuid::new_v4();
        let refined = refine_value(
            Value::Blob(id.as_bytes().to_vec()),
            Some("GUID"),
            DateTimeFormat::Iso8601,
        )
        .unwrap();
        assert_eq!(refined, Value::Guid(id));

        let refined = refine_value(
            Value::Text(id.to_string()),
            Some("uniqueidentifier"),
            DateTimeFormat::Iso8601,
        )
        .unwrap();
        assert_eq!(refined, Value::Guid(id));

        // Wrong-sized blob is a mismatch, not a silent pass-through.
        assert!(refine_value(
            Value::Blob(vec![1, 2, 3]),
            Some("GUID"),
            DateTimeFormat::Iso8601
        )
        .is_err());
    }

    #[test]
    fn refinement_is_idempotent() {
        let id = Uuid::new_v4();
        let refined =
            refine_value(Value::Guid(id), Some("GUID"), DateTimeFormat::Iso8601).unwrap();
        assert_eq!(refined, Value::Guid(id));

        let t = sample_time();
        let refined =
            refine_value(Value::DateTime(t), Some("DATETIME"), DateTimeFormat::Ticks).unwrap();
        assert_eq!(refined, Value::DateTime(t));
    }

    #[test]
    fn datetime_refinement_uses_connection_format() {
        let t = sample_time();
        let stored = DateTimeFormat::UnixEpoch.encode(t);
        let refined =
            refine_value(stored, Some("DATETIME"), DateTimeFormat::UnixEpoch).unwrap();
        assert_eq!(refined, Value::DateTime(t));
    }

    #[test]
    fn null_survives_refinement() {
        assert_eq!(
            refine_value(Value::Null, Some("GUID"), DateTimeFormat::Iso8601).unwrap(),
            Value::Null
        );
        assert_eq!(
            refine_value(Value::Null, Some("DATETIME"), DateTimeFormat::Iso8601).unwrap(),
            Value::Null
        );
    }
}
