//! Error types and the native result-code enumeration.

use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::c_int;
use thiserror::Error;

/// The closed set of primary SQLite result codes.
///
/// Extended result codes are folded into their primary code before
/// classification; the raw value is preserved on [`Error::Sqlite`] for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    Error = 1,
    Internal = 2,
    Perm = 3,
    Abort = 4,
    Busy = 5,
    Locked = 6,
    NoMem = 7,
    ReadOnly = 8,
    Interrupt = 9,
    IoErr = 10,
    Corrupt = 11,
    NotFound = 12,
    Full = 13,
    CantOpen = 14,
    Protocol = 15,
    Empty = 16,
    Schema = 17,
    TooBig = 18,
    Constraint = 19,
    Mismatch = 20,
    Misuse = 21,
    NoLfs = 22,
    Auth = 23,
    Format = 24,
    Range = 25,
    NotADb = 26,
    Notice = 27,
    Warning = 28,
    Row = 100,
    Done = 101,
    /// A code outside the documented enumeration.
    Unknown = -1,
}

impl ResultCode {
    /// Classifies a raw native return value, masking any extended bits.
    pub fn from_raw(rc: c_int) -> Self {
        match rc & 0xff {
            0 => ResultCode::Ok,
            1 => ResultCode::Error,
            2 => ResultCode::Internal,
            3 => ResultCode::Perm,
            4 => ResultCode::Abort,
            5 => ResultCode::Busy,
            6 => ResultCode::Locked,
            7 => ResultCode::NoMem,
            8 => ResultCode::ReadOnly,
            9 => ResultCode::Interrupt,
            10 => ResultCode::IoErr,
            11 => ResultCode::Corrupt,
            12 => ResultCode::NotFound,
            13 => ResultCode::Full,
            14 => ResultCode::CantOpen,
            15 => ResultCode::Protocol,
            16 => ResultCode::Empty,
            17 => ResultCode::Schema,
            18 => ResultCode::TooBig,
            19 => ResultCode::Constraint,
            20 => ResultCode::Mismatch,
            21 => ResultCode::Misuse,
            22 => ResultCode::NoLfs,
            23 => ResultCode::Auth,
            24 => ResultCode::Format,
            25 => ResultCode::Range,
            26 => ResultCode::NotADb,
            27 => ResultCode::Notice,
            28 => ResultCode::Warning,
            100 => ResultCode::Row,
            101 => ResultCode::Done,
            _ => ResultCode::Unknown,
        }
    }

    /// Raw value suitable for returning across the module ABI.
    pub fn to_raw(self) -> c_int {
        match self {
            ResultCode::Unknown => ffi::SQLITE_ERROR,
            other => other as c_int,
        }
    }

    /// True for the transient lock-contention codes that retry loops absorb.
    pub fn is_contended(self) -> bool {
        matches!(self, ResultCode::Busy | ResultCode::Locked)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// A native call failed. Carries the classified code and the
    /// connection's last error string, captured at the failure site.
    #[error("SQLite error {code:?}: {message}")]
    Sqlite { code: ResultCode, message: String },

    /// A handle was used after it became invalid, or was never valid.
    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// SQL text or an argument contained an interior NUL byte.
    #[error("string contains an interior NUL byte")]
    NulByte(#[from] std::ffi::NulError),

    /// A virtual table implementation reported a failure.
    #[error("virtual table error: {0}")]
    Module(String),

    /// A value could not be converted to or from its native representation.
    #[error("value conversion failed: {0}")]
    Conversion(String),
}

impl Error {
    /// Builds a [`Error::Sqlite`] from a raw return code and the last
    /// error string of the given connection, which must be read before any
    /// further native call can overwrite it.
    pub(crate) fn from_handle(rc: c_int, db: *mut ffi::sqlite3) -> Self {
        Error::Sqlite {
            code: ResultCode::from_raw(rc),
            message: last_error_string(db),
        }
    }

    pub(crate) fn sqlite(code: ResultCode, message: impl Into<String>) -> Self {
        Error::Sqlite {
            code,
            message: message.into(),
        }
    }

    /// The native code to report across the module ABI for this error.
    pub fn result_code(&self) -> c_int {
        match self {
            Error::Sqlite { code, .. } => code.to_raw(),
            Error::InvalidHandle(_) => ffi::SQLITE_MISUSE,
            Error::NulByte(_) | Error::Conversion(_) => ffi::SQLITE_ERROR,
            Error::Module(_) => ffi::SQLITE_ERROR,
        }
    }
}

/// Reads `sqlite3_errmsg` for a connection. Safe on a null pointer.
pub(crate) fn last_error_string(db: *mut ffi::sqlite3) -> String {
    if db.is_null() {
        return String::from("no connection handle available");
    }
    unsafe {
        let msg = ffi::sqlite3_errmsg(db);
        if msg.is_null() {
            String::new()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_codes_round_trip() {
        for rc in [0, 1, 5, 6, 17, 21, 100, 101] {
            assert_eq!(ResultCode::from_raw(rc).to_raw(), rc);
        }
    }

    #[test]
    fn extended_codes_fold_to_primary() {
        // SQLITE_LOCKED_SHAREDCACHE = 262 = 6 | (1 << 8)
        assert_eq!(ResultCode::from_raw(262), ResultCode::Locked);
        // SQLITE_BUSY_RECOVERY = 261
        assert_eq!(ResultCode::from_raw(261), ResultCode::Busy);
        // SQLITE_IOERR_READ = 266
        assert_eq!(ResultCode::from_raw(266), ResultCode::IoErr);
    }

    #[test]
    fn contended_classification() {
        assert!(ResultCode::Busy.is_contended());
        assert!(ResultCode::Locked.is_contended());
        assert!(!ResultCode::Schema.is_contended());
        assert!(!ResultCode::Error.is_contended());
    }
}
