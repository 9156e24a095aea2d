//! # litebridge
//!
//! A managed interop layer over the native SQLite library: scoped handle
//! ownership, a path-keyed connection pool, a contention-aware statement
//! state machine, typed value marshaling, virtual table modules written in
//! safe Rust, and online backup sessions.
//!
//! The layering is strict. [`handle`] owns raw pointers and nothing else;
//! [`connection`], [`statement`] and [`backup`] implement the call
//! protocols on top of them; [`value`] carries data across the boundary in
//! both directions; [`vtab`] inverts the direction of the interop,
//! exposing managed tables to the native query planner.
//!
//! ## Quick start
//!
//! ```no_run
//! use litebridge::{Connection, ConnectionConfig};
//! use std::time::Duration;
//!
//! # fn main() -> litebridge::Result<()> {
//! let conn = Connection::open(ConnectionConfig::new("app.db"))?;
//! conn.execute("CREATE TABLE IF NOT EXISTS logs (at DATETIME, line TEXT)")?;
//!
//! let (stmt, _) = conn.prepare(
//!     "SELECT line FROM logs WHERE at > :since",
//!     Duration::from_secs(5),
//! )?;
//! let mut stmt = stmt.expect("non-empty SQL");
//! stmt.bind_named(":since", chrono::Utc::now())?;
//! while stmt.step()? {
//!     println!("{}", stmt.column_text(0)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod connection;
pub mod error;
pub mod handle;
pub mod pool;
pub mod retry;
pub mod statement;
pub mod value;
pub mod vtab;

pub use backup::Backup;
pub use connection::{Connection, ConnectionConfig};
pub use error::{Error, Result, ResultCode};
pub use pool::{ConnectionPool, PoolCounts};
pub use retry::{Clock, RetryPolicy, SystemClock};
pub use statement::{ResetOutcome, Statement};
pub use value::{DateTimeFormat, TypeAffinity, Value};
pub use vtab::{
    Change, ColumnContext, ConstraintUsage, FoundFunction, IndexConstraint, IndexConstraintOp,
    IndexInfo, IndexOrderBy, ScalarFunction, VirtualTable, VirtualTableCursor, VirtualTableModule,
};
