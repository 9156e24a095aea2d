//! Virtual table support: managed table implementations exposed through
//! the native module ABI.
//!
//! A [`VirtualTableModule`] is registered on a connection under a module
//! name; `CREATE VIRTUAL TABLE ... USING name(...)` then routes every
//! native callback through the bridge in [`dispatch`] to the managed
//! [`VirtualTable`] and [`VirtualTableCursor`] implementations. The bridge
//! owns all unsafe ABI plumbing; implementations deal only in safe types.

mod dispatch;

use crate::error::Result;
use crate::value::{result_value, DateTimeFormat, Value};
use libsqlite3_sys as ffi;
use std::os::raw::c_int;

/// A factory for virtual tables, registered under a module name.
///
/// `create` runs for `CREATE VIRTUAL TABLE`; `connect` runs when an
/// existing virtual table is attached to a new connection. Eponymous-style
/// modules that keep no persistent state can leave the default `connect`,
/// which delegates to `create`.
pub trait VirtualTableModule: Send + Sync + 'static {
    type Table: VirtualTable;

    /// Builds a new table instance. `args` holds the raw module arguments:
    /// module name, database name, table name, then any user arguments
    /// from the `USING` clause. Returns the `CREATE TABLE` statement
    /// declaring the table's columns, plus the table itself.
    fn create(&self, args: &[String]) -> Result<(String, Self::Table)>;

    /// Attaches to an existing table instance.
    fn connect(&self, args: &[String]) -> Result<(String, Self::Table)> {
        self.create(args)
    }
}

/// One virtual table instance.
pub trait VirtualTable: 'static {
    type Cursor: VirtualTableCursor;

    /// Chooses a query plan for the given constraints. Implementations
    /// record which constraints they can serve via
    /// [`IndexInfo::constraint_usage_mut`] and set the plan outputs.
    fn best_index(&self, info: &mut IndexInfo) -> Result<()>;

    /// Opens a new cursor over the table.
    fn open(&mut self) -> Result<Self::Cursor>;

    /// Applies a row change. Returns the rowid assigned to an insert, or
    /// `None` for deletes and updates.
    ///
    /// The default rejects all writes, making the table read-only.
    fn update(&mut self, change: Change) -> Result<Option<i64>> {
        let _ = change;
        Err(crate::error::Error::Module(
            "virtual table is read-only".to_owned(),
        ))
    }

    /// Renames the persistent state backing the table.
    fn rename(&mut self, new_name: &str) -> Result<()> {
        let _ = new_name;
        Ok(())
    }

    /// Releases per-connection resources. Runs on `DROP TABLE` before the
    /// table is dropped; `disconnect` distinguishes detach from drop.
    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    /// Whether the table participates in transaction callbacks.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Whether the table participates in savepoint callbacks. Implies
    /// transaction support.
    fn supports_savepoints(&self) -> bool {
        false
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn savepoint(&mut self, id: i32) -> Result<()> {
        let _ = id;
        Ok(())
    }

    fn release(&mut self, id: i32) -> Result<()> {
        let _ = id;
        Ok(())
    }

    fn rollback_to(&mut self, id: i32) -> Result<()> {
        let _ = id;
        Ok(())
    }

    /// Overloads a function when applied to columns of this table.
    fn find_function(&self, name: &str, arg_count: i32) -> Option<FoundFunction> {
        let _ = (name, arg_count);
        None
    }
}

/// A cursor over a virtual table's rows.
pub trait VirtualTableCursor: 'static {
    /// Positions the cursor at the first row matching the plan chosen by
    /// `best_index`, identified by `index_num`/`index_str`. `args` holds
    /// the values of the constraints the plan claimed.
    fn filter(&mut self, index_num: i32, index_str: Option<&str>, args: &[Value]) -> Result<()>;

    fn next(&mut self) -> Result<()>;

    fn eof(&self) -> bool;

    /// Publishes the value of one column of the current row.
    fn column(&self, ctx: &mut ColumnContext, index: usize) -> Result<()>;

    fn rowid(&self) -> Result<i64>;
}

/// A row change requested through the write path.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Delete the row with this rowid.
    Delete { rowid: i64 },
    /// Insert a row. A `None` rowid asks the table to assign one and
    /// return it.
    Insert {
        rowid: Option<i64>,
        values: Vec<Value>,
    },
    /// Update the row at `rowid`, possibly moving it to `new_rowid`.
    Update {
        rowid: i64,
        new_rowid: i64,
        values: Vec<Value>,
    },
}

/// A scalar function implementation returned by
/// [`VirtualTable::find_function`].
pub type ScalarFunction = Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// A function overload plus the constraint opcode it exposes to the
/// planner, if any.
pub struct FoundFunction {
    pub function: ScalarFunction,
    /// A `SQLITE_INDEX_CONSTRAINT_FUNCTION`-range opcode making the
    /// overload visible to `best_index`, or `None` for a plain overload.
    pub constraint_op: Option<u8>,
}

/// Constraint operators surfaced to `best_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Ne,
    IsNot,
    IsNotNull,
    IsNull,
    Is,
    Limit,
    Offset,
    /// An overloaded function registered through `find_function`.
    Function(u8),
    Other(u8),
}

impl IndexConstraintOp {
    fn from_raw(op: u8) -> Self {
        match op {
            2 => IndexConstraintOp::Eq,
            4 => IndexConstraintOp::Gt,
            8 => IndexConstraintOp::Le,
            16 => IndexConstraintOp::Lt,
            32 => IndexConstraintOp::Ge,
            64 => IndexConstraintOp::Match,
            65 => IndexConstraintOp::Like,
            66 => IndexConstraintOp::Glob,
            67 => IndexConstraintOp::Regexp,
            68 => IndexConstraintOp::Ne,
            69 => IndexConstraintOp::IsNot,
            70 => IndexConstraintOp::IsNotNull,
            71 => IndexConstraintOp::IsNull,
            72 => IndexConstraintOp::Is,
            73 => IndexConstraintOp::Limit,
            74 => IndexConstraintOp::Offset,
            op if op >= 150 => IndexConstraintOp::Function(op),
            op => IndexConstraintOp::Other(op),
        }
    }
}

/// One WHERE-clause constraint visible to the planner.
#[derive(Debug, Clone, Copy)]
pub struct IndexConstraint {
    pub column: i32,
    pub op: IndexConstraintOp,
    pub usable: bool,
}

/// One ORDER BY term visible to the planner.
#[derive(Debug, Clone, Copy)]
pub struct IndexOrderBy {
    pub column: i32,
    pub descending: bool,
}

/// How the chosen plan consumes one constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintUsage {
    /// 1-based position of this constraint's value in the `filter` args,
    /// or 0 when the plan does not use it.
    pub argv_index: i32,
    /// The core need not re-check the constraint on returned rows.
    pub omit: bool,
}

/// Safe view of the planner exchange structure passed to `best_index`.
///
/// Inputs (constraints, order-by terms) are copied out of the native
/// struct; outputs are buffered here and written back by the bridge after
/// `best_index` returns.
pub struct IndexInfo {
    constraints: Vec<IndexConstraint>,
    order_by: Vec<IndexOrderBy>,
    usage: Vec<ConstraintUsage>,
    /// Opaque plan number passed back to `filter`.
    pub index_num: i32,
    /// Opaque plan string passed back to `filter`.
    pub index_str: Option<String>,
    /// The plan already emits rows in the requested order.
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
}

impl IndexInfo {
    pub(crate) fn new(constraints: Vec<IndexConstraint>, order_by: Vec<IndexOrderBy>) -> Self {
        let usage = vec![ConstraintUsage::default(); constraints.len()];
        IndexInfo {
            constraints,
            order_by,
            usage,
            index_num: 0,
            index_str: None,
            order_by_consumed: false,
            estimated_cost: 1e9,
            estimated_rows: 25,
        }
    }

    pub fn constraints(&self) -> &[IndexConstraint] {
        &self.constraints
    }

    pub fn order_by(&self) -> &[IndexOrderBy] {
        &self.order_by
    }

    /// Output slot for the constraint at the same index as
    /// [`constraints`](Self::constraints).
    pub fn constraint_usage_mut(&mut self, index: usize) -> &mut ConstraintUsage {
        &mut self.usage[index]
    }

    pub(crate) fn usage(&self) -> &[ConstraintUsage] {
        &self.usage
    }
}

/// Result slot handed to [`VirtualTableCursor::column`] and scalar
/// function overloads.
pub struct ColumnContext {
    ctx: *mut ffi::sqlite3_context,
    format: DateTimeFormat,
}

impl ColumnContext {
    pub(crate) fn new(ctx: *mut ffi::sqlite3_context, format: DateTimeFormat) -> Self {
        ColumnContext { ctx, format }
    }

    /// Publishes a value, encoding `DateTime` and `Guid` refinements the
    /// same way the binding path does.
    pub fn set(&mut self, value: &Value) {
        unsafe { result_value(self.ctx, value, self.format) }
    }

    pub fn set_null(&mut self) {
        unsafe { ffi::sqlite3_result_null(self.ctx) }
    }

    pub fn set_error(&mut self, message: &str) {
        unsafe {
            ffi::sqlite3_result_error(
                self.ctx,
                message.as_ptr() as *const std::os::raw::c_char,
                message.len() as c_int,
            )
        }
    }
}
