//! The unsafe bridge between the native module ABI and the managed
//! virtual table traits.
//!
//! Every callback crosses through a trampoline here: the native descriptor
//! structs embed their managed state behind the required base struct, each
//! trampoline recovers it, converts arguments into safe types, and maps
//! managed errors back to result codes with the message published where
//! the ABI expects it. Panics are caught at the boundary and reported as
//! plain errors; they never unwind into the native frame.

use crate::connection::Connection;
use crate::error::{Error, Result, ResultCode};
use crate::value::{result_value, value_from_raw, DateTimeFormat, Value};
use crate::vtab::{
    Change, ColumnContext, IndexConstraint, IndexConstraintOp, IndexInfo, IndexOrderBy,
    ScalarFunction, VirtualTable, VirtualTableCursor, VirtualTableModule,
};
use libsqlite3_sys as ffi;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

/// Per-registration state handed to the core as the module's client data.
/// The module definition must stay at a stable address for the lifetime of
/// the registration, so it lives in this box too.
struct ModuleRegistration<M: VirtualTableModule> {
    module: M,
    def: ffi::sqlite3_module,
    format: DateTimeFormat,
}

/// Transaction/savepoint ordering ledger for one table instance.
///
/// A table created or first written inside a transaction is enlisted in
/// it without a begin callback, so sync and savepoint open the ledger
/// implicitly. Re-entering begin, syncing twice, committing before sync,
/// or naming a savepoint id the ledger does not hold are reported as
/// `SQLITE_MISUSE` without touching the managed table.
#[derive(Default)]
struct TxState {
    active: bool,
    synced: bool,
    savepoints: Vec<i32>,
}

impl TxState {
    fn begin(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        self.synced = false;
        true
    }

    fn sync(&mut self) -> bool {
        if self.synced {
            return false;
        }
        self.active = true;
        self.synced = true;
        true
    }

    fn commit(&mut self) -> bool {
        if self.active && !self.synced {
            return false;
        }
        *self = TxState::default();
        true
    }

    // Rollback must always be safe to deliver; it can follow a failed
    // sync on another table in the same transaction.
    fn rollback(&mut self) {
        *self = TxState::default();
    }

    fn savepoint(&mut self, id: i32) {
        self.active = true;
        if !self.savepoints.contains(&id) {
            self.savepoints.push(id);
        }
    }

    /// Releasing savepoint `id` discards it and everything opened after
    /// it. The id must still be open; a released or rolled-back id stays
    /// invalid until a new savepoint callback re-issues it.
    fn release(&mut self, id: i32) -> bool {
        if !self.savepoints.contains(&id) {
            return false;
        }
        self.savepoints.retain(|&s| s < id);
        true
    }

    /// Rolling back to `id` keeps it open but discards later savepoints.
    /// The target must be an open id or an enclosing level below every
    /// open id; anything else names an invalidated savepoint.
    fn rollback_to(&mut self, id: i32) -> bool {
        if !self.savepoints.contains(&id) && !self.savepoints.iter().any(|&s| s > id) {
            return false;
        }
        self.savepoints.retain(|&s| s <= id);
        true
    }
}

struct FunctionBox {
    function: ScalarFunction,
    format: DateTimeFormat,
}

/// Native descriptor for one table instance. The base struct must be the
/// first field so the pointer round-trips through the ABI.
#[repr(C)]
struct VTabBox<T: VirtualTable> {
    base: ffi::sqlite3_vtab,
    table: T,
    format: DateTimeFormat,
    tx: TxState,
    functions: Vec<*mut FunctionBox>,
}

impl<T: VirtualTable> Drop for VTabBox<T> {
    fn drop(&mut self) {
        for ptr in self.functions.drain(..) {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// Native descriptor for one open cursor.
#[repr(C)]
struct CursorBox<T: VirtualTable> {
    base: ffi::sqlite3_vtab_cursor,
    cursor: T::Cursor,
}

impl Connection {
    /// Registers a virtual table module under `name`.
    ///
    /// The module stays registered until the connection closes. A
    /// connection that has registered modules is never returned to the
    /// pool, since a pooled handle must carry no caller-specific state.
    pub fn create_module<M: VirtualTableModule>(&self, name: &str, module: M) -> Result<()> {
        let db = self.db()?;
        let name_c = CString::new(name)?;

        let mut def: ffi::sqlite3_module = unsafe { std::mem::zeroed() };
        def.iVersion = 2;
        def.xCreate = Some(x_create::<M>);
        def.xConnect = Some(x_connect::<M>);
        def.xBestIndex = Some(x_best_index::<M::Table>);
        def.xDisconnect = Some(x_disconnect::<M::Table>);
        def.xDestroy = Some(x_destroy::<M::Table>);
        def.xOpen = Some(x_open::<M::Table>);
        def.xClose = Some(x_close::<M::Table>);
        def.xFilter = Some(x_filter::<M::Table>);
        def.xNext = Some(x_next::<M::Table>);
        def.xEof = Some(x_eof::<M::Table>);
        def.xColumn = Some(x_column::<M::Table>);
        def.xRowid = Some(x_rowid::<M::Table>);
        def.xUpdate = Some(x_update::<M::Table>);
        def.xBegin = Some(x_begin::<M::Table>);
        def.xSync = Some(x_sync::<M::Table>);
        def.xCommit = Some(x_commit::<M::Table>);
        def.xRollback = Some(x_rollback::<M::Table>);
        def.xFindFunction = Some(x_find_function::<M::Table>);
        def.xRename = Some(x_rename::<M::Table>);
        def.xSavepoint = Some(x_savepoint::<M::Table>);
        def.xRelease = Some(x_release::<M::Table>);
        def.xRollbackTo = Some(x_rollback_to::<M::Table>);

        let registration = Box::new(ModuleRegistration {
            module,
            def,
            format: self.datetime_format(),
        });
        let reg_ptr = Box::into_raw(registration);
        let rc = unsafe {
            ffi::sqlite3_create_module_v2(
                db,
                name_c.as_ptr(),
                &(*reg_ptr).def,
                reg_ptr as *mut c_void,
                Some(drop_registration::<M>),
            )
        };
        // On failure the core has already invoked the destructor on the
        // client data, so the box is gone either way.
        if rc != ffi::SQLITE_OK {
            return Err(Error::from_handle(rc, db));
        }
        debug!(module = name, "registered virtual table module");
        self.disable_pooling();
        Ok(())
    }
}

unsafe extern "C" fn drop_registration<M: VirtualTableModule>(aux: *mut c_void) {
    drop(Box::from_raw(aux as *mut ModuleRegistration<M>));
}

fn guard<F: FnOnce() -> c_int>(f: F) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(rc) => rc,
        Err(_) => {
            error!("panic crossed the virtual table boundary");
            ffi::SQLITE_ERROR
        }
    }
}

/// Copies a message into engine-owned memory (`sqlite3_free`-compatible).
unsafe fn engine_string(message: &str) -> *mut c_char {
    let owned;
    let text = if message.contains('\0') {
        owned = message.replace('\0', " ");
        owned.as_str()
    } else {
        message
    };
    let c = CString::new(text).unwrap_or_default();
    ffi::sqlite3_mprintf(b"%s\0".as_ptr() as *const c_char, c.as_ptr())
}

unsafe fn publish_vtab_error(vtab: *mut ffi::sqlite3_vtab, err: &Error) -> c_int {
    if !(*vtab).zErrMsg.is_null() {
        ffi::sqlite3_free((*vtab).zErrMsg as *mut c_void);
    }
    (*vtab).zErrMsg = engine_string(&err.to_string());
    err.result_code()
}

unsafe fn raw_slice<'a, P>(ptr: *const P, len: c_int) -> &'a [P] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

unsafe fn vtab_box<'a, T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> &'a mut VTabBox<T> {
    &mut *(vtab as *mut VTabBox<T>)
}

unsafe fn cursor_box<'a, T: VirtualTable>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
) -> &'a mut CursorBox<T> {
    &mut *(cursor as *mut CursorBox<T>)
}

unsafe fn module_args(argc: c_int, argv: *const *const c_char) -> Vec<String> {
    raw_slice(argv, argc)
        .iter()
        .map(|&arg| {
            if arg.is_null() {
                String::new()
            } else {
                CStr::from_ptr(arg).to_string_lossy().into_owned()
            }
        })
        .collect()
}

unsafe fn declare_schema(db: *mut ffi::sqlite3, schema: &str) -> Result<()> {
    let c = CString::new(schema)?;
    let rc = ffi::sqlite3_declare_vtab(db, c.as_ptr());
    if rc != ffi::SQLITE_OK {
        return Err(Error::from_handle(rc, db));
    }
    Ok(())
}

unsafe fn construct<M: VirtualTableModule>(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
    connecting: bool,
) -> c_int {
    let registration = &*(aux as *const ModuleRegistration<M>);
    let args = module_args(argc, argv);
    let built = if connecting {
        registration.module.connect(&args)
    } else {
        registration.module.create(&args)
    };
    let table = match built.and_then(|(schema, table)| {
        declare_schema(db, &schema)?;
        Ok(table)
    }) {
        Ok(table) => table,
        Err(err) => {
            *pz_err = engine_string(&err.to_string());
            return err.result_code();
        }
    };
    let vtab = Box::new(VTabBox {
        base: std::mem::zeroed(),
        table,
        format: registration.format,
        tx: TxState::default(),
        functions: Vec::new(),
    });
    *pp_vtab = Box::into_raw(vtab) as *mut ffi::sqlite3_vtab;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_create<M: VirtualTableModule>(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    guard(|| construct::<M>(db, aux, argc, argv, pp_vtab, pz_err, false))
}

unsafe extern "C" fn x_connect<M: VirtualTableModule>(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    guard(|| construct::<M>(db, aux, argc, argv, pp_vtab, pz_err, true))
}

unsafe extern "C" fn x_best_index<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    raw: *mut ffi::sqlite3_index_info,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        let raw = &mut *raw;
        let constraints = raw_slice(raw.aConstraint as *const _, raw.nConstraint)
            .iter()
            .map(
                |c: &ffi::sqlite3_index_constraint| IndexConstraint {
                    column: c.iColumn,
                    op: IndexConstraintOp::from_raw(c.op),
                    usable: c.usable != 0,
                },
            )
            .collect();
        let order_by = raw_slice(raw.aOrderBy as *const _, raw.nOrderBy)
            .iter()
            .map(
                |o: &ffi::sqlite3_index_orderby| IndexOrderBy {
                    column: o.iColumn,
                    descending: o.desc != 0,
                },
            )
            .collect();

        let mut info = IndexInfo::new(constraints, order_by);
        if let Err(err) = holder.table.best_index(&mut info) {
            return publish_vtab_error(vtab, &err);
        }

        if raw.nConstraint > 0 {
            let usage =
                std::slice::from_raw_parts_mut(raw.aConstraintUsage, raw.nConstraint as usize);
            for (slot, chosen) in usage.iter_mut().zip(info.usage()) {
                slot.argvIndex = chosen.argv_index;
                slot.omit = chosen.omit as std::os::raw::c_uchar;
            }
        }
        raw.idxNum = info.index_num;
        if let Some(plan) = &info.index_str {
            raw.idxStr = engine_string(plan);
            raw.needToFreeIdxStr = 1;
        }
        raw.orderByConsumed = info.order_by_consumed as c_int;
        raw.estimatedCost = info.estimated_cost;
        raw.estimatedRows = info.estimated_rows;
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_disconnect<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    guard(|| {
        let mut holder = Box::from_raw(vtab as *mut VTabBox<T>);
        holder.table.disconnect();
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_destroy<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        if let Err(err) = holder.table.destroy() {
            // A failed destroy leaves the table attached.
            return publish_vtab_error(vtab, &err);
        }
        drop(Box::from_raw(vtab as *mut VTabBox<T>));
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_open<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    pp_cursor: *mut *mut ffi::sqlite3_vtab_cursor,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        match holder.table.open() {
            Ok(cursor) => {
                let boxed = Box::new(CursorBox::<T> {
                    base: std::mem::zeroed(),
                    cursor,
                });
                *pp_cursor = Box::into_raw(boxed) as *mut ffi::sqlite3_vtab_cursor;
                ffi::SQLITE_OK
            }
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_close<T: VirtualTable>(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    guard(|| {
        drop(Box::from_raw(cursor as *mut CursorBox<T>));
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_filter<T: VirtualTable>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    idx_num: c_int,
    idx_str: *const c_char,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> c_int {
    guard(|| {
        let vtab = (*cursor).pVtab;
        let holder = cursor_box::<T>(cursor);
        let plan = if idx_str.is_null() {
            None
        } else {
            Some(CStr::from_ptr(idx_str).to_string_lossy())
        };
        let args: Vec<Value> = raw_slice(argv as *const *mut ffi::sqlite3_value, argc)
            .iter()
            .map(|&v| value_from_raw(v))
            .collect();
        match holder.cursor.filter(idx_num, plan.as_deref(), &args) {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_next<T: VirtualTable>(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    guard(|| {
        let vtab = (*cursor).pVtab;
        match cursor_box::<T>(cursor).cursor.next() {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_eof<T: VirtualTable>(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    guard(|| cursor_box::<T>(cursor).cursor.eof() as c_int)
}

unsafe extern "C" fn x_column<T: VirtualTable>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    ctx: *mut ffi::sqlite3_context,
    index: c_int,
) -> c_int {
    guard(|| {
        let vtab = (*cursor).pVtab;
        let format = vtab_box::<T>(vtab).format;
        let holder = cursor_box::<T>(cursor);
        let mut slot = ColumnContext::new(ctx, format);
        match holder.cursor.column(&mut slot, index as usize) {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_rowid<T: VirtualTable>(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    p_rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    guard(|| {
        let vtab = (*cursor).pVtab;
        match cursor_box::<T>(cursor).cursor.rowid() {
            Ok(rowid) => {
                *p_rowid = rowid;
                ffi::SQLITE_OK
            }
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_update<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
    p_rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        let args = raw_slice(argv as *const *mut ffi::sqlite3_value, argc);
        let mut inserting = false;
        let change = if args.len() == 1 {
            Change::Delete {
                rowid: ffi::sqlite3_value_int64(args[0]),
            }
        } else {
            let values: Vec<Value> = args[2..].iter().map(|&v| value_from_raw(v)).collect();
            if ffi::sqlite3_value_type(args[0]) == ffi::SQLITE_NULL {
                inserting = true;
                let rowid = (ffi::sqlite3_value_type(args[1]) != ffi::SQLITE_NULL)
                    .then(|| ffi::sqlite3_value_int64(args[1]));
                Change::Insert { rowid, values }
            } else {
                Change::Update {
                    rowid: ffi::sqlite3_value_int64(args[0]),
                    new_rowid: ffi::sqlite3_value_int64(args[1]),
                    values,
                }
            }
        };
        let requested = match &change {
            Change::Insert { rowid, .. } => *rowid,
            _ => None,
        };
        match holder.table.update(change) {
            Ok(assigned) => {
                if inserting && !p_rowid.is_null() {
                    *p_rowid = assigned.or(requested).unwrap_or_default();
                }
                ffi::SQLITE_OK
            }
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_begin<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        if !holder.tx.begin() {
            return misuse(vtab, "transaction already open");
        }
        if !holder.table.supports_transactions() {
            return ffi::SQLITE_OK;
        }
        match holder.table.begin() {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_sync<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        if !holder.tx.sync() {
            return misuse(vtab, "sync delivered twice in one transaction");
        }
        if !holder.table.supports_transactions() {
            return ffi::SQLITE_OK;
        }
        match holder.table.sync() {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_commit<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        if !holder.tx.commit() {
            return misuse(vtab, "commit before sync");
        }
        if !holder.table.supports_transactions() {
            return ffi::SQLITE_OK;
        }
        match holder.table.commit() {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_rollback<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        holder.tx.rollback();
        if !holder.table.supports_transactions() {
            return ffi::SQLITE_OK;
        }
        match holder.table.rollback() {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_savepoint<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    id: c_int,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        holder.tx.savepoint(id);
        if !holder.table.supports_savepoints() {
            return ffi::SQLITE_OK;
        }
        match holder.table.savepoint(id) {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_release<T: VirtualTable>(vtab: *mut ffi::sqlite3_vtab, id: c_int) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        if !holder.tx.release(id) {
            return misuse(vtab, "release names a savepoint that is not open");
        }
        if !holder.table.supports_savepoints() {
            return ffi::SQLITE_OK;
        }
        match holder.table.release(id) {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_rollback_to<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    id: c_int,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        if !holder.tx.rollback_to(id) {
            return misuse(vtab, "rollback-to names a savepoint that is not open");
        }
        if !holder.table.supports_savepoints() {
            return ffi::SQLITE_OK;
        }
        match holder.table.rollback_to(id) {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

unsafe extern "C" fn x_rename<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    new_name: *const c_char,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        let name = CStr::from_ptr(new_name).to_string_lossy();
        match holder.table.rename(&name) {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => publish_vtab_error(vtab, &err),
        }
    })
}

type RawScalarFn = unsafe extern "C" fn(*mut ffi::sqlite3_context, c_int, *mut *mut ffi::sqlite3_value);

unsafe extern "C" fn x_find_function<T: VirtualTable>(
    vtab: *mut ffi::sqlite3_vtab,
    n_arg: c_int,
    name: *const c_char,
    px_func: *mut Option<RawScalarFn>,
    pp_arg: *mut *mut c_void,
) -> c_int {
    guard(|| {
        let holder = vtab_box::<T>(vtab);
        let name = CStr::from_ptr(name).to_string_lossy();
        let Some(found) = holder.table.find_function(&name, n_arg) else {
            return 0;
        };
        let constraint_op = found.constraint_op;
        let boxed = Box::into_raw(Box::new(FunctionBox {
            function: found.function,
            format: holder.format,
        }));
        // Freed when the table descriptor is dropped; the core may hold the
        // pointer for the life of any statement compiled against it.
        holder.functions.push(boxed);
        *px_func = Some(call_overload);
        *pp_arg = boxed as *mut c_void;
        match constraint_op {
            Some(op) => c_int::from(op),
            None => 1,
        }
    })
}

unsafe extern "C" fn call_overload(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let holder = &*(ffi::sqlite3_user_data(ctx) as *const FunctionBox);
        let args: Vec<Value> = raw_slice(argv as *const *mut ffi::sqlite3_value, argc)
            .iter()
            .map(|&v| value_from_raw(v))
            .collect();
        match (holder.function)(&args) {
            Ok(value) => result_value(ctx, &value, holder.format),
            Err(err) => {
                let message = err.to_string();
                ffi::sqlite3_result_error(
                    ctx,
                    message.as_ptr() as *const c_char,
                    message.len() as c_int,
                );
            }
        }
    }));
    if outcome.is_err() {
        error!("panic crossed a function overload boundary");
        let message = "function implementation panicked";
        ffi::sqlite3_result_error(
            ctx,
            message.as_ptr() as *const c_char,
            message.len() as c_int,
        );
    }
}

unsafe fn misuse(vtab: *mut ffi::sqlite3_vtab, message: &str) -> c_int {
    publish_vtab_error(
        vtab,
        &Error::sqlite(ResultCode::Misuse, message.to_owned()),
    )
}
