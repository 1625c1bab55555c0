//! Native functions installed on the `plv8` namespace object, and the
//! `PreparedPlan`, `Cursor` and `WindowObject` classes they hand out.

use common::sql::{quote_literal, quote_nullable};
use deno_core::v8;
use pgrx::PgLogLevel;
use pgrx::pg_sys::panic::ErrorReport;
use pgrx::prelude::*;
use pgrx::{FromDatum, PgSqlErrorCode};
use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char};

use crate::dispatch::with_arg_type;
use crate::engine::{
    ActiveScope, PLV8_INTNL_CONV, PLV8_INTNL_FCINFO, PLV8_INTNL_TUPSTORE, internal_pointer,
    run_callback, set_internal_pointer,
};
use crate::error_bridge::{ErrorKind, Plv8Result, ScriptError, host_call};
use crate::proc_cache::find_js_function_by_name;
use crate::spi_status::{SubTransaction, check_spi_status};
use crate::tuple_converter::Converter;
use crate::type_bridge::{fill_type, infer_datum_type, new_string, to_datum, to_value, value_to_string};

const DEFAULT_PARTITION_LOCAL_SIZE: usize = 1000;
const STORAGE_HEADER: usize = 2 * std::mem::size_of::<usize>();

const NULL_PARAM: c_char = b'n' as c_char;
const SET_PARAM: c_char = b' ' as c_char;

struct Templates {
    plan: v8::Global<v8::ObjectTemplate>,
    cursor: v8::Global<v8::ObjectTemplate>,
    window: v8::Global<v8::ObjectTemplate>,
}

thread_local! {
    static TEMPLATES: RefCell<Option<Templates>> = const { RefCell::new(None) };
}

pub(crate) fn attr_full() -> v8::PropertyAttribute {
    v8::PropertyAttribute::READ_ONLY
        | v8::PropertyAttribute::DONT_ENUM
        | v8::PropertyAttribute::DONT_DELETE
}

fn set_callback(
    scope: &mut v8::HandleScope<'_, ()>,
    template: v8::Local<v8::ObjectTemplate>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
    attr: v8::PropertyAttribute,
) -> Plv8Result<()> {
    let key = new_string(scope, name)?;
    let function = v8::FunctionTemplate::new(scope, callback);
    template.set_with_attr(key.into(), function.into(), attr);
    Ok(())
}

fn no_constructor(
    _scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
}

fn class_template<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    class_name: &str,
) -> Plv8Result<v8::Local<'s, v8::ObjectTemplate>> {
    let base = v8::FunctionTemplate::new(scope, no_constructor);
    let name = new_string(scope, class_name)?;
    base.set_class_name(name);
    let template = base.instance_template(scope);
    template.set_internal_field_count(1);
    Ok(template)
}

/// Registers every native function on the `plv8` template and builds the
/// class templates.
pub(crate) fn install(
    scope: &mut v8::HandleScope<'_, ()>,
    plv8: v8::Local<v8::ObjectTemplate>,
) -> Plv8Result<()> {
    let attr = attr_full();
    set_callback(scope, plv8, "elog", elog, attr)?;
    set_callback(scope, plv8, "execute", execute, attr)?;
    set_callback(scope, plv8, "prepare", prepare, attr)?;
    set_callback(scope, plv8, "return_next", return_next, attr)?;
    set_callback(scope, plv8, "subtransaction", subtransaction, attr)?;
    set_callback(scope, plv8, "find_function", find_function, attr)?;
    set_callback(scope, plv8, "get_window_object", get_window_object, attr)?;
    set_callback(scope, plv8, "quote_literal", quote_literal_fn, attr)?;
    set_callback(scope, plv8, "quote_nullable", quote_nullable_fn, attr)?;
    set_callback(scope, plv8, "quote_ident", quote_ident_fn, attr)?;

    let none = v8::PropertyAttribute::NONE;
    let plan = class_template(scope, "PreparedPlan")?;
    set_callback(scope, plan, "cursor", plan_cursor, none)?;
    set_callback(scope, plan, "execute", plan_execute, none)?;
    set_callback(scope, plan, "free", plan_free, none)?;

    let cursor = class_template(scope, "Cursor")?;
    set_callback(scope, cursor, "fetch", cursor_fetch, none)?;
    set_callback(scope, cursor, "move", cursor_move, none)?;
    set_callback(scope, cursor, "close", cursor_close, none)?;

    let window = class_template(scope, "WindowObject")?;
    set_callback(scope, window, "get_partition_local", win_get_partition_local, none)?;
    set_callback(scope, window, "set_partition_local", win_set_partition_local, none)?;
    set_callback(scope, window, "get_current_position", win_get_current_position, none)?;
    set_callback(scope, window, "get_partition_row_count", win_get_partition_row_count, none)?;
    set_callback(scope, window, "set_mark_position", win_set_mark_position, none)?;
    set_callback(scope, window, "rows_are_peers", win_rows_are_peers, none)?;
    set_callback(scope, window, "get_func_arg_in_partition", win_get_func_arg_in_partition, none)?;
    set_callback(scope, window, "get_func_arg_in_frame", win_get_func_arg_in_frame, none)?;
    set_callback(scope, window, "get_func_arg_current", win_get_func_arg_current, none)?;
    for (name, seek) in [
        ("SEEK_CURRENT", pg_sys::WINDOW_SEEK_CURRENT),
        ("SEEK_HEAD", pg_sys::WINDOW_SEEK_HEAD),
        ("SEEK_TAIL", pg_sys::WINDOW_SEEK_TAIL),
    ] {
        let key = new_string(scope, name)?;
        let value = v8::Integer::new(scope, seek as i32);
        window.set(key.into(), value.into());
    }

    let templates = Templates {
        plan: v8::Global::new(scope, plan),
        cursor: v8::Global::new(scope, cursor),
        window: v8::Global::new(scope, window),
    };
    TEMPLATES.with(|slot| *slot.borrow_mut() = Some(templates));
    Ok(())
}

fn instantiate<'s>(
    scope: &mut v8::HandleScope<'s>,
    pick: fn(&Templates) -> &v8::Global<v8::ObjectTemplate>,
) -> Plv8Result<v8::Local<'s, v8::Object>> {
    let template = TEMPLATES.with(|slot| {
        slot.borrow().as_ref().map(|templates| v8::Local::new(scope, pick(templates)))
    });
    template
        .and_then(|template| template.new_instance(scope))
        .ok_or_else(|| ScriptError::runtime("could not instantiate object template").into())
}

fn undefined<'s>(scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Value> {
    v8::undefined(scope).into()
}

/// Maps a script-side level constant to the host level; `None` for anything
/// that is not one of the exported constants.
fn elog_level(level: i32) -> Option<PgLogLevel> {
    let level = u32::try_from(level).ok()?;
    let mapped = match level {
        pg_sys::DEBUG5 => PgLogLevel::DEBUG5,
        pg_sys::DEBUG4 => PgLogLevel::DEBUG4,
        pg_sys::DEBUG3 => PgLogLevel::DEBUG3,
        pg_sys::DEBUG2 => PgLogLevel::DEBUG2,
        pg_sys::DEBUG1 => PgLogLevel::DEBUG1,
        pg_sys::LOG => PgLogLevel::LOG,
        pg_sys::INFO => PgLogLevel::INFO,
        pg_sys::NOTICE => PgLogLevel::NOTICE,
        pg_sys::WARNING => PgLogLevel::WARNING,
        pg_sys::ERROR => PgLogLevel::ERROR,
        _ => return None,
    };
    Some(mapped)
}

fn elog<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 2 {
            return Err(ScriptError::runtime("usage: plv8.elog(elevel, ...)").into());
        }
        let raw_level = args.get(0).int32_value(scope).unwrap_or(-1);
        let level = elog_level(raw_level).ok_or_else(|| ScriptError::runtime("invalid error level"))?;

        let mut parts = Vec::with_capacity(args.length() as usize - 1);
        for index in 1..args.length() {
            parts.push(value_to_string(scope, args.get(index))?);
        }
        let message = parts.join(" ");

        let code = match level {
            PgLogLevel::ERROR => PgSqlErrorCode::ERRCODE_INTERNAL_ERROR,
            PgLogLevel::WARNING => PgSqlErrorCode::ERRCODE_WARNING,
            _ => PgSqlErrorCode::ERRCODE_SUCCESSFUL_COMPLETION,
        };
        // an ERROR unwinds out of the protected region and is thrown back
        host_call(|| ErrorReport::new(code, message, "plv8.elog").report(level))?;
        Ok(undefined(scope))
    })
}

fn array_elements<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Vec<v8::Local<'s, v8::Value>> {
    let Ok(array) = v8::Local::<v8::Array>::try_from(value) else {
        return Vec::new();
    };
    (0..array.length())
        .map(|index| array.get_index(scope, index).unwrap_or_else(|| v8::undefined(scope).into()))
        .collect()
}

/// `execute(sql, [a, b])` and `execute(sql, a, b)` both bind `a` and `b`.
fn query_params<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: &v8::FunctionCallbackArguments<'s>,
) -> Vec<v8::Local<'s, v8::Value>> {
    if args.length() < 2 {
        return Vec::new();
    }
    let first = args.get(1);
    if args.length() == 2 && first.is_array() {
        return array_elements(scope, first);
    }
    (1..args.length()).map(|index| args.get(index)).collect()
}

fn bind_params(
    scope: &mut v8::HandleScope,
    params: &[v8::Local<v8::Value>],
    types: &[pg_sys::Oid],
) -> Plv8Result<(Vec<pg_sys::Datum>, Vec<c_char>)> {
    let mut values = Vec::with_capacity(params.len());
    let mut nulls = Vec::with_capacity(params.len());
    let mcxt = unsafe { pg_sys::CurrentMemoryContext };
    for (value, typid) in params.iter().zip(types) {
        if value.is_null_or_undefined() {
            values.push(pg_sys::Datum::from(0));
            nulls.push(NULL_PARAM);
            continue;
        }
        let mut ty = fill_type(*typid, mcxt)?;
        match to_datum(scope, *value, &mut ty)? {
            Some(datum) => {
                values.push(datum);
                nulls.push(SET_PARAM);
            }
            None => {
                values.push(pg_sys::Datum::from(0));
                nulls.push(NULL_PARAM);
            }
        }
    }
    Ok((values, nulls))
}

fn sql_cstring(sql: String) -> Plv8Result<CString> {
    CString::new(sql).map_err(|_| ScriptError::runtime("query contains a null character").into())
}

/// Rows for row-returning statements, the processed count otherwise.
fn spi_result<'s>(scope: &mut v8::HandleScope<'s>, status: i32) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let status = check_spi_status(status)?;
    let (processed, tuptable) = unsafe { (pg_sys::SPI_processed, pg_sys::SPI_tuptable) };
    let returns_rows = matches!(
        u32::try_from(status).unwrap_or(0),
        pg_sys::SPI_OK_SELECT
            | pg_sys::SPI_OK_INSERT_RETURNING
            | pg_sys::SPI_OK_DELETE_RETURNING
            | pg_sys::SPI_OK_UPDATE_RETURNING
    );
    if !returns_rows || tuptable.is_null() {
        return Ok(v8::Number::new(scope, row_count(processed)).into());
    }
    rows_to_array(scope, tuptable, processed as usize).map(Into::into)
}

/// Affected-row counts are reported as numbers, which hold any `u64` count
/// below 2^53 exactly.
fn row_count(processed: u64) -> f64 {
    processed as f64
}

fn rows_to_array<'s>(
    scope: &mut v8::HandleScope<'s>,
    tuptable: *mut pg_sys::SPITupleTable,
    count: usize,
) -> Plv8Result<v8::Local<'s, v8::Array>> {
    let mut converter = Converter::new(unsafe { (*tuptable).tupdesc }, false)?;
    let rows = v8::Array::new(scope, count as i32);
    for index in 0..count {
        let tuple = unsafe { *(*tuptable).vals.add(index) };
        let row = converter.to_value(scope, tuple)?;
        rows.set_index(scope, index as u32, row.into());
    }
    Ok(rows)
}

fn execute<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let sql = sql_cstring(value_to_string(scope, args.get(0))?)?;
        let params = query_params(scope, &args);

        let mut types = Vec::with_capacity(params.len());
        for (index, param) in params.iter().enumerate() {
            let typid = infer_datum_type(*param).ok_or_else(|| {
                ScriptError::runtime(format!("parameter[{index}] cannot translate to a database type"))
            })?;
            types.push(typid);
        }

        let subtransaction = SubTransaction::begin()?;
        let status = bind_params(scope, &params, &types).and_then(|(mut values, nulls)| {
            host_call(|| unsafe {
                if params.is_empty() {
                    pg_sys::SPI_exec(sql.as_ptr(), 0)
                } else {
                    pg_sys::SPI_execute_with_args(
                        sql.as_ptr(),
                        params.len() as i32,
                        types.as_mut_ptr(),
                        values.as_mut_ptr(),
                        nulls.as_ptr(),
                        false,
                        0,
                    )
                }
            })
        });
        subtransaction.end(status.is_ok())?;
        spi_result(scope, status?)
    })
}

fn prepare<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let sql = sql_cstring(value_to_string(scope, args.get(0))?)?;

        let mut types = Vec::new();
        if args.length() > 1 {
            let mut regtype = fill_type(pg_sys::REGTYPEOID, unsafe { pg_sys::CurrentMemoryContext })?;
            for name in array_elements(scope, args.get(1)) {
                let name = value_to_string(scope, name)?;
                let datum = regtype.input(&name)?;
                let typid = unsafe { pg_sys::Oid::from_datum(datum, false) }
                    .ok_or_else(|| ScriptError::runtime(format!("unknown type \"{name}\"")))?;
                types.push(typid);
            }
        }

        let plan = host_call(|| unsafe {
            pg_sys::SPI_prepare(sql.as_ptr(), types.len() as i32, types.as_mut_ptr())
        })?;
        if plan.is_null() {
            check_spi_status(unsafe { pg_sys::SPI_result })?;
            return Err(ScriptError::new(ErrorKind::Spi, "SPI_prepare failed").into());
        }
        check_spi_status(host_call(|| unsafe { pg_sys::SPI_keepplan(plan) })?)?;

        let object = instantiate(scope, |templates| &templates.plan)?;
        set_internal_pointer(scope, object, 0, plan.cast());
        Ok(object.into())
    })
}

fn this_plan(scope: &mut v8::HandleScope, this: v8::Local<v8::Object>) -> Plv8Result<pg_sys::SPIPlanPtr> {
    let plan = internal_pointer(scope, this, 0) as pg_sys::SPIPlanPtr;
    if plan.is_null() {
        return Err(ScriptError::runtime("plan has already been freed").into());
    }
    Ok(plan)
}

/// Binds the plan's parameters from the first argument, checking the count.
fn plan_params(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    plan: pg_sys::SPIPlanPtr,
) -> Plv8Result<(Vec<pg_sys::Datum>, Vec<c_char>)> {
    let params = if args.length() > 0 && args.get(0).is_array() {
        array_elements(scope, args.get(0))
    } else {
        Vec::new()
    };
    let argcount = host_call(|| unsafe { pg_sys::SPI_getargcount(plan) })?;
    if argcount as usize != params.len() {
        return Err(ScriptError::runtime(format!(
            "plan expected {} argument(s), given is {}",
            argcount,
            params.len()
        ))
        .into());
    }
    let types = host_call(|| {
        (0..argcount).map(|index| unsafe { pg_sys::SPI_getargtypeid(plan, index) }).collect::<Vec<_>>()
    })?;
    bind_params(scope, &params, &types)
}

fn plan_execute<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let plan = this_plan(scope, args.this())?;
        let (mut values, nulls) = plan_params(scope, &args, plan)?;

        let subtransaction = SubTransaction::begin()?;
        let status = host_call(|| unsafe {
            pg_sys::SPI_execute_plan(plan, values.as_mut_ptr(), nulls.as_ptr(), false, 0)
        });
        subtransaction.end(status.is_ok())?;
        spi_result(scope, status?)
    })
}

fn plan_cursor<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let plan = this_plan(scope, args.this())?;
        let (mut values, nulls) = plan_params(scope, &args, plan)?;

        let name = host_call(|| unsafe {
            let portal = pg_sys::SPI_cursor_open(
                std::ptr::null(),
                plan,
                values.as_mut_ptr(),
                nulls.as_ptr(),
                false,
            );
            CStr::from_ptr((*portal).name).to_string_lossy().into_owned()
        })?;

        let object = instantiate(scope, |templates| &templates.cursor)?;
        let name = new_string(scope, &name)?;
        object.set_internal_field(0, name.into());
        Ok(object.into())
    })
}

fn plan_free<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let this = args.this();
        let plan = internal_pointer(scope, this, 0) as pg_sys::SPIPlanPtr;
        let status =
            if plan.is_null() { 0 } else { host_call(|| unsafe { pg_sys::SPI_freeplan(plan) })? };
        set_internal_pointer(scope, this, 0, std::ptr::null_mut());
        Ok(v8::Integer::new(scope, status).into())
    })
}

fn this_cursor(scope: &mut v8::HandleScope, this: v8::Local<v8::Object>) -> Plv8Result<pg_sys::Portal> {
    let name = this
        .get_internal_field(scope, 0)
        .and_then(|data| v8::Local::<v8::Value>::try_from(data).ok())
        .map(|value| value.to_rust_string_lossy(scope))
        .unwrap_or_default();
    let name = CString::new(name).map_err(|_| ScriptError::runtime("cannot find cursor"))?;
    let portal = host_call(|| unsafe { pg_sys::SPI_cursor_find(name.as_ptr()) })?;
    if portal.is_null() {
        return Err(ScriptError::runtime("cannot find cursor").into());
    }
    Ok(portal)
}

/// A signed count becomes a direction and a row count.
fn scroll(count: i32) -> (bool, i64) {
    (count >= 0, i64::from(count).abs())
}

fn cursor_fetch<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let portal = this_cursor(scope, args.this())?;
        let want_array = args.length() >= 1;
        let (forward, count) =
            if want_array { scroll(args.get(0).int32_value(scope).unwrap_or(0)) } else { (true, 1) };

        host_call(|| unsafe { pg_sys::SPI_cursor_fetch(portal, forward, count as _) })?;
        let (processed, tuptable) = unsafe { (pg_sys::SPI_processed, pg_sys::SPI_tuptable) };
        if processed == 0 || tuptable.is_null() {
            return Ok(undefined(scope));
        }
        if want_array {
            return rows_to_array(scope, tuptable, processed as usize).map(Into::into);
        }
        let mut converter = Converter::new(unsafe { (*tuptable).tupdesc }, false)?;
        let tuple = unsafe { *(*tuptable).vals };
        converter.to_value(scope, tuple).map(Into::into)
    })
}

fn cursor_move<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let portal = this_cursor(scope, args.this())?;
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let (forward, count) = scroll(args.get(0).int32_value(scope).unwrap_or(0));
        host_call(|| unsafe { pg_sys::SPI_cursor_move(portal, forward, count as _) })?;
        Ok(undefined(scope))
    })
}

fn cursor_close<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let portal = this_cursor(scope, args.this())?;
        host_call(|| unsafe { pg_sys::SPI_cursor_close(portal) })?;
        Ok(v8::Integer::new(scope, 1).into())
    })
}

fn return_next<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let this = args.this();
        let converter = internal_pointer(scope, this, PLV8_INTNL_CONV) as *mut Converter;
        if converter.is_null() {
            return Err(ScriptError::new(
                ErrorKind::WrongContext,
                "return_next called in context that cannot accept a set",
            )
            .into());
        }
        let tupstore = internal_pointer(scope, this, PLV8_INTNL_TUPSTORE) as *mut pg_sys::Tuplestorestate;
        let converter = unsafe { &mut *converter };
        converter.to_datum(scope, args.get(0), Some(tupstore))?;
        Ok(undefined(scope))
    })
}

fn subtransaction<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let Ok(function) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
            return Ok(undefined(scope));
        };

        let subtransaction = SubTransaction::begin()?;
        let tc = &mut v8::TryCatch::new(scope);
        let result = {
            let _active = ActiveScope::enter(tc);
            function.call(tc, function.into(), &[])
        };
        subtransaction.end(result.is_some())?;
        result.ok_or_else(|| ScriptError::from_try_catch(ErrorKind::EngineRuntime, tc).into())
    })
}

fn find_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let signature = value_to_string(scope, args.get(0))?;
        let function = find_js_function_by_name(scope, &signature)?;
        Ok(v8::Local::new(scope, &function).into())
    })
}

fn get_window_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let fcinfo = internal_pointer(scope, args.this(), PLV8_INTNL_FCINFO);
        if fcinfo.is_null() {
            return Err(ScriptError::new(
                ErrorKind::WrongContext,
                "get_window_object called in wrong context",
            )
            .into());
        }
        let object = instantiate(scope, |templates| &templates.window)?;
        set_internal_pointer(scope, object, 0, fcinfo);
        Ok(object.into())
    })
}

fn window_call(
    scope: &mut v8::HandleScope,
    this: v8::Local<v8::Object>,
) -> Plv8Result<(pg_sys::FunctionCallInfo, pg_sys::WindowObject)> {
    let fcinfo = internal_pointer(scope, this, 0) as pg_sys::FunctionCallInfo;
    let winobj = if fcinfo.is_null() {
        std::ptr::null_mut()
    } else {
        unsafe { (*fcinfo).context as pg_sys::WindowObject }
    };
    if winobj.is_null() {
        return Err(ScriptError::new(
            ErrorKind::WrongContext,
            "window function api called with wrong object",
        )
        .into());
    }
    Ok((fcinfo, winobj))
}

/// Header of the partition-local area; the JSON text follows it.
#[repr(C)]
struct WindowStorage {
    maxlen: usize,
    len: usize,
}

/// Bytes to request from the partition for `payload` bytes of data.
fn storage_request(payload: usize) -> usize {
    payload + STORAGE_HEADER
}

/// The capacity to record for a write of `needed` bytes: the first write
/// fixes the capacity, later writes must fit into it.
fn storage_capacity(maxlen: usize, needed: usize) -> Result<usize, ScriptError> {
    if maxlen == 0 {
        Ok(needed)
    } else if maxlen < needed {
        Err(ScriptError::runtime("window local memory overflow"))
    } else {
        Ok(maxlen)
    }
}

fn partition_storage(winobj: pg_sys::WindowObject, size: usize) -> Plv8Result<*mut WindowStorage> {
    host_call(|| unsafe { pg_sys::WinGetPartitionLocalMemory(winobj, size) as *mut WindowStorage })
}

fn win_get_partition_local<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (_, winobj) = window_call(scope, args.this())?;
        let payload = if args.length() < 1 {
            DEFAULT_PARTITION_LOCAL_SIZE
        } else {
            usize::try_from(args.get(0).int32_value(scope).unwrap_or(0)).unwrap_or(0)
        };
        let size = storage_request(payload);
        let storage = partition_storage(winobj, size)?;

        let text = unsafe {
            if (*storage).maxlen == 0 {
                (*storage).maxlen = size;
            }
            if (*storage).len == 0 {
                return Ok(undefined(scope));
            }
            let data = (storage as *const u8).add(STORAGE_HEADER);
            String::from_utf8_lossy(std::slice::from_raw_parts(data, (*storage).len)).into_owned()
        };
        let text = new_string(scope, &text)?;
        v8::json::parse(scope, text)
            .ok_or_else(|| ScriptError::runtime("could not parse partition local value").into())
    })
}

fn win_set_partition_local<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (_, winobj) = window_call(scope, args.this())?;
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let text = v8::json::stringify(scope, args.get(0))
            .map(|text| text.to_rust_string_lossy(scope))
            .ok_or_else(|| ScriptError::runtime("could not serialize partition local value"))?;
        let size = storage_request(text.len());
        let storage = partition_storage(winobj, size)?;

        unsafe {
            (*storage).maxlen = storage_capacity((*storage).maxlen, size)?;
            (*storage).len = text.len();
            let data = (storage as *mut u8).add(STORAGE_HEADER);
            std::ptr::copy_nonoverlapping(text.as_ptr(), data, text.len());
        }
        Ok(undefined(scope))
    })
}

fn win_get_current_position<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (_, winobj) = window_call(scope, args.this())?;
        let position = host_call(|| unsafe { pg_sys::WinGetCurrentPosition(winobj) })?;
        Ok(v8::Number::new(scope, position as f64).into())
    })
}

fn win_get_partition_row_count<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (_, winobj) = window_call(scope, args.this())?;
        let count = host_call(|| unsafe { pg_sys::WinGetPartitionRowCount(winobj) })?;
        Ok(v8::Number::new(scope, count as f64).into())
    })
}

fn win_set_mark_position<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (_, winobj) = window_call(scope, args.this())?;
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let position = args.get(0).integer_value(scope).unwrap_or(0);
        host_call(|| unsafe { pg_sys::WinSetMarkPosition(winobj, position) })?;
        Ok(undefined(scope))
    })
}

fn win_rows_are_peers<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (_, winobj) = window_call(scope, args.this())?;
        if args.length() < 2 {
            return Ok(undefined(scope));
        }
        let first = args.get(0).integer_value(scope).unwrap_or(0);
        let second = args.get(1).integer_value(scope).unwrap_or(0);
        let peers = host_call(|| unsafe { pg_sys::WinRowsArePeers(winobj, first, second) })?;
        Ok(v8::Boolean::new(scope, peers).into())
    })
}

#[derive(Clone, Copy)]
enum WindowSeek {
    Partition,
    Frame,
}

fn window_func_arg<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: &v8::FunctionCallbackArguments<'s>,
    seek: WindowSeek,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let (fcinfo, winobj) = window_call(scope, args.this())?;
    if args.length() < 4 {
        return Err(ScriptError::runtime("argument not enough").into());
    }
    let argno = args.get(0).int32_value(scope).unwrap_or(0);
    let relpos = args.get(1).int32_value(scope).unwrap_or(0);
    let seektype = args.get(2).int32_value(scope).unwrap_or(0);
    let set_mark = args.get(3).boolean_value(scope);

    let mut is_null = false;
    let mut is_out = false;
    let datum = host_call(|| unsafe {
        match seek {
            WindowSeek::Partition => pg_sys::WinGetFuncArgInPartition(
                winobj, argno, relpos, seektype, set_mark, &mut is_null, &mut is_out,
            ),
            WindowSeek::Frame => pg_sys::WinGetFuncArgInFrame(
                winobj, argno, relpos, seektype, set_mark, &mut is_null, &mut is_out,
            ),
        }
    })?;
    if is_out {
        return Ok(undefined(scope));
    }
    with_arg_type(fcinfo, argno, |ty| to_value(scope, datum, is_null, ty))
}

fn win_get_func_arg_in_partition<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| window_func_arg(scope, &args, WindowSeek::Partition))
}

fn win_get_func_arg_in_frame<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| window_func_arg(scope, &args, WindowSeek::Frame))
}

fn win_get_func_arg_current<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        let (fcinfo, winobj) = window_call(scope, args.this())?;
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let argno = args.get(0).int32_value(scope).unwrap_or(0);
        let mut is_null = false;
        let datum =
            host_call(|| unsafe { pg_sys::WinGetFuncArgCurrent(winobj, argno, &mut is_null) })?;
        with_arg_type(fcinfo, argno, |ty| to_value(scope, datum, is_null, ty))
    })
}

fn quote_literal_fn<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let text = value_to_string(scope, args.get(0))?;
        new_string(scope, &quote_literal(&text)).map(Into::into)
    })
}

fn quote_nullable_fn<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let value = args.get(0);
        let text = if value.is_null_or_undefined() { None } else { Some(value_to_string(scope, value)?) };
        new_string(scope, &quote_nullable(text.as_deref())).map(Into::into)
    })
}

fn quote_ident_fn<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    run_callback(scope, rv, |scope| {
        if args.length() < 1 {
            return Ok(undefined(scope));
        }
        let ident = CString::new(value_to_string(scope, args.get(0))?)
            .map_err(|_| ScriptError::runtime("identifier contains a null character"))?;
        let quoted = host_call(|| unsafe {
            let raw = pg_sys::quote_identifier(ident.as_ptr());
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        })?;
        new_string(scope, &quoted).map(Into::into)
    })
}
