//! Call dispatch for the three entry points: function calls (scalar, window,
//! set-returning and trigger), anonymous code blocks and validation.

use deno_core::v8;
use pgrx::prelude::*;
use pgrx::{FromDatum, PgMemoryContexts};
use std::ffi::{CStr, c_void};
use std::rc::Rc;

use crate::dialect::Dialect;
use crate::engine::{
    ActiveScope, PLV8_INTNL_CONV, PLV8_INTNL_FCINFO, PLV8_INTNL_TUPSTORE, SlotGuard, user_context,
    with_scope,
};
use crate::error_bridge::{ErrorKind, Plv8Result, ScriptError, host_call, protect};
use crate::exec_env::ExecEnv;
use crate::observability::{
    log_debug, log_warn, record_execute_error, record_execute_start, record_execute_success,
};
use crate::proc_cache::{compile, compile_function, forget, is_polymorphic_type, type_name};
use crate::spi_status::SpiConnection;
use crate::tuple_converter::Converter;
use crate::type_bridge::{TYPTYPE_PSEUDO, TypeInfo, fill_type, new_string, to_datum, to_value};

/// Per-call-site state kept in `fn_extra` for the life of the call site's
/// memory context.
pub(crate) struct Proc {
    fn_oid: pg_sys::Oid,
    proname: String,
    function: v8::Global<v8::Function>,
    env: Rc<ExecEnv>,
    arg_types: Vec<TypeInfo>,
    ret_type: Option<TypeInfo>,
    retset: bool,
}

impl Proc {
    fn arg_type_mut(&mut self, argno: i32) -> Plv8Result<&mut TypeInfo> {
        usize::try_from(argno)
            .ok()
            .and_then(|index| self.arg_types.get_mut(index))
            .ok_or_else(|| ScriptError::runtime(format!("argument {argno} is out of range")).into())
    }

    /// The environment is rebuilt once the transaction that created it ended.
    fn live_env(&mut self, scope: &mut v8::HandleScope) -> Plv8Result<Rc<ExecEnv>> {
        if !self.env.is_live() {
            let function = v8::Local::new(scope, &self.function);
            let context = self.env.context().clone();
            self.env = ExecEnv::create(scope, &context, function)?;
        }
        Ok(Rc::clone(&self.env))
    }
}

/// Runs the argument type of the current window call through `f`.
pub(crate) fn with_arg_type<R>(
    fcinfo: pg_sys::FunctionCallInfo,
    argno: i32,
    f: impl FnOnce(&mut TypeInfo) -> Plv8Result<R>,
) -> Plv8Result<R> {
    let proc = unsafe { (*(*fcinfo).flinfo).fn_extra } as *mut Proc;
    if proc.is_null() {
        return Err(ScriptError::new(
            ErrorKind::WrongContext,
            "window function api called with wrong object",
        )
        .into());
    }
    let proc = unsafe { &mut *proc };
    f(proc.arg_type_mut(argno)?)
}

/// Calls `function` with an SPI connection open around it.
pub(crate) fn do_call<'s>(
    tc: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    function: v8::Local<v8::Function>,
    receiver: v8::Local<v8::Value>,
    args: &[v8::Local<v8::Value>],
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let spi = SpiConnection::connect()?;
    let result = function.call(tc, receiver, args);
    let finished = spi.finish();
    let result = result.ok_or_else(|| ScriptError::from_try_catch(ErrorKind::EngineRuntime, tc))?;
    finished?;
    Ok(result)
}

unsafe fn arg(fcinfo: pg_sys::FunctionCallInfo, index: usize) -> pg_sys::NullableDatum {
    unsafe { *(*fcinfo).args.as_ptr().add(index) }
}

fn resolve_type(
    typid: pg_sys::Oid,
    resolve: impl FnOnce() -> pg_sys::Oid,
) -> Plv8Result<pg_sys::Oid> {
    if is_polymorphic_type(typid) { host_call(resolve) } else { Ok(typid) }
}

unsafe fn proc_for_call(
    scope: &mut v8::HandleScope<'_, ()>,
    fcinfo: pg_sys::FunctionCallInfo,
    is_trigger: bool,
    dialect: Dialect,
) -> Plv8Result<*mut Proc> {
    let flinfo = unsafe { (*fcinfo).flinfo };
    let existing = unsafe { (*flinfo).fn_extra };
    if !existing.is_null() {
        return Ok(existing.cast());
    }

    let fn_oid = unsafe { (*flinfo).fn_oid };
    let mcxt = unsafe { (*flinfo).fn_mcxt };
    let compiled = compile(scope, fn_oid, false, is_trigger, dialect)?;

    let mut arg_types = Vec::with_capacity(compiled.argtypes.len());
    for (index, typid) in compiled.argtypes.iter().enumerate() {
        let typid =
            resolve_type(*typid, || unsafe { pg_sys::get_fn_expr_argtype(flinfo, index as i32) })?;
        arg_types.push(fill_type(typid, mcxt)?);
    }
    let ret_type = if is_trigger {
        None
    } else {
        let typid = resolve_type(compiled.rettype, || unsafe { pg_sys::get_fn_expr_rettype(flinfo) })?;
        Some(fill_type(typid, mcxt)?)
    };

    let context = user_context(scope)?;
    let env = {
        let local = v8::Local::new(scope, &context);
        let scope = &mut v8::ContextScope::new(scope, local);
        let function = v8::Local::new(scope, &compiled.function);
        ExecEnv::create(scope, &context, function)?
    };

    let proc = Proc {
        fn_oid,
        proname: compiled.proname,
        function: compiled.function,
        env,
        arg_types,
        ret_type,
        retset: compiled.retset,
    };
    let proc = PgMemoryContexts::For(mcxt).leak_and_drop_on_delete(proc);
    unsafe {
        (*flinfo).fn_extra = proc.cast();
    }
    Ok(proc)
}

fn window_object(fcinfo: pg_sys::FunctionCallInfo) -> Option<pg_sys::WindowObject> {
    let context = unsafe { (*fcinfo).context };
    let is_window = !context.is_null()
        && unsafe { pgrx::is_a(context, pg_sys::NodeTag::T_WindowObjectData) };
    is_window.then_some(context as pg_sys::WindowObject)
}

fn called_as_trigger(fcinfo: pg_sys::FunctionCallInfo) -> bool {
    let context = unsafe { (*fcinfo).context };
    !context.is_null() && unsafe { pgrx::is_a(context, pg_sys::NodeTag::T_TriggerData) }
}

/// Entry for `<language>_call_handler`.
pub(crate) unsafe fn call_handler(fcinfo: pg_sys::FunctionCallInfo, dialect: Dialect) -> pg_sys::Datum {
    match with_scope(|scope| unsafe { handle_call(scope, fcinfo, dialect) }) {
        Ok(datum) => datum,
        Err(err) => err.rethrow(),
    }
}

unsafe fn handle_call(
    scope: &mut v8::HandleScope<'_, ()>,
    fcinfo: pg_sys::FunctionCallInfo,
    dialect: Dialect,
) -> Plv8Result<pg_sys::Datum> {
    let is_trigger = called_as_trigger(fcinfo);
    let proc = unsafe { proc_for_call(scope, fcinfo, is_trigger, dialect)? };
    let (fn_oid, proname, retset) = {
        let proc = unsafe { &*proc };
        (proc.fn_oid, proc.proname.clone(), proc.retset)
    };

    let started_at = record_execute_start();
    log_debug(&format!("plv8.execute start fn={} oid={}", proname, fn_oid));
    let result = if is_trigger {
        unsafe { call_trigger(scope, fcinfo, proc) }
    } else if retset {
        unsafe { call_srf(scope, fcinfo, proc) }
    } else {
        unsafe { call_function(scope, fcinfo, proc) }
    };
    match &result {
        Ok(_) => record_execute_success(started_at),
        Err(err) => {
            record_execute_error(started_at, err.metrics_class());
            log_warn(&format!("plv8.execute failed fn={} oid={} err={}", proname, fn_oid, err));
        }
    }
    result
}

unsafe fn call_function(
    scope: &mut v8::HandleScope<'_, ()>,
    fcinfo: pg_sys::FunctionCallInfo,
    proc: *mut Proc,
) -> Plv8Result<pg_sys::Datum> {
    let context = unsafe { (*proc).env.context().clone() };
    let context = v8::Local::new(scope, &context);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let _active = ActiveScope::enter(tc);

    let window = window_object(fcinfo);
    let mut args = Vec::new();
    {
        let proc = unsafe { &mut *proc };
        for (index, ty) in proc.arg_types.iter_mut().enumerate() {
            let value = match window {
                // window arguments are not in fcinfo
                Some(winobj) => {
                    let mut is_null = false;
                    let datum = host_call(|| unsafe {
                        pg_sys::WinGetFuncArgCurrent(winobj, index as i32, &mut is_null)
                    })?;
                    to_value(tc, datum, is_null, ty)?
                }
                None => {
                    let arg = unsafe { arg(fcinfo, index) };
                    to_value(tc, arg.value, arg.isnull, ty)?
                }
            };
            args.push(value);
        }
    }

    let fcinfo_slot = if window.is_some() { fcinfo.cast::<c_void>() } else { std::ptr::null_mut() };
    let _window_guard = SlotGuard::set(tc, PLV8_INTNL_FCINFO, fcinfo_slot)?;
    let env = unsafe { (*proc).live_env(tc)? };
    let function = env.function(tc)?;
    let receiver = env.receiver(tc)?;
    let result = do_call(tc, function, receiver.into(), &args)?;

    let proc = unsafe { &mut *proc };
    let Some(ret_type) = proc.ret_type.as_mut() else {
        return Ok(pg_sys::Datum::from(0));
    };
    match ret_type.typid {
        pg_sys::VOIDOID => Ok(pg_sys::Datum::from(0)),
        pg_sys::RECORDOID => unsafe { record_result(tc, fcinfo, result) },
        _ => match to_datum(tc, result, ret_type)? {
            Some(datum) => Ok(datum),
            None => {
                unsafe { (*fcinfo).isnull = true };
                Ok(pg_sys::Datum::from(0))
            }
        },
    }
}

unsafe fn record_result(
    scope: &mut v8::HandleScope,
    fcinfo: pg_sys::FunctionCallInfo,
    result: v8::Local<v8::Value>,
) -> Plv8Result<pg_sys::Datum> {
    if result.is_null_or_undefined() {
        unsafe { (*fcinfo).isnull = true };
        return Ok(pg_sys::Datum::from(0));
    }
    let mut tupdesc: pg_sys::TupleDesc = std::ptr::null_mut();
    let class = host_call(|| unsafe {
        pg_sys::get_call_result_type(fcinfo, std::ptr::null_mut(), &mut tupdesc)
    })?;
    if class != pg_sys::TypeFuncClass::TYPEFUNC_COMPOSITE {
        return Err(ScriptError::new(
            ErrorKind::WrongContext,
            "function returning record called in context that cannot accept type record",
        )
        .into());
    }
    let mut converter = Converter::new(tupdesc, false)?;
    converter.to_datum(scope, result, None)
}

struct TupleStore {
    tupstore: *mut pg_sys::Tuplestorestate,
    tupdesc: pg_sys::TupleDesc,
    is_scalar: bool,
}

unsafe fn create_tuple_store(
    fcinfo: pg_sys::FunctionCallInfo,
    rettype: pg_sys::Oid,
) -> Plv8Result<TupleStore> {
    protect(|| unsafe {
        let rsinfo = (*fcinfo).resultinfo as *mut pg_sys::ReturnSetInfo;
        if rsinfo.is_null() || !pgrx::is_a(rsinfo.cast(), pg_sys::NodeTag::T_ReturnSetInfo) {
            return Err(ScriptError::new(
                ErrorKind::WrongContext,
                "set-valued function called in context that cannot accept a set",
            )
            .into());
        }
        if (*rsinfo).allowedModes & pg_sys::SetFunctionReturnMode::SFRM_Materialize as i32 == 0 {
            return Err(ScriptError::new(
                ErrorKind::WrongContext,
                "materialize mode required, but it is not allowed in this context",
            )
            .into());
        }

        let class =
            pg_sys::get_call_result_type(fcinfo, std::ptr::null_mut(), std::ptr::null_mut());
        if rettype == pg_sys::RECORDOID && class != pg_sys::TypeFuncClass::TYPEFUNC_COMPOSITE {
            return Err(ScriptError::new(
                ErrorKind::WrongContext,
                "function returning record called in context that cannot accept type record",
            )
            .into());
        }

        let old_context =
            pg_sys::MemoryContextSwitchTo((*(*rsinfo).econtext).ecxt_per_query_memory);
        let tupstore = pg_sys::tuplestore_begin_heap(true, false, pg_sys::work_mem);
        (*rsinfo).returnMode = pg_sys::SetFunctionReturnMode::SFRM_Materialize;
        (*rsinfo).setResult = tupstore;
        if (*rsinfo).setDesc.is_null() {
            (*rsinfo).setDesc = pg_sys::CreateTupleDescCopy((*rsinfo).expectedDesc);
        }
        let tupdesc = (*rsinfo).setDesc;
        pg_sys::MemoryContextSwitchTo(old_context);

        Ok(TupleStore {
            tupstore,
            tupdesc,
            is_scalar: class == pg_sys::TypeFuncClass::TYPEFUNC_SCALAR,
        })
    })
}

unsafe fn call_srf(
    scope: &mut v8::HandleScope<'_, ()>,
    fcinfo: pg_sys::FunctionCallInfo,
    proc: *mut Proc,
) -> Plv8Result<pg_sys::Datum> {
    let rettype = unsafe { (*proc).ret_type.as_ref().map_or(pg_sys::InvalidOid, |ty| ty.typid) };
    let store = unsafe { create_tuple_store(fcinfo, rettype)? };

    let context = unsafe { (*proc).env.context().clone() };
    let context = v8::Local::new(scope, &context);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let _active = ActiveScope::enter(tc);

    let mut args = Vec::new();
    {
        let proc = unsafe { &mut *proc };
        for (index, ty) in proc.arg_types.iter_mut().enumerate() {
            let arg = unsafe { arg(fcinfo, index) };
            args.push(to_value(tc, arg.value, arg.isnull, ty)?);
        }
    }

    // nested set-returning calls stash and restore the outer converter
    let mut converter = Converter::new(store.tupdesc, store.is_scalar)?;
    let conv_ptr = (&mut converter as *mut Converter).cast::<c_void>();
    let _conv_guard = SlotGuard::set(tc, PLV8_INTNL_CONV, conv_ptr)?;
    let _tupstore_guard = SlotGuard::set(tc, PLV8_INTNL_TUPSTORE, store.tupstore.cast())?;

    let env = unsafe { (*proc).live_env(tc)? };
    let function = env.function(tc)?;
    let receiver = env.receiver(tc)?;
    let result = do_call(tc, function, receiver.into(), &args)?;

    if result.is_undefined() {
        // rows were pushed with return_next, or there are none
    } else if let Ok(rows) = v8::Local::<v8::Array>::try_from(result) {
        for index in 0..rows.length() {
            let row = rows.get_index(tc, index).unwrap_or_else(|| v8::undefined(tc).into());
            converter.to_datum(tc, row, Some(store.tupstore))?;
        }
    } else {
        converter.to_datum(tc, result, Some(store.tupstore))?;
    }
    Ok(pg_sys::Datum::from(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerOp {
    Insert,
    Delete,
    Update,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TriggerEvent {
    pub(crate) op: Option<TriggerOp>,
    pub(crate) for_row: bool,
    pub(crate) when: &'static str,
}

impl TriggerEvent {
    pub(crate) fn decode(event: u32) -> Self {
        let op = match event & pg_sys::TRIGGER_EVENT_OPMASK {
            pg_sys::TRIGGER_EVENT_INSERT => Some(TriggerOp::Insert),
            pg_sys::TRIGGER_EVENT_DELETE => Some(TriggerOp::Delete),
            pg_sys::TRIGGER_EVENT_UPDATE => Some(TriggerOp::Update),
            pg_sys::TRIGGER_EVENT_TRUNCATE => Some(TriggerOp::Truncate),
            _ => None,
        };
        let when = match event & pg_sys::TRIGGER_EVENT_TIMINGMASK {
            pg_sys::TRIGGER_EVENT_BEFORE => "BEFORE",
            pg_sys::TRIGGER_EVENT_INSTEAD => "INSTEAD OF",
            _ => "AFTER",
        };
        Self { op, for_row: event & pg_sys::TRIGGER_EVENT_ROW != 0, when }
    }

    pub(crate) fn level(self) -> &'static str {
        if self.for_row { "ROW" } else { "STATEMENT" }
    }

    pub(crate) fn op_name(self) -> &'static str {
        match self.op {
            Some(TriggerOp::Insert) => "INSERT",
            Some(TriggerOp::Delete) => "DELETE",
            Some(TriggerOp::Update) => "UPDATE",
            Some(TriggerOp::Truncate) => "TRUNCATE",
            None => "?",
        }
    }
}

unsafe fn cstr_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    raw: *const std::ffi::c_char,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    if raw.is_null() {
        return Ok(v8::null(scope).into());
    }
    let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy();
    new_string(scope, &text).map(Into::into)
}

unsafe fn call_trigger(
    scope: &mut v8::HandleScope<'_, ()>,
    fcinfo: pg_sys::FunctionCallInfo,
    proc: *mut Proc,
) -> Plv8Result<pg_sys::Datum> {
    let trigdata = unsafe { (*fcinfo).context as *mut pg_sys::TriggerData };
    let (relation, trigger, event) =
        unsafe { ((*trigdata).tg_relation, (*trigdata).tg_trigger, (*trigdata).tg_event) };
    let event = TriggerEvent::decode(event);
    let tupdesc = unsafe { (*relation).rd_att };
    let (trigtuple, newtuple) = unsafe { ((*trigdata).tg_trigtuple, (*trigdata).tg_newtuple) };

    let context = unsafe { (*proc).env.context().clone() };
    let context = v8::Local::new(scope, &context);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let _active = ActiveScope::enter(tc);

    let undefined: v8::Local<v8::Value> = v8::undefined(tc).into();
    let mut default_result = pg_sys::Datum::from(0);
    let (new, old) = if event.for_row {
        let mut converter = Converter::new(tupdesc, false)?;
        match event.op {
            Some(TriggerOp::Insert) => {
                default_result = pg_sys::Datum::from(trigtuple);
                (converter.to_value(tc, trigtuple)?.into(), undefined)
            }
            Some(TriggerOp::Delete) => {
                default_result = pg_sys::Datum::from(trigtuple);
                (undefined, converter.to_value(tc, trigtuple)?.into())
            }
            Some(TriggerOp::Update) => {
                default_result = pg_sys::Datum::from(newtuple);
                (converter.to_value(tc, newtuple)?.into(), converter.to_value(tc, trigtuple)?.into())
            }
            _ => (undefined, undefined),
        }
    } else {
        (undefined, undefined)
    };

    let (tgname, relid, relname, relnamespace, tgargs) = unsafe {
        let rd_rel = (*relation).rd_rel;
        let nargs = usize::try_from((*trigger).tgnargs).unwrap_or(0);
        let tgargs = (0..nargs).map(|index| *(*trigger).tgargs.add(index)).collect::<Vec<_>>();
        ((*trigger).tgname, (*relation).rd_id, (*rd_rel).relname.data.as_ptr(), (*rd_rel).relnamespace, tgargs)
    };
    let schema = host_call(|| unsafe { pg_sys::get_namespace_name(relnamespace) })?;

    let argv = v8::Array::new(tc, tgargs.len() as i32);
    for (index, raw) in tgargs.iter().enumerate() {
        let value = unsafe { cstr_value(tc, *raw)? };
        argv.set_index(tc, index as u32, value);
    }
    let args: [v8::Local<v8::Value>; 10] = [
        new,
        old,
        unsafe { cstr_value(tc, tgname)? },
        new_string(tc, event.when)?.into(),
        new_string(tc, event.level())?.into(),
        new_string(tc, event.op_name())?.into(),
        v8::Integer::new_from_unsigned(tc, relid.to_u32()).into(),
        unsafe { cstr_value(tc, relname)? },
        unsafe { cstr_value(tc, schema)? },
        argv.into(),
    ];

    let env = unsafe { (*proc).live_env(tc)? };
    let function = env.function(tc)?;
    let receiver = env.receiver(tc)?;
    let result = do_call(tc, function, receiver.into(), &args)?;

    // null skips the row; statement-level results are ignored
    if result.is_null() || !event.for_row {
        return Ok(pg_sys::Datum::from(0));
    }
    if result.is_undefined() {
        return Ok(default_result);
    }
    let mut converter = Converter::new(tupdesc, false)?;
    let tuple = converter.to_heap_tuple(tc, result)?;
    Ok(pg_sys::Datum::from(tuple))
}

/// Entry for `<language>_inline_handler`.
pub(crate) unsafe fn inline_handler(fcinfo: pg_sys::FunctionCallInfo, dialect: Dialect) -> pg_sys::Datum {
    let source = unsafe {
        let codeblock = arg(fcinfo, 0).value.cast_mut_ptr::<pg_sys::InlineCodeBlock>();
        CStr::from_ptr((*codeblock).source_text).to_string_lossy().into_owned()
    };
    let started_at = record_execute_start();
    match with_scope(|scope| run_inline(scope, &source, dialect)) {
        Ok(()) => {
            record_execute_success(started_at);
            pg_sys::Datum::from(0)
        }
        Err(err) => {
            record_execute_error(started_at, err.metrics_class());
            err.rethrow()
        }
    }
}

fn run_inline(scope: &mut v8::HandleScope<'_, ()>, source: &str, dialect: Dialect) -> Plv8Result<()> {
    let function = compile_function(scope, None, &[], source, false, dialect)?;
    let context = user_context(scope)?;
    let local = v8::Local::new(scope, &context);
    let scope = &mut v8::ContextScope::new(scope, local);
    let tc = &mut v8::TryCatch::new(scope);
    let _active = ActiveScope::enter(tc);

    let function = v8::Local::new(tc, &function);
    let env = ExecEnv::create(tc, &context, function)?;
    let receiver = env.receiver(tc)?;
    do_call(tc, function, receiver.into(), &[]).map(|_| ())
}

/// Pseudo-type results other than these are refused with `None`;
/// `Some(true)` marks a trigger function.
pub(crate) fn check_return_type(rettype: pg_sys::Oid, is_pseudo: bool) -> Option<bool> {
    if !is_pseudo {
        return Some(false);
    }
    match rettype {
        pg_sys::TRIGGEROID => Some(true),
        pg_sys::RECORDOID | pg_sys::VOIDOID | pg_sys::INTERNALOID => Some(false),
        typid if is_polymorphic_type(typid) => Some(false),
        _ => None,
    }
}

/// Entry for `<language>_call_validator`.
pub(crate) unsafe fn validator(fcinfo: pg_sys::FunctionCallInfo, dialect: Dialect) -> pg_sys::Datum {
    let fn_oid = unsafe {
        let arg = arg(fcinfo, 0);
        pg_sys::Oid::from_datum(arg.value, arg.isnull)
    };
    let Some(fn_oid) = fn_oid else {
        return pg_sys::Datum::from(0);
    };
    let permitted = unsafe { pg_sys::CheckFunctionValidatorAccess((*(*fcinfo).flinfo).fn_oid, fn_oid) };
    if !permitted {
        return pg_sys::Datum::from(0);
    }
    if let Err(err) = validate(fn_oid, dialect) {
        forget(fn_oid);
        err.rethrow();
    }
    pg_sys::Datum::from(0)
}

fn validate(fn_oid: pg_sys::Oid, dialect: Dialect) -> Plv8Result<()> {
    let rettype = host_call(|| unsafe { pg_sys::get_func_rettype(fn_oid) })?;
    let typtype = host_call(|| unsafe { pg_sys::get_typtype(rettype) })?;
    let Some(is_trigger) = check_return_type(rettype, typtype == TYPTYPE_PSEUDO) else {
        return Err(ScriptError::new(
            ErrorKind::UnsupportedType,
            format!("PL/v8 functions cannot return type {}", type_name(rettype)?),
        )
        .into());
    };
    if !unsafe { pg_sys::check_function_bodies } {
        return Ok(());
    }

    with_scope(|scope| {
        let compiled = compile(scope, fn_oid, true, is_trigger, dialect)?;
        let context = user_context(scope)?;
        let local = v8::Local::new(scope, &context);
        let scope = &mut v8::ContextScope::new(scope, local);
        let function = v8::Local::new(scope, &compiled.function);
        ExecEnv::create(scope, &context, function)?;
        log_debug(&format!("validated function {} (oid {})", compiled.proname, fn_oid));
        Ok(())
    })
}
