//! The backend's single engine instance.
//!
//! The isolate comes from a leaked `JsRuntime` and lives for the rest of the
//! process. Every user gets a context built from the same global template,
//! and every scope that may hand control back to the host is pushed on an
//! active-scope stack so that nested calls can open child scopes under it.

use deno_core::{JsRuntime, RuntimeOptions, v8};
use pgrx::prelude::*;
use std::cell::RefCell;
use std::ffi::c_void;

use crate::builtins;
use crate::config::{debugger_port, start_proc};
use crate::error_bridge::{ErrorKind, Plv8Error, Plv8Result, ScriptError, host_call, protect};
use crate::observability::{log_debug, log_info};
use crate::proc_cache::{find_js_function_by_name, forget_user};
use crate::type_bridge::new_string;

pub(crate) const PLV8_INTNL_CONV: usize = 1;
pub(crate) const PLV8_INTNL_TUPSTORE: usize = 2;
pub(crate) const PLV8_INTNL_FCINFO: usize = 3;
const PLV8_INTNL_MAX: usize = 4;

const LOG_LEVELS: [(&str, u32); 11] = [
    ("DEBUG5", pg_sys::DEBUG5),
    ("DEBUG4", pg_sys::DEBUG4),
    ("DEBUG3", pg_sys::DEBUG3),
    ("DEBUG2", pg_sys::DEBUG2),
    ("DEBUG1", pg_sys::DEBUG1),
    ("DEBUG", pg_sys::DEBUG5),
    ("LOG", pg_sys::LOG),
    ("INFO", pg_sys::INFO),
    ("NOTICE", pg_sys::NOTICE),
    ("WARNING", pg_sys::WARNING),
    ("ERROR", pg_sys::ERROR),
];

struct Engine {
    isolate: *mut v8::OwnedIsolate,
    global_template: v8::Global<v8::ObjectTemplate>,
    receiver_template: v8::Global<v8::ObjectTemplate>,
}

struct ContextEntry {
    user_id: pg_sys::Oid,
    context: v8::Global<v8::Context>,
}

thread_local! {
    static ENGINE: RefCell<Option<Engine>> = const { RefCell::new(None) };
    static CONTEXTS: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
    static ACTIVE_SCOPES: RefCell<Vec<*mut v8::HandleScope<'static, ()>>> =
        const { RefCell::new(Vec::new()) };
}

fn bootstrap() -> Plv8Result<Engine> {
    let runtime: &'static mut JsRuntime =
        Box::leak(Box::new(JsRuntime::new(RuntimeOptions::default())));
    let isolate: *mut v8::OwnedIsolate = runtime.v8_isolate();
    // SAFETY: the runtime is leaked, so the isolate lives for the backend.
    let scope = &mut v8::HandleScope::new(unsafe { &mut *isolate });

    let global = v8::ObjectTemplate::new(scope);
    let constant = v8::PropertyAttribute::READ_ONLY | v8::PropertyAttribute::DONT_DELETE;
    for (name, level) in LOG_LEVELS {
        let key = new_string(scope, name)?;
        let value = v8::Integer::new(scope, level as i32);
        global.set_with_attr(key.into(), value.into(), constant);
    }

    let plv8 = v8::ObjectTemplate::new(scope);
    plv8.set_internal_field_count(PLV8_INTNL_MAX);
    let version_key = new_string(scope, "version")?;
    let version = new_string(scope, env!("CARGO_PKG_VERSION"))?;
    plv8.set_with_attr(version_key.into(), version.into(), builtins::attr_full());
    builtins::install(scope, plv8)?;
    let plv8_key = new_string(scope, "plv8")?;
    global.set_with_attr(plv8_key.into(), plv8.into(), builtins::attr_full());

    let receiver = v8::ObjectTemplate::new(scope);
    receiver.set_internal_field_count(1);

    log_debug("engine bootstrapped");
    Ok(Engine {
        isolate,
        global_template: v8::Global::new(scope, global),
        receiver_template: v8::Global::new(scope, receiver),
    })
}

fn ensure_engine() -> Plv8Result<*mut v8::OwnedIsolate> {
    if let Some(isolate) = ENGINE.with(|engine| engine.borrow().as_ref().map(|e| e.isolate)) {
        return Ok(isolate);
    }
    let engine = bootstrap()?;
    let isolate = engine.isolate;
    ENGINE.with(|slot| *slot.borrow_mut() = Some(engine));
    Ok(isolate)
}

/// Marks `scope` as the innermost live scope until the guard is dropped.
pub(crate) struct ActiveScope(());

impl ActiveScope {
    /// The guard must be dropped before `scope` is, and `scope` must not be
    /// used while a scope derived from the stack entry is alive.
    pub(crate) fn enter(scope: &mut v8::HandleScope<'_, ()>) -> Self {
        // erased lifetime; popped in Drop before the scope can go away
        let raw = scope as *mut v8::HandleScope<'_, ()> as *mut v8::HandleScope<'static, ()>;
        ACTIVE_SCOPES.with(|stack| stack.borrow_mut().push(raw));
        Self(())
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        ACTIVE_SCOPES.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Runs `f` in a fresh handle scope, nested under the innermost active scope
/// when the engine is already on the stack.
pub(crate) fn with_scope<R, F>(f: F) -> Plv8Result<R>
where
    F: FnOnce(&mut v8::HandleScope<'_, ()>) -> Plv8Result<R>,
{
    let top = ACTIVE_SCOPES.with(|stack| stack.borrow().last().copied());
    match top {
        Some(top) => {
            // SAFETY: `top` is pushed by a live `ActiveScope` whose owner is
            // suspended in a native callback or nested call until this child
            // scope is dropped at the end of the arm.
            let scope = &mut v8::HandleScope::new(unsafe { &mut *top });
            f(scope)
        }
        None => {
            let isolate = ensure_engine()?;
            // SAFETY: no scope is active, so nothing else borrows the isolate.
            let scope = &mut v8::HandleScope::new(unsafe { &mut *isolate });
            f(scope)
        }
    }
}

/// Body of every native function: the scope is made active, the work runs
/// in a protected region and any failure is thrown back as an `Error`.
pub(crate) fn run_callback<'s, F>(
    scope: &mut v8::HandleScope<'s>,
    mut rv: v8::ReturnValue,
    f: F,
) where
    F: FnOnce(&mut v8::HandleScope<'s>) -> Plv8Result<v8::Local<'s, v8::Value>>,
{
    let _active = ActiveScope::enter(scope);
    match protect(|| f(scope)) {
        Ok(value) => rv.set(value),
        Err(err) => err.throw(scope),
    }
}

/// A new receiver object with one internal field.
pub(crate) fn new_receiver<'s>(
    scope: &mut v8::HandleScope<'s>,
) -> Plv8Result<v8::Local<'s, v8::Object>> {
    let template = ENGINE.with(|engine| {
        engine.borrow().as_ref().map(|e| v8::Local::new(scope, &e.receiver_template))
    });
    template
        .and_then(|template| template.new_instance(scope))
        .ok_or_else(|| ScriptError::runtime("could not create receiver").into())
}

/// The context of the current user, created on first use.
pub(crate) fn user_context(
    scope: &mut v8::HandleScope<'_, ()>,
) -> Plv8Result<v8::Global<v8::Context>> {
    let user_id = host_call(|| unsafe { pg_sys::GetUserId() })?;
    let existing = CONTEXTS.with(|contexts| {
        contexts
            .borrow()
            .iter()
            .find(|entry| entry.user_id == user_id)
            .map(|entry| entry.context.clone())
    });
    if let Some(context) = existing {
        return Ok(context);
    }

    let template = ENGINE
        .with(|engine| engine.borrow().as_ref().map(|e| v8::Local::new(scope, &e.global_template)))
        .ok_or_else(|| ScriptError::runtime("engine is not initialized"))?;
    let context = v8::Context::new(
        scope,
        v8::ContextOptions { global_template: Some(template), ..Default::default() },
    );
    let context = v8::Global::new(scope, context);

    // registered first: the startup code may compile functions of its own
    CONTEXTS.with(|contexts| {
        contexts.borrow_mut().push(ContextEntry { user_id, context: context.clone() });
    });
    log_debug(&format!(
        "created context for user {} (debugger port {})",
        user_id.to_u32(),
        debugger_port()
    ));

    if let Some(signature) = start_proc() {
        if let Err(err) = run_start_proc(scope, &context, &signature) {
            CONTEXTS.with(|contexts| contexts.borrow_mut().retain(|entry| entry.user_id != user_id));
            forget_user(user_id.to_u32());
            return Err(err);
        }
        log_info(&format!("ran start_proc {signature} for user {}", user_id.to_u32()));
    }
    Ok(context)
}

fn run_start_proc(
    scope: &mut v8::HandleScope<'_, ()>,
    context: &v8::Global<v8::Context>,
    signature: &str,
) -> Plv8Result<()> {
    let context = v8::Local::new(scope, context);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let _active = ActiveScope::enter(tc);

    let function = match find_js_function_by_name(tc, signature) {
        Ok(function) => function,
        Err(err) if is_lookup_failure(&err) => {
            warning!("failed to find js function {}", err.message());
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let function = v8::Local::new(tc, &function);
    let receiver = context.global(tc);
    crate::dispatch::do_call(tc, function, receiver.into(), &[]).map(|_| ())
}

/// Resolution failures only downgrade to a warning; a startup function that
/// does not compile still fails the call.
fn is_lookup_failure(err: &Plv8Error) -> bool {
    match err {
        Plv8Error::Host(_) => true,
        Plv8Error::Script(err) => err.kind() == ErrorKind::CatalogLookupFailed,
    }
}

/// The `plv8` namespace object of the entered context.
pub(crate) fn plv8_object<'s>(
    scope: &mut v8::HandleScope<'s>,
) -> Plv8Result<v8::Local<'s, v8::Object>> {
    let global = scope.get_current_context().global(scope);
    let key = new_string(scope, "plv8")?;
    global
        .get(scope, key.into())
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .ok_or_else(|| ScriptError::new(ErrorKind::EngineRuntime, "plv8 namespace is missing").into())
}

/// Reads an external pointer from an internal field; null when unset.
pub(crate) fn internal_pointer(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    index: usize,
) -> *mut c_void {
    object
        .get_internal_field(scope, index)
        .and_then(|data| v8::Local::<v8::Value>::try_from(data).ok())
        .and_then(|value| v8::Local::<v8::External>::try_from(value).ok())
        .map_or(std::ptr::null_mut(), |external| external.value())
}

pub(crate) fn set_internal_pointer(
    scope: &mut v8::HandleScope<'_, ()>,
    object: v8::Local<v8::Object>,
    index: usize,
    pointer: *mut c_void,
) {
    let external = v8::External::new(scope, pointer);
    object.set_internal_field(index, external.into());
}

/// Sets one `plv8` slot for the duration of a call and puts the previous
/// value back on drop, so nested calls see their own state.
pub(crate) struct SlotGuard {
    plv8: v8::Global<v8::Object>,
    index: usize,
    previous: *mut c_void,
}

impl SlotGuard {
    pub(crate) fn set(
        scope: &mut v8::HandleScope,
        index: usize,
        pointer: *mut c_void,
    ) -> Plv8Result<Self> {
        let plv8 = plv8_object(scope)?;
        let previous = internal_pointer(scope, plv8, index);
        set_internal_pointer(scope, plv8, index, pointer);
        Ok(Self { plv8: v8::Global::new(scope, plv8), index, previous })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let restored = with_scope(|scope| {
            let plv8 = v8::Local::new(scope, &self.plv8);
            set_internal_pointer(scope, plv8, self.index, self.previous);
            Ok(())
        });
        if let Err(err) = restored {
            log_debug(&format!("could not restore plv8 slot {}: {err}", self.index));
        }
    }
}
