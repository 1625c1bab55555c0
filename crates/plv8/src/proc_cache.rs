use common::signature::SignatureForm;
use deno_core::v8;
use pgrx::FromDatum;
use pgrx::fcinfo::direct_function_call;
use pgrx::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};

use crate::dialect::{Dialect, translate};
use crate::engine::user_context;
use crate::error_bridge::{ErrorKind, Plv8Result, ScriptError, host_call, protect};
use crate::observability::{
    log_debug, record_compile_error, record_compile_start, record_compile_success,
};
use crate::spi_status::SubTransaction;
use crate::type_bridge::{TYPTYPE_PSEUDO, name_data, new_string, syscache_lookup, tuple_struct};

const TRIGGER_ARGUMENTS: &str =
    "NEW, OLD, TG_NAME, TG_WHEN, TG_LEVEL, TG_OP, TG_RELID, TG_TABLE_NAME, TG_TABLE_SCHEMA, TG_ARGV";

thread_local! {
    // compiled functions are bound to the backend's isolate
    static PROC_CACHE: RefCell<HashMap<pg_sys::Oid, ProcCacheEntry>> = RefCell::new(HashMap::new());
}

/// Identity of a catalog row version, compared to decide whether a cached
/// function is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcVersion {
    pub(crate) xmin: String,
    pub(crate) tid: String,
    pub(crate) user_id: u32,
}

struct ProcCacheEntry {
    function: Option<v8::Global<v8::Function>>,
    version: ProcVersion,
    proname: String,
    prosrc: String,
    rettype: pg_sys::Oid,
    retset: bool,
    argtypes: Vec<pg_sys::Oid>,
}

/// The parts of `pg_proc` the handler needs, read from the syscache.
#[derive(Debug, Clone)]
struct CatalogProc {
    version: ProcVersion,
    proname: String,
    prosrc: Option<String>,
    rettype: pg_sys::Oid,
    retset: bool,
    argtypes: Vec<pg_sys::Oid>,
    argmodes: Option<Vec<String>>,
    argnames: Option<Vec<Option<String>>>,
    language: String,
}

/// A current compiled function with the catalog facts dispatch works from.
pub(crate) struct CompiledProc {
    pub(crate) function: v8::Global<v8::Function>,
    pub(crate) proname: String,
    pub(crate) rettype: pg_sys::Oid,
    pub(crate) retset: bool,
    pub(crate) argtypes: Vec<pg_sys::Oid>,
}

pub(crate) fn is_current(stored: bool, cached: &ProcVersion, catalog: &ProcVersion) -> bool {
    stored && cached == catalog
}

fn read_catalog(fn_oid: pg_sys::Oid, user_id: u32) -> Plv8Result<CatalogProc> {
    let procoid = pg_sys::SysCacheIdentifier::PROCOID as i32;
    let row = syscache_lookup(procoid, fn_oid, |tuple| unsafe {
        let form = &*tuple_struct::<pg_sys::FormData_pg_proc>(tuple);
        let header = &*(*tuple).t_data;
        let tid = (*tuple).t_self;
        let block = (u32::from(tid.ip_blkid.bi_hi) << 16) | u32::from(tid.ip_blkid.bi_lo);

        let mut isnull = false;
        let prosrc = pg_sys::SysCacheGetAttr(
            procoid,
            tuple,
            pg_sys::Anum_pg_proc_prosrc as pg_sys::AttrNumber,
            &mut isnull,
        );
        let prosrc = String::from_datum(prosrc, isnull);

        let mut types: *mut pg_sys::Oid = std::ptr::null_mut();
        let mut names: *mut *mut std::ffi::c_char = std::ptr::null_mut();
        let mut modes: *mut std::ffi::c_char = std::ptr::null_mut();
        let count = pg_sys::get_func_arg_info(tuple, &mut types, &mut names, &mut modes).max(0) as usize;
        let argtypes = if types.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(types, count).to_vec()
        };
        let argnames = (!names.is_null()).then(|| {
            (0..count)
                .map(|index| {
                    let raw = *names.add(index);
                    (!raw.is_null()).then(|| CStr::from_ptr(raw).to_string_lossy().into_owned())
                })
                .collect::<Vec<_>>()
        });
        let argmodes = (!modes.is_null()).then(|| {
            (0..count).map(|index| char::from(*modes.add(index) as u8).to_string()).collect::<Vec<_>>()
        });

        CatalogProc {
            version: ProcVersion {
                xmin: header.t_choice.t_heap.t_xmin.to_string(),
                tid: format!("({block},{})", tid.ip_posid),
                user_id,
            },
            proname: name_data(&form.proname),
            prosrc,
            rettype: form.prorettype,
            retset: form.proretset,
            argtypes,
            argmodes,
            argnames,
            language: String::new(),
        }
        .with_language(form.prolang)
    })?;

    match row {
        Some(catalog) => catalog,
        None => Err(ScriptError::new(
            ErrorKind::CatalogLookupFailed,
            format!("cache lookup failed for function {}", fn_oid),
        )
        .into()),
    }
}

impl CatalogProc {
    fn with_language(mut self, prolang: pg_sys::Oid) -> Plv8Result<Self> {
        let language = syscache_lookup(pg_sys::SysCacheIdentifier::LANGOID as i32, prolang, |tuple| unsafe {
            name_data(&(*tuple_struct::<pg_sys::FormData_pg_language>(tuple)).lanname)
        })?;
        self.language = language.ok_or_else(|| {
            ScriptError::new(
                ErrorKind::CatalogLookupFailed,
                format!("cache lookup failed for language {}", prolang),
            )
        })?;
        Ok(self)
    }
}

fn is_polymorphic(typid: pg_sys::Oid) -> bool {
    matches!(
        typid,
        pg_sys::ANYELEMENTOID
            | pg_sys::ANYARRAYOID
            | pg_sys::ANYNONARRAYOID
            | pg_sys::ANYENUMOID
            | pg_sys::ANYRANGEOID
            | pg_sys::ANYMULTIRANGEOID
            | pg_sys::ANYCOMPATIBLEOID
            | pg_sys::ANYCOMPATIBLEARRAYOID
            | pg_sys::ANYCOMPATIBLENONARRAYOID
            | pg_sys::ANYCOMPATIBLERANGEOID
            | pg_sys::ANYCOMPATIBLEMULTIRANGEOID
    )
}

pub(crate) fn is_polymorphic_type(typid: pg_sys::Oid) -> bool {
    is_polymorphic(typid)
}

pub(crate) fn type_name(typid: pg_sys::Oid) -> Plv8Result<String> {
    host_call(|| unsafe {
        let raw = pg_sys::format_type_be(typid);
        let name = std::ffi::CStr::from_ptr(raw).to_string_lossy().into_owned();
        pg_sys::pfree(raw.cast());
        name
    })
}

/// Pseudo-typed arguments are refused, except `internal` (used to declare
/// functions only reachable through `find_function`) and polymorphic ones.
fn validate_argument_types(argtypes: &[pg_sys::Oid]) -> Plv8Result<()> {
    for typid in argtypes {
        let typtype = host_call(|| unsafe { pg_sys::get_typtype(*typid) })?;
        if typtype == TYPTYPE_PSEUDO && *typid != pg_sys::INTERNALOID && !is_polymorphic(*typid)
        {
            return Err(ScriptError::new(
                ErrorKind::UnsupportedType,
                format!("PL/v8 functions cannot accept type {}", type_name(*typid)?),
            )
            .into());
        }
    }
    Ok(())
}

/// Keeps the arguments a caller passes (`i`, `b` and `v` modes), with their
/// names aligned.
pub(crate) fn input_arguments(
    argtypes: &[pg_sys::Oid],
    argmodes: Option<&[String]>,
    argnames: Option<&[Option<String>]>,
) -> (Vec<pg_sys::Oid>, Vec<Option<String>>) {
    let mut types = Vec::with_capacity(argtypes.len());
    let mut names = Vec::with_capacity(argtypes.len());
    for (index, typid) in argtypes.iter().enumerate() {
        let mode = argmodes.and_then(|modes| modes.get(index)).map_or("i", String::as_str);
        if !matches!(mode, "i" | "b" | "v") {
            continue;
        }
        types.push(*typid);
        names.push(argnames.and_then(|names| names.get(index).cloned().flatten()));
    }
    (types, names)
}

/// Wraps a body as a function expression. The header takes exactly one line
/// so that reported line numbers are off by one.
pub(crate) fn wrapper_source(
    argnames: &[Option<String>],
    body: &str,
    is_trigger: bool,
    translated: bool,
) -> Result<String, ScriptError> {
    let parameters = if is_trigger {
        if !argnames.is_empty() {
            return Err(ScriptError::new(
                ErrorKind::EngineCompile,
                "trigger function cannot have arguments",
            ));
        }
        TRIGGER_ARGUMENTS.to_string()
    } else {
        argnames
            .iter()
            .enumerate()
            .map(|(index, name)| match name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => format!("${}", index + 1),
            })
            .collect::<Vec<_>>()
            .join(",")
    };

    if translated {
        Ok(format!("(function ({parameters}){{\nreturn {body}\n}})"))
    } else {
        Ok(format!("(function ({parameters}){{\n{body}\n}})"))
    }
}

/// Compiles a wrapped body in the current user's context.
pub(crate) fn compile_function(
    scope: &mut v8::HandleScope<'_, ()>,
    proname: Option<&str>,
    argnames: &[Option<String>],
    prosrc: &str,
    is_trigger: bool,
    dialect: Dialect,
) -> Plv8Result<v8::Global<v8::Function>> {
    let context = user_context(scope)?;
    let body = translate(scope, prosrc, dialect)?;
    let source = wrapper_source(argnames, &body, is_trigger, dialect.is_translated())?;

    let context = v8::Local::new(scope, &context);
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);
    let code = new_string(tc, &source)?;
    let name: v8::Local<v8::Value> = match proname {
        Some(proname) => new_string(tc, proname)?.into(),
        None => v8::undefined(tc).into(),
    };
    let origin = v8::ScriptOrigin::new(tc, name, 0, 0, false, 0, None, false, false, false, None);

    let script = v8::Script::compile(tc, code, Some(&origin))
        .ok_or_else(|| ScriptError::from_try_catch(ErrorKind::EngineCompile, tc))?;
    let result =
        script.run(tc).ok_or_else(|| ScriptError::from_try_catch(ErrorKind::EngineCompile, tc))?;
    let function = v8::Local::<v8::Function>::try_from(result).map_err(|_| {
        ScriptError::new(ErrorKind::EngineCompile, "compiled source is not a function")
    })?;
    Ok(v8::Global::new(tc, function))
}

/// Returns the cached function for `fn_oid`, compiling it when the catalog
/// row or the user changed since it was cached.
pub(crate) fn compile(
    scope: &mut v8::HandleScope<'_, ()>,
    fn_oid: pg_sys::Oid,
    validate: bool,
    is_trigger: bool,
    dialect: Dialect,
) -> Plv8Result<CompiledProc> {
    let user_id = host_call(|| unsafe { pg_sys::GetUserId() })?;
    let catalog = read_catalog(fn_oid, user_id.to_u32())?;

    let cached = PROC_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let entry = cache.get(&fn_oid)?;
        if is_current(entry.function.is_some(), &entry.version, &catalog.version) {
            return entry.function.clone().map(|function| CompiledProc {
                function,
                proname: entry.proname.clone(),
                rettype: entry.rettype,
                retset: entry.retset,
                argtypes: entry.argtypes.clone(),
            });
        }
        // stale: release the pinned function and the stored source
        cache.remove(&fn_oid);
        None
    });
    if let Some(compiled) = cached {
        return Ok(compiled);
    }

    let prosrc = catalog
        .prosrc
        .clone()
        .ok_or_else(|| ScriptError::new(ErrorKind::CatalogLookupFailed, "null prosrc"))?;
    if validate {
        validate_argument_types(&catalog.argtypes)?;
    }
    let (argtypes, argnames) = input_arguments(
        &catalog.argtypes,
        catalog.argmodes.as_deref(),
        catalog.argnames.as_deref(),
    );

    let started_at = record_compile_start();
    let function = match compile_function(
        scope,
        Some(&catalog.proname),
        &argnames,
        &prosrc,
        is_trigger,
        dialect,
    ) {
        Ok(function) => {
            record_compile_success(started_at);
            function
        }
        Err(err) => {
            record_compile_error(started_at, err.metrics_class());
            return Err(err);
        }
    };
    log_debug(&format!("compiled function {} (oid {})", catalog.proname, fn_oid));

    PROC_CACHE.with(|cache| {
        cache.borrow_mut().insert(
            fn_oid,
            ProcCacheEntry {
                function: Some(function.clone()),
                version: catalog.version.clone(),
                proname: catalog.proname.clone(),
                prosrc,
                rettype: catalog.rettype,
                retset: catalog.retset,
                argtypes: argtypes.clone(),
            },
        );
    });

    Ok(CompiledProc {
        function,
        proname: catalog.proname,
        rettype: catalog.rettype,
        retset: catalog.retset,
        argtypes,
    })
}

/// Drops the cached entry for `fn_oid`, if any; used when validation of a
/// freshly compiled function fails later on.
pub(crate) fn forget(fn_oid: pg_sys::Oid) {
    PROC_CACHE.with(|cache| {
        if let Some(entry) = cache.borrow_mut().remove(&fn_oid) {
            log_debug(&format!("discarded cached source of {} ({} bytes)", entry.proname, entry.prosrc.len()));
        }
    });
}

/// Drops every function compiled in `user_id`'s context; called when that
/// context is discarded.
pub(crate) fn forget_user(user_id: u32) {
    PROC_CACHE.with(|cache| cache.borrow_mut().retain(|_, entry| entry.version.user_id != user_id));
}

/// Compiles a function of the language family by oid; `None` when it is
/// written in some other language.
pub(crate) fn find_js_function(
    scope: &mut v8::HandleScope<'_, ()>,
    fn_oid: pg_sys::Oid,
) -> Plv8Result<Option<v8::Global<v8::Function>>> {
    let user_id = host_call(|| unsafe { pg_sys::GetUserId() })?;
    let catalog = read_catalog(fn_oid, user_id.to_u32())?;
    let Some(dialect) = Dialect::from_language(&catalog.language) else {
        return Ok(None);
    };
    compile(scope, fn_oid, true, false, dialect).map(|compiled| Some(compiled.function))
}

/// Resolves a `regproc` or `regprocedure` signature to a compiled function.
pub(crate) fn find_js_function_by_name(
    scope: &mut v8::HandleScope<'_, ()>,
    signature: &str,
) -> Plv8Result<v8::Global<v8::Function>> {
    let found = match resolve_signature(signature)? {
        Some(fn_oid) => find_js_function(scope, fn_oid)?,
        None => None,
    };
    found.ok_or_else(|| {
        ScriptError::new(
            ErrorKind::CatalogLookupFailed,
            format!("javascript function is not found for \"{signature}\""),
        )
        .into()
    })
}

/// Runs the type's input function in a subtransaction, so an unknown name
/// is rolled back cleanly and reported as a lookup failure.
fn resolve_signature(signature: &str) -> Plv8Result<Option<pg_sys::Oid>> {
    let form = SignatureForm::detect(signature);
    let parse = match form {
        SignatureForm::Name => pg_sys::regprocin,
        SignatureForm::NameWithArgs => pg_sys::regprocedurein,
    };
    let input = CString::new(signature)
        .map_err(|_| ScriptError::runtime("function signature contains a null character"))?;
    log_debug(&format!("resolving \"{signature}\" as {}", form.regtype()));

    let subtransaction = SubTransaction::begin()?;
    let resolved = protect(|| {
        Ok(unsafe {
            direct_function_call::<pg_sys::Oid>(parse, &[Some(pg_sys::Datum::from(input.as_ptr()))])
        })
    });
    subtransaction.end(resolved.is_ok())?;

    match resolved {
        Ok(fn_oid) => Ok(fn_oid.filter(|oid| *oid != pg_sys::InvalidOid)),
        Err(err) => Err(ScriptError::new(ErrorKind::CatalogLookupFailed, err.message()).into()),
    }
}
