//! Conversion between database datums and engine values.
//!
//! A [`TypeInfo`] describes one database type the way the converters need it:
//! storage layout, the kind of conversion that applies and lazily resolved
//! text I/O routines. Arrays and domains describe their element or base type
//! recursively.

use deno_core::v8;
use pgrx::fcinfo::{direct_function_call, direct_function_call_as_datum};
use pgrx::prelude::*;
use pgrx::{FromDatum, IntoDatum};
use std::ffi::{CStr, CString, c_char, c_void};

use crate::error_bridge::{ErrorKind, Plv8Error, Plv8Result, ScriptError, host_call, protect};
use crate::tuple_converter::Converter;

const TYPCATEGORY_ARRAY: c_char = b'A' as c_char;
const TYPCATEGORY_COMPOSITE: c_char = b'C' as c_char;
const TYPTYPE_DOMAIN: c_char = b'd' as c_char;
pub(crate) const TYPTYPE_PSEUDO: c_char = b'p' as c_char;

/// Milliseconds between the Unix epoch and the 2000-01-01 database epoch.
pub(crate) const EPOCH_SHIFT_MS: f64 = (2_451_545.0 - 2_440_588.0) * 86_400_000.0;
const MS_PER_DAY: f64 = 86_400_000.0;
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExternalArrayKind {
    Int16,
    Int32,
    Float32,
    Float64,
}

impl ExternalArrayKind {
    pub(crate) fn from_domain_name(name: &str) -> Option<Self> {
        match name {
            "plv8_int2array" => Some(Self::Int16),
            "plv8_int4array" => Some(Self::Int32),
            "plv8_float4array" => Some(Self::Float32),
            "plv8_float8array" => Some(Self::Float64),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum TypeKind {
    Scalar,
    Array(Box<TypeInfo>),
    Composite,
    Domain(Box<TypeInfo>),
    ExternalArray(ExternalArrayKind),
}

#[derive(Debug)]
pub(crate) struct TypeInfo {
    pub(crate) typid: pg_sys::Oid,
    pub(crate) len: i16,
    pub(crate) byval: bool,
    pub(crate) align: c_char,
    pub(crate) kind: TypeKind,
    mcxt: pg_sys::MemoryContext,
    ioparam: pg_sys::Oid,
    fn_input: *mut pg_sys::FmgrInfo,
    fn_output: *mut pg_sys::FmgrInfo,
    domain_extra: *mut c_void,
}

/// Reads the catalog description of `typid`. I/O routines and domain check
/// caches are allocated in `mcxt` (the current context when null).
pub(crate) fn fill_type(typid: pg_sys::Oid, mcxt: pg_sys::MemoryContext) -> Plv8Result<TypeInfo> {
    let mcxt = if mcxt.is_null() { unsafe { pg_sys::CurrentMemoryContext } } else { mcxt };

    let (category, len, byval, align, typtype) = host_call(|| unsafe {
        let mut category: c_char = 0;
        let mut preferred = false;
        let mut len: i16 = 0;
        let mut byval = false;
        let mut align: c_char = 0;
        pg_sys::get_type_category_preferred(typid, &mut category, &mut preferred);
        pg_sys::get_typlenbyvalalign(typid, &mut len, &mut byval, &mut align);
        (category, len, byval, align, pg_sys::get_typtype(typid))
    })?;

    let mut info = TypeInfo {
        typid,
        len,
        byval,
        align,
        kind: TypeKind::Scalar,
        mcxt,
        ioparam: pg_sys::InvalidOid,
        fn_input: std::ptr::null_mut(),
        fn_output: std::ptr::null_mut(),
        domain_extra: std::ptr::null_mut(),
    };

    if typtype == TYPTYPE_DOMAIN {
        if let Some(kind) = external_array_kind(typid)? {
            info.kind = TypeKind::ExternalArray(kind);
            return Ok(info);
        }
        let base = host_call(|| unsafe { pg_sys::getBaseType(typid) })?;
        info.kind = TypeKind::Domain(Box::new(fill_type(base, mcxt)?));
        return Ok(info);
    }

    if typid == pg_sys::RECORDARRAYOID {
        info.kind = TypeKind::Array(Box::new(fill_type(pg_sys::RECORDOID, mcxt)?));
    } else if category == TYPCATEGORY_ARRAY {
        let element = host_call(|| unsafe { pg_sys::get_element_type(typid) })?;
        if element == pg_sys::InvalidOid {
            return Err(ScriptError::new(
                ErrorKind::UnsupportedType,
                format!("cannot determine element type of array: {}", typid.to_u32()),
            )
            .into());
        }
        info.kind = TypeKind::Array(Box::new(fill_type(element, mcxt)?));
    } else if category == TYPCATEGORY_COMPOSITE || typid == pg_sys::RECORDOID {
        info.kind = TypeKind::Composite;
    }

    Ok(info)
}

fn external_array_kind(typid: pg_sys::Oid) -> Plv8Result<Option<ExternalArrayKind>> {
    let name = syscache_lookup(pg_sys::SysCacheIdentifier::TYPEOID as i32, typid, |tuple| unsafe {
        let form = &*tuple_struct::<pg_sys::FormData_pg_type>(tuple);
        name_data(&form.typname)
    })?;
    match name {
        Some(name) => Ok(ExternalArrayKind::from_domain_name(&name)),
        None => Err(ScriptError::new(
            ErrorKind::CatalogLookupFailed,
            format!("cache lookup failed for type {}", typid.to_u32()),
        )
        .into()),
    }
}

/// Reads one syscache entry by oid; `None` when the cache has no such row.
pub(crate) fn syscache_lookup<R>(
    cache_id: i32,
    key: pg_sys::Oid,
    read: impl FnOnce(pg_sys::HeapTuple) -> R,
) -> Plv8Result<Option<R>> {
    protect(|| unsafe {
        let tuple = pg_sys::SearchSysCache1(cache_id, pg_sys::Datum::from(key.to_u32()));
        if tuple.is_null() {
            return Ok(None);
        }
        let result = read(tuple);
        pg_sys::ReleaseSysCache(tuple);
        Ok(Some(result))
    })
}

/// The fixed-size catalog struct of a heap tuple.
///
/// # Safety
/// `tuple` must be a valid catalog tuple whose row type is `T`.
pub(crate) unsafe fn tuple_struct<T>(tuple: pg_sys::HeapTuple) -> *const T {
    unsafe {
        let header = (*tuple).t_data;
        header.cast::<u8>().add(usize::from((*header).t_hoff)).cast()
    }
}

pub(crate) fn name_data(name: &pg_sys::NameData) -> String {
    unsafe { CStr::from_ptr(name.data.as_ptr()) }.to_string_lossy().into_owned()
}

impl TypeInfo {
    fn input_function(&mut self) -> Plv8Result<*mut pg_sys::FmgrInfo> {
        if self.fn_input.is_null() {
            let (typid, mcxt) = (self.typid, self.mcxt);
            let (finfo, ioparam) = host_call(|| unsafe {
                let mut func = pg_sys::InvalidOid;
                let mut ioparam = pg_sys::InvalidOid;
                pg_sys::getTypeInputInfo(typid, &mut func, &mut ioparam);
                let finfo = alloc_fmgr_info(mcxt);
                pg_sys::fmgr_info_cxt(func, finfo, mcxt);
                (finfo, ioparam)
            })?;
            self.fn_input = finfo;
            self.ioparam = ioparam;
        }
        Ok(self.fn_input)
    }

    fn output_function(&mut self) -> Plv8Result<*mut pg_sys::FmgrInfo> {
        if self.fn_output.is_null() {
            let (typid, mcxt) = (self.typid, self.mcxt);
            self.fn_output = host_call(|| unsafe {
                let mut func = pg_sys::InvalidOid;
                let mut is_varlena = false;
                pg_sys::getTypeOutputInfo(typid, &mut func, &mut is_varlena);
                let finfo = alloc_fmgr_info(mcxt);
                pg_sys::fmgr_info_cxt(func, finfo, mcxt);
                finfo
            })?;
        }
        Ok(self.fn_output)
    }

    /// Runs the type's input routine on `text`.
    pub(crate) fn input(&mut self, text: &str) -> Plv8Result<pg_sys::Datum> {
        let finfo = self.input_function()?;
        let ioparam = self.ioparam;
        let text = CString::new(text).map_err(|_| {
            ScriptError::runtime("string value contains a null character")
        })?;
        host_call(|| unsafe {
            pg_sys::InputFunctionCall(finfo, text.as_ptr().cast_mut(), ioparam, -1)
        })
    }

    /// Runs the type's output routine on `datum`.
    pub(crate) fn output(&mut self, datum: pg_sys::Datum) -> Plv8Result<String> {
        let finfo = self.output_function()?;
        host_call(|| unsafe {
            let raw = pg_sys::OutputFunctionCall(finfo, datum);
            let text = CStr::from_ptr(raw).to_string_lossy().into_owned();
            pg_sys::pfree(raw.cast());
            text
        })
    }
}

unsafe fn alloc_fmgr_info(mcxt: pg_sys::MemoryContext) -> *mut pg_sys::FmgrInfo {
    unsafe {
        pg_sys::MemoryContextAllocZero(mcxt, std::mem::size_of::<pg_sys::FmgrInfo>())
            as *mut pg_sys::FmgrInfo
    }
}

pub(crate) fn new_string<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    text: &str,
) -> Plv8Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text)
        .ok_or_else(|| ScriptError::runtime("could not allocate engine string").into())
}

/// Stringifies a script value, surfacing a throwing `toString` as an error.
pub(crate) fn value_to_string(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Plv8Result<String> {
    match value.to_string(scope) {
        Some(text) => Ok(text.to_rust_string_lossy(scope)),
        None => Err(ScriptError::runtime("could not convert value to string").into()),
    }
}

pub(crate) fn epoch_from_timestamp(micros: i64) -> f64 {
    micros as f64 / 1000.0 + EPOCH_SHIFT_MS
}

pub(crate) fn timestamp_from_epoch(epoch_ms: f64) -> i64 {
    ((epoch_ms - EPOCH_SHIFT_MS) * 1000.0) as i64
}

pub(crate) fn epoch_from_date(days: i32) -> f64 {
    f64::from(days) * MS_PER_DAY + EPOCH_SHIFT_MS
}

pub(crate) fn date_from_epoch(epoch_ms: f64) -> i32 {
    ((epoch_ms - EPOCH_SHIFT_MS) / MS_PER_DAY) as i32
}

/// The database type a bare script value is bound as when used as a query
/// parameter, or `None` for objects and arrays.
pub(crate) fn infer_datum_type(value: v8::Local<v8::Value>) -> Option<pg_sys::Oid> {
    if value.is_null_or_undefined() {
        Some(pg_sys::TEXTOID)
    } else if value.is_boolean() {
        Some(pg_sys::BOOLOID)
    } else if value.is_int32() {
        Some(pg_sys::INT4OID)
    } else if value.is_uint32() {
        Some(pg_sys::INT8OID)
    } else if value.is_number() {
        Some(pg_sys::FLOAT8OID)
    } else if value.is_string() {
        Some(pg_sys::TEXTOID)
    } else if value.is_date() {
        Some(pg_sys::TIMESTAMPOID)
    } else {
        None
    }
}

pub(crate) fn to_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    datum: pg_sys::Datum,
    is_null: bool,
    ty: &mut TypeInfo,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    if is_null {
        return Ok(v8::null(scope).into());
    }
    match &mut ty.kind {
        TypeKind::Array(element) => array_to_value(scope, datum, element),
        TypeKind::ExternalArray(kind) => external_array_to_value(scope, datum, *kind),
        TypeKind::Composite => record_to_value(scope, datum),
        TypeKind::Domain(base) => to_value(scope, datum, false, base),
        TypeKind::Scalar => scalar_to_value(scope, datum, ty),
    }
}

fn scalar_to_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    datum: pg_sys::Datum,
    ty: &mut TypeInfo,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let value: v8::Local<v8::Value> = unsafe {
        match ty.typid {
            pg_sys::OIDOID => {
                let oid = pg_sys::Oid::from_datum(datum, false).unwrap_or(pg_sys::InvalidOid);
                v8::Integer::new_from_unsigned(scope, oid.to_u32()).into()
            }
            pg_sys::BOOLOID => {
                v8::Boolean::new(scope, bool::from_datum(datum, false).unwrap_or(false)).into()
            }
            pg_sys::INT2OID => {
                v8::Integer::new(scope, i32::from(i16::from_datum(datum, false).unwrap_or(0)))
                    .into()
            }
            pg_sys::INT4OID => {
                v8::Integer::new(scope, i32::from_datum(datum, false).unwrap_or(0)).into()
            }
            pg_sys::INT8OID => {
                let value = i64::from_datum(datum, false).unwrap_or(0);
                if value.abs() <= MAX_SAFE_INTEGER {
                    v8::Number::new(scope, value as f64).into()
                } else {
                    new_string(scope, &value.to_string())?.into()
                }
            }
            pg_sys::FLOAT4OID => {
                v8::Number::new(scope, f64::from(f32::from_datum(datum, false).unwrap_or(0.0)))
                    .into()
            }
            pg_sys::FLOAT8OID => {
                v8::Number::new(scope, f64::from_datum(datum, false).unwrap_or(0.0)).into()
            }
            pg_sys::NUMERICOID => {
                let number = protect(|| {
                    Ok(direct_function_call::<f64>(pg_sys::numeric_float8, &[Some(datum)]))
                })?;
                v8::Number::new(scope, number.unwrap_or(f64::NAN)).into()
            }
            pg_sys::DATEOID => {
                let days = i32::from_datum(datum, false).unwrap_or(0);
                date_value(scope, epoch_from_date(days))?
            }
            pg_sys::TIMESTAMPOID | pg_sys::TIMESTAMPTZOID => {
                let micros = i64::from_datum(datum, false).unwrap_or(0);
                date_value(scope, epoch_from_timestamp(micros))?
            }
            pg_sys::TEXTOID | pg_sys::VARCHAROID | pg_sys::BPCHAROID | pg_sys::XMLOID => {
                let text = host_call(|| String::from_datum(datum, false))?.unwrap_or_default();
                new_string(scope, &text)?.into()
            }
            pg_sys::BYTEAOID => {
                let bytes = host_call(|| Vec::<u8>::from_datum(datum, false))?.unwrap_or_default();
                let len = bytes.len();
                let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
                let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
                v8::Uint8Array::new(scope, buffer, 0, len)
                    .ok_or_else(|| ScriptError::runtime("could not allocate Uint8Array"))?
                    .into()
            }
            pg_sys::JSONOID => {
                let text = host_call(|| String::from_datum(datum, false))?.unwrap_or_default();
                parse_json(scope, &text)?
            }
            pg_sys::JSONBOID => {
                let text = ty.output(datum)?;
                parse_json(scope, &text)?
            }
            _ => to_string(scope, datum, ty)?.into(),
        }
    };
    Ok(value)
}

fn date_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    epoch_ms: f64,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    v8::Date::new(scope, epoch_ms)
        .map(Into::into)
        .ok_or_else(|| ScriptError::runtime("could not allocate Date").into())
}

fn parse_json<'s>(
    scope: &mut v8::HandleScope<'s>,
    text: &str,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let source = new_string(scope, text)?;
    v8::json::parse(scope, source)
        .ok_or_else(|| ScriptError::runtime("could not parse json value").into())
}

/// Renders `datum` through the type's output routine.
pub(crate) fn to_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    datum: pg_sys::Datum,
    ty: &mut TypeInfo,
) -> Plv8Result<v8::Local<'s, v8::String>> {
    let text = ty.output(datum)?;
    new_string(scope, &text)
}

struct DeconstructedArray {
    values: Vec<pg_sys::Datum>,
    nulls: Vec<bool>,
    dims: Vec<usize>,
}

unsafe fn deconstruct(datum: pg_sys::Datum, element: &TypeInfo) -> Plv8Result<DeconstructedArray> {
    let (typid, len, byval, align) = (element.typid, element.len, element.byval, element.align);
    host_call(|| unsafe {
        let array = pg_sys::pg_detoast_datum(datum.cast_mut_ptr()) as *mut pg_sys::ArrayType;
        let ndim = usize::try_from((*array).ndim).unwrap_or(0);
        let dims_ptr = array.cast::<u8>().add(std::mem::size_of::<pg_sys::ArrayType>()) as *const i32;
        let dims = (0..ndim)
            .map(|i| usize::try_from(*dims_ptr.add(i)).unwrap_or(0))
            .collect::<Vec<_>>();

        let mut values: *mut pg_sys::Datum = std::ptr::null_mut();
        let mut nulls: *mut bool = std::ptr::null_mut();
        let mut count: i32 = 0;
        pg_sys::deconstruct_array(
            array,
            typid,
            i32::from(len),
            byval,
            align,
            &mut values,
            &mut nulls,
            &mut count,
        );
        let count = usize::try_from(count).unwrap_or(0);
        let deconstructed = DeconstructedArray {
            values: std::slice::from_raw_parts(values, count).to_vec(),
            nulls: std::slice::from_raw_parts(nulls, count).to_vec(),
            dims,
        };
        pg_sys::pfree(values.cast());
        pg_sys::pfree(nulls.cast());
        deconstructed
    })
}

fn array_to_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    datum: pg_sys::Datum,
    element: &mut TypeInfo,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let array = unsafe { deconstruct(datum, element)? };
    if array.dims.is_empty() {
        return Ok(v8::Array::new(scope, 0).into());
    }
    let mut cursor = 0;
    nested_array(scope, &array, 0, &mut cursor, element)
}

/// Builds one dimension level, consuming elements in storage order.
fn nested_array<'s>(
    scope: &mut v8::HandleScope<'s>,
    array: &DeconstructedArray,
    depth: usize,
    cursor: &mut usize,
    element: &mut TypeInfo,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let length = array.dims[depth];
    let result = v8::Array::new(scope, i32::try_from(length).unwrap_or(i32::MAX));
    for index in 0..length {
        let item = if depth + 1 < array.dims.len() {
            nested_array(scope, array, depth + 1, cursor, element)?
        } else {
            let position = *cursor;
            *cursor += 1;
            to_value(scope, array.values[position], array.nulls[position], element)?
        };
        result.set_index(scope, index as u32, item);
    }
    Ok(result.into())
}

fn external_array_to_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    datum: pg_sys::Datum,
    kind: ExternalArrayKind,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let (elem_typid, elem_len, elem_byval, elem_align) = match kind {
        ExternalArrayKind::Int16 => (pg_sys::INT2OID, 2, true, b's' as c_char),
        ExternalArrayKind::Int32 => (pg_sys::INT4OID, 4, true, b'i' as c_char),
        ExternalArrayKind::Float32 => (pg_sys::FLOAT4OID, 4, true, b'i' as c_char),
        ExternalArrayKind::Float64 => (pg_sys::FLOAT8OID, 8, true, b'd' as c_char),
    };
    let element = TypeInfo {
        typid: elem_typid,
        len: elem_len,
        byval: elem_byval,
        align: elem_align,
        kind: TypeKind::Scalar,
        mcxt: std::ptr::null_mut(),
        ioparam: pg_sys::InvalidOid,
        fn_input: std::ptr::null_mut(),
        fn_output: std::ptr::null_mut(),
        domain_extra: std::ptr::null_mut(),
    };
    let array = unsafe { deconstruct(datum, &element)? };
    if array.dims.len() > 1 || array.nulls.iter().any(|is_null| *is_null) {
        return Err(ScriptError::runtime(
            "NULL element, or multi-dimension array not allowed in external array type",
        )
        .into());
    }

    let count = array.values.len();
    let bytes: Vec<u8> = unsafe {
        match kind {
            ExternalArrayKind::Int16 => array
                .values
                .iter()
                .flat_map(|d| i16::from_datum(*d, false).unwrap_or(0).to_ne_bytes())
                .collect(),
            ExternalArrayKind::Int32 => array
                .values
                .iter()
                .flat_map(|d| i32::from_datum(*d, false).unwrap_or(0).to_ne_bytes())
                .collect(),
            ExternalArrayKind::Float32 => array
                .values
                .iter()
                .flat_map(|d| f32::from_datum(*d, false).unwrap_or(0.0).to_ne_bytes())
                .collect(),
            ExternalArrayKind::Float64 => array
                .values
                .iter()
                .flat_map(|d| f64::from_datum(*d, false).unwrap_or(0.0).to_ne_bytes())
                .collect(),
        }
    };
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    let typed: Option<v8::Local<v8::Value>> = match kind {
        ExternalArrayKind::Int16 => v8::Int16Array::new(scope, buffer, 0, count).map(Into::into),
        ExternalArrayKind::Int32 => v8::Int32Array::new(scope, buffer, 0, count).map(Into::into),
        ExternalArrayKind::Float32 => {
            v8::Float32Array::new(scope, buffer, 0, count).map(Into::into)
        }
        ExternalArrayKind::Float64 => {
            v8::Float64Array::new(scope, buffer, 0, count).map(Into::into)
        }
    };
    typed.ok_or_else(|| ScriptError::runtime("could not allocate typed array").into())
}

fn record_to_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    datum: pg_sys::Datum,
) -> Plv8Result<v8::Local<'s, v8::Value>> {
    let (tupdesc, mut tuple) = host_call(|| unsafe {
        let header = pg_sys::pg_detoast_datum(datum.cast_mut_ptr()) as pg_sys::HeapTupleHeader;
        let tupdesc = pg_sys::lookup_rowtype_tupdesc_copy(
            pgrx::heap_tuple_header_get_type_id(header),
            pgrx::heap_tuple_header_get_typmod(header),
        );
        let tuple = pg_sys::HeapTupleData {
            t_len: pgrx::heap_tuple_header_get_datum_length(header) as u32,
            t_data: header,
            ..Default::default()
        };
        (tupdesc, tuple)
    })?;
    let mut converter = Converter::new(tupdesc, false)?;
    converter.to_value(scope, &mut tuple).map(Into::into)
}

/// Converts a script value to a datum of `ty`; `None` means SQL NULL.
pub(crate) fn to_datum(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    ty: &mut TypeInfo,
) -> Plv8Result<Option<pg_sys::Datum>> {
    if value.is_null_or_undefined() {
        return Ok(None);
    }
    let typid = ty.typid;
    let mcxt = ty.mcxt;
    match &mut ty.kind {
        TypeKind::Array(element) => array_to_datum(scope, value, element).map(Some),
        TypeKind::ExternalArray(kind) => external_array_to_datum(scope, value, *kind).map(Some),
        TypeKind::Composite => record_to_datum(scope, value, typid).map(Some),
        TypeKind::Domain(base) => {
            let datum = to_datum(scope, value, base)?;
            let extra = &mut ty.domain_extra;
            host_call(|| unsafe {
                pg_sys::domain_check(
                    datum.unwrap_or(pg_sys::Datum::from(0)),
                    datum.is_none(),
                    typid,
                    extra,
                    mcxt,
                )
            })?;
            Ok(datum)
        }
        TypeKind::Scalar => scalar_to_datum(scope, value, ty).map(Some),
    }
}

fn scalar_to_datum(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    ty: &mut TypeInfo,
) -> Plv8Result<pg_sys::Datum> {
    let direct = match ty.typid {
        pg_sys::OIDOID if value.is_number() => value
            .uint32_value(scope)
            .and_then(|oid| pg_sys::Oid::from(oid).into_datum()),
        pg_sys::BOOLOID if value.is_boolean() => value.boolean_value(scope).into_datum(),
        pg_sys::INT2OID if value.is_number() => {
            value.int32_value(scope).and_then(|v| (v as i16).into_datum())
        }
        pg_sys::INT4OID if value.is_number() => value.int32_value(scope).into_datum(),
        pg_sys::INT8OID if value.is_number() => value.integer_value(scope).into_datum(),
        pg_sys::FLOAT4OID if value.is_number() => {
            value.number_value(scope).and_then(|v| (v as f32).into_datum())
        }
        pg_sys::FLOAT8OID if value.is_number() => value.number_value(scope).into_datum(),
        pg_sys::NUMERICOID if value.is_number() => match value.number_value(scope) {
            Some(number) => host_call(|| unsafe {
                direct_function_call_as_datum(pg_sys::float8_numeric, &[number.into_datum()])
            })?,
            None => None,
        },
        pg_sys::DATEOID if value.is_date() => value
            .number_value(scope)
            .and_then(|epoch| date_from_epoch(epoch).into_datum()),
        pg_sys::TIMESTAMPOID | pg_sys::TIMESTAMPTZOID if value.is_date() => value
            .number_value(scope)
            .and_then(|epoch| timestamp_from_epoch(epoch).into_datum()),
        pg_sys::BYTEAOID if value.is_array_buffer_view() => {
            let view = v8::Local::<v8::ArrayBufferView>::try_from(value)
                .map_err(|_| ScriptError::runtime("value is not an ArrayBufferView"))?;
            let mut bytes = vec![0u8; view.byte_length()];
            let copied = view.copy_contents(&mut bytes);
            bytes.truncate(copied);
            host_call(|| bytes.into_datum())?
        }
        pg_sys::JSONOID if value.is_object() => {
            let text = v8::json::stringify(scope, value)
                .map(|text| text.to_rust_string_lossy(scope))
                .ok_or_else(|| ScriptError::runtime("could not stringify json value"))?;
            host_call(|| text.into_datum())?
        }
        pg_sys::JSONBOID if value.is_object() => {
            let text = v8::json::stringify(scope, value)
                .map(|text| text.to_rust_string_lossy(scope))
                .ok_or_else(|| ScriptError::runtime("could not stringify json value"))?;
            Some(ty.input(&text)?)
        }
        _ => None,
    };
    if let Some(datum) = direct {
        return Ok(datum);
    }

    let text = value_to_string(scope, value)?;
    ty.input(&text)
}

fn array_to_datum(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    element: &mut TypeInfo,
) -> Plv8Result<pg_sys::Datum> {
    let array = v8::Local::<v8::Array>::try_from(value)
        .map_err(|_| ScriptError::runtime("value is not an Array"))?;
    // json elements may legitimately be arrays themselves
    let nests = !matches!(element.typid, pg_sys::JSONOID | pg_sys::JSONBOID);
    let mut dims = array_dims(scope, array, nests);
    let capacity = dims.iter().map(|dim| *dim as usize).product::<usize>();
    let mut values = Vec::with_capacity(capacity);
    let mut nulls = Vec::with_capacity(capacity);
    flatten_array(scope, array, &dims, 0, nests, element, &mut values, &mut nulls)?;

    let mut lbs = vec![1i32; dims.len()];
    let (typid, len, byval, align) = (element.typid, element.len, element.byval, element.align);
    host_call(|| unsafe {
        let array = pg_sys::construct_md_array(
            values.as_mut_ptr(),
            nulls.as_mut_ptr(),
            dims.len() as i32,
            dims.as_mut_ptr(),
            lbs.as_mut_ptr(),
            typid,
            i32::from(len),
            byval,
            align,
        );
        pg_sys::Datum::from(array)
    })
}

/// Dimension lengths, read along the first element of every level.
fn array_dims(scope: &mut v8::HandleScope, array: v8::Local<v8::Array>, nests: bool) -> Vec<i32> {
    let mut dims = vec![array.length() as i32];
    let mut current = array;
    while nests && dims.len() < pg_sys::MAXDIM as usize {
        let Some(inner) = current
            .get_index(scope, 0)
            .and_then(|first| v8::Local::<v8::Array>::try_from(first).ok())
        else {
            break;
        };
        dims.push(inner.length() as i32);
        current = inner;
    }
    dims
}

fn ragged_array() -> Plv8Error {
    ScriptError::new(
        ErrorKind::WrongShape,
        "multidimensional arrays must have array expressions with matching dimensions",
    )
    .into()
}

/// Appends the elements of `array` in row-major order, checking every level
/// against `dims`.
#[allow(clippy::too_many_arguments)]
fn flatten_array(
    scope: &mut v8::HandleScope,
    array: v8::Local<v8::Array>,
    dims: &[i32],
    depth: usize,
    nests: bool,
    element: &mut TypeInfo,
    values: &mut Vec<pg_sys::Datum>,
    nulls: &mut Vec<bool>,
) -> Plv8Result<()> {
    if array.length() as i32 != dims[depth] {
        return Err(ragged_array());
    }
    for index in 0..array.length() {
        let item = array.get_index(scope, index).unwrap_or_else(|| v8::undefined(scope).into());
        if depth + 1 < dims.len() {
            let inner = v8::Local::<v8::Array>::try_from(item).map_err(|_| ragged_array())?;
            flatten_array(scope, inner, dims, depth + 1, nests, element, values, nulls)?;
            continue;
        }
        if nests && item.is_array() {
            return Err(ragged_array());
        }
        match to_datum(scope, item, element)? {
            Some(datum) => {
                values.push(datum);
                nulls.push(false);
            }
            None => {
                values.push(pg_sys::Datum::from(0));
                nulls.push(true);
            }
        }
    }
    Ok(())
}

fn external_array_to_datum(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    kind: ExternalArrayKind,
) -> Plv8Result<pg_sys::Datum> {
    let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) else {
        let mut element = fill_type(external_element_type(kind), std::ptr::null_mut())?;
        return array_to_datum(scope, value, &mut element);
    };
    let mut bytes = vec![0u8; view.byte_length()];
    let copied = view.copy_contents(&mut bytes);
    bytes.truncate(copied);

    let datum = match kind {
        ExternalArrayKind::Int16 => host_call(|| {
            bytes
                .chunks_exact(2)
                .map(|chunk| i16::from_ne_bytes([chunk[0], chunk[1]]))
                .collect::<Vec<_>>()
                .into_datum()
        })?,
        ExternalArrayKind::Int32 => host_call(|| {
            bytes
                .chunks_exact(4)
                .map(|chunk| i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect::<Vec<_>>()
                .into_datum()
        })?,
        ExternalArrayKind::Float32 => host_call(|| {
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect::<Vec<_>>()
                .into_datum()
        })?,
        ExternalArrayKind::Float64 => host_call(|| {
            bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    f64::from_ne_bytes(raw)
                })
                .collect::<Vec<_>>()
                .into_datum()
        })?,
    };
    datum.ok_or_else(|| ScriptError::runtime("could not build external array").into())
}

fn external_element_type(kind: ExternalArrayKind) -> pg_sys::Oid {
    match kind {
        ExternalArrayKind::Int16 => pg_sys::INT2OID,
        ExternalArrayKind::Int32 => pg_sys::INT4OID,
        ExternalArrayKind::Float32 => pg_sys::FLOAT4OID,
        ExternalArrayKind::Float64 => pg_sys::FLOAT8OID,
    }
}

fn record_to_datum(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    typid: pg_sys::Oid,
) -> Plv8Result<pg_sys::Datum> {
    let tupdesc = host_call(|| unsafe { pg_sys::lookup_rowtype_tupdesc_copy(typid, -1) })?;
    let mut converter = Converter::new(tupdesc, false)?;
    converter.to_datum(scope, value, None)
}
