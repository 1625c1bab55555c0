use deno_core::v8;
use pgrx::PgTupleDesc;
use pgrx::prelude::*;

use crate::error_bridge::{ErrorKind, Plv8Result, ScriptError, host_call};
use crate::type_bridge::{TypeInfo, fill_type, new_string, to_datum, to_value, value_to_string};

struct Column {
    name: String,
    dropped: bool,
    ty: Option<TypeInfo>,
}

/// Row <-> object translation for one tuple descriptor.
///
/// Column type descriptors live in a private memory context that is deleted
/// when the converter is dropped.
pub(crate) struct Converter {
    tupdesc: pg_sys::TupleDesc,
    columns: Vec<Column>,
    is_scalar: bool,
    memory_context: pg_sys::MemoryContext,
}

impl Converter {
    pub(crate) fn new(tupdesc: pg_sys::TupleDesc, is_scalar: bool) -> Plv8Result<Self> {
        let memory_context = host_call(|| unsafe {
            pg_sys::AllocSetContextCreateExtended(
                pg_sys::CurrentMemoryContext,
                c"ConverterContext".as_ptr(),
                0,
                1024,
                8192,
            )
        })?;
        let mut converter =
            Self { tupdesc, columns: Vec::new(), is_scalar, memory_context };

        let attributes = host_call(|| unsafe {
            pg_sys::BlessTupleDesc(tupdesc);
            PgTupleDesc::from_pg_unchecked(tupdesc)
                .iter()
                .map(|attr| (attr.name().to_string(), attr.type_oid().value(), attr.is_dropped()))
                .collect::<Vec<_>>()
        })?;

        for (name, typid, dropped) in attributes {
            let ty = if dropped { None } else { Some(fill_type(typid, memory_context)?) };
            converter.columns.push(Column { name, dropped, ty });
        }
        Ok(converter)
    }

    pub(crate) fn tupdesc(&self) -> pg_sys::TupleDesc {
        self.tupdesc
    }

    fn live_columns(&self) -> usize {
        self.columns.iter().filter(|column| !column.dropped).count()
    }

    /// Builds an object keyed by column name.
    pub(crate) fn to_value<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        tuple: *mut pg_sys::HeapTupleData,
    ) -> Plv8Result<v8::Local<'s, v8::Object>> {
        let natts = self.columns.len();
        let mut values = vec![pg_sys::Datum::from(0); natts];
        let mut nulls = vec![true; natts];
        let tupdesc = self.tupdesc;
        host_call(|| unsafe {
            pg_sys::heap_deform_tuple(tuple, tupdesc, values.as_mut_ptr(), nulls.as_mut_ptr());
        })?;

        let object = v8::Object::new(scope);
        for (index, column) in self.columns.iter_mut().enumerate() {
            let Some(ty) = column.ty.as_mut() else {
                continue;
            };
            let key = new_string(scope, &column.name)?;
            let value = to_value(scope, values[index], nulls[index], ty)?;
            object.set(scope, key.into(), value);
        }
        Ok(object)
    }

    fn to_values(
        &mut self,
        scope: &mut v8::HandleScope,
        value: v8::Local<v8::Value>,
    ) -> Plv8Result<(Vec<pg_sys::Datum>, Vec<bool>)> {
        let natts = self.columns.len();
        let mut values = vec![pg_sys::Datum::from(0); natts];
        let mut nulls = vec![true; natts];

        if self.is_scalar {
            if let Some(index) = self.columns.iter().position(|column| !column.dropped) {
                if let Some(ty) = self.columns[index].ty.as_mut() {
                    if let Some(datum) = to_datum(scope, value, ty)? {
                        values[index] = datum;
                        nulls[index] = false;
                    }
                }
            }
            return Ok((values, nulls));
        }

        let object = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| ScriptError::new(ErrorKind::WrongShape, "argument must be an object"))?;
        let names = object
            .get_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| ScriptError::runtime("could not read property names"))?;
        let mut property_names = Vec::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            if let Some(name) = names.get_index(scope, index) {
                property_names.push(value_to_string(scope, name)?);
            }
        }
        check_shape(
            self.columns.iter().filter(|column| !column.dropped).map(|column| column.name.as_str()),
            self.live_columns(),
            &property_names,
        )?;

        for (index, column) in self.columns.iter_mut().enumerate() {
            let Some(ty) = column.ty.as_mut() else {
                continue;
            };
            let key = new_string(scope, &column.name)?;
            let attr = object.get(scope, key.into()).unwrap_or_else(|| v8::undefined(scope).into());
            if let Some(datum) = to_datum(scope, attr, ty)? {
                values[index] = datum;
                nulls[index] = false;
            }
        }
        Ok((values, nulls))
    }

    /// Forms a heap tuple from `value`.
    pub(crate) fn to_heap_tuple(
        &mut self,
        scope: &mut v8::HandleScope,
        value: v8::Local<v8::Value>,
    ) -> Plv8Result<pg_sys::HeapTuple> {
        let (mut values, mut nulls) = self.to_values(scope, value)?;
        let tupdesc = self.tupdesc;
        host_call(|| unsafe {
            pg_sys::heap_form_tuple(tupdesc, values.as_mut_ptr(), nulls.as_mut_ptr())
        })
    }

    /// Converts `value` to a composite datum, or appends it to `tupstore` and
    /// returns a zero datum when one is given.
    pub(crate) fn to_datum(
        &mut self,
        scope: &mut v8::HandleScope,
        value: v8::Local<v8::Value>,
        tupstore: Option<*mut pg_sys::Tuplestorestate>,
    ) -> Plv8Result<pg_sys::Datum> {
        let tupdesc = self.tupdesc;
        match tupstore {
            Some(tupstore) => {
                let (mut values, mut nulls) = self.to_values(scope, value)?;
                host_call(|| unsafe {
                    pg_sys::tuplestore_putvalues(
                        tupstore,
                        tupdesc,
                        values.as_mut_ptr(),
                        nulls.as_mut_ptr(),
                    );
                    pg_sys::Datum::from(0)
                })
            }
            None => {
                let tuple = self.to_heap_tuple(scope, value)?;
                host_call(|| unsafe { pg_sys::heap_copy_tuple_as_datum(tuple, tupdesc) })
            }
        }
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        if self.memory_context.is_null() || std::thread::panicking() {
            return;
        }
        let memory_context = self.memory_context;
        self.memory_context = std::ptr::null_mut();
        self.columns.clear();
        if let Err(err) = host_call(|| unsafe { pg_sys::MemoryContextDelete(memory_context) }) {
            warning!("~Converter: {err}");
        }
    }
}

/// The property names of a returned object must match the row's columns
/// one-to-one.
fn check_shape<'a>(
    columns: impl Iterator<Item = &'a str>,
    column_count: usize,
    property_names: &[String],
) -> Plv8Result<()> {
    if property_names.len() != column_count {
        return Err(ScriptError::new(
            ErrorKind::WrongShape,
            "expected fields and property names have different cardinality",
        )
        .into());
    }
    for column in columns {
        if !property_names.iter().any(|name| name == column) {
            return Err(ScriptError::new(
                ErrorKind::WrongShape,
                "field name / property name mismatch",
            )
            .into());
        }
    }
    Ok(())
}
