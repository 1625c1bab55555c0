use pgrx::JsonB;
use pgrx::prelude::*;

mod builtins;
mod config;
mod dialect;
mod dispatch;
mod engine;
mod error_bridge;
mod exec_env;
mod observability;
mod proc_cache;
mod spi_status;
mod tuple_converter;
mod type_bridge;

use dialect::Dialect;

::pgrx::pg_module_magic!(name, version);

extension_sql!(
    r#"
    CREATE FUNCTION plv8_call_handler()
    RETURNS language_handler
    AS 'MODULE_PATHNAME', 'plv8_call_handler'
    LANGUAGE C;

    CREATE FUNCTION plv8_inline_handler(internal)
    RETURNS void
    AS 'MODULE_PATHNAME', 'plv8_inline_handler'
    LANGUAGE C;

    CREATE FUNCTION plv8_call_validator(oid)
    RETURNS void
    AS 'MODULE_PATHNAME', 'plv8_call_validator'
    LANGUAGE C;

    CREATE FUNCTION plcoffee_call_handler()
    RETURNS language_handler
    AS 'MODULE_PATHNAME', 'plcoffee_call_handler'
    LANGUAGE C;

    CREATE FUNCTION plcoffee_inline_handler(internal)
    RETURNS void
    AS 'MODULE_PATHNAME', 'plcoffee_inline_handler'
    LANGUAGE C;

    CREATE FUNCTION plcoffee_call_validator(oid)
    RETURNS void
    AS 'MODULE_PATHNAME', 'plcoffee_call_validator'
    LANGUAGE C;

    CREATE FUNCTION plls_call_handler()
    RETURNS language_handler
    AS 'MODULE_PATHNAME', 'plls_call_handler'
    LANGUAGE C;

    CREATE FUNCTION plls_inline_handler(internal)
    RETURNS void
    AS 'MODULE_PATHNAME', 'plls_inline_handler'
    LANGUAGE C;

    CREATE FUNCTION plls_call_validator(oid)
    RETURNS void
    AS 'MODULE_PATHNAME', 'plls_call_validator'
    LANGUAGE C;

    DO $$
    BEGIN
        IF NOT EXISTS (SELECT 1 FROM pg_language WHERE lanname = 'plv8') THEN
            CREATE TRUSTED LANGUAGE plv8
                HANDLER plv8_call_handler
                INLINE plv8_inline_handler
                VALIDATOR plv8_call_validator;
        END IF;
        IF NOT EXISTS (SELECT 1 FROM pg_language WHERE lanname = 'plcoffee') THEN
            CREATE TRUSTED LANGUAGE plcoffee
                HANDLER plcoffee_call_handler
                INLINE plcoffee_inline_handler
                VALIDATOR plcoffee_call_validator;
        END IF;
        IF NOT EXISTS (SELECT 1 FROM pg_language WHERE lanname = 'plls') THEN
            CREATE TRUSTED LANGUAGE plls
                HANDLER plls_call_handler
                INLINE plls_inline_handler
                VALIDATOR plls_call_validator;
        END IF;
    END;
    $$;

    CREATE DOMAIN plv8_int2array AS int2[];
    CREATE DOMAIN plv8_int4array AS int4[];
    CREATE DOMAIN plv8_float4array AS float4[];
    CREATE DOMAIN plv8_float8array AS float8[];
    "#,
    name = "plv8_sql_bootstrap"
);

/// Emits the handler, inline handler and validator of one language, each
/// with its V1 info record.
macro_rules! language_entry_points {
    (
        $dialect:expr,
        $call:ident / $call_finfo:ident,
        $inline:ident / $inline_finfo:ident,
        $validator:ident / $validator_finfo:ident $(,)?
    ) => {
        #[pg_guard]
        #[unsafe(no_mangle)]
        pub unsafe extern "C-unwind" fn $call(fcinfo: pg_sys::FunctionCallInfo) -> pg_sys::Datum {
            unsafe { dispatch::call_handler(fcinfo, $dialect) }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn $call_finfo() -> &'static pg_sys::Pg_finfo_record {
            const V1_API: pg_sys::Pg_finfo_record = pg_sys::Pg_finfo_record { api_version: 1 };
            &V1_API
        }

        #[pg_guard]
        #[unsafe(no_mangle)]
        pub unsafe extern "C-unwind" fn $inline(fcinfo: pg_sys::FunctionCallInfo) -> pg_sys::Datum {
            unsafe { dispatch::inline_handler(fcinfo, $dialect) }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn $inline_finfo() -> &'static pg_sys::Pg_finfo_record {
            const V1_API: pg_sys::Pg_finfo_record = pg_sys::Pg_finfo_record { api_version: 1 };
            &V1_API
        }

        #[pg_guard]
        #[unsafe(no_mangle)]
        pub unsafe extern "C-unwind" fn $validator(
            fcinfo: pg_sys::FunctionCallInfo,
        ) -> pg_sys::Datum {
            unsafe { dispatch::validator(fcinfo, $dialect) }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn $validator_finfo() -> &'static pg_sys::Pg_finfo_record {
            const V1_API: pg_sys::Pg_finfo_record = pg_sys::Pg_finfo_record { api_version: 1 };
            &V1_API
        }
    };
}

language_entry_points!(
    Dialect::JavaScript,
    plv8_call_handler / pg_finfo_plv8_call_handler,
    plv8_inline_handler / pg_finfo_plv8_inline_handler,
    plv8_call_validator / pg_finfo_plv8_call_validator,
);

language_entry_points!(
    Dialect::CoffeeScript,
    plcoffee_call_handler / pg_finfo_plcoffee_call_handler,
    plcoffee_inline_handler / pg_finfo_plcoffee_inline_handler,
    plcoffee_call_validator / pg_finfo_plcoffee_call_validator,
);

language_entry_points!(
    Dialect::LiveScript,
    plls_call_handler / pg_finfo_plls_call_handler,
    plls_inline_handler / pg_finfo_plls_inline_handler,
    plls_call_validator / pg_finfo_plls_call_validator,
);

#[pg_guard]
pub extern "C-unwind" fn _PG_init() {
    config::register_gucs();
    exec_env::register_xact_callback();
}

#[pg_schema]
mod plv8 {
    use super::*;

    #[pg_extern]
    fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    #[pg_extern]
    fn metrics() -> JsonB {
        JsonB(crate::observability::metrics_json())
    }
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    include!("../tests/pg/mod.rs");
}
