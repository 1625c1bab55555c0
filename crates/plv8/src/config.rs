use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};
use std::ffi::CString;

pub(crate) const DEFAULT_DEBUGGER_PORT: i32 = 35432;

static START_PROC: GucSetting<Option<CString>> = GucSetting::<Option<CString>>::new(None);
static DEBUGGER_PORT: GucSetting<i32> = GucSetting::<i32>::new(DEFAULT_DEBUGGER_PORT);
static LOG_LEVEL: GucSetting<Option<CString>> =
    GucSetting::<Option<CString>>::new(Some(c"warn"));

pub(crate) fn register_gucs() {
    GucRegistry::define_string_guc(
        c"plv8.start_proc",
        c"PL/v8 function to run once when PL/v8 is first used.",
        c"Signature of a function (regproc or regprocedure form) executed in every new per-user context.",
        &START_PROC,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_int_guc(
        c"plv8.debugger_port",
        c"V8 remote debug port.",
        c"The default value is 35432. This is effective only if PL/v8 is compiled with debugger support.",
        &DEBUGGER_PORT,
        0,
        65536,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_string_guc(
        c"plv8.log_level",
        c"Verbosity of PL/v8 diagnostics.",
        c"One of off, error, warn, info, debug.",
        &LOG_LEVEL,
        GucContext::Userset,
        GucFlags::default(),
    );
}

/// The configured startup function signature, if any.
pub(crate) fn start_proc() -> Option<String> {
    START_PROC
        .get()
        .map(|value| value.to_string_lossy().into_owned())
        .filter(|value| !value.trim().is_empty())
}

pub(crate) fn debugger_port() -> i32 {
    DEBUGGER_PORT.get()
}

pub(crate) fn log_level_setting() -> String {
    LOG_LEVEL
        .get()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_else(|| "warn".to_string())
}
