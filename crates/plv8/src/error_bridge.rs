use pgrx::pg_sys::panic::{CaughtError, ErrorReport};
use pgrx::prelude::*;
use pgrx::{PgLogLevel, PgSqlErrorCode, PgTryBuilder};
use std::fmt;
use std::panic::AssertUnwindSafe;

use deno_core::v8;

pub(crate) type Plv8Result<T> = Result<T, Plv8Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    CatalogLookupFailed,
    UnsupportedType,
    WrongContext,
    WrongShape,
    DialectDisabled,
    EngineCompile,
    EngineRuntime,
    Spi,
}

impl ErrorKind {
    fn sql_error_code(self) -> PgSqlErrorCode {
        match self {
            Self::UnsupportedType | Self::WrongContext => {
                PgSqlErrorCode::ERRCODE_FEATURE_NOT_SUPPORTED
            }
            Self::WrongShape => PgSqlErrorCode::ERRCODE_DATATYPE_MISMATCH,
            _ => PgSqlErrorCode::ERRCODE_INTERNAL_ERROR,
        }
    }

    pub(crate) fn metrics_class(self) -> &'static str {
        match self {
            Self::EngineCompile | Self::DialectDisabled => "compile",
            Self::EngineRuntime => "runtime",
            Self::Spi => "spi",
            _ => "other",
        }
    }
}

/// An error raised on the script side of the bridge, reported to the host
/// with its message and an optional `fn() LINE n: src` detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptError {
    kind: ErrorKind,
    message: String,
    detail: Option<String>,
}

impl ScriptError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), detail: None }
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EngineRuntime, message)
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Captures the pending exception of `try_catch`.
    pub(crate) fn from_try_catch(
        kind: ErrorKind,
        try_catch: &mut v8::TryCatch<v8::HandleScope>,
    ) -> Self {
        let message = match try_catch.exception() {
            Some(exception) => exception.to_rust_string_lossy(try_catch),
            None => "unknown exception".to_string(),
        };
        let Some(report) = try_catch.message() else {
            return Self::new(kind, message);
        };

        let resource = report
            .get_script_resource_name(try_catch)
            .filter(|name| !name.is_undefined() && !name.is_null())
            .map(|name| name.to_rust_string_lossy(try_catch));
        let line = report.get_line_number(try_catch);
        let source = report.get_source_line(try_catch).map(|src| src.to_rust_string_lossy(try_catch));

        Self::new(kind, message).with_detail(format_detail(
            resource.as_deref(),
            line,
            source.as_deref(),
        ))
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Builds the `Error` object handed back to scripts.
    pub(crate) fn to_engine_error<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> v8::Local<'s, v8::Value> {
        let text = strip_error_prefix(&self.message);
        let message = v8::String::new(scope, text).unwrap_or_else(|| v8::String::empty(scope));
        v8::Exception::error(scope, message)
    }

    fn rethrow(&self) -> ! {
        let mut report =
            ErrorReport::new(self.kind.sql_error_code(), self.message.clone(), "plv8");
        if let Some(detail) = &self.detail {
            report = report.set_detail(detail.clone());
        }
        report.report(PgLogLevel::ERROR);
        unreachable!("ERROR level reports do not return")
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A host error caught inside a protected region, waiting to be re-raised.
#[derive(Debug)]
pub(crate) struct HostError {
    caught: CaughtError,
}

impl HostError {
    pub(crate) fn new(caught: CaughtError) -> Self {
        Self { caught }
    }

    pub(crate) fn message(&self) -> String {
        match &self.caught {
            CaughtError::PostgresError(report)
            | CaughtError::ErrorReport(report)
            | CaughtError::RustPanic { ereport: report, .. } => report.message().to_string(),
        }
    }

    fn rethrow(self) -> ! {
        self.caught.rethrow()
    }
}

#[derive(Debug)]
pub(crate) enum Plv8Error {
    Script(ScriptError),
    Host(HostError),
}

impl Plv8Error {
    pub(crate) fn message(&self) -> String {
        match self {
            Self::Script(err) => err.message().to_string(),
            Self::Host(err) => err.message(),
        }
    }

    pub(crate) fn metrics_class(&self) -> &'static str {
        match self {
            Self::Script(err) => err.kind().metrics_class(),
            Self::Host(_) => "host",
        }
    }

    /// Leaves Rust through the matching host unwinding path.
    pub(crate) fn rethrow(self) -> ! {
        match self {
            Self::Script(err) => err.rethrow(),
            Self::Host(err) => err.rethrow(),
        }
    }

    /// Throws this error into the engine as an `Error` object.
    pub(crate) fn throw(&self, scope: &mut v8::HandleScope) {
        let exception = match self {
            Self::Script(err) => err.to_engine_error(scope),
            Self::Host(err) => ScriptError::runtime(err.message()).to_engine_error(scope),
        };
        scope.throw_exception(exception);
    }
}

impl From<ScriptError> for Plv8Error {
    fn from(value: ScriptError) -> Self {
        Self::Script(value)
    }
}

impl fmt::Display for Plv8Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Runs `f` inside a host try block; any host error raised inside becomes
/// `Plv8Error::Host` and the memory context current on entry is restored.
pub(crate) fn protect<T, F>(f: F) -> Plv8Result<T>
where
    F: FnOnce() -> Plv8Result<T>,
{
    let saved_context = unsafe { pg_sys::CurrentMemoryContext };
    PgTryBuilder::new(AssertUnwindSafe(f))
        .catch_others(|caught| {
            unsafe {
                pg_sys::CurrentMemoryContext = saved_context;
            }
            Err(Plv8Error::Host(HostError::new(caught)))
        })
        .execute()
}

/// Shorthand for protected host calls that cannot fail on the script side.
pub(crate) fn host_call<T, F>(f: F) -> Plv8Result<T>
where
    F: FnOnce() -> T,
{
    protect(|| Ok(f()))
}

pub(crate) fn format_detail(resource: Option<&str>, line: Option<usize>, source: Option<&str>) -> String {
    let line = match line {
        Some(line) => line.saturating_sub(1).to_string(),
        None => "?".to_string(),
    };
    format!("{}() LINE {}: {}", resource.unwrap_or("?"), line, source.unwrap_or("?"))
}

pub(crate) fn strip_error_prefix(message: &str) -> &str {
    message.strip_prefix("Error: ").unwrap_or(message)
}
