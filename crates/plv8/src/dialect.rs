//! Source dialects and their embedded compilers.

use deno_core::v8;
use std::cell::RefCell;

use crate::error_bridge::{ErrorKind, Plv8Result, ScriptError};
use crate::type_bridge::{new_string, value_to_string};

static COFFEE_SCRIPT_JS: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/coffee_script.js"));
static LIVESCRIPT_JS: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/livescript.js"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    JavaScript,
    CoffeeScript,
    LiveScript,
}

impl Dialect {
    /// The dialect served by a language of the family, by `pg_language` name.
    pub(crate) fn from_language(name: &str) -> Option<Self> {
        match name {
            "plv8" => Some(Self::JavaScript),
            "plcoffee" => Some(Self::CoffeeScript),
            "plls" => Some(Self::LiveScript),
            _ => None,
        }
    }

    /// Translated bodies are wrapped as `return <expr>`.
    pub(crate) fn is_translated(self) -> bool {
        !matches!(self, Self::JavaScript)
    }

    fn compiler_global(self) -> &'static str {
        match self {
            Self::JavaScript => "",
            Self::CoffeeScript => "CoffeeScript",
            Self::LiveScript => "LiveScript",
        }
    }

    fn blob(self) -> &'static [u8] {
        match self {
            Self::JavaScript => &[],
            Self::CoffeeScript => COFFEE_SCRIPT_JS,
            Self::LiveScript => LIVESCRIPT_JS,
        }
    }

    fn disabled_message(self) -> &'static str {
        match self {
            Self::JavaScript => "Unknown Dialect",
            Self::CoffeeScript => "CoffeeScript is not enabled",
            Self::LiveScript => "LiveScript is not enabled",
        }
    }
}

fn blob_enabled(blob: &[u8]) -> bool {
    blob.first().is_some_and(|byte| *byte != 0)
}

thread_local! {
    // shared by every user; only the compilers run here
    static DIALECT_CONTEXT: RefCell<Option<v8::Global<v8::Context>>> = const { RefCell::new(None) };
}

/// Translates `source` to JavaScript with the dialect's embedded compiler.
pub(crate) fn translate(
    scope: &mut v8::HandleScope<'_, ()>,
    source: &str,
    dialect: Dialect,
) -> Plv8Result<String> {
    if !dialect.is_translated() {
        return Ok(source.to_string());
    }
    let blob = dialect.blob();
    if !blob_enabled(blob) {
        return Err(ScriptError::new(ErrorKind::DialectDisabled, dialect.disabled_message()).into());
    }

    let context = DIALECT_CONTEXT.with(|slot| slot.borrow().clone());
    let context = match context {
        Some(context) => v8::Local::new(scope, &context),
        None => {
            let context = v8::Context::new(scope, Default::default());
            let global = v8::Global::new(scope, context);
            DIALECT_CONTEXT.with(|slot| *slot.borrow_mut() = Some(global));
            context
        }
    };
    let scope = &mut v8::ContextScope::new(scope, context);
    let tc = &mut v8::TryCatch::new(scope);

    let global = context.global(tc);
    let key = new_string(tc, dialect.compiler_global())?;
    let mut compiler = global.get(tc, key.into()).filter(|value| !value.is_undefined());
    if compiler.is_none() {
        let code = new_string(tc, &String::from_utf8_lossy(blob))?;
        let origin = v8::ScriptOrigin::new(
            tc,
            key.into(),
            0,
            0,
            false,
            0,
            None,
            false,
            false,
            false,
            None,
        );
        v8::Script::compile(tc, code, Some(&origin))
            .and_then(|script| script.run(tc))
            .ok_or_else(|| ScriptError::from_try_catch(ErrorKind::EngineCompile, tc))?;
        compiler = global.get(tc, key.into());
    }

    let compiler = compiler
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .ok_or_else(|| {
            ScriptError::new(
                ErrorKind::EngineCompile,
                format!("{} compiler is not available", dialect.compiler_global()),
            )
        })?;
    let compile_key = new_string(tc, "compile")?;
    let compile = compiler
        .get(tc, compile_key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| ScriptError::new(ErrorKind::EngineCompile, "compile() not found"))?;

    let input = new_string(tc, source)?;
    let translated = compile
        .call(tc, compiler.into(), &[input.into()])
        .ok_or_else(|| ScriptError::from_try_catch(ErrorKind::EngineCompile, tc))?;
    value_to_string(tc, translated)
}
