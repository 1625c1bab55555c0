//! Per-transaction execution environments.
//!
//! An environment pins a receiver object whose only internal field holds the
//! compiled function. Environments are listed per transaction; the list is
//! walked by the transaction callback, which releases every receiver.

use deno_core::v8;
use pgrx::prelude::*;
use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

use crate::engine::new_receiver;
use crate::error_bridge::{Plv8Result, ScriptError};
use crate::observability::log_debug;

pub(crate) struct ExecEnv {
    context: v8::Global<v8::Context>,
    receiver: RefCell<Option<v8::Global<v8::Object>>>,
}

thread_local! {
    static EXEC_ENVS: RefCell<Vec<Rc<ExecEnv>>> = const { RefCell::new(Vec::new()) };
}

impl ExecEnv {
    /// Builds an environment for `function` compiled in `context` and links it
    /// onto the teardown list.
    pub(crate) fn create(
        scope: &mut v8::HandleScope,
        context: &v8::Global<v8::Context>,
        function: v8::Local<v8::Function>,
    ) -> Plv8Result<Rc<Self>> {
        let receiver = new_receiver(scope)?;
        receiver.set_internal_field(0, function.into());
        let env = Rc::new(Self {
            context: context.clone(),
            receiver: RefCell::new(Some(v8::Global::new(scope, receiver))),
        });
        EXEC_ENVS.with(|envs| envs.borrow_mut().push(Rc::clone(&env)));
        Ok(env)
    }

    pub(crate) fn context(&self) -> &v8::Global<v8::Context> {
        &self.context
    }

    /// False once the owning transaction has ended.
    pub(crate) fn is_live(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub(crate) fn receiver<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Plv8Result<v8::Local<'s, v8::Object>> {
        self.receiver
            .borrow()
            .as_ref()
            .map(|receiver| v8::Local::new(scope, receiver))
            .ok_or_else(|| ScriptError::runtime("execution environment has been released").into())
    }

    /// The function pinned by the receiver.
    pub(crate) fn function<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Plv8Result<v8::Local<'s, v8::Function>> {
        let receiver = self.receiver(scope)?;
        receiver
            .get_internal_field(scope, 0)
            .and_then(|data| v8::Local::<v8::Value>::try_from(data).ok())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| ScriptError::runtime("execution environment holds no function").into())
    }

    fn release(&self) {
        self.receiver.borrow_mut().take();
    }
}

/// Releases every receiver created during the ending transaction.
fn release_all() -> usize {
    EXEC_ENVS.with(|envs| {
        let mut envs = envs.borrow_mut();
        let released = envs.len();
        for env in envs.iter() {
            env.release();
        }
        envs.clear();
        released
    })
}

#[pg_guard]
unsafe extern "C-unwind" fn plv8_xact_cb(_event: pg_sys::XactEvent::Type, _arg: *mut c_void) {
    let released = release_all();
    if released > 0 {
        log_debug(&format!("released {released} execution environment(s)"));
    }
}

pub(crate) fn register_xact_callback() {
    unsafe {
        pg_sys::RegisterXactCallback(Some(plv8_xact_cb), std::ptr::null_mut());
    }
}
