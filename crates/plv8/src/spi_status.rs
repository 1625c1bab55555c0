use pgrx::prelude::*;

use crate::error_bridge::{ErrorKind, Plv8Result, ScriptError, host_call, protect};

const SPI_ERROR_CONNECT: i32 = -1;
const SPI_ERROR_COPY: i32 = -2;
const SPI_ERROR_OPUNKNOWN: i32 = -3;
const SPI_ERROR_UNCONNECTED: i32 = -4;
const SPI_ERROR_CURSOR: i32 = -5;
const SPI_ERROR_ARGUMENT: i32 = -6;
const SPI_ERROR_PARAM: i32 = -7;
const SPI_ERROR_TRANSACTION: i32 = -8;
const SPI_ERROR_NOATTRIBUTE: i32 = -9;
const SPI_ERROR_NOOUTFUNC: i32 = -10;
const SPI_ERROR_TYPUNKNOWN: i32 = -11;

/// Stable, user-facing text for an SPI return code.
pub(crate) fn format_spi_status(status: i32) -> String {
    if status > 0 {
        return "OK".to_string();
    }
    let text = match status {
        SPI_ERROR_CONNECT => "SPI_ERROR_CONNECT",
        SPI_ERROR_COPY => "SPI_ERROR_COPY",
        SPI_ERROR_OPUNKNOWN => "SPI_ERROR_OPUNKNOWN",
        SPI_ERROR_UNCONNECTED | SPI_ERROR_TRANSACTION => {
            "current transaction is aborted, commands ignored until end of transaction block"
        }
        SPI_ERROR_CURSOR => "SPI_ERROR_CURSOR",
        SPI_ERROR_ARGUMENT => "SPI_ERROR_ARGUMENT",
        SPI_ERROR_PARAM => "SPI_ERROR_PARAM",
        SPI_ERROR_NOATTRIBUTE => "SPI_ERROR_NOATTRIBUTE",
        SPI_ERROR_NOOUTFUNC => "SPI_ERROR_NOOUTFUNC",
        SPI_ERROR_TYPUNKNOWN => "SPI_ERROR_TYPUNKNOWN",
        other => return format!("SPI_ERROR: {other}"),
    };
    text.to_string()
}

pub(crate) fn check_spi_status(status: i32) -> Plv8Result<i32> {
    if status < 0 {
        Err(ScriptError::new(ErrorKind::Spi, format_spi_status(status)).into())
    } else {
        Ok(status)
    }
}

/// An open SPI connection. `finish` must be called on the success path; the
/// drop only closes connections abandoned by an early return.
pub(crate) struct SpiConnection {
    finished: bool,
}

impl SpiConnection {
    pub(crate) fn connect() -> Plv8Result<Self> {
        let status = host_call(|| unsafe { pg_sys::SPI_connect() })?;
        if status != pg_sys::SPI_OK_CONNECT as i32 {
            return Err(ScriptError::new(ErrorKind::Spi, "could not connect to SPI manager").into());
        }
        Ok(Self { finished: false })
    }

    pub(crate) fn finish(mut self) -> Plv8Result<()> {
        self.finished = true;
        let status = host_call(|| unsafe { pg_sys::SPI_finish() })?;
        check_spi_status(status).map(|_| ())
    }
}

impl Drop for SpiConnection {
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() {
            return;
        }
        if let Err(err) = host_call(|| unsafe { pg_sys::SPI_finish() }) {
            warning!("plv8: failed to finish SPI connection: {err}");
        }
    }
}

/// An internal subtransaction entered from script code.
pub(crate) struct SubTransaction {
    resource_owner: pg_sys::ResourceOwner,
    memory_context: pg_sys::MemoryContext,
}

impl SubTransaction {
    pub(crate) fn begin() -> Plv8Result<Self> {
        protect(|| unsafe {
            if !pg_sys::IsTransactionOrTransactionBlock() {
                return Err(ScriptError::runtime("out of transaction").into());
            }
            let block = Self {
                resource_owner: pg_sys::CurrentResourceOwner,
                memory_context: pg_sys::CurrentMemoryContext,
            };
            pg_sys::BeginInternalSubTransaction(std::ptr::null());
            pg_sys::MemoryContextSwitchTo(block.memory_context);
            Ok(block)
        })
    }

    /// Releases the subtransaction on success, rolls it back otherwise.
    pub(crate) fn end(self, success: bool) -> Plv8Result<()> {
        host_call(|| unsafe {
            if success {
                pg_sys::ReleaseCurrentSubTransaction();
            } else {
                pg_sys::RollbackAndReleaseCurrentSubTransaction();
            }
            pg_sys::MemoryContextSwitchTo(self.memory_context);
            pg_sys::CurrentResourceOwner = self.resource_owner;
        })
    }
}
