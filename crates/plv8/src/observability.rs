use pgrx::prelude::*;
use serde_json::Value;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::log_level_setting;

static COMPILE_CALLS: AtomicU64 = AtomicU64::new(0);
static COMPILE_ERRORS: AtomicU64 = AtomicU64::new(0);
static COMPILE_LATENCY_TOTAL_MS: AtomicU64 = AtomicU64::new(0);
static COMPILE_LATENCY_LAST_MS: AtomicU64 = AtomicU64::new(0);
static COMPILE_LATENCY_MAX_MS: AtomicU64 = AtomicU64::new(0);
static EXECUTE_CALLS: AtomicU64 = AtomicU64::new(0);
static EXECUTE_ERRORS: AtomicU64 = AtomicU64::new(0);
static EXECUTE_LATENCY_TOTAL_MS: AtomicU64 = AtomicU64::new(0);
static EXECUTE_LATENCY_LAST_MS: AtomicU64 = AtomicU64::new(0);
static EXECUTE_LATENCY_MAX_MS: AtomicU64 = AtomicU64::new(0);

static COMPILE_ERROR_CLASSES: ErrorClassCounters = ErrorClassCounters::new();
static EXECUTE_ERROR_CLASSES: ErrorClassCounters = ErrorClassCounters::new();

struct ErrorClassCounters {
    compile: AtomicU64,
    runtime: AtomicU64,
    spi: AtomicU64,
    host: AtomicU64,
    other: AtomicU64,
}

impl ErrorClassCounters {
    const fn new() -> Self {
        Self {
            compile: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            spi: AtomicU64::new(0),
            host: AtomicU64::new(0),
            other: AtomicU64::new(0),
        }
    }

    fn increment(&self, class: &str) {
        let counter = match class {
            "compile" => &self.compile,
            "runtime" => &self.runtime,
            "spi" => &self.spi,
            "host" => &self.host,
            _ => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn to_json(&self) -> Value {
        json!({
            "compile": self.compile.load(Ordering::Relaxed),
            "runtime": self.runtime.load(Ordering::Relaxed),
            "spi": self.spi.load(Ordering::Relaxed),
            "host": self.host.load(Ordering::Relaxed),
            "other": self.other.load(Ordering::Relaxed)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

pub(crate) fn parse_log_level(raw: &str) -> LogLevel {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" => LogLevel::Off,
        "error" => LogLevel::Error,
        "warn" | "warning" => LogLevel::Warn,
        "info" => LogLevel::Info,
        "debug" | "trace" => LogLevel::Debug,
        _ => LogLevel::Warn,
    }
}

fn current_log_level() -> LogLevel {
    parse_log_level(log_level_setting().as_str())
}

pub(crate) fn log_debug(message: &str) {
    if current_log_level() >= LogLevel::Debug {
        debug1!("{message}");
    }
}

pub(crate) fn log_info(message: &str) {
    if current_log_level() >= LogLevel::Info {
        info!("{message}");
    }
}

pub(crate) fn log_warn(message: &str) {
    if current_log_level() >= LogLevel::Warn {
        warning!("{message}");
    }
}

pub(crate) fn record_compile_start() -> Instant {
    COMPILE_CALLS.fetch_add(1, Ordering::Relaxed);
    Instant::now()
}

pub(crate) fn record_compile_success(started_at: Instant) {
    record_latency(
        started_at,
        &COMPILE_LATENCY_TOTAL_MS,
        &COMPILE_LATENCY_LAST_MS,
        &COMPILE_LATENCY_MAX_MS,
    );
}

pub(crate) fn record_compile_error(started_at: Instant, class: &str) {
    COMPILE_ERRORS.fetch_add(1, Ordering::Relaxed);
    COMPILE_ERROR_CLASSES.increment(class);
    record_compile_success(started_at);
}

pub(crate) fn record_execute_start() -> Instant {
    EXECUTE_CALLS.fetch_add(1, Ordering::Relaxed);
    Instant::now()
}

pub(crate) fn record_execute_success(started_at: Instant) {
    record_latency(
        started_at,
        &EXECUTE_LATENCY_TOTAL_MS,
        &EXECUTE_LATENCY_LAST_MS,
        &EXECUTE_LATENCY_MAX_MS,
    );
}

pub(crate) fn record_execute_error(started_at: Instant, class: &str) {
    EXECUTE_ERRORS.fetch_add(1, Ordering::Relaxed);
    EXECUTE_ERROR_CLASSES.increment(class);
    record_execute_success(started_at);
}

pub(crate) fn metrics_json() -> Value {
    json!({
        "compile": {
            "calls": COMPILE_CALLS.load(Ordering::Relaxed),
            "errors": COMPILE_ERRORS.load(Ordering::Relaxed),
            "latency_ms": {
                "total": COMPILE_LATENCY_TOTAL_MS.load(Ordering::Relaxed),
                "last": COMPILE_LATENCY_LAST_MS.load(Ordering::Relaxed),
                "max": COMPILE_LATENCY_MAX_MS.load(Ordering::Relaxed)
            },
            "error_classes": COMPILE_ERROR_CLASSES.to_json()
        },
        "execute": {
            "calls": EXECUTE_CALLS.load(Ordering::Relaxed),
            "errors": EXECUTE_ERRORS.load(Ordering::Relaxed),
            "latency_ms": {
                "total": EXECUTE_LATENCY_TOTAL_MS.load(Ordering::Relaxed),
                "last": EXECUTE_LATENCY_LAST_MS.load(Ordering::Relaxed),
                "max": EXECUTE_LATENCY_MAX_MS.load(Ordering::Relaxed)
            },
            "error_classes": EXECUTE_ERROR_CLASSES.to_json()
        }
    })
}

fn record_latency(
    started_at: Instant,
    total_ms: &AtomicU64,
    last_ms: &AtomicU64,
    max_ms: &AtomicU64,
) {
    let elapsed_ms = started_at.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
    total_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    last_ms.store(elapsed_ms, Ordering::Relaxed);
    update_max(max_ms, elapsed_ms);
}

fn update_max(max_metric: &AtomicU64, candidate: u64) {
    let mut current = max_metric.load(Ordering::Relaxed);
    while candidate > current {
        match max_metric.compare_exchange(current, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}
