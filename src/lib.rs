//! Schema drift repair plus FK-aware backup, restore and sync.
//!
//! Every entry point takes a [`DatabaseOps`] handle explicitly; nothing in the
//! library caches connections process-wide.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod backup;
pub mod config;
pub mod connect;
pub mod db;
pub mod error;
pub mod ops;
pub mod schema;
pub mod sync;

pub use error::{AppError, AppResult};
pub use ops::{DatabaseOps, Filters, OpsError, Row};

/// Tracing target shared by every event the crate emits.
pub const LOG_TARGET: &str = "dbmend";

const LOG_ENV: &str = "DBMEND_LOG";
const LOG_DIR_ENV: &str = "DBMEND_LOG_DIR";
const DEFAULT_FILTER: &str = "dbmend=info,sqlx=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::new(std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()))
}

/// Install the JSON tracing subscriber.
///
/// Writes to stderr, and additionally to a daily rolling file when
/// `DBMEND_LOG_DIR` is set. The returned guard must be held for the life of
/// the process so buffered file output is flushed on exit. Calling this more
/// than once is harmless; later calls leave the first subscriber in place.
pub fn init_logging() -> Option<WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dbmend.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
