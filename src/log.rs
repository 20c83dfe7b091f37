/// Severity of a diagnostic record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only sink for the library's own diagnostics.
///
/// The pipeline never surfaces runtime errors to callers; everything it has
/// to say about dropped spans, failed requests, or unparseable agent
/// responses goes through this trait. Implementations must be safe to call
/// from the writer's worker thread and from producer threads concurrently.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: String);
}

/// Default [`Logger`] that forwards records to the [`tracing`] ecosystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(target: env!("CARGO_PKG_NAME"), "{message}"),
            LogLevel::Info => tracing::info!(target: env!("CARGO_PKG_NAME"), "{message}"),
            LogLevel::Warn => tracing::warn!(target: env!("CARGO_PKG_NAME"), "{message}"),
            LogLevel::Error => tracing::error!(target: env!("CARGO_PKG_NAME"), "{message}"),
        }
    }
}
