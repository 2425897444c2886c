//! Logging backend that routes `log` records to a pluggable sink
//!
//! Library code only uses the `log` macros. A host installs this backend
//! once with [`init_logger`] and chooses where records go with
//! [`set_log_sink`]; without a sink, records are dropped.

use std::io::Write;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::Utc;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Destination for log records
pub trait LogSink: Send + Sync {
    fn on_log(&self, level: Level, target: &str, message: &str);
}

/// Sink writing one timestamped line per record to stderr
pub struct StderrSink;

impl LogSink for StderrSink {
    fn on_log(&self, level: Level, target: &str, message: &str) {
        let _ = writeln!(
            std::io::stderr().lock(),
            "{} {:<5} {} {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level,
            target,
            message
        );
    }
}

/// Global logger instance
static LOGGER: OnceLock<SinkLogger> = OnceLock::new();

struct SinkLogger {
    sink: RwLock<Option<Arc<dyn LogSink>>>,
    max_level: RwLock<Level>,
}

impl SinkLogger {
    fn new(max_level: Level) -> Self {
        Self {
            sink: RwLock::new(None),
            max_level: RwLock::new(max_level),
        }
    }

    fn set_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        if let Ok(mut guard) = self.sink.write() {
            *guard = sink;
        }
    }

    fn set_max_level(&self, level: Level) {
        if let Ok(mut guard) = self.max_level.write() {
            *guard = level;
        }
    }

    fn max_level(&self) -> Level {
        self.max_level.read().map(|l| *l).unwrap_or(Level::Info)
    }
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
            && self.sink.read().ok().is_some_and(|sink| sink.is_some())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Ok(guard) = self.sink.read()
            && let Some(sink) = guard.as_ref()
        {
            let message = record.args().to_string();
            sink.on_log(record.level(), record.target(), &message);
        }
    }

    fn flush(&self) {}
}

/// Install the sink logger as the global `log` backend
///
/// Fails if another logger was installed first.
pub fn init_logger(max_level: Level) -> Result<(), SetLoggerError> {
    let logger = LOGGER.get_or_init(|| SinkLogger::new(max_level));
    log::set_logger(logger)?;
    log::set_max_level(max_level.to_level_filter());
    Ok(())
}

/// Replace the sink receiving records; `None` silences logging
pub fn set_log_sink(sink: Option<Arc<dyn LogSink>>) {
    if let Some(logger) = LOGGER.get() {
        logger.set_sink(sink);
    }
}

/// Update the maximum level passed to the sink
pub fn set_log_level(level: Level) {
    if let Some(logger) = LOGGER.get() {
        logger.set_max_level(level);
        log::set_max_level(level.to_level_filter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl LogSink for CapturingSink {
        fn on_log(&self, level: Level, _target: &str, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_logger_filters_by_level() {
        let logger = SinkLogger::new(Level::Info);
        let sink = Arc::new(CapturingSink::default());
        logger.set_sink(Some(sink.clone()));

        let emit = |level: Level, msg: &str| {
            logger.log(
                &Record::builder()
                    .level(level)
                    .target("mailsync")
                    .args(format_args!("{}", msg))
                    .build(),
            );
        };

        emit(Level::Info, "[SYNC] started");
        emit(Level::Debug, "[SYNC] hidden");
        logger.set_max_level(Level::Debug);
        emit(Level::Debug, "[SYNC] visible");

        let lines = sink.lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (Level::Info, "[SYNC] started".to_string()),
                (Level::Debug, "[SYNC] visible".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_sink_disables_logging() {
        let logger = SinkLogger::new(Level::Trace);
        let metadata = Metadata::builder().level(Level::Error).build();
        assert!(!logger.enabled(&metadata));
    }
}
