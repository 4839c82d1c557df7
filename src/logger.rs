use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

/// Writes log records to stderr.
pub struct StderrLogger {
    level: LevelFilter,
}

impl StderrLogger {
    pub const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut err = std::io::stderr().lock();
            writeln!(err, "{:<5} {}: {}", record.level(), record.target(), record.args())
                .ok();
        }
    }

    fn flush(&self) {
        std::io::stderr().flush().ok();
    }
}

/// Install the logger, passing records up to `level`.
pub fn init(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    static LOGGER: StderrLogger = StderrLogger::new(LevelFilter::Trace);
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}
