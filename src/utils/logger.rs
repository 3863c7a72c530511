use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming,
};

/// Logger setup for the engine process. Writes to the configured file with
/// size-based rotation, duplicating warnings to stderr.
pub fn init(log_file: &str, level: log::Level) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_str(level.as_str().to_lowercase())?
        .log_to_file(FileSpec::try_from(log_file)?)
        .rotate(
            Criterion::Size(100 << 20),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(10),
        )
        .duplicate_to_stderr(flexi_logger::Duplicate::Warn)
        .start()
}

/// Stderr-only setup for the command-line tools.
pub fn init_stderr(level: log::Level) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_str(level.as_str().to_lowercase())?.start()
}
