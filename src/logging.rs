use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use simplelog::{ConfigBuilder, WriteLogger};

use crate::config::LogConfig;
use crate::error::{AppError, AppResult};

pub fn parse_level(raw: &str) -> AppResult<LevelFilter> {
    LevelFilter::from_str(raw.trim()).map_err(|_| {
        AppError::invalid_argument(format!(
            "unknown log level `{raw}` (expected off, error, warn, info, debug or trace)"
        ))
    })
}

/// Installs the process-wide logger. Logs go to `config.file` when set and
/// to stderr otherwise. Only binaries call this.
pub fn init(config: &LogConfig) -> AppResult<()> {
    let level = parse_level(&config.level)?;
    let log_config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .set_thread_level(LevelFilter::Debug)
        .build();

    let installed = match config.file.as_deref() {
        Some(path) => WriteLogger::init(level, log_config, create_log_file(path)?),
        None => WriteLogger::init(level, log_config, std::io::stderr()),
    };
    installed.map_err(|err| AppError::unsupported(format!("logger already installed: {err}")))
}

fn create_log_file(path: &Path) -> AppResult<File> {
    File::create(path).map_err(|source| {
        AppError::io_with_context(
            source,
            format!("failed to create log file: {}", path.display()),
        )
    })
}
