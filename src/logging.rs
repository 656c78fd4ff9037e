use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;

use crate::config::LoggingConfig;
use crate::error::LoggingError;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Routes the `log` facade to the append-only agent log file, and to stderr
/// as well in console mode.
pub fn setup_logging(config: &LoggingConfig, console: bool) -> Result<(), LoggingError> {
    let level = config
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);

    // Create log directory if it doesn't exist
    if let Some(dir) = Path::new(&config.log_file).parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| LoggingError::LogFile {
                path: config.log_file.clone(),
                source: e,
            })?;
        }
    }

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .append(true)
        .build(&config.log_file)
        .map_err(|e| LoggingError::LogFile {
            path: config.log_file.clone(),
            source: e,
        })?;

    let mut builder = Config::builder().appender(Appender::builder().build("file", Box::new(logfile)));
    let mut root = Root::builder().appender("file");

    if console {
        let stderr = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(stderr)));
        root = root.appender("console");
    }

    let log_config = builder
        .build(root.build(level))
        .map_err(|e| LoggingError::Config(e.to_string()))?;

    log4rs::init_config(log_config)?;
    Ok(())
}
