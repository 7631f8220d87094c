//! Logging sink setup.
//!
//! Logging starts console-only, before the configuration is read. Once the
//! configuration has been loaded, [`LogHandle::attach_file`] switches on the
//! durable sink: one JSON document per line, appended to the configured file,
//! while the console keeps receiving everything it did before.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{LevelFilter, Log, Metadata, Record};
use thiserror::Error;

use crate::settings::Logging;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("logger already initialized")]
    AlreadyInitialized(#[from] log::SetLoggerError),
    #[error("failed opening log file {path}")]
    OpenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

struct FileSink {
    file: File,
    level: LevelFilter,
}

/// Handle on the installed logger, used to attach the durable sink.
#[derive(Clone)]
pub struct LogHandle {
    console_level: LevelFilter,
    file: Arc<Mutex<Option<FileSink>>>,
}

struct FetterLogger {
    console: env_logger::Logger,
    file: Arc<Mutex<Option<FileSink>>>,
}

/// Install the console logger. We log from `level` and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init(level: LevelFilter) -> Result<LogHandle, LoggingError> {
    let mut builder = env_logger::Builder::new();
    if std::env::var_os("RUST_LOG").is_some() {
        builder.parse_env(env_logger::Env::default());
    } else {
        builder.filter_level(level);
    }
    let console = builder.build();
    let console_level = console.filter();
    let file = Arc::new(Mutex::new(None));

    log::set_boxed_logger(Box::new(FetterLogger {
        console,
        file: file.clone(),
    }))?;
    log::set_max_level(console_level);

    Ok(LogHandle {
        console_level,
        file,
    })
}

impl LogHandle {
    /// Start writing JSON lines to the configured log file.
    ///
    /// An unparsable level falls back to `info`.
    pub fn attach_file(&self, config: &Logging) -> Result<(), LoggingError> {
        let level = parse_level(&config.level).unwrap_or_else(|| {
            log::error!("Unknown log level '{}', setting it to INFO", config.level);
            LevelFilter::Info
        });
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file)
            .map_err(|source| LoggingError::OpenFile {
                path: config.file.clone(),
                source,
            })?;

        *lock(&self.file) = Some(FileSink { file, level });
        log::set_max_level(level.max(self.console_level));
        log::debug!("Logging to {} with level {level}", config.file);
        Ok(())
    }
}

impl Log for FetterLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if self.console.enabled(metadata) {
            return true;
        }
        match &*lock(&self.file) {
            Some(sink) => metadata.level() <= sink.level,
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if let Some(sink) = &mut *lock(&self.file) {
            if record.level() <= sink.level {
                // Nowhere to report a failing log write.
                let _ = writeln!(sink.file, "{}", json_line(record));
            }
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(sink) = &mut *lock(&self.file) {
            let _ = sink.file.flush();
        }
    }
}

/// A panic while logging must not silence the logger for good.
fn lock(file: &Mutex<Option<FileSink>>) -> MutexGuard<'_, Option<FileSink>> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(level.trim()).ok()
}

fn json_line(record: &Record) -> String {
    serde_json::json!({
        "@timestamp": chrono::Local::now().to_rfc3339(),
        "level": record.level().as_str(),
        "target": record.target(),
        "message": record.args().to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level(" info "), Some(LevelFilter::Info));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn json_format() {
        let line = json_line(
            &Record::builder()
                .args(format_args!("Adding process {} to cgroup {}", 42, "compile"))
                .level(log::Level::Warn)
                .target("cgroup_manager")
                .build(),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["target"], "cgroup_manager");
        assert_eq!(value["message"], "Adding process 42 to cgroup compile");
        assert!(value["@timestamp"].is_string());
    }
}
