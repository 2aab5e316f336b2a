// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::thread;

use log::{Log, Metadata, Record};
use serde::{Deserialize, Deserializer, Serialize};

use super::extract_guard;
use super::time::LocalTime;

/// Default level filter.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;
/// Name shown in every log line.
pub const APP_NAME: &str = "cpuid-harness";

/// The logger.
pub static LOGGER: Logger = Logger(Mutex::new(LoggerConfiguration {
    target: None,
    filter: LogFilter { module: None },
    format: LogFormat {
        show_level: false,
        show_log_origin: false,
    },
}));

/// Error type for [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Error type for [`Logger::update`].
#[derive(Debug, thiserror::Error)]
#[error("Failed to open target file: {0}")]
pub struct LoggerUpdateError(pub std::io::Error);

impl Logger {
    /// Initialize the logger.
    pub fn init(&'static self) -> Result<(), LoggerInitError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    /// Applies the given logger configuration the logger.
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        let mut guard = extract_guard(self.0.lock());
        log::set_max_level(
            config
                .level
                .map(log::LevelFilter::from)
                .unwrap_or(DEFAULT_LEVEL),
        );

        if let Some(log_path) = config.log_path {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(LoggerUpdateError)?;

            guard.target = Some(file);
        };

        if let Some(show_level) = config.show_level {
            guard.format.show_level = show_level;
        }

        if let Some(show_log_origin) = config.show_log_origin {
            guard.format.show_log_origin = show_log_origin;
        }

        if let Some(module) = config.module {
            guard.filter.module = Some(module);
        }

        // Ensure we drop the guard before attempting to log, otherwise this
        // would deadlock.
        drop(guard);

        Ok(())
    }
}

#[derive(Debug)]
pub struct LogFilter {
    pub module: Option<String>,
}
#[derive(Debug)]
pub struct LogFormat {
    pub show_level: bool,
    pub show_log_origin: bool,
}
#[derive(Debug)]
pub struct LoggerConfiguration {
    pub target: Option<std::fs::File>,
    pub filter: LogFilter,
    pub format: LogFormat,
}

/// Writes log lines to stdout, or to the file configured through [`LoggerConfig::log_path`].
#[derive(Debug)]
pub struct Logger(pub Mutex<LoggerConfiguration>);

impl Log for Logger {
    // No additional filters to <https://docs.rs/log/latest/log/fn.max_level.html>.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut guard = extract_guard(self.0.lock());

        let enabled_module = match (&guard.filter.module, record.module_path()) {
            (Some(filter), Some(source)) => source.starts_with(filter),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if !enabled_module {
            return;
        }

        let thread = thread::current().name().unwrap_or("-").to_string();
        let level = match guard.format.show_level {
            true => format!(":{}", record.level()),
            false => String::new(),
        };

        let origin = match guard.format.show_log_origin {
            true => {
                let file = record.file().unwrap_or("?");
                let line = match record.line() {
                    Some(x) => x.to_string(),
                    None => String::from("?"),
                };
                format!(":{file}:{line}")
            }
            false => String::new(),
        };

        let message = format!(
            "{} [{APP_NAME}:{thread}{level}{origin}] {}\n",
            LocalTime::now(),
            record.args()
        );

        // A failed write has nowhere to be reported.
        let _ = if let Some(file) = &mut guard.target {
            file.write_all(message.as_bytes())
        } else {
            std::io::stdout().write_all(message.as_bytes())
        };
    }

    fn flush(&self) {
        let mut guard = extract_guard(self.0.lock());
        let _ = match &mut guard.target {
            Some(file) => file.flush(),
            None => std::io::stdout().flush(),
        };
    }
}

/// Strongly typed structure used to describe the logger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Named pipe or file used as output for logs.
    pub log_path: Option<PathBuf>,
    /// The level of the Logger.
    pub level: Option<LevelFilter>,
    /// Whether to show the log level in the log.
    pub show_level: Option<bool>,
    /// Whether to show the log origin in the log.
    pub show_log_origin: Option<bool>,
    /// The module to filter logs by.
    pub module: Option<String>,
}

/// Log level filter, accepted in any case and with `warning` as an alias of `warn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LevelFilter {
    /// [`log::LevelFilter::Off`]
    Off,
    /// [`log::LevelFilter::Trace`]
    Trace,
    /// [`log::LevelFilter::Debug`]
    Debug,
    /// [`log::LevelFilter::Info`]
    Info,
    /// [`log::LevelFilter::Warn`]
    Warn,
    /// [`log::LevelFilter::Error`]
    Error,
}
impl From<LevelFilter> for log::LevelFilter {
    fn from(filter: LevelFilter) -> log::LevelFilter {
        match filter {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Trace => log::LevelFilter::Trace,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Error => log::LevelFilter::Error,
        }
    }
}
impl<'de> Deserialize<'de> for LevelFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let key = String::deserialize(deserializer)?;
        LevelFilter::from_str(&key).map_err(D::Error::custom)
    }
}

/// Error type for [`<LevelFilter as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse string to level filter: {0}")]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LevelFilterFromStrError(String::from(s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use log::Level;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_levelfilter_from_str_all_variants() {
        use itertools::Itertools;

        #[derive(Deserialize)]
        struct Foo {
            #[allow(dead_code)]
            level: LevelFilter,
        }

        for (level, level_enum) in [
            ("off", LevelFilter::Off),
            ("trace", LevelFilter::Trace),
            ("debug", LevelFilter::Debug),
            ("info", LevelFilter::Info),
            ("warn", LevelFilter::Warn),
            ("warning", LevelFilter::Warn),
            ("error", LevelFilter::Error),
        ] {
            let multi = level.chars().map(|_| 0..=1).multi_cartesian_product();
            for combination in multi {
                let variant = level
                    .chars()
                    .zip_eq(combination)
                    .map(|(c, v)| match v {
                        0 => c.to_ascii_lowercase(),
                        1 => c.to_ascii_uppercase(),
                        _ => unreachable!(),
                    })
                    .collect::<String>();

                let ex = format!("{{ \"level\": \"{}\" }}", variant);
                assert_eq!(LevelFilter::from_str(&variant), Ok(level_enum));
                assert!(serde_json::from_str::<Foo>(&ex).is_ok(), "{ex}");
            }
        }
        assert!(serde_json::from_str::<Foo>("{ \"level\": \"blah\" }").is_err());
        assert_eq!(
            LevelFilter::from_str("bad"),
            Err(LevelFilterFromStrError(String::from("bad")))
        );
        assert_eq!(
            log::LevelFilter::from(LevelFilter::Warn),
            log::LevelFilter::Warn
        );
    }

    #[test]
    fn test_logger_config_deny_unknown_fields() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{ "level": "Debug", "show_level": true }"#).unwrap();
        assert_eq!(config.level, Some(LevelFilter::Debug));
        assert_eq!(config.show_level, Some(true));
        assert!(serde_json::from_str::<LoggerConfig>(r#"{ "colour": true }"#).is_err());
    }

    fn file_logger(path: PathBuf, module: Option<&str>) -> Logger {
        let logger = Logger(Mutex::new(LoggerConfiguration {
            target: None,
            filter: LogFilter { module: None },
            format: LogFormat {
                show_level: false,
                show_log_origin: false,
            },
        }));
        logger
            .update(LoggerConfig {
                log_path: Some(path),
                level: Some(LevelFilter::Trace),
                show_level: Some(true),
                show_log_origin: Some(true),
                module: module.map(String::from),
            })
            .unwrap();
        logger
    }

    #[test]
    fn test_logger() {
        let file = TempFile::new().unwrap();
        let logger = file_logger(file.as_path().to_path_buf(), Some("cpuid_harness"));

        assert!(logger.enabled(&Metadata::builder().level(Level::Debug).build()));

        let record = Record::builder()
            .args(format_args!("Error!"))
            .metadata(Metadata::builder().level(Level::Error).build())
            .file(Some("src/harness.rs"))
            .line(Some(200))
            .module_path(Some("cpuid_harness::harness"))
            .build();
        logger.log(&record);

        // Filtered out by module.
        let record = Record::builder()
            .args(format_args!("Hidden"))
            .metadata(Metadata::builder().level(Level::Error).build())
            .module_path(Some("kvm_ioctls"))
            .build();
        logger.log(&record);
        logger.flush();

        let contents = std::fs::read_to_string(file.as_path()).unwrap();
        let (_time, rest) = contents.split_once(' ').unwrap();
        let thread = thread::current().name().unwrap_or("-").to_string();
        assert_eq!(
            rest,
            format!("[{APP_NAME}:{thread}:ERROR:src/harness.rs:200] Error!\n")
        );
    }

    #[test]
    fn test_update_bad_path() {
        let logger = Logger(Mutex::new(LoggerConfiguration {
            target: None,
            filter: LogFilter { module: None },
            format: LogFormat {
                show_level: false,
                show_log_origin: false,
            },
        }));
        let err = logger
            .update(LoggerConfig {
                log_path: Some(PathBuf::from("/nonexistent/dir/harness.log")),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to open target file"));
    }
}
