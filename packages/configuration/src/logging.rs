use serde::{Deserialize, Serialize};

/// Logging level. A host application may translate this directly into a
/// `tracing` filter directive (`info`, `debug`, ...).
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        write!(f, "{s}")
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Logging {
    #[serde(default = "Logging::default_log_level")]
    pub log_level: LogLevel,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl Logging {
    fn default_log_level() -> LogLevel {
        LogLevel::Info
    }
}
