//! The daemon's own settings (spec §3 `DaemonConfig`, SPEC_FULL §4.G),
//! not the filesystem's rendered content, only operational tuning: log
//! destinations, the executable-template driver's poll granularity, and
//! the default config-store document path. Loaded from an optional TOML
//! file (`serde` + `toml::from_str`, the same pattern `diffuzzer`'s
//! `config.rs` uses for its own settings), with defaults applying when
//! absent.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::TemplateFsError;
use crate::logging::LogDestination;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub logging: LoggingConfig,
    /// Seconds the executable-template driver's `poll` waits per
    /// iteration before re-checking for hang-up (spec §4.D: "a 10s
    /// timeout... not a deadline").
    pub exec_poll_timeout_secs: u64,
    /// Default config-store document, used when no mount-time override
    /// is given.
    pub config_store_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            logging: LoggingConfig::default(),
            exec_poll_timeout_secs: 10,
            config_store_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub destination: LogDestination,
    pub file_path: Option<PathBuf>,
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            destination: LogDestination::Stderr,
            file_path: None,
            level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
                log::LevelFilter::Error
            }
            LogLevel::Warning | LogLevel::Notice => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &PathBuf) -> Result<Self, TemplateFsError> {
        let text = std::fs::read_to_string(path).map_err(|source| TemplateFsError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| TemplateFsError::ConfigParse {
            path: path.clone(),
            source,
        })
    }

    pub fn load_or_default(path: Option<&PathBuf>) -> Result<Self, TemplateFsError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(DaemonConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = DaemonConfig::load_or_default(None).unwrap();
        assert_eq!(config.exec_poll_timeout_secs, 10);
    }

    #[test]
    fn partial_toml_fills_remaining_fields_with_defaults() {
        let config: DaemonConfig = toml::from_str("exec_poll_timeout_secs = 30\n").unwrap();
        assert_eq!(config.exec_poll_timeout_secs, 30);
        assert_eq!(config.logging.level, LogLevel::Info);
    }
}
