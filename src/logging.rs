//! The logging façade (spec §6 "Logging"): level-tagged records (plus a
//! `trace` function-trace channel), routed per level to one of
//! {void, syslog, file, stderr}. Built on the `log` facade with `log4rs`
//! as the backend, the same stack `diffuzzer` uses for per-destination,
//! per-level routing (SPEC_FULL §4.H). No syslog crate appears anywhere
//! in this corpus, so the syslog destination is a small custom
//! `log4rs::append::Append` built on the `libc` already in the
//! dependency stack rather than an unattested crate.

use std::ffi::CString;

use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config as Log4rsConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::Deserialize;

use crate::daemon_config::LoggingConfig;
use crate::error::TemplateFsError;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    Void,
    Syslog,
    File,
    Stderr,
}

impl Default for LogDestination {
    fn default() -> Self {
        LogDestination::Stderr
    }
}

/// `%l` = level name, `%f:%L` = file:line (spec §6: "prefixed by level
/// name unless destination is syslog, optionally suffixed with
/// `@file:line`").
const PATTERN_DEFAULT: &str = "{l} {m}{n}";
const PATTERN_WITH_LOCATION: &str = "{l} {m} @{f}:{L}{n}";
const PATTERN_SYSLOG: &str = "{m}{n}";

/// Installs the process-wide `log4rs` logger per `config`. Call once at
/// daemon startup, before the first `log::info!`/etc.
pub fn init(config: &LoggingConfig, with_location: bool) -> Result<(), TemplateFsError> {
    let level = config.level.to_level_filter();
    let pattern = if with_location { PATTERN_WITH_LOCATION } else { PATTERN_DEFAULT };

    let log_config = match config.destination {
        LogDestination::Void => Log4rsConfig::builder()
            .build(Root::builder().build(log::LevelFilter::Off))
            .expect("an empty root config is always valid"),
        LogDestination::Stderr => {
            let appender = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(pattern)))
                .target(log4rs::append::console::Target::Stderr)
                .build();
            Log4rsConfig::builder()
                .appender(Appender::builder().build("stderr", Box::new(appender)))
                .build(Root::builder().appender("stderr").build(level))
                .expect("valid stderr appender config")
        }
        LogDestination::File => {
            let path = config
                .file_path
                .clone()
                .unwrap_or_else(|| "templatefs.log".into());
            let appender = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(pattern)))
                .build(&path)
                .map_err(|_| TemplateFsError::InvalidPath(path.clone()))?;
            Log4rsConfig::builder()
                .appender(Appender::builder().build("file", Box::new(appender)))
                .build(Root::builder().appender("file").build(level))
                .expect("valid file appender config")
        }
        LogDestination::Syslog => {
            let appender = SyslogAppender::new(Box::new(PatternEncoder::new(PATTERN_SYSLOG)));
            Log4rsConfig::builder()
                .appender(Appender::builder().build("syslog", Box::new(appender)))
                .build(Root::builder().appender("syslog").build(level))
                .expect("valid syslog appender config")
        }
    };

    log4rs::init_config(log_config)
        .map_err(|_| TemplateFsError::InvalidPath("log4rs config".into()))?;
    Ok(())
}

/// A `log4rs` appender that hands each record to `libc::syslog`. Spec §6:
/// "message format is one line per record... unless destination is
/// syslog": syslog supplies its own level prefix, so this appender's
/// encoder drops the `{l}` token entirely (`PATTERN_SYSLOG`).
#[derive(Debug)]
struct SyslogAppender {
    encoder: Box<dyn log4rs::encode::Encode>,
}

impl SyslogAppender {
    fn new(encoder: Box<dyn log4rs::encode::Encode>) -> Self {
        unsafe {
            libc::openlog(
                c"templatefs".as_ptr(),
                libc::LOG_PID | libc::LOG_CONS,
                libc::LOG_DAEMON,
            );
        }
        SyslogAppender { encoder }
    }

    fn syslog_priority(level: log::Level) -> libc::c_int {
        match level {
            log::Level::Error => libc::LOG_ERR,
            log::Level::Warn => libc::LOG_WARNING,
            log::Level::Info => libc::LOG_INFO,
            log::Level::Debug | log::Level::Trace => libc::LOG_DEBUG,
        }
    }
}

impl Append for SyslogAppender {
    fn append(&self, record: &log::Record) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        let mut writer = log4rs::encode::writer::simple::SimpleWriter(&mut buf);
        self.encoder.encode(&mut writer, record)?;
        let text = String::from_utf8_lossy(&buf);
        if let Ok(line) = CString::new(text.trim_end().as_bytes()) {
            unsafe {
                libc::syslog(Self::syslog_priority(record.level()), c"%s".as_ptr(), line.as_ptr());
            }
        }
        Ok(())
    }

    fn flush(&self) {}
}
