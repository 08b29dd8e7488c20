// ── Logger collaborator ──
//
// The device client reports lifecycle milestones through a small
// synchronous `Logger` interface. The default forwards to `tracing`.

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use strum::{Display, EnumString, FromRepr};
use tracing::{debug, info};

use crate::error::CoreError;

/// Verbosity of the client's own log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[repr(u8)]
pub enum LogLevel {
    /// Nothing is logged.
    #[default]
    Disabled,
    /// Public API milestones only.
    ApiOnly,
    /// Milestones plus debug detail.
    All,
}

impl LogLevel {
    /// Parse `DISABLED`, `API_ONLY` or `ALL`, ignoring case.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        Self::from_str(name).map_err(|_| CoreError::InvalidLogLevel {
            name: name.to_owned(),
        })
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Disabled => 0,
            LogLevel::ApiOnly => 1,
            LogLevel::All => 2,
        }
    }
}

/// Sink for client lifecycle messages.
pub trait Logger: Send + Sync {
    fn set_log_level(&self, level: LogLevel);
    fn log(&self, message: &str, tag: Option<&str>);
    fn debug(&self, message: &str, tag: Option<&str>);
}

/// [`Logger`] backed by `tracing` (`info` for `log`, `debug` for `debug`).
#[derive(Debug, Default)]
pub struct TracingLogger {
    level: AtomicU8,
}

impl TracingLogger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level: AtomicU8::new(level.into()),
        }
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_repr(self.level.load(Ordering::Relaxed)).unwrap_or_default()
    }
}

impl Logger for TracingLogger {
    fn set_log_level(&self, level: LogLevel) {
        self.level.store(level.into(), Ordering::Relaxed);
    }

    fn log(&self, message: &str, tag: Option<&str>) {
        if self.level() != LogLevel::Disabled {
            info!(tag = tag.unwrap_or_default(), "{message}");
        }
    }

    fn debug(&self, message: &str, tag: Option<&str>) {
        if self.level() == LogLevel::All {
            debug!(tag = tag.unwrap_or_default(), "{message}");
        }
    }
}
