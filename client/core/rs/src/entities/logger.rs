use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq,
)]
pub struct LogConfig {
  /// Minimum level at which to emit logs.
  #[serde(default)]
  pub level: LogLevel,
  /// Mode to write logs to stdio.
  #[serde(default)]
  pub stdio: StdioLogMode,
  /// Use pretty (multi line) logging in standard mode.
  #[serde(default)]
  pub pretty: bool,
}

#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  #[default]
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(value: LogLevel) -> Self {
    match value {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

impl From<tracing::Level> for LogLevel {
  fn from(value: tracing::Level) -> Self {
    match value {
      tracing::Level::TRACE => LogLevel::Trace,
      tracing::Level::DEBUG => LogLevel::Debug,
      tracing::Level::INFO => LogLevel::Info,
      tracing::Level::WARN => LogLevel::Warn,
      tracing::Level::ERROR => LogLevel::Error,
    }
  }
}

#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
