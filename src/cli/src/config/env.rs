use super::file::LogLevel;

#[derive(Debug, Clone, Default)]
pub(crate) struct Values {
  pub(crate) log_level: Option<LogLevel>,
  pub(crate) nopoll: bool,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Invalid log level {0}")]
  InvalidLogLevel(String),
}

pub(crate) fn parse() -> Result<Values, ParseError> {
  let _ = dotenv::dotenv();

  let log_level = match std::env::var("MODBRIDGE_LOG_LEVEL") {
    Ok(log_level) => Some(parse_log_level(&log_level)?),
    Err(_) => None,
  };

  let values = Values {
    log_level,
    nopoll: std::env::var("MODBRIDGE_NOPOLL")
      .map_or_else(|_| false, |_| true),
  };

  Ok(values)
}

fn parse_log_level(log_level: &str) -> Result<LogLevel, ParseError> {
  match log_level.trim().to_lowercase().as_str() {
    "trace" => Ok(LogLevel::Trace),
    "debug" => Ok(LogLevel::Debug),
    "info" => Ok(LogLevel::Info),
    "warn" | "warning" => Ok(LogLevel::Warn),
    "error" => Ok(LogLevel::Error),
    _ => Err(ParseError::InvalidLogLevel(log_level.to_string())),
  }
}
