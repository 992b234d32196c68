use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::service::modbus::{Destination, Options, RegisterType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Link {
  #[serde(flatten)]
  pub(crate) destination: Destination,
  pub(crate) timeout: Option<u32>,
  #[serde(default)]
  pub(crate) slave_timeouts: HashMap<u8, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Register {
  pub(crate) register_type: RegisterType,
  pub(crate) address: u16,
  pub(crate) length: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Poll {
  pub(crate) link: String,
  pub(crate) slave: u8,
  pub(crate) registers: Vec<Register>,
  #[serde(default)]
  pub(crate) options: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Write {
  pub(crate) link: String,
  pub(crate) slave: u8,
  pub(crate) register_type: RegisterType,
  pub(crate) address: u16,
  pub(crate) values: Vec<u16>,
  pub(crate) options: Option<Options>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Modbus {
  pub(crate) termination_timeout: Option<u32>,
  pub(crate) max_queue_depth: Option<usize>,
  #[serde(default)]
  pub(crate) links: HashMap<String, Link>,
  #[serde(default)]
  pub(crate) poll: Vec<Poll>,
  #[serde(default)]
  pub(crate) write: Vec<Write>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Values {
  pub(crate) log_level: Option<LogLevel>,
  pub(crate) cleanup_interval: Option<u32>,
  pub(crate) poll_interval: Option<u32>,
  pub(crate) health_interval: Option<u32>,
  pub(crate) write_interval: Option<u32>,
  #[serde(default)]
  pub(crate) modbus: Modbus,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed creating project directories")]
  MissingProjectDirs,

  #[error("Failed reading config file")]
  Read(#[from] std::io::Error),

  #[error("Config file is missing an extension")]
  MissingExtension,

  #[error("Config file has invalid extension")]
  InvalidExtension,

  #[error("Failed deserializing config from yaml")]
  DeserializetionYaml(#[from] serde_yaml::Error),

  #[error("Failed deserializing config from toml")]
  DeserializetionToml(#[from] toml::de::Error),

  #[error("Failed deserializing config from json")]
  DeserializetionJson(#[from] serde_json::Error),
}

pub(crate) async fn parse_async(
  location: Option<&str>,
) -> Result<Values, ParseError> {
  let location = match location {
    Some(location) => std::path::PathBuf::from(location),
    None => {
      match directories::ProjectDirs::from("com", "modbridge", "modbridge") {
        Some(project_dirs) => project_dirs.config_dir().join("config.yaml"),
        None => return Err(ParseError::MissingProjectDirs),
      }
    }
  };

  let values = {
    let raw = tokio::fs::read_to_string(location.clone()).await?;
    match location.extension().and_then(|str| str.to_str()) {
      None => return Err(ParseError::MissingExtension),
      Some("yaml" | "yml") => serde_yaml::from_str::<Values>(raw.as_str())?,
      Some("toml") => toml::from_str::<Values>(raw.as_str())?,
      Some("json") => serde_json::from_str::<Values>(raw.as_str())?,
      Some(_) => return Err(ParseError::InvalidExtension),
    }
  };

  Ok(values)
}

pub(crate) fn milliseconds_to_chrono(milliseconds: u32) -> chrono::Duration {
  chrono::Duration::milliseconds(milliseconds as i64)
}
