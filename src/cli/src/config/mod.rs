mod args;
mod env;
mod file;

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  sync::Arc,
};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::service::modbus::address::Task;
use crate::service::modbus::{Address, Destination, Options, RegisterType};

#[derive(Debug, Clone)]
pub(crate) struct Link {
  pub(crate) destination: Destination,
  pub(crate) timeout: chrono::Duration,
  pub(crate) slave_timeouts: HashMap<u8, chrono::Duration>,
}

/// Registers read on every poll tick.
#[derive(Debug, Clone)]
pub(crate) struct Poll {
  pub(crate) link_id: String,
  pub(crate) slave: u8,
  pub(crate) addresses: HashSet<Address>,
  pub(crate) options: Options,
}

/// Values written on every write tick.
#[derive(Debug, Clone)]
pub(crate) struct Write {
  pub(crate) link_id: String,
  pub(crate) slave: u8,
  pub(crate) register_type: RegisterType,
  pub(crate) address: u16,
  pub(crate) values: Vec<u16>,
  pub(crate) options: Options,
}

#[derive(Debug, Clone)]
pub(crate) struct Modbus {
  pub(crate) termination_timeout: chrono::Duration,
  pub(crate) max_queue_depth: usize,
  pub(crate) links: HashMap<String, Link>,
  pub(crate) poll: Vec<Poll>,
  pub(crate) write: Vec<Write>,
}

impl Modbus {
  /// Slaves any poll or write target addresses on a link.
  pub(crate) fn slaves(&self, link_id: &str) -> BTreeSet<u8> {
    self
      .poll
      .iter()
      .filter(|poll| poll.link_id == link_id)
      .map(|poll| poll.slave)
      .chain(
        self
          .write
          .iter()
          .filter(|write| write.link_id == link_id)
          .map(|write| write.slave),
      )
      .collect()
  }
}

#[derive(Debug, Clone)]
pub(crate) struct Values {
  pub(crate) log_level: tracing::level_filters::LevelFilter,
  pub(crate) nopoll: bool,
  pub(crate) cleanup_interval: chrono::Duration,
  pub(crate) poll_interval: chrono::Duration,
  pub(crate) health_interval: chrono::Duration,
  pub(crate) write_interval: chrono::Duration,
  pub(crate) modbus: Modbus,
}

#[derive(Debug, Clone)]
struct Unparsed {
  from_args: args::Values,
  from_env: env::Values,
  from_file: file::Values,
}

#[derive(Debug, Clone)]
pub(crate) struct Manager {
  lock: Arc<Mutex<Unparsed>>,
}

#[derive(Debug, Error)]
pub(crate) enum ReadError {
  #[error("Failed reading file")]
  FileReadError(#[from] file::ParseError),

  #[error("Failed reading env")]
  EnvReadError(#[from] env::ParseError),
}

impl Manager {
  pub(crate) async fn new() -> Result<Self, ReadError> {
    let config = Self::read_async().await?;

    let config_manager = Self {
      lock: Arc::new(Mutex::new(config)),
    };

    Ok(config_manager)
  }

  pub(crate) async fn values(&self) -> Values {
    let config = self.lock.lock().await.clone();

    Self::parse(config)
  }

  #[tracing::instrument(skip(self))]
  pub(crate) async fn reload(&self) -> Values {
    let config = {
      let mut values = self.lock.lock().await;
      let from_file =
        file::parse_async(values.from_args.config.as_deref()).await;
      match from_file {
        Ok(from_file) => values.from_file = from_file,
        Err(error) => {
          tracing::error!("Failed parsing config file {}", error)
        }
      }
      values.clone()
    };

    Self::parse(config)
  }

  fn parse(config: Unparsed) -> Values {
    let links = config
      .from_file
      .modbus
      .links
      .into_iter()
      .map(|(name, link)| {
        (
          name,
          Link {
            destination: link.destination,
            timeout: file::milliseconds_to_chrono(
              link.timeout.unwrap_or(1000),
            ),
            slave_timeouts: link
              .slave_timeouts
              .into_iter()
              .map(|(slave, timeout)| {
                (slave, file::milliseconds_to_chrono(timeout))
              })
              .collect(),
          },
        )
      })
      .collect::<HashMap<_, _>>();

    let link_id = |name: &str| match links.get(name) {
      Some(link) => Some(link.destination.link_id()),
      None => {
        tracing::warn!("Target references unknown link {}", name);
        None
      }
    };

    let poll = config
      .from_file
      .modbus
      .poll
      .into_iter()
      .filter_map(|poll| {
        let link_id = link_id(poll.link.as_str())?;
        Some(Poll {
          link_id,
          slave: poll.slave,
          addresses: poll
            .registers
            .into_iter()
            .map(|register| {
              Address::range(
                register.register_type,
                register.address,
                register.length.unwrap_or(1),
              )
            })
            .collect(),
          options: poll.options,
        })
      })
      .collect::<Vec<_>>();

    let write = config
      .from_file
      .modbus
      .write
      .into_iter()
      .filter_map(|write| {
        Some(Write {
          link_id: link_id(write.link.as_str())?,
          slave: write.slave,
          register_type: write.register_type,
          address: write.address,
          values: write.values,
          options: write
            .options
            .unwrap_or_else(|| Options::new(Task::WriteEntity)),
        })
      })
      .collect::<Vec<_>>();

    Values {
      log_level: config
        .from_env
        .log_level
        .or(config.from_file.log_level)
        .map_or_else(
          || {
            if config.from_args.trace {
              tracing::level_filters::LevelFilter::TRACE
            } else {
              #[cfg(debug_assertions)]
              {
                tracing::level_filters::LevelFilter::DEBUG
              }
              #[cfg(not(debug_assertions))]
              {
                tracing::level_filters::LevelFilter::INFO
              }
            }
          },
          |log_level| match log_level {
            file::LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
            file::LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            file::LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            file::LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
            file::LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
          },
        ),
      nopoll: config.from_env.nopoll,
      cleanup_interval: file::milliseconds_to_chrono(
        config.from_file.cleanup_interval.unwrap_or(60_000),
      ),
      poll_interval: file::milliseconds_to_chrono(
        config.from_file.poll_interval.unwrap_or(60_000),
      ),
      health_interval: file::milliseconds_to_chrono(
        config.from_file.health_interval.unwrap_or(60_000),
      ),
      write_interval: file::milliseconds_to_chrono(
        config.from_file.write_interval.unwrap_or(60_000),
      ),
      modbus: Modbus {
        termination_timeout: file::milliseconds_to_chrono(
          config
            .from_file
            .modbus
            .termination_timeout
            .unwrap_or(10_000),
        ),
        max_queue_depth: config
          .from_file
          .modbus
          .max_queue_depth
          .unwrap_or(1000),
        links,
        poll,
        write,
      },
    }
  }

  async fn read_async() -> Result<Unparsed, ReadError> {
    let from_args = args::parse();
    let from_env = env::parse()?;
    let from_file = file::parse_async(from_args.config.as_deref()).await?;

    Ok(Unparsed {
      from_args,
      from_env,
      from_file,
    })
  }
}

#[cfg(test)]
impl Values {
  /// Defaults with no links, as if read from an empty file.
  pub(crate) fn empty() -> Self {
    Manager::parse(Unparsed {
      from_args: args::Values::default(),
      from_env: env::Values::default(),
      from_file: file::Values::default(),
    })
  }
}

#[cfg(test)]
impl Manager {
  pub(crate) fn from_yaml(yaml: &str) -> Self {
    Self {
      lock: Arc::new(Mutex::new(Unparsed {
        from_args: args::Values::default(),
        from_env: env::Values::default(),
        from_file: serde_yaml::from_str(yaml).unwrap(),
      })),
    }
  }
}
