use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::*;

use super::address::{Address, Options, RegisterType, Task};
use super::cache::{ErrorRecord, Registry, SlaveCaches};
use super::connection::{Destination, ModbusTransport, Params};
use super::policy::{ErrorState, RequestError};
use super::processor::{AggregateResult, ExecuteError, Processor};
use super::transport::{Transport, TransportError};
use super::worker::{Diagnostics, Driver, Worker};

#[derive(Clone, Debug)]
struct Link {
  transport: Arc<dyn Transport>,
  worker: Arc<Worker>,
  driver: Driver,
  processor: Processor,
}

impl Link {
  fn new(
    transport: Arc<dyn Transport>,
    caches: SlaveCaches,
    termination_timeout: chrono::Duration,
  ) -> Self {
    let link_id = transport.link_id();
    let worker = Arc::new(
      Worker::new(super::queue::Queue::new(), transport.clone(), caches)
        .on_finish(move || tracing::trace!("Drained queue of {}", link_id)),
    );
    let driver = Driver::spawn(worker.clone(), termination_timeout);
    let processor = Processor::new(worker.queue().clone());
    Self {
      transport,
      worker,
      driver,
      processor,
    }
  }
}

/// Physical links and their transaction workers.
#[derive(Clone, Debug)]
pub(crate) struct Service {
  links: Arc<Mutex<HashMap<String, Link>>>,
  registry: Registry,
  termination_timeout: chrono::Duration,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReadError {
  #[error("No link bound for given id")]
  LinkNotFound(String),

  #[error("Failed to connect")]
  FailedToConnect(#[source] RequestError),

  #[error("Failed executing read")]
  Execute(#[from] ExecuteError),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WriteError {
  #[error("No link bound for given id")]
  LinkNotFound(String),

  #[error("Nothing to write")]
  Empty,

  #[error("Failed to connect")]
  FailedToConnect(#[source] RequestError),

  #[error("Failed executing write")]
  Execute(#[from] ExecuteError),
}

impl service::Service for Service {
  fn new(config: config::Values) -> Self {
    Self::empty(config.modbus.termination_timeout)
  }
}

impl Service {
  fn empty(termination_timeout: chrono::Duration) -> Self {
    Self {
      links: Arc::new(Mutex::new(HashMap::new())),
      registry: Registry::new(),
      termination_timeout,
    }
  }

  #[tracing::instrument(skip(self, params))]
  pub(crate) async fn bind(
    &self,
    destination: Destination,
    params: Params,
  ) -> String {
    self
      .bind_transport(Arc::new(ModbusTransport::new(destination, params)))
      .await
  }

  /// Binds a link unless one with the same id already exists.
  #[tracing::instrument(skip_all, fields(link = %transport.link_id()))]
  pub(crate) async fn bind_transport(
    &self,
    transport: Arc<dyn Transport>,
  ) -> String {
    let link_id = transport.link_id();
    let mut links = self.links.clone().lock_owned().await;
    if !links.contains_key(&link_id) {
      let caches = self.registry.for_link(&link_id);
      links.insert(
        link_id.clone(),
        Link::new(transport, caches, self.termination_timeout),
      );
    }
    tracing::trace!("Bound - current links {:?}", links.keys());

    link_id
  }

  pub(crate) async fn link_ids(&self) -> Vec<String> {
    self.links.lock().await.keys().cloned().collect()
  }

  #[tracing::instrument(skip(self, addresses), fields(
    addresses = addresses.len()
  ))]
  pub(crate) async fn read_registers(
    &self,
    link_id: &str,
    slave: u8,
    addresses: &HashSet<Address>,
    options: Options,
  ) -> Result<AggregateResult, ReadError> {
    let link = match self.get_link(link_id).await {
      Some(link) => link,
      None => return Err(ReadError::LinkNotFound(link_id.to_string())),
    };
    let first = addresses
      .iter()
      .min_by_key(|address| (address.register_type, address.address));
    if let Some(first) = first {
      Self::ensure_connected(&link, slave, first)
        .await
        .map_err(ReadError::FailedToConnect)?;
    }

    let result = link.processor.execute(slave, addresses, options).await?;
    tracing::trace!("Read {} addresses", result.len());

    Ok(result)
  }

  #[tracing::instrument(skip(self, data))]
  pub(crate) async fn write_registers(
    &self,
    link_id: &str,
    slave: u8,
    register_type: RegisterType,
    address: u16,
    data: Vec<u16>,
    options: Options,
  ) -> Result<(), WriteError> {
    if data.is_empty() {
      return Err(WriteError::Empty);
    }
    let link = match self.get_link(link_id).await {
      Some(link) => link,
      None => return Err(WriteError::LinkNotFound(link_id.to_string())),
    };
    let address = Address::write(register_type, address, data);
    Self::ensure_connected(&link, slave, &address)
      .await
      .map_err(WriteError::FailedToConnect)?;

    link.processor.write(slave, address, options).await?;
    tracing::trace!("Written");

    Ok(())
  }

  pub(crate) async fn diagnostics(
    &self,
    link_id: &str,
    slave: u8,
  ) -> Option<Diagnostics> {
    self
      .get_link(link_id)
      .await
      .map(|link| link.worker.diagnostics(slave))
  }

  #[tracing::instrument(skip(self))]
  pub(crate) fn cleanup(&self) {
    self.registry.cleanup(chrono::Utc::now());
    tracing::trace!("Cleaned caches");
  }

  /// Drops every pending entry of a link and fails it as cancelled.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn reset(&self, link_id: &str) -> usize {
    match self.get_link(link_id).await {
      Some(link) => Self::cancel_pending(&link),
      None => 0,
    }
  }

  /// Removes a link, stops its driver and fails whatever it left queued.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn stop(&self, link_id: &str) {
    let link = {
      let mut links = self.links.clone().lock_owned().await;
      links.remove(link_id)
    };

    if let Some(link) = link {
      if let Err(error) = link.driver.terminate().await {
        // NOTE: error -> trace because this means it already terminated
        tracing::trace!("Failed terminating link driver {}", error)
      }
      Self::cancel_pending(&link);
    }
  }

  #[tracing::instrument(skip(self))]
  pub(crate) async fn terminate(&self) {
    for link_id in self.link_ids().await {
      self.stop(&link_id).await;
    }
  }

  fn cancel_pending(link: &Link) -> usize {
    let dropped = link.worker.queue().clear();
    for entry in &dropped {
      let error = RequestError::new(
        ErrorState::Other,
        entry.error_count,
        TransportError::Cancelled,
      );
      entry.callback.error(entry, &error);
    }
    tracing::debug!(
      "Dropped {} entries of {}",
      dropped.len(),
      link.transport.link_id()
    );

    dropped.len()
  }

  async fn get_link(&self, link_id: &str) -> Option<Link> {
    self.links.lock().await.get(link_id).cloned()
  }

  async fn ensure_connected(
    link: &Link,
    slave: u8,
    address: &Address,
  ) -> Result<(), RequestError> {
    if link.transport.is_connected().await {
      return Ok(());
    }

    match link.transport.connect().await {
      Ok(()) => {
        tracing::debug!("Connected {}", link.transport.link_id());
        Ok(())
      }
      Err(error) => {
        tracing::warn!(
          "Failed connecting {} {}",
          link.transport.link_id(),
          error
        );
        link.worker.caches().with(slave, |cache| {
          cache.add_error(ErrorRecord {
            timestamp: chrono::Utc::now(),
            task: Task::InitialConnect,
            address: address.clone(),
            state: ErrorState::InitialConnect,
          })
        });
        Err(RequestError::new(ErrorState::InitialConnect, 1, error))
      }
    }
  }
}
