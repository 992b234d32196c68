use futures::future::join_all;

use crate::*;

pub(crate) struct Process {
  config: config::Manager,
  services: service::Container,
}

impl Process {
  pub(crate) fn new(
    config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self { config, services }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Recurring for Process {
  #[tracing::instrument(skip(self))]
  async fn execute(&self) -> anyhow::Result<()> {
    let config = self.config.reload().await;
    if config.nopoll {
      tracing::trace!("Polling disabled");
      return Ok(());
    }

    let polled =
      join_all(config.modbus.poll.iter().map(|poll| self.poll(poll))).await;

    tracing::info!(
      "Polled {:?} targets of which {:?} failed",
      polled.len(),
      polled.iter().filter(|polled| polled.is_err()).count(),
    );

    Ok(())
  }
}

impl Process {
  #[tracing::instrument(skip_all, fields(
    link = %poll.link_id,
    slave = poll.slave,
  ))]
  async fn poll(&self, poll: &config::Poll) -> anyhow::Result<()> {
    let result = match self
      .services
      .modbus()
      .read_registers(&poll.link_id, poll.slave, &poll.addresses, poll.options)
      .await
    {
      Ok(result) => result,
      Err(error) => {
        tracing::warn!("Failed polling {}", error);
        return Err(error.into());
      }
    };

    let failed = result
      .holding_registers
      .values()
      .chain(result.analog_inputs.values())
      .chain(result.coils.values())
      .chain(result.discrete_inputs.values())
      .filter(|register| register.error.is_some())
      .count();
    tracing::info!(
      "Polled {} addresses with {} failed {}",
      result.len(),
      failed,
      serde_json::to_string(&result)?
    );

    Ok(())
  }
}
