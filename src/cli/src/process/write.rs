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
    let config = self.config.values().await;
    if config.modbus.write.is_empty() {
      tracing::trace!("Nothing to write");
      return Ok(());
    }

    let written =
      join_all(config.modbus.write.iter().map(|write| self.write(write)))
        .await;

    tracing::info!(
      "Wrote {:?} targets of which {:?} failed",
      written.len(),
      written.iter().filter(|written| written.is_err()).count(),
    );

    Ok(())
  }
}

impl Process {
  #[tracing::instrument(skip_all, fields(
    link = %write.link_id,
    slave = write.slave,
    address = write.address,
  ))]
  async fn write(&self, write: &config::Write) -> anyhow::Result<()> {
    if let Err(error) = self
      .services
      .modbus()
      .write_registers(
        &write.link_id,
        write.slave,
        write.register_type,
        write.address,
        write.values.clone(),
        write.options,
      )
      .await
    {
      tracing::warn!("Failed writing {}", error);
      return Err(error.into());
    }

    Ok(())
  }
}
