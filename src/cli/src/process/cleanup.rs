use crate::*;

pub(crate) struct Process {
  services: service::Container,
}

impl Process {
  pub(crate) fn new(
    _config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self { services }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Recurring for Process {
  #[tracing::instrument(skip(self))]
  async fn execute(&self) -> anyhow::Result<()> {
    self.services.modbus().cleanup();

    Ok(())
  }
}
