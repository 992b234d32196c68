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
    let modbus = self.services.modbus();

    for link_id in modbus.link_ids().await {
      let mut queue_depth = 0;
      for slave in config.modbus.slaves(&link_id) {
        let diagnostics = match modbus.diagnostics(&link_id, slave).await {
          Some(diagnostics) => diagnostics,
          None => continue,
        };
        queue_depth = queue_depth.max(diagnostics.queue_depth);
        tracing::info!(
          "Health of {} slave {} {}",
          link_id,
          slave,
          serde_json::to_string(&diagnostics)?
        );
      }

      if queue_depth > config.modbus.max_queue_depth {
        let dropped = modbus.reset(&link_id).await;
        tracing::warn!(
          "Reset {} with {} queued entries, dropped {}",
          link_id,
          queue_depth,
          dropped
        );
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::sync::Arc;

  use super::*;
  use crate::process::Recurring;
  use crate::service::modbus::mock::MockTransport;
  use crate::service::modbus::transport::TransportError;
  use crate::service::modbus::{Address, Options, RegisterType};

  const CONFIG: &str = r#"
modbus:
  max_queue_depth: 2
  links:
    meter:
      kind: tcp
      host: localhost
      port: 5020
  poll:
    - link: meter
      slave: 1
      registers: []
"#;

  #[tokio::test]
  async fn resets_links_with_deep_queues() {
    let config = config::Manager::from_yaml(CONFIG);
    let services = service::Container::new(config.values().await);
    let transport = Arc::new(
      MockTransport::new()
        .named("localhost:5020")
        .always(|| TransportError::Timeout),
    );
    let link = services.modbus().bind_transport(transport.clone()).await;
    let addresses = (0..50)
      .map(|index| Address::new(RegisterType::HoldingRegister, index * 20))
      .collect::<HashSet<_>>();

    let read = tokio::spawn({
      let services = services.clone();
      async move {
        services
          .modbus()
          .read_registers(&link, 1, &addresses, Options::default())
          .await
      }
    });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    Process::new(config, services.clone()).execute().await.unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(1), read)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(result.len(), 50);
    let cancelled = result
      .holding_registers
      .values()
      .filter_map(|register| register.error.as_ref())
      .filter(|error| matches!(*error.source, TransportError::Cancelled))
      .count();
    assert!(cancelled > 0);
    assert!(transport.call_count() < 50);
    services.modbus().terminate().await;
  }

  #[tokio::test]
  async fn shallow_queues_are_left_alone() {
    let config = config::Manager::from_yaml(CONFIG);
    let services = service::Container::new(config.values().await);
    let transport = Arc::new(MockTransport::new().named("localhost:5020"));
    let link = services.modbus().bind_transport(transport.clone()).await;
    services
      .modbus()
      .read_registers(
        &link,
        1,
        &HashSet::from([Address::new(RegisterType::Coils, 3)]),
        Options::default(),
      )
      .await
      .unwrap();

    Process::new(config, services.clone()).execute().await.unwrap();

    let diagnostics = services.modbus().diagnostics(&link, 1).await.unwrap();
    assert_eq!(diagnostics.queue_depth, 0);
    assert_eq!(transport.call_count(), 1);
    services.modbus().terminate().await;
  }
}
