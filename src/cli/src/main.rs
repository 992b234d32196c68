#![deny(
  unsafe_code,
  // reason = "Let's just not do it"
)]
#![deny(
  clippy::unwrap_used,
  clippy::expect_used,
  clippy::panic,
  clippy::unreachable,
  // reason = "We have to handle errors properly"
)]
#![cfg_attr(
  test,
  allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)
)]

mod config;
mod process;
mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config::Manager::new().await?;

  let services_config = config.values().await;
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::builder()
        .with_default_directive(services_config.log_level.into())
        .from_env_lossy(),
    )
    .init();
  tracing::info!(
    "Starting with {} links and {} poll targets",
    services_config.modbus.links.len(),
    services_config.modbus.poll.len()
  );

  let links = services_config.modbus.links.clone();
  let services = service::Container::new(services_config);
  for link in links.into_values() {
    services
      .modbus()
      .bind(
        link.destination,
        service::modbus::connection::Params::new(
          link.timeout,
          link.slave_timeouts,
        ),
      )
      .await;
  }
  let processes = process::Container::new(config, services.clone());

  processes.spawn().await;
  tokio::signal::ctrl_c().await?;
  tracing::info!("Shutting down");
  processes.cancel().await;
  services.modbus().terminate().await;

  Ok(())
}
