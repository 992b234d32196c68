use std::time::Duration;

use super::address::RegisterType;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
  #[error("Request timed out")]
  Timeout,

  #[error("Frame corrupted: {0}")]
  Crc(String),

  #[error("Modbus exception {0}")]
  Exception(u8),

  #[error("Link is not connected")]
  NotConnected,

  #[error("Cannot write {0}")]
  Unsupported(RegisterType),

  #[error("Expected {expected} values but received {received}")]
  ShortResponse { expected: u16, received: usize },

  #[error("Request was dropped from the queue")]
  Cancelled,

  #[error("Transport failed")]
  Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub(crate) struct ReadResult {
  pub(crate) data: Vec<u16>,
  pub(crate) duration: Duration,
}

/// One physical link: a serial port or a TCP endpoint.
///
/// Implementations must tolerate concurrent `connect` calls and open the
/// link at most once.
#[async_trait::async_trait]
pub(crate) trait Transport: std::fmt::Debug + Send + Sync {
  fn link_id(&self) -> String;

  async fn is_connected(&self) -> bool;

  async fn connect(&self) -> Result<(), TransportError>;

  async fn reconnect(&self, task: &str) -> Result<(), TransportError>;

  async fn read(
    &self,
    register_type: RegisterType,
    slave: u8,
    address: u16,
    length: u16,
  ) -> Result<ReadResult, TransportError>;

  async fn write(
    &self,
    register_type: RegisterType,
    slave: u8,
    address: u16,
    data: &[u16],
  ) -> Result<(), TransportError>;
}
