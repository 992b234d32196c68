use std::collections::HashMap;
use std::time::Instant;

use futures_time::future::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};

use super::address::RegisterType;
use super::transport::{ReadResult, Transport, TransportError};

#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum Destination {
  Tcp { host: String, port: u16 },
  Rtu { path: String, baud_rate: u32 },
}

impl Destination {
  /// Key of the link in the cache registry.
  pub(crate) fn link_id(&self) -> String {
    match self {
      Destination::Tcp { host, port } => format!("{host}:{port}"),
      Destination::Rtu { path, .. } => path.clone(),
    }
  }
}

#[derive(Clone, Debug)]
pub(crate) struct Params {
  timeout: chrono::Duration,
  slave_timeouts: HashMap<u8, chrono::Duration>,
}

impl Params {
  pub(crate) fn new(
    timeout: chrono::Duration,
    slave_timeouts: HashMap<u8, chrono::Duration>,
  ) -> Self {
    Self {
      timeout,
      slave_timeouts,
    }
  }

  pub(crate) fn timeout(&self, slave: u8) -> chrono::Duration {
    self
      .slave_timeouts
      .get(&slave)
      .copied()
      .unwrap_or(self.timeout)
  }
}

#[derive(Debug, Default)]
struct State {
  ctx: Option<Context>,
  timed_out: bool,
}

/// Modbus RTU or TCP link backed by a tokio-modbus client context.
#[derive(Debug)]
pub(crate) struct ModbusTransport {
  destination: Destination,
  params: Params,
  state: Mutex<State>,
}

impl ModbusTransport {
  pub(crate) fn new(destination: Destination, params: Params) -> Self {
    Self {
      destination,
      params,
      state: Mutex::new(State::default()),
    }
  }

  #[tracing::instrument(skip_all, fields(destination = ?self.destination))]
  async fn open(&self) -> Result<Context, TransportError> {
    let timeout = timeout_from_chrono(self.params.timeout);
    let ctx = match &self.destination {
      Destination::Tcp { host, port } => {
        let stream = flatten_result(
          TcpStream::connect((host.as_str(), *port))
            .timeout(timeout)
            .await,
        )?;
        tcp::attach(stream)
      }
      Destination::Rtu { path, baud_rate } => {
        let builder = tokio_serial::new(path, *baud_rate);
        let stream = tokio_serial::SerialStream::open(&builder)
          .map_err(std::io::Error::from)?;
        rtu::attach(stream)
      }
    };
    tracing::trace!("Opened");

    Ok(ctx)
  }
}

#[async_trait::async_trait]
impl Transport for ModbusTransport {
  fn link_id(&self) -> String {
    self.destination.link_id()
  }

  async fn is_connected(&self) -> bool {
    self.state.lock().await.ctx.is_some()
  }

  async fn connect(&self) -> Result<(), TransportError> {
    let mut state = self.state.lock().await;
    if state.ctx.is_none() {
      state.ctx = Some(self.open().await?);
      state.timed_out = false;
    }

    Ok(())
  }

  #[tracing::instrument(skip(self), fields(destination = ?self.destination))]
  async fn reconnect(&self, task: &str) -> Result<(), TransportError> {
    let mut state = self.state.lock().await;
    // NOTE: reopening right after a timeout only loses the late response
    if state.timed_out && state.ctx.is_some() {
      tracing::trace!("Skipped reconnect after timeout");
      state.timed_out = false;
      return Ok(());
    }

    state.ctx = None;
    state.ctx = Some(self.open().await?);
    state.timed_out = false;
    tracing::debug!("Reconnected");

    Ok(())
  }

  async fn read(
    &self,
    register_type: RegisterType,
    slave: u8,
    address: u16,
    length: u16,
  ) -> Result<ReadResult, TransportError> {
    let timeout = timeout_from_chrono(self.params.timeout(slave));
    let mut state = self.state.lock().await;
    let ctx = state.ctx.as_mut().ok_or(TransportError::NotConnected)?;
    ctx.set_slave(Slave(slave));

    let started = Instant::now();
    let result = match register_type {
      RegisterType::Coils => flatten_result(
        ctx.read_coils(address, length).timeout(timeout).await,
      )
      .map(bools_to_words),
      RegisterType::DiscreteInputs => flatten_result(
        ctx
          .read_discrete_inputs(address, length)
          .timeout(timeout)
          .await,
      )
      .map(bools_to_words),
      RegisterType::HoldingRegister => flatten_result(
        ctx
          .read_holding_registers(address, length)
          .timeout(timeout)
          .await,
      ),
      RegisterType::AnalogInputs => flatten_result(
        ctx
          .read_input_registers(address, length)
          .timeout(timeout)
          .await,
      ),
    };
    state.timed_out = matches!(result, Err(TransportError::Timeout));

    Ok(ReadResult {
      data: result?,
      duration: started.elapsed(),
    })
  }

  async fn write(
    &self,
    register_type: RegisterType,
    slave: u8,
    address: u16,
    data: &[u16],
  ) -> Result<(), TransportError> {
    let timeout = timeout_from_chrono(self.params.timeout(slave));
    let mut state = self.state.lock().await;
    let ctx = state.ctx.as_mut().ok_or(TransportError::NotConnected)?;
    ctx.set_slave(Slave(slave));

    let result = match (register_type, data) {
      (RegisterType::Coils, [value]) => flatten_result(
        ctx
          .write_single_coil(address, *value != 0)
          .timeout(timeout)
          .await,
      ),
      (RegisterType::Coils, values) => {
        let coils = words_to_bools(values);
        flatten_result(
          ctx
            .write_multiple_coils(address, &coils)
            .timeout(timeout)
            .await,
        )
      }
      (RegisterType::HoldingRegister, [value]) => flatten_result(
        ctx
          .write_single_register(address, *value)
          .timeout(timeout)
          .await,
      ),
      (RegisterType::HoldingRegister, values) => flatten_result(
        ctx
          .write_multiple_registers(address, values)
          .timeout(timeout)
          .await,
      ),
      (register_type, _) => Err(TransportError::Unsupported(register_type)),
    };
    state.timed_out = matches!(result, Err(TransportError::Timeout));

    result
  }
}

const EXCEPTIONS: [(&str, u8); 9] = [
  ("illegal function", 0x01),
  ("illegal data address", 0x02),
  ("illegal data value", 0x03),
  ("server device failure", 0x04),
  ("acknowledge", 0x05),
  ("server device busy", 0x06),
  ("memory parity error", 0x08),
  ("gateway path unavailable", 0x0A),
  ("gateway target device", 0x0B),
];

fn classify_io(error: std::io::Error) -> TransportError {
  if error.kind() == std::io::ErrorKind::TimedOut {
    return TransportError::Timeout;
  }

  let message = error.to_string().to_lowercase();
  if message.contains("crc") || error.kind() == std::io::ErrorKind::InvalidData
  {
    return TransportError::Crc(error.to_string());
  }
  if let Some((_, code)) = EXCEPTIONS
    .iter()
    .find(|(exception, _)| message.contains(exception))
  {
    return TransportError::Exception(*code);
  }

  TransportError::Io(error)
}

/// Outer error is the timeout, inner error comes from the link.
fn flatten_result<T>(
  result: std::io::Result<std::io::Result<T>>,
) -> Result<T, TransportError> {
  match result {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(error)) => Err(classify_io(error)),
    Err(_) => Err(TransportError::Timeout),
  }
}

fn bools_to_words(values: Vec<bool>) -> Vec<u16> {
  values.into_iter().map(u16::from).collect()
}

fn words_to_bools(values: &[u16]) -> Vec<bool> {
  values.iter().map(|value| *value != 0).collect()
}

fn timeout_from_chrono(
  timeout: chrono::Duration,
) -> futures_time::time::Duration {
  futures_time::time::Duration::from_millis(
    timeout.num_milliseconds().max(0) as u64,
  )
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  use super::*;

  fn io(kind: std::io::ErrorKind, message: &str) -> std::io::Error {
    std::io::Error::new(kind, message)
  }

  #[test]
  fn classifies_io_errors() {
    assert!(matches!(
      classify_io(io(std::io::ErrorKind::TimedOut, "late")),
      TransportError::Timeout
    ));
    assert!(matches!(
      classify_io(io(std::io::ErrorKind::InvalidData, "Invalid CRC")),
      TransportError::Crc(_)
    ));
    assert!(matches!(
      classify_io(io(
        std::io::ErrorKind::Other,
        "Modbus function 3: Illegal data address"
      )),
      TransportError::Exception(2)
    ));
    assert!(matches!(
      classify_io(io(
        std::io::ErrorKind::Other,
        "Modbus function 5: Illegal function"
      )),
      TransportError::Exception(1)
    ));
    assert!(matches!(
      classify_io(io(std::io::ErrorKind::BrokenPipe, "gone")),
      TransportError::Io(_)
    ));
  }

  #[test]
  fn converts_coils() {
    assert_eq!(bools_to_words(vec![true, false, true]), vec![1, 0, 1]);
    assert_eq!(words_to_bools(&[0, 2, 1]), vec![false, true, true]);
  }

  #[test]
  fn destinations_deserialize_and_name_links() {
    let tcp: Destination = serde_json::from_str(
      r#"{ "kind": "tcp", "host": "10.0.0.2", "port": 502 }"#,
    )
    .unwrap();
    let rtu: Destination = serde_yaml::from_str(
      "kind: rtu\npath: /dev/ttyUSB0\nbaud_rate: 9600\n",
    )
    .unwrap();

    assert_eq!(tcp.link_id(), "10.0.0.2:502");
    assert_eq!(rtu.link_id(), "/dev/ttyUSB0");
  }

  #[test]
  fn slave_timeouts_override_link_timeout() {
    let params = Params::new(
      chrono::Duration::milliseconds(100),
      HashMap::from([(7, chrono::Duration::milliseconds(900))]),
    );

    assert_eq!(params.timeout(7), chrono::Duration::milliseconds(900));
    assert_eq!(params.timeout(8), chrono::Duration::milliseconds(100));
  }

  #[tokio::test]
  async fn reads_before_connect_fail() {
    let transport = ModbusTransport::new(
      Destination::Tcp {
        host: "127.0.0.1".to_string(),
        port: 1,
      },
      Params::new(chrono::Duration::milliseconds(50), HashMap::new()),
    );

    assert!(!transport.is_connected().await);
    assert!(matches!(
      transport.read(RegisterType::HoldingRegister, 1, 0, 1).await,
      Err(TransportError::NotConnected)
    ));
  }

  #[tokio::test]
  async fn silent_device_times_out_and_reconnect_is_skipped_once() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
      let mut sockets = Vec::new();
      while let Ok((socket, _)) = listener.accept().await {
        counter.fetch_add(1, Ordering::SeqCst);
        sockets.push(socket);
      }
    });
    let transport = ModbusTransport::new(
      Destination::Tcp {
        host: "127.0.0.1".to_string(),
        port,
      },
      Params::new(chrono::Duration::milliseconds(50), HashMap::new()),
    );

    transport.connect().await.unwrap();
    transport.connect().await.unwrap();
    let result = transport.read(RegisterType::HoldingRegister, 1, 0, 2).await;
    assert!(matches!(result, Err(TransportError::Timeout)));

    transport.reconnect("test").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    transport.reconnect("test").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
  }
}
