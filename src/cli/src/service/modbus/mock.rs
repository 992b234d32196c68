use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::address::RegisterType;
use super::transport::{ReadResult, Transport, TransportError};

type Failure = fn() -> TransportError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CallKind {
  Read,
  Write,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Call {
  pub(crate) kind: CallKind,
  pub(crate) register_type: RegisterType,
  pub(crate) slave: u8,
  pub(crate) address: u16,
  pub(crate) length: u16,
}

/// Scripted transport.
///
/// Successful reads return each register's address as its value.
#[derive(Debug)]
pub(crate) struct MockTransport {
  link_id: String,
  connected: AtomicBool,
  fail_connect: AtomicBool,
  script: Mutex<VecDeque<Option<Failure>>>,
  always: Mutex<Option<Failure>>,
  bad_registers: Mutex<Vec<(RegisterType, u16, Failure)>>,
  calls: Mutex<Vec<Call>>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  connects: AtomicUsize,
  reconnects: AtomicUsize,
  delay: Duration,
}

impl MockTransport {
  pub(crate) fn new() -> Self {
    Self {
      link_id: "mock".to_string(),
      connected: AtomicBool::new(true),
      fail_connect: AtomicBool::new(false),
      script: Mutex::new(VecDeque::new()),
      always: Mutex::new(None),
      bad_registers: Mutex::new(Vec::new()),
      calls: Mutex::new(Vec::new()),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
      connects: AtomicUsize::new(0),
      reconnects: AtomicUsize::new(0),
      delay: Duration::from_millis(2),
    }
  }

  pub(crate) fn named(mut self, link_id: &str) -> Self {
    self.link_id = link_id.to_string();
    self
  }

  pub(crate) fn disconnected(self) -> Self {
    self.connected.store(false, Ordering::SeqCst);
    self
  }

  pub(crate) fn refusing(self) -> Self {
    self.fail_connect.store(true, Ordering::SeqCst);
    self.disconnected()
  }

  /// Queues the outcome of the next call; `None` lets it succeed.
  pub(crate) fn next_call(self, failure: Option<Failure>) -> Self {
    self.script.lock().push_back(failure);
    self
  }

  pub(crate) fn always(self, failure: Failure) -> Self {
    *self.always.lock() = Some(failure);
    self
  }

  /// Every read covering `register` fails.
  pub(crate) fn bad_register(
    self,
    register_type: RegisterType,
    register: u16,
    failure: Failure,
  ) -> Self {
    self
      .bad_registers
      .lock()
      .push((register_type, register, failure));
    self
  }

  pub(crate) fn calls(&self) -> Vec<Call> {
    self.calls.lock().clone()
  }

  pub(crate) fn call_count(&self) -> usize {
    self.calls.lock().len()
  }

  pub(crate) fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  pub(crate) fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }

  pub(crate) fn reconnects(&self) -> usize {
    self.reconnects.load(Ordering::SeqCst)
  }

  async fn call(&self, call: Call) -> Result<(), TransportError> {
    let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
    tokio::time::sleep(self.delay).await;
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let scripted = self.script.lock().pop_front();
    let bad = self
      .bad_registers
      .lock()
      .iter()
      .find(|(register_type, register, _)| {
        *register_type == call.register_type
          && call.address <= *register
          && *register < call.address.saturating_add(call.length)
      })
      .map(|(_, _, failure)| *failure);
    let always = *self.always.lock();
    self.calls.lock().push(call);

    let failure = match scripted {
      Some(scripted) => scripted,
      None => bad.or(always),
    };
    match failure {
      Some(failure) => Err(failure()),
      None => Ok(()),
    }
  }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
  fn link_id(&self) -> String {
    self.link_id.clone()
  }

  async fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  async fn connect(&self) -> Result<(), TransportError> {
    self.connects.fetch_add(1, Ordering::SeqCst);
    if self.fail_connect.load(Ordering::SeqCst) {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "refused",
      )));
    }
    self.connected.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn reconnect(&self, _task: &str) -> Result<(), TransportError> {
    self.reconnects.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn read(
    &self,
    register_type: RegisterType,
    slave: u8,
    address: u16,
    length: u16,
  ) -> Result<ReadResult, TransportError> {
    self
      .call(Call {
        kind: CallKind::Read,
        register_type,
        slave,
        address,
        length,
      })
      .await?;

    Ok(ReadResult {
      data: (address..address.saturating_add(length)).collect(),
      duration: self.delay,
    })
  }

  async fn write(
    &self,
    register_type: RegisterType,
    slave: u8,
    address: u16,
    data: &[u16],
  ) -> Result<(), TransportError> {
    self
      .call(Call {
        kind: CallKind::Write,
        register_type,
        slave,
        address,
        length: data.len() as u16,
      })
      .await
  }
}
