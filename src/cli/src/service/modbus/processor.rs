use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use super::address::{Address, Options, RegisterType};
use super::batch;
use super::policy::{ErrorState, RequestError};
use super::queue::{Callback, ErrorAction, Queue, QueueEntry};
use super::span::Span;
use super::transport::TransportError;

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct RegisterResult {
  pub(crate) data: Option<Vec<u16>>,
  pub(crate) error: Option<RequestError>,
}

/// Per address results of one [`Processor::execute`] call.
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct AggregateResult {
  pub(crate) coils: BTreeMap<u16, RegisterResult>,
  pub(crate) discrete_inputs: BTreeMap<u16, RegisterResult>,
  pub(crate) holding_registers: BTreeMap<u16, RegisterResult>,
  pub(crate) analog_inputs: BTreeMap<u16, RegisterResult>,
}

impl AggregateResult {
  fn map(&self, register_type: RegisterType) -> &BTreeMap<u16, RegisterResult> {
    match register_type {
      RegisterType::Coils => &self.coils,
      RegisterType::DiscreteInputs => &self.discrete_inputs,
      RegisterType::HoldingRegister => &self.holding_registers,
      RegisterType::AnalogInputs => &self.analog_inputs,
    }
  }

  fn map_mut(
    &mut self,
    register_type: RegisterType,
  ) -> &mut BTreeMap<u16, RegisterResult> {
    match register_type {
      RegisterType::Coils => &mut self.coils,
      RegisterType::DiscreteInputs => &mut self.discrete_inputs,
      RegisterType::HoldingRegister => &mut self.holding_registers,
      RegisterType::AnalogInputs => &mut self.analog_inputs,
    }
  }

  #[cfg(test)]
  pub(crate) fn get(
    &self,
    register_type: RegisterType,
    address: u16,
  ) -> Option<&RegisterResult> {
    self.map(register_type).get(&address)
  }

  pub(crate) fn len(&self) -> usize {
    RegisterType::ALL
      .iter()
      .map(|register_type| self.map(*register_type).len())
      .sum()
  }

  #[cfg(test)]
  pub(crate) fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecuteError {
  #[error(
    "Read of {register_type} {address} on slave {slave} resolved as a write"
  )]
  UnexpectedWrite {
    slave: u8,
    register_type: RegisterType,
    address: u16,
  },

  #[error("Request failed")]
  Failed(#[from] RequestError),

  #[error("Channel was disconnected before the request could be finished")]
  ChannelDisconnected(anyhow::Error),
}

#[derive(Debug)]
enum Reply {
  Resolved { address: Address, values: Vec<u16> },
  Failed { address: Address, error: RequestError },
}

/// Bridges queue callbacks to the channel of one processor call.
#[derive(Debug)]
struct ReplyCallback {
  sender: flume::Sender<Reply>,
}

impl ReplyCallback {
  fn send(&self, reply: Reply) {
    if let Err(error) = self.sender.send(reply) {
      // NOTE: error -> trace because this fails when the caller gave up
      tracing::trace!("Failed sending reply {:?}", error.into_inner());
    }
  }
}

impl Callback for ReplyCallback {
  fn resolve(&self, entry: &QueueEntry, values: &[u16]) {
    self.send(Reply::Resolved {
      address: entry.address.clone(),
      values: values.to_vec(),
    });
  }

  fn error(&self, entry: &QueueEntry, error: &RequestError) -> ErrorAction {
    self.send(Reply::Failed {
      address: entry.address.clone(),
      error: error.clone(),
    });
    match error.state {
      ErrorState::Timeout => ErrorAction::HandledNoReconnect,
      ErrorState::Crc => ErrorAction::HandledReconnect,
      _ => ErrorAction::NotHandled,
    }
  }
}

type Register = (RegisterType, u16);

/// Turns sets of individual addresses into coalesced queue entries and
/// back.
#[derive(Clone, Debug)]
pub(crate) struct Processor {
  queue: Queue,
}

impl Processor {
  pub(crate) fn new(queue: Queue) -> Self {
    Self { queue }
  }

  #[tracing::instrument(skip_all, fields(
    slave = slave_id,
    addresses = addresses.len(),
    task = %options.task,
  ))]
  pub(crate) async fn execute(
    &self,
    slave_id: u8,
    addresses: &HashSet<Address>,
    options: Options,
  ) -> Result<AggregateResult, ExecuteError> {
    let requested = addresses
      .iter()
      .flat_map(|address| {
        address
          .registers()
          .map(move |register| (address.register_type, register))
      })
      .collect::<HashSet<Register>>();
    if requested.is_empty() {
      return Ok(AggregateResult::default());
    }

    let (sender, receiver) = flume::unbounded();
    let callback: Arc<dyn Callback> = Arc::new(ReplyCallback { sender });
    let ranges = batch::prepare(addresses);
    tracing::trace!("Enqueueing {} ranges", ranges.len());
    for range in ranges {
      self.queue.enqueue(slave_id, range, callback.clone(), options);
    }
    drop(callback);

    let mut settled =
      HashMap::<Register, Result<u16, RequestError>>::with_capacity(
        requested.len(),
      );
    while settled.len() < requested.len() {
      let reply = receiver
        .recv_async()
        .await
        .map_err(|error| ExecuteError::ChannelDisconnected(error.into()))?;

      match reply {
        Reply::Resolved { address, values } => {
          if address.is_write() {
            tracing::error!(
              "Received write result for read {} on slave {}",
              address,
              slave_id
            );
            return Err(ExecuteError::UnexpectedWrite {
              slave: slave_id,
              register_type: address.register_type,
              address: address.address,
            });
          }

          for (offset, register) in address.registers().enumerate() {
            let key = (address.register_type, register);
            if !requested.contains(&key) {
              continue;
            }
            let value = values.get(offset).copied().ok_or_else(|| {
              RequestError::new(
                ErrorState::Other,
                1,
                TransportError::ShortResponse {
                  expected: address.length(),
                  received: values.len(),
                },
              )
            });
            settled.entry(key).or_insert(value);
          }
        }
        Reply::Failed { address, error } => {
          tracing::debug!("Failed {} with {}", address, error);
          for register in address.registers() {
            let key = (address.register_type, register);
            if requested.contains(&key) {
              settled.entry(key).or_insert_with(|| Err(error.clone()));
            }
          }
        }
      }
    }

    let mut result = AggregateResult::default();
    for address in addresses {
      let mut data = Vec::with_capacity(address.length() as usize);
      let mut error = None;
      for register in address.registers() {
        match settled.get(&(address.register_type, register)) {
          Some(Ok(value)) => data.push(*value),
          Some(Err(register_error)) => {
            error.get_or_insert_with(|| register_error.clone());
          }
          None => {}
        }
      }
      let register_result = match error {
        Some(error) => RegisterResult {
          data: None,
          error: Some(error),
        },
        None => RegisterResult {
          data: Some(data),
          error: None,
        },
      };
      result
        .map_mut(address.register_type)
        .insert(address.address, register_result);
    }

    Ok(result)
  }

  /// Enqueues one write and waits for its outcome.
  #[tracing::instrument(skip_all, fields(slave = slave_id, address = %address))]
  pub(crate) async fn write(
    &self,
    slave_id: u8,
    address: Address,
    options: Options,
  ) -> Result<(), ExecuteError> {
    let (sender, receiver) = flume::bounded(1);
    self.queue.enqueue(
      slave_id,
      address,
      Arc::new(ReplyCallback { sender }),
      options,
    );

    match receiver.recv_async().await {
      Ok(Reply::Resolved { .. }) => Ok(()),
      Ok(Reply::Failed { error, .. }) => Err(error.into()),
      Err(error) => Err(ExecuteError::ChannelDisconnected(error.into())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::service::modbus::cache::SlaveCaches;
  use crate::service::modbus::mock::MockTransport;
  use crate::service::modbus::worker::{Driver, Worker};

  struct Fixture {
    transport: Arc<MockTransport>,
    processor: Processor,
    driver: Driver,
  }

  fn fixture(transport: MockTransport) -> Fixture {
    let transport = Arc::new(transport);
    let queue = Queue::new();
    let worker = Arc::new(Worker::new(
      queue.clone(),
      transport.clone(),
      SlaveCaches::default(),
    ));
    let driver = Driver::spawn(worker, chrono::Duration::seconds(5));
    Fixture {
      transport,
      processor: Processor::new(queue),
      driver,
    }
  }

  fn addresses(
    register_type: RegisterType,
    registers: &[u16],
  ) -> HashSet<Address> {
    registers
      .iter()
      .map(|register| Address::new(register_type, *register))
      .collect()
  }

  #[tokio::test]
  async fn resolves_every_requested_address() {
    let fixture = fixture(MockTransport::new());
    let mut requested =
      addresses(RegisterType::HoldingRegister, &[0, 1, 2, 3, 7, 8, 27, 28]);
    requested.extend(addresses(RegisterType::Coils, &[0, 1, 2, 3]));

    let result = fixture
      .processor
      .execute(1, &requested, Options::default())
      .await
      .unwrap();

    assert_eq!(result.len(), requested.len());
    assert!(result.get(RegisterType::HoldingRegister, 4).is_none());
    assert_eq!(
      result
        .get(RegisterType::HoldingRegister, 27)
        .and_then(|result| result.data.clone()),
      Some(vec![27])
    );
    let calls = fixture
      .transport
      .calls()
      .iter()
      .map(|call| (call.register_type, call.address, call.length))
      .collect::<Vec<_>>();
    assert_eq!(
      calls,
      vec![
        (RegisterType::Coils, 0, 4),
        (RegisterType::HoldingRegister, 0, 9),
        (RegisterType::HoldingRegister, 27, 2),
      ]
    );
    fixture.driver.terminate().await.unwrap();
  }

  #[tokio::test]
  async fn empty_request_resolves_immediately() {
    let fixture = fixture(MockTransport::new());

    let result = fixture
      .processor
      .execute(1, &HashSet::new(), Options::default())
      .await
      .unwrap();

    assert!(result.is_empty());
    assert_eq!(fixture.transport.call_count(), 0);
    fixture.driver.terminate().await.unwrap();
  }

  #[tokio::test]
  async fn concurrent_calls_never_overlap_on_the_bus() {
    let fixture = fixture(MockTransport::new());

    let calls = (0..8u16).map(|slave| {
      let processor = fixture.processor.clone();
      let requested =
        addresses(RegisterType::HoldingRegister, &[slave, slave + 40]);
      tokio::spawn(async move {
        processor
          .execute(slave as u8 + 1, &requested, Options::default())
          .await
      })
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
      assert_eq!(result.unwrap().unwrap().len(), 2);
    }
    assert_eq!(fixture.transport.max_in_flight(), 1);
    assert_eq!(fixture.transport.call_count(), 16);
    fixture.driver.terminate().await.unwrap();
  }

  #[tokio::test]
  async fn failed_range_marks_each_address() {
    let fixture = fixture(
      MockTransport::new()
        .bad_register(RegisterType::HoldingRegister, 2, || {
          TransportError::Exception(2)
        }),
    );
    let mut requested = addresses(RegisterType::HoldingRegister, &[1, 2, 3]);
    requested.extend(addresses(RegisterType::AnalogInputs, &[5]));

    let result = fixture
      .processor
      .execute(1, &requested, Options::default())
      .await
      .unwrap();

    assert_eq!(result.len(), 4);
    for register in [1, 2, 3] {
      let register_result =
        result.get(RegisterType::HoldingRegister, register).unwrap();
      assert!(register_result.data.is_none());
      assert_eq!(
        register_result.error.as_ref().map(|error| error.state),
        Some(ErrorState::IllegalAddress)
      );
    }
    assert!(result
      .get(RegisterType::AnalogInputs, 5)
      .and_then(|result| result.data.as_ref())
      .is_some());
    fixture.driver.terminate().await.unwrap();
  }

  #[tokio::test]
  async fn split_isolates_bad_register() {
    let fixture = fixture(
      MockTransport::new()
        .bad_register(RegisterType::HoldingRegister, 2, || {
          TransportError::Exception(2)
        }),
    );
    let requested = addresses(RegisterType::HoldingRegister, &[1, 2, 3]);

    let result = fixture
      .processor
      .execute(1, &requested, Options::default().split())
      .await
      .unwrap();

    assert_eq!(result.len(), 3);
    let data = |register| {
      result
        .get(RegisterType::HoldingRegister, register)
        .and_then(|result| result.data.clone())
    };
    assert_eq!(data(1), Some(vec![1]));
    assert_eq!(data(2), None);
    assert_eq!(data(3), Some(vec![3]));
    fixture.driver.terminate().await.unwrap();
  }

  #[tokio::test]
  async fn write_reply_for_read_is_rejected() {
    let queue = Queue::new();
    let processor = Processor::new(queue.clone());
    let requested = addresses(RegisterType::Coils, &[4]);

    let pending = tokio::spawn(async move {
      processor.execute(2, &requested, Options::default()).await
    });
    let mut entry = loop {
      if let Some(entry) = queue.dequeue() {
        break entry;
      }
      tokio::task::yield_now().await;
    };
    entry.address.write = Some(vec![1]);
    entry.callback.resolve(&entry, &[1]);

    let result = pending.await.unwrap();
    assert!(matches!(
      result,
      Err(ExecuteError::UnexpectedWrite {
        slave: 2,
        register_type: RegisterType::Coils,
        address: 4,
      })
    ));
  }

  #[tokio::test]
  async fn writes_report_failures() {
    let fixture = fixture(MockTransport::new());

    let written = fixture
      .processor
      .write(
        1,
        Address::write(RegisterType::Coils, 3, vec![1]),
        Options::default(),
      )
      .await;
    let rejected = fixture
      .processor
      .write(
        1,
        Address::write(RegisterType::DiscreteInputs, 3, vec![1]),
        Options::default(),
      )
      .await;

    assert!(written.is_ok());
    assert!(matches!(
      rejected,
      Err(ExecuteError::Failed(RequestError {
        state: ErrorState::IllegalFunctionCode,
        ..
      }))
    ));
    fixture.driver.terminate().await.unwrap();
  }

  #[test]
  fn reply_actions_follow_error_state() {
    let (sender, receiver) = flume::unbounded();
    let callback = Arc::new(ReplyCallback { sender });
    let entry = QueueEntry::new(
      1,
      Address::new(RegisterType::HoldingRegister, 7),
      callback.clone(),
      Options::default(),
    );
    let action = |state| {
      let error = RequestError::new(state, 1, TransportError::Timeout);
      callback.error(&entry, &error)
    };

    assert_eq!(action(ErrorState::Timeout), ErrorAction::HandledNoReconnect);
    assert_eq!(action(ErrorState::Crc), ErrorAction::HandledReconnect);
    assert_eq!(
      action(ErrorState::IllegalFunctionCode),
      ErrorAction::NotHandled
    );
    assert_eq!(action(ErrorState::IllegalAddress), ErrorAction::NotHandled);
    assert_eq!(receiver.len(), 4);
  }

  fn crc() -> TransportError {
    TransportError::Crc("CRC error".to_string())
  }

  #[tokio::test]
  async fn crc_failures_reconnect_the_link() {
    let crc_fixture = fixture(MockTransport::new().always(crc));
    let timeout_fixture =
      fixture(MockTransport::new().always(|| TransportError::Timeout));
    let requested = addresses(RegisterType::HoldingRegister, &[5]);

    let crc_result = crc_fixture
      .processor
      .execute(1, &requested, Options::default())
      .await
      .unwrap();
    let timeout_result = timeout_fixture
      .processor
      .execute(1, &requested, Options::default())
      .await
      .unwrap();

    assert!(crc_result.holding_registers[&5].error.is_some());
    assert!(timeout_result.holding_registers[&5].error.is_some());
    assert_eq!(crc_fixture.transport.reconnects(), 1);
    assert_eq!(timeout_fixture.transport.reconnects(), 0);
    crc_fixture.driver.terminate().await.unwrap();
    timeout_fixture.driver.terminate().await.unwrap();
  }
}
