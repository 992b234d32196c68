use std::fmt::Display;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tokio_modbus::Quantity;

use super::span::Span;

/// Independent Modbus address spaces.
///
/// Declaration order is the coalescing order, so coils always come first.
#[derive(
  Clone,
  Copy,
  Debug,
  Hash,
  Eq,
  PartialEq,
  Ord,
  PartialOrd,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum RegisterType {
  Coils = 1,
  DiscreteInputs = 2,
  HoldingRegister = 3,
  AnalogInputs = 4,
}

impl RegisterType {
  pub(crate) const ALL: [RegisterType; 4] = [
    RegisterType::Coils,
    RegisterType::DiscreteInputs,
    RegisterType::HoldingRegister,
    RegisterType::AnalogInputs,
  ];

  pub(crate) fn is_writable(self) -> bool {
    matches!(self, RegisterType::Coils | RegisterType::HoldingRegister)
  }
}

impl Display for RegisterType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      RegisterType::Coils => "coils",
      RegisterType::DiscreteInputs => "discrete inputs",
      RegisterType::HoldingRegister => "holding registers",
      RegisterType::AnalogInputs => "analog inputs",
    };
    f.write_str(name)
  }
}

/// A register (or a run of registers) on one slave.
///
/// Identity is `(address, register_type)`: two addresses that only differ
/// in length or write payload compare equal and hash the same.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Address {
  pub(crate) address: u16,
  pub(crate) register_type: RegisterType,
  #[serde(default = "default_length")]
  pub(crate) length: u16,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub(crate) write: Option<Vec<u16>>,
}

fn default_length() -> u16 {
  1
}

impl Address {
  pub(crate) fn new(register_type: RegisterType, address: u16) -> Self {
    Self {
      address,
      register_type,
      length: 1,
      write: None,
    }
  }

  pub(crate) fn range(
    register_type: RegisterType,
    address: u16,
    length: u16,
  ) -> Self {
    Self {
      address,
      register_type,
      length,
      write: None,
    }
  }

  pub(crate) fn write(
    register_type: RegisterType,
    address: u16,
    data: Vec<u16>,
  ) -> Self {
    Self {
      address,
      register_type,
      length: data.len() as u16,
      write: Some(data),
    }
  }

  pub(crate) fn length(&self) -> u16 {
    self.length.max(1)
  }

  pub(crate) fn is_write(&self) -> bool {
    self.write.is_some()
  }
}

impl PartialEq for Address {
  fn eq(&self, other: &Self) -> bool {
    self.address == other.address && self.register_type == other.register_type
  }
}

impl Eq for Address {}

impl Hash for Address {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.address.hash(state);
    self.register_type.hash(state);
  }
}

impl Span for Address {
  fn register_type(&self) -> RegisterType {
    self.register_type
  }

  fn address(&self) -> u16 {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.length()
  }
}

impl Display for Address {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.register_type, self.address)?;
    if self.length() > 1 {
      write!(f, " (l: {})", self.length())?;
    }
    Ok(())
  }
}

/// Caller category, doubling as drain priority: higher values go first.
#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  Hash,
  Eq,
  PartialEq,
  Ord,
  PartialOrd,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Task {
  DeviceDetection = 0,
  Specification = 1,
  Entity = 2,
  WriteEntity = 3,
  #[default]
  Poll = 4,
  InitialConnect = 5,
  Splitted = 6,
  TcpBridge = 7,
}

pub(crate) const TASK_COUNT: usize = 8;

impl Task {
  pub(crate) fn index(self) -> usize {
    self as usize
  }
}

impl Display for Task {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Task::DeviceDetection => "device detection",
      Task::Specification => "specification",
      Task::Entity => "entity",
      Task::WriteEntity => "write entity",
      Task::Poll => "poll",
      Task::InitialConnect => "initial connect",
      Task::Splitted => "splitted",
      Task::TcpBridge => "tcp bridge",
    };
    f.write_str(name)
  }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct ErrorHandling {
  #[serde(default)]
  pub(crate) retry: bool,
  #[serde(default)]
  pub(crate) split: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct Options {
  #[serde(default)]
  pub(crate) task: Task,
  #[serde(default)]
  pub(crate) error_handling: ErrorHandling,
  #[serde(default)]
  pub(crate) use_cache: bool,
  #[serde(default)]
  pub(crate) print_logs: bool,
}

impl Options {
  pub(crate) fn new(task: Task) -> Self {
    Self {
      task,
      ..Default::default()
    }
  }
}

#[cfg(test)]
impl Options {
  pub(crate) fn retry(mut self) -> Self {
    self.error_handling.retry = true;
    self
  }

  pub(crate) fn split(mut self) -> Self {
    self.error_handling.split = true;
    self
  }

  pub(crate) fn cached(mut self) -> Self {
    self.use_cache = true;
    self
  }
}
