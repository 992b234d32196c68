pub mod modbus;

use crate::*;

pub(crate) trait Service {
  fn new(config: config::Values) -> Self;
}

#[derive(Debug, Clone)]
pub(crate) struct Container {
  modbus: modbus::Service,
}

impl Container {
  pub(crate) fn new(config: config::Values) -> Self {
    Self {
      modbus: modbus::Service::new(config),
    }
  }

  pub(crate) fn modbus(&self) -> &modbus::Service {
    &self.modbus
  }
}
