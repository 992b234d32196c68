use tokio_modbus::Quantity;

use super::address::RegisterType;

pub(crate) trait Span {
  fn register_type(&self) -> RegisterType;

  fn address(&self) -> u16;

  fn quantity(&self) -> Quantity;

  /// Last register covered by the span (inclusive).
  fn end(&self) -> u16 {
    self
      .address()
      .saturating_add(self.quantity().max(1))
      .saturating_sub(1)
  }

  fn registers(&self) -> std::ops::RangeInclusive<u16> {
    self.address()..=self.end()
  }

  #[cfg(test)]
  fn covers(&self, register_type: RegisterType, register: u16) -> bool {
    self.register_type() == register_type
      && self.address() <= register
      && register <= self.end()
  }
}

impl<TSpan: Span> Span for &TSpan {
  fn register_type(&self) -> RegisterType {
    (*self).register_type()
  }

  fn address(&self) -> u16 {
    (*self).address()
  }

  fn quantity(&self) -> Quantity {
    (*self).quantity()
  }
}
