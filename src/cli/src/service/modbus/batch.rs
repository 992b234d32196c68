use itertools::Itertools;
use tokio_modbus::Quantity;

use super::address::{Address, RegisterType};
use super::span::*;

/// Largest hole (in registers) that still gets padded into one read.
pub(crate) const MAX_GAP: u16 = 10;

#[derive(Clone, Debug)]
pub(crate) struct Batch<TSpan: Span> {
  pub(crate) register_type: RegisterType,
  pub(crate) address: u16,
  pub(crate) quantity: Quantity,
  pub(crate) spans: Vec<TSpan>,
}

impl<TSpan: Span> Span for Batch<TSpan> {
  fn register_type(&self) -> RegisterType {
    self.register_type
  }

  fn address(&self) -> u16 {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

impl<TSpan: Span> Batch<TSpan> {
  fn start(span: TSpan) -> Self {
    Self {
      register_type: span.register_type(),
      address: span.address(),
      quantity: span.quantity().max(1),
      spans: vec![span],
    }
  }

  fn extend(&mut self, span: TSpan) {
    let end = self.end().max(span.end());
    self.quantity = (end - self.address).saturating_add(1);
    self.spans.push(span);
  }

  pub(crate) fn to_address(&self) -> Address {
    Address::range(self.register_type, self.address, self.quantity)
  }
}

/// Merges spans into contiguous range requests.
///
/// Spans are ordered by `(register_type, address)`. A new batch starts when
/// the register type changes or when the next span begins more than
/// `max_gap` registers after the last covered register.
pub(crate) fn batch_spans<
  TSpan: Span,
  TIntoIterator: IntoIterator<Item = TSpan>,
>(
  spans: TIntoIterator,
  max_gap: u16,
) -> Vec<Batch<TSpan>> {
  let mut iter = spans
    .into_iter()
    .sorted_by_key(|span| (span.register_type(), span.address()));

  let first = match iter.next() {
    Some(first) => first,
    None => return Vec::new(),
  };
  let mut batches = Vec::new();
  let mut current = Batch::start(first);

  for span in iter {
    let same_type = span.register_type() == current.register_type;
    let gap = span.address().saturating_sub(current.end());
    if same_type && gap <= max_gap {
      current.extend(span);
    } else {
      batches.push(current);
      current = Batch::start(span);
    }
  }
  batches.push(current);

  batches
}

/// Range requests for a set of addresses, with the default gap.
pub(crate) fn prepare<'a, TIntoIterator>(
  addresses: TIntoIterator,
) -> Vec<Address>
where
  TIntoIterator: IntoIterator<Item = &'a Address>,
{
  batch_spans(addresses, MAX_GAP)
    .iter()
    .map(Batch::to_address)
    .collect()
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use super::*;

  fn add(
    addresses: &mut HashSet<Address>,
    register_type: RegisterType,
    range: std::ops::Range<u16>,
  ) {
    for address in range {
      addresses.insert(Address::new(register_type, address));
    }
  }

  fn ranges(prepared: &[Address]) -> Vec<(RegisterType, u16, u16)> {
    prepared
      .iter()
      .map(|address| (address.register_type, address.address, address.length))
      .collect()
  }

  #[test]
  fn merges_holding_registers_within_gap() {
    let mut addresses = HashSet::new();
    add(&mut addresses, RegisterType::HoldingRegister, 0..4);
    add(&mut addresses, RegisterType::HoldingRegister, 7..9);
    add(&mut addresses, RegisterType::HoldingRegister, 27..29);
    add(&mut addresses, RegisterType::Coils, 0..4);

    let prepared = prepare(&addresses);

    assert_eq!(
      ranges(&prepared),
      vec![
        (RegisterType::Coils, 0, 4),
        (RegisterType::HoldingRegister, 0, 9),
        (RegisterType::HoldingRegister, 27, 2),
      ]
    );
  }

  #[test]
  fn splits_when_gap_exceeds_limit() {
    let mut addresses = HashSet::new();
    add(&mut addresses, RegisterType::AnalogInputs, 0..1);
    add(&mut addresses, RegisterType::AnalogInputs, 10..11);
    add(&mut addresses, RegisterType::AnalogInputs, 21..22);

    let prepared = prepare(&addresses);

    assert_eq!(
      ranges(&prepared),
      vec![
        (RegisterType::AnalogInputs, 0, 11),
        (RegisterType::AnalogInputs, 21, 1),
      ]
    );
  }

  #[test]
  fn keeps_trailing_registers_of_wide_addresses() {
    let mut addresses = HashSet::new();
    addresses.insert(Address::new(RegisterType::HoldingRegister, 100));
    addresses.insert(Address::range(RegisterType::HoldingRegister, 102, 4));

    let prepared = prepare(&addresses);

    assert_eq!(
      ranges(&prepared),
      vec![(RegisterType::HoldingRegister, 100, 6)]
    );
  }

  #[test]
  fn batches_keep_their_spans() {
    let first = Address::new(RegisterType::Coils, 1);
    let second = Address::new(RegisterType::Coils, 3);

    let batches = batch_spans([&second, &first], MAX_GAP);

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].spans, vec![&first, &second]);
    assert_eq!(batches[0].quantity, 3);
  }

  #[test]
  fn empty_input_yields_no_ranges() {
    let addresses = HashSet::<Address>::new();
    assert!(prepare(&addresses).is_empty());
  }

  #[test]
  fn ranges_cover_input_without_overlap() {
    let mut addresses = HashSet::new();
    for address in [3, 5, 19, 40, 41, 44, 60, 200, 205, 999] {
      addresses.insert(Address::new(RegisterType::HoldingRegister, address));
    }
    for address in [1, 2, 80] {
      addresses.insert(Address::new(RegisterType::DiscreteInputs, address));
    }

    let prepared = prepare(&addresses);
    let again = prepare(&addresses);
    assert_eq!(ranges(&prepared), ranges(&again));

    for address in &addresses {
      assert!(prepared
        .iter()
        .any(|range| range.covers(address.register_type, address.address)));
    }
    for (left, right) in prepared.iter().tuple_windows() {
      let left_key = (left.register_type, left.address);
      let right_key = (right.register_type, right.address);
      assert!(left_key < right_key);
      if left.register_type == right.register_type {
        assert!(left.end() < right.address);
      }
    }
  }
}
