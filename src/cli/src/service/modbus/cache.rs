use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::address::{Address, RegisterType, Task, TASK_COUNT};
use super::policy::{ErrorState, RequestError};
use super::span::Span;

const MAX_ERRORS: usize = 50;
const MINUTES: usize = 60;

/// Errors older than this are pruned on cleanup.
pub(crate) fn error_clean_timeout() -> chrono::Duration {
  chrono::Duration::hours(1)
}

/// Data younger than this survives a failed read.
pub(crate) fn error_timeout() -> chrono::Duration {
  chrono::Duration::hours(5)
}

/// Entries older than this are dropped on cleanup.
pub(crate) fn data_timeout() -> chrono::Duration {
  chrono::Duration::hours(10)
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct CacheEntry {
  pub(crate) data: Option<Vec<u16>>,
  pub(crate) error: Option<RequestError>,
  pub(crate) timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ErrorRecord {
  pub(crate) timestamp: DateTime<Utc>,
  pub(crate) task: Task,
  pub(crate) address: Address,
  pub(crate) state: ErrorState,
}

pub(crate) type RequestCounts = [[u32; MINUTES]; TASK_COUNT];

#[derive(Clone, Debug)]
pub(crate) struct SlaveCache {
  coils: HashMap<u16, CacheEntry>,
  discrete_inputs: HashMap<u16, CacheEntry>,
  holding_registers: HashMap<u16, CacheEntry>,
  analog_inputs: HashMap<u16, CacheEntry>,
  errors: VecDeque<ErrorRecord>,
  request_counts: RequestCounts,
}

impl Default for SlaveCache {
  fn default() -> Self {
    Self {
      coils: HashMap::new(),
      discrete_inputs: HashMap::new(),
      holding_registers: HashMap::new(),
      analog_inputs: HashMap::new(),
      errors: VecDeque::with_capacity(MAX_ERRORS),
      request_counts: [[0; MINUTES]; TASK_COUNT],
    }
  }
}

impl SlaveCache {
  fn entries(&self, register_type: RegisterType) -> &HashMap<u16, CacheEntry> {
    match register_type {
      RegisterType::Coils => &self.coils,
      RegisterType::DiscreteInputs => &self.discrete_inputs,
      RegisterType::HoldingRegister => &self.holding_registers,
      RegisterType::AnalogInputs => &self.analog_inputs,
    }
  }

  fn entries_mut(
    &mut self,
    register_type: RegisterType,
  ) -> &mut HashMap<u16, CacheEntry> {
    match register_type {
      RegisterType::Coils => &mut self.coils,
      RegisterType::DiscreteInputs => &mut self.discrete_inputs,
      RegisterType::HoldingRegister => &mut self.holding_registers,
      RegisterType::AnalogInputs => &mut self.analog_inputs,
    }
  }

  /// Overwrites one entry per register of `address` with `values`.
  pub(crate) fn update(
    &mut self,
    address: &Address,
    values: &[u16],
    now: DateTime<Utc>,
  ) {
    let entries = self.entries_mut(address.register_type);
    for (register, value) in address.registers().zip(values.iter()) {
      entries.insert(
        register,
        CacheEntry {
          data: Some(vec![*value]),
          error: None,
          timestamp: now,
        },
      );
    }
  }

  /// Stores `error` for every register of `address` unless the register
  /// still holds data younger than [`error_timeout`].
  pub(crate) fn update_error(
    &mut self,
    address: &Address,
    error: &RequestError,
    now: DateTime<Utc>,
  ) {
    let entries = self.entries_mut(address.register_type);
    for register in address.registers() {
      let fresh = entries.get(&register).is_some_and(|entry| {
        entry.data.is_some() && now - entry.timestamp < error_timeout()
      });
      if fresh {
        continue;
      }

      entries.insert(
        register,
        CacheEntry {
          data: None,
          error: Some(error.clone()),
          timestamp: now,
        },
      );
    }
  }

  #[cfg(test)]
  pub(crate) fn get(
    &self,
    register_type: RegisterType,
    register: u16,
  ) -> Option<&CacheEntry> {
    self.entries(register_type).get(&register)
  }

  /// Entries for every register of `address` or nothing when any is missing.
  pub(crate) fn lookup(&self, address: &Address) -> Option<Vec<CacheEntry>> {
    let entries = self.entries(address.register_type);
    address
      .registers()
      .map(|register| entries.get(&register).cloned())
      .collect()
  }

  pub(crate) fn add_error(&mut self, record: ErrorRecord) {
    if self.errors.len() >= MAX_ERRORS {
      self.errors.pop_front();
    }
    self.errors.push_back(record);
  }

  pub(crate) fn count_request(&mut self, task: Task, now: DateTime<Utc>) {
    let minute = now.minute() as usize % MINUTES;
    self.request_counts[task.index()][minute] += 1;
  }

  #[tracing::instrument(skip_all)]
  pub(crate) fn cleanup(&mut self, now: DateTime<Utc>) {
    for register_type in RegisterType::ALL {
      self
        .entries_mut(register_type)
        .retain(|_, entry| now - entry.timestamp <= data_timeout());
    }

    self
      .errors
      .retain(|record| now - record.timestamp <= error_clean_timeout());

    // NOTE: the minute before this one has been fully counted by now
    let previous = (now.minute() as usize + MINUTES - 1) % MINUTES;
    for counts in self.request_counts.iter_mut() {
      counts[previous] = 0;
    }
  }

  pub(crate) fn errors(&self) -> Vec<ErrorRecord> {
    self.errors.iter().cloned().collect()
  }

  #[cfg(test)]
  pub(crate) fn request_counts(&self) -> &RequestCounts {
    &self.request_counts
  }

  /// Requests per task summed over the tracked hour.
  pub(crate) fn request_counts_by_task(&self) -> [u32; TASK_COUNT] {
    let mut totals = [0; TASK_COUNT];
    for (total, counts) in totals.iter_mut().zip(self.request_counts.iter()) {
      *total = counts.iter().sum();
    }
    totals
  }
}

/// Slave caches of one physical link, shared by everything using the link.
#[derive(Clone, Debug, Default)]
pub(crate) struct SlaveCaches(Arc<Mutex<HashMap<u8, SlaveCache>>>);

impl SlaveCaches {
  /// Runs `f` on the cache of `slave`, creating it on first access.
  pub(crate) fn with<TResult>(
    &self,
    slave: u8,
    f: impl FnOnce(&mut SlaveCache) -> TResult,
  ) -> TResult {
    let mut caches = self.0.lock();
    f(caches.entry(slave).or_default())
  }

  /// Runs `f` on the cache of `slave` without creating it.
  pub(crate) fn peek<TResult>(
    &self,
    slave: u8,
    f: impl FnOnce(&SlaveCache) -> TResult,
  ) -> Option<TResult> {
    self.0.lock().get(&slave).map(f)
  }

  pub(crate) fn cleanup(&self, now: DateTime<Utc>) {
    for cache in self.0.lock().values_mut() {
      cache.cleanup(now);
    }
  }
}

/// Link id to slave caches.
#[derive(Clone, Debug, Default)]
pub(crate) struct Registry {
  links: Arc<Mutex<HashMap<String, SlaveCaches>>>,
}

impl Registry {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn for_link(&self, link_id: &str) -> SlaveCaches {
    self
      .links
      .lock()
      .entry(link_id.to_string())
      .or_default()
      .clone()
  }

  pub(crate) fn cleanup(&self, now: DateTime<Utc>) {
    let links = self.links.lock().values().cloned().collect::<Vec<_>>();
    for caches in links {
      caches.cleanup(now);
    }
  }
}
