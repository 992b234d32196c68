use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::address::{Address, Task};
use super::queue::QueueEntry;
use super::span::Span;
use super::transport::TransportError;

pub(crate) const MAX_ERROR_RETRIES_CRC: u32 = 4;
pub(crate) const MAX_ERROR_RETRIES_TIMEOUT: u32 = 1;
pub(crate) const MAX_ERROR_RETRIES_OTHER: u32 = 1;

#[derive(
  Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ErrorState {
  #[default]
  NoError,
  Timeout,
  Crc,
  IllegalAddress,
  IllegalFunctionCode,
  Other,
  InitialConnect,
}

impl Display for ErrorState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ErrorState::NoError => "no error",
      ErrorState::Timeout => "timeout",
      ErrorState::Crc => "crc",
      ErrorState::IllegalAddress => "illegal address",
      ErrorState::IllegalFunctionCode => "illegal function code",
      ErrorState::Other => "other",
      ErrorState::InitialConnect => "initial connect",
    };
    f.write_str(name)
  }
}

/// Terminal failure of one queue entry.
#[derive(Clone, Debug, thiserror::Error)]
#[error("Request failed with {state} after {attempts} attempt(s)")]
pub(crate) struct RequestError {
  pub(crate) state: ErrorState,
  pub(crate) attempts: u32,
  #[source]
  pub(crate) source: Arc<TransportError>,
}

impl RequestError {
  pub(crate) fn new(
    state: ErrorState,
    attempts: u32,
    source: TransportError,
  ) -> Self {
    Self {
      state,
      attempts,
      source: Arc::new(source),
    }
  }
}

impl Serialize for RequestError {
  fn serialize<S: serde::Serializer>(
    &self,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;

    let mut state = serializer.serialize_struct("RequestError", 3)?;
    state.serialize_field("state", &self.state)?;
    state.serialize_field("attempts", &self.attempts)?;
    state.serialize_field("message", &self.source.to_string())?;
    state.end()
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
  Retry { reconnect: bool },
  Split { reconnect: bool },
  Fail,
}

pub(crate) fn classify(error: &TransportError) -> ErrorState {
  match error {
    TransportError::Crc(_) => ErrorState::Crc,
    TransportError::Timeout => ErrorState::Timeout,
    TransportError::Exception(1) => ErrorState::IllegalFunctionCode,
    TransportError::Exception(2) => ErrorState::IllegalAddress,
    TransportError::Exception(_) => ErrorState::Crc,
    TransportError::Unsupported(_) => ErrorState::IllegalFunctionCode,
    TransportError::NotConnected
    | TransportError::ShortResponse { .. }
    | TransportError::Cancelled
    | TransportError::Io(_) => ErrorState::Other,
  }
}

/// Classifies `error`, records it on the entry and decides what happens
/// next.
///
/// `error_count` only grows on the retry path; a split hands the work to
/// fresh children and leaves the parent as is.
#[tracing::instrument(skip_all, fields(
  slave = entry.slave_id,
  address = %entry.address,
  task = %entry.options.task,
))]
pub(crate) fn handle(
  entry: &mut QueueEntry,
  error: &TransportError,
) -> Outcome {
  let state = classify(error);
  entry.error_state = state;
  let splittable =
    entry.options.error_handling.split && entry.address.length() > 1;

  let outcome = match state {
    ErrorState::Crc | ErrorState::IllegalAddress => {
      if splittable {
        Outcome::Split { reconnect: true }
      } else {
        retry(entry, true)
      }
    }
    ErrorState::Timeout => {
      if splittable {
        Outcome::Split { reconnect: false }
      } else {
        retry(entry, false)
      }
    }
    ErrorState::IllegalFunctionCode => Outcome::Fail,
    ErrorState::Other | ErrorState::InitialConnect | ErrorState::NoError => {
      retry(entry, true)
    }
  };

  tracing::debug!(
    "Handled {} ({}) after {} error(s): {:?}",
    state,
    error,
    entry.error_count,
    outcome
  );

  outcome
}

fn retry(entry: &mut QueueEntry, reconnect: bool) -> Outcome {
  if !entry.options.error_handling.retry {
    return Outcome::Fail;
  }

  entry.error_count += 1;
  let exhausted = match entry.error_state {
    ErrorState::Crc | ErrorState::IllegalAddress => {
      entry.error_count >= MAX_ERROR_RETRIES_CRC
    }
    ErrorState::Timeout => entry.error_count > MAX_ERROR_RETRIES_TIMEOUT,
    _ => entry.error_count > MAX_ERROR_RETRIES_OTHER,
  };

  if exhausted {
    Outcome::Fail
  } else {
    Outcome::Retry { reconnect }
  }
}

/// One length 1 child per register of `entry`.
pub(crate) fn split(entry: &QueueEntry) -> Vec<QueueEntry> {
  let mut options = entry.options;
  options.task = Task::Splitted;
  options.error_handling.split = false;
  options.use_cache = false;

  entry
    .address
    .registers()
    .map(|register| {
      QueueEntry::new(
        entry.slave_id,
        Address::new(entry.address.register_type, register),
        entry.callback.clone(),
        options,
      )
    })
    .collect()
}
