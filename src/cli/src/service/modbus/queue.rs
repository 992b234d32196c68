use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::address::{Address, Options};
use super::policy::{ErrorState, RequestError};

/// What the owner of an entry did about a terminal error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ErrorAction {
  NotHandled,
  HandledReconnect,
  HandledNoReconnect,
  Retry,
}

/// Receives the outcome of a queue entry.
///
/// Split children share their parent's callback, so one callback can see
/// several partial resolutions for the range it enqueued.
pub(crate) trait Callback: Send + Sync {
  fn resolve(&self, entry: &QueueEntry, values: &[u16]);

  fn error(&self, entry: &QueueEntry, error: &RequestError) -> ErrorAction;
}

#[derive(Clone)]
pub(crate) struct QueueEntry {
  pub(crate) id: uuid::Uuid,
  pub(crate) slave_id: u8,
  pub(crate) address: Address,
  pub(crate) callback: Arc<dyn Callback>,
  pub(crate) error_state: ErrorState,
  pub(crate) error_count: u32,
  pub(crate) options: Options,
}

impl std::fmt::Debug for QueueEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueueEntry")
      .field("id", &self.id)
      .field("slave_id", &self.slave_id)
      .field("address", &self.address)
      .field("error_state", &self.error_state)
      .field("error_count", &self.error_count)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

impl QueueEntry {
  pub(crate) fn new(
    slave_id: u8,
    address: Address,
    callback: Arc<dyn Callback>,
    options: Options,
  ) -> Self {
    Self {
      id: uuid::Uuid::new_v4(),
      slave_id,
      address,
      callback,
      error_state: ErrorState::NoError,
      error_count: 0,
      options,
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Signal {
  NewEntry,
  CachedEntry,
  Terminate,
}

type SignalSender = flume::Sender<Signal>;
type SignalReceiver = flume::Receiver<Signal>;

/// Pending requests for one physical link.
///
/// Plain FIFO; the worker imposes task priority when it drains.
#[derive(Clone, Debug)]
pub(crate) struct Queue {
  entries: Arc<Mutex<VecDeque<QueueEntry>>>,
  sender: SignalSender,
  receiver: SignalReceiver,
}

impl Default for Queue {
  fn default() -> Self {
    Self::new()
  }
}

impl Queue {
  pub(crate) fn new() -> Self {
    let (sender, receiver) = flume::unbounded();
    Self {
      entries: Arc::new(Mutex::new(VecDeque::new())),
      sender,
      receiver,
    }
  }

  pub(crate) fn signals(&self) -> SignalReceiver {
    self.receiver.clone()
  }

  #[tracing::instrument(skip(self, callback, options))]
  pub(crate) fn enqueue(
    &self,
    slave_id: u8,
    address: Address,
    callback: Arc<dyn Callback>,
    options: Options,
  ) -> uuid::Uuid {
    let entry = QueueEntry::new(slave_id, address, callback, options);
    let id = entry.id;
    self.enqueue_entry(entry);
    id
  }

  pub(crate) fn enqueue_entry(&self, entry: QueueEntry) {
    let signal = if entry.options.use_cache && !entry.address.is_write() {
      Signal::CachedEntry
    } else {
      Signal::NewEntry
    };
    self.entries.lock().push_back(entry);
    self.signal(signal);
  }

  /// Re-appends an entry after a recoverable error, keeping its error state.
  pub(crate) fn retry(&self, entry: QueueEntry) {
    tracing::trace!("Requeued {} for slave {}", entry.address, entry.slave_id);
    self.entries.lock().push_back(entry);
    self.signal(Signal::NewEntry);
  }

  pub(crate) fn dequeue(&self) -> Option<QueueEntry> {
    self.entries.lock().pop_front()
  }

  /// Empties the queue and hands the dropped entries back to the caller.
  pub(crate) fn clear(&self) -> Vec<QueueEntry> {
    self.entries.lock().drain(..).collect()
  }

  /// Stable sort, highest task first.
  pub(crate) fn sort_by_task(&self) {
    self
      .entries
      .lock()
      .make_contiguous()
      .sort_by(|a, b| b.options.task.cmp(&a.options.task));
  }

  /// Removes every entry matching `predicate`, preserving the order of the
  /// rest.
  pub(crate) fn take_where(
    &self,
    mut predicate: impl FnMut(&QueueEntry) -> bool,
  ) -> Vec<QueueEntry> {
    let mut entries = self.entries.lock();
    let mut taken = Vec::new();
    let mut kept = VecDeque::with_capacity(entries.len());
    for entry in entries.drain(..) {
      if predicate(&entry) {
        taken.push(entry);
      } else {
        kept.push_back(entry);
      }
    }
    *entries = kept;
    taken
  }

  pub(crate) fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  pub(crate) fn terminate(&self) {
    self.signal(Signal::Terminate);
  }

  fn signal(&self, signal: Signal) {
    if let Err(error) = self.sender.send(signal) {
      // NOTE: the queue owns a receiver so this only fails while dropping
      tracing::trace!("Failed signalling {:?}", error.into_inner());
    }
  }
}
