use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_time::future::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;

use super::address::{Address, TASK_COUNT};
use super::cache::{ErrorRecord, SlaveCaches};
use super::policy::{self, ErrorState, Outcome, RequestError};
use super::queue::{ErrorAction, Queue, QueueEntry, Signal};
use super::span::Span;
use super::transport::{Transport, TransportError};

fn notice_timeout() -> chrono::Duration {
  chrono::Duration::minutes(30)
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct Diagnostics {
  pub(crate) errors: Vec<ErrorRecord>,
  pub(crate) request_counts_by_task: [u32; TASK_COUNT],
  pub(crate) queue_depth: usize,
}

type FinishHook = Box<dyn Fn() + Send + Sync>;

/// Sequential executor for one physical link.
///
/// The only caller of the link's transport. Entries are drained strictly
/// one at a time, highest task first.
pub(crate) struct Worker {
  queue: Queue,
  transport: Arc<dyn Transport>,
  caches: SlaveCaches,
  running: AtomicBool,
  on_finish: Option<FinishHook>,
  notice: parking_lot::Mutex<Notice>,
}

impl std::fmt::Debug for Worker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Worker")
      .field("link", &self.transport.link_id())
      .field("queue", &self.queue.len())
      .field("running", &self.running.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl Worker {
  pub(crate) fn new(
    queue: Queue,
    transport: Arc<dyn Transport>,
    caches: SlaveCaches,
  ) -> Self {
    Self {
      queue,
      transport,
      caches,
      running: AtomicBool::new(false),
      on_finish: None,
      notice: parking_lot::Mutex::new(Notice::default()),
    }
  }

  pub(crate) fn on_finish(
    mut self,
    hook: impl Fn() + Send + Sync + 'static,
  ) -> Self {
    self.on_finish = Some(Box::new(hook));
    self
  }

  pub(crate) fn queue(&self) -> &Queue {
    &self.queue
  }

  pub(crate) fn caches(&self) -> &SlaveCaches {
    &self.caches
  }

  /// Drains the queue unless another drain is already in progress.
  #[tracing::instrument(skip_all, fields(link = %self.transport.link_id()))]
  pub(crate) async fn run(&self) {
    loop {
      if self.queue.is_empty() {
        return;
      }
      if self
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        tracing::trace!("Already running");
        return;
      }

      let depth = self.queue.len();
      if depth % 10 == 0 {
        tracing::debug!("Draining {} queue entries", depth);
      }

      loop {
        self.queue.sort_by_task();
        let entry = match self.queue.dequeue() {
          Some(entry) => entry,
          None => break,
        };
        self.process(entry).await;
      }

      if let Some(on_finish) = &self.on_finish {
        on_finish();
      }
      self.running.store(false, Ordering::Release);
    }
  }

  /// Answers queued read entries that are fully cached without touching
  /// the transport.
  #[tracing::instrument(skip_all, fields(link = %self.transport.link_id()))]
  pub(crate) fn answer_cached(&self) {
    let entries = self.queue.take_where(|entry| {
      entry.options.use_cache
        && !entry.address.is_write()
        && self
          .caches
          .peek(entry.slave_id, |cache| cache.lookup(&entry.address).is_some())
          .unwrap_or(false)
    });
    for entry in entries {
      if !self.answer_from_cache(&entry) {
        // NOTE: evicted by cleanup in between
        self.queue.enqueue_entry(entry);
      }
    }
  }

  pub(crate) fn diagnostics(&self, slave: u8) -> Diagnostics {
    let (errors, request_counts_by_task) = self
      .caches
      .peek(slave, |cache| (cache.errors(), cache.request_counts_by_task()))
      .unwrap_or_else(|| (Vec::new(), [0; TASK_COUNT]));

    Diagnostics {
      errors,
      request_counts_by_task,
      queue_depth: self.queue.len(),
    }
  }

  #[tracing::instrument(skip_all, fields(
    slave = entry.slave_id,
    address = %entry.address,
    task = %entry.options.task,
  ))]
  async fn process(&self, entry: QueueEntry) {
    tracing::trace!("Processing with {} left", self.queue.len());
    let task = entry.options.task;
    self
      .caches
      .with(entry.slave_id, |cache| cache.count_request(task, now()));

    if entry.address.is_write() {
      self.write(entry).await;
    } else {
      self.read(entry).await;
    }
  }

  async fn write(&self, mut entry: QueueEntry) {
    let register_type = entry.address.register_type;
    let data = entry.address.write.clone().unwrap_or_default();
    let result = if register_type.is_writable() {
      self
        .transport
        .write(register_type, entry.slave_id, entry.address.address, &data)
        .await
    } else {
      Err(TransportError::Unsupported(register_type))
    };

    match result {
      Ok(()) => {
        entry.error_state = ErrorState::NoError;
        tracing::trace!("Written");
        entry.callback.resolve(&entry, &data);
      }
      Err(error) => {
        let state = policy::classify(&error);
        entry.error_state = state;
        self.record(&entry, state);
        let error = RequestError::new(state, 1, error);
        self.notice(&entry, &format!("Write failed: {}", error.source));
        let action = entry.callback.error(&entry, &error);
        self.apply(entry, action).await;
      }
    }
  }

  async fn read(&self, mut entry: QueueEntry) {
    if entry.options.use_cache && self.answer_from_cache(&entry) {
      return;
    }

    let register_type = entry.address.register_type;
    let length = entry.address.length();
    let mut attempts = 0;
    loop {
      attempts += 1;
      let error = match self
        .transport
        .read(register_type, entry.slave_id, entry.address.address, length)
        .await
      {
        Ok(result) if result.data.len() >= length as usize => {
          if entry.error_state != ErrorState::NoError {
            tracing::debug!("Succeeded after {}", entry.error_state);
          }
          entry.error_state = ErrorState::NoError;
          let address = entry.address.clone();
          self.caches.with(entry.slave_id, |cache| {
            cache.update(&address, &result.data, now())
          });
          tracing::trace!("Read in {:?}", result.duration);
          entry.callback.resolve(&entry, &result.data);
          return;
        }
        Ok(result) => TransportError::ShortResponse {
          expected: length,
          received: result.data.len(),
        },
        Err(error) => error,
      };

      let outcome = policy::handle(&mut entry, &error);
      self.record(&entry, entry.error_state);

      let failure = match outcome {
        Outcome::Retry { reconnect } => {
          if !reconnect {
            continue;
          }
          match self.transport.reconnect("ReconnectOnError").await {
            Ok(()) => continue,
            Err(reconnect_error) => {
              tracing::warn!("Unable to reconnect {}", reconnect_error);
              reconnect_error
            }
          }
        }
        Outcome::Split { reconnect } => {
          let children = policy::split(&entry);
          tracing::debug!("Split into {} entries", children.len());
          for child in children {
            self.queue.enqueue_entry(child);
          }
          if reconnect {
            if let Err(error) =
              self.transport.reconnect("ReconnectOnError").await
            {
              tracing::warn!("Unable to reconnect {}", error);
            }
          }
          return;
        }
        Outcome::Fail => error,
      };

      let error = RequestError::new(entry.error_state, attempts, failure);
      let address = entry.address.clone();
      self.caches.with(entry.slave_id, |cache| {
        cache.update_error(&address, &error, now())
      });
      self.notice(
        &entry,
        &format!("Failed permanently {}: {}", entry.address, error.source),
      );
      let action = entry.callback.error(&entry, &error);
      self.apply(entry, action).await;
      return;
    }
  }

  /// Resolves every register of `entry` from the cache, one length 1
  /// address at a time.
  fn answer_from_cache(&self, entry: &QueueEntry) -> bool {
    let cached = self
      .caches
      .peek(entry.slave_id, |cache| cache.lookup(&entry.address))
      .flatten();
    let cached = match cached {
      Some(cached) => cached,
      None => return false,
    };

    tracing::trace!("Answering {} from cache", entry.address);
    for (register, cached) in entry.address.registers().zip(cached) {
      let mut single = entry.clone();
      single.address = Address::new(entry.address.register_type, register);
      single.error_state = ErrorState::NoError;
      match (cached.data, cached.error) {
        (Some(data), _) => single.callback.resolve(&single, &data),
        (None, Some(error)) => {
          single.callback.error(&single, &error);
        }
        (None, None) => {
          let error = RequestError::new(
            ErrorState::Other,
            0,
            TransportError::ShortResponse {
              expected: 1,
              received: 0,
            },
          );
          single.callback.error(&single, &error);
        }
      }
    }

    true
  }

  async fn apply(&self, mut entry: QueueEntry, action: ErrorAction) {
    match action {
      ErrorAction::NotHandled | ErrorAction::HandledNoReconnect => {}
      ErrorAction::HandledReconnect => {
        if let Err(error) =
          self.transport.reconnect("ReconnectOnHandledError").await
        {
          tracing::warn!("Unable to reconnect {}", error);
        }
      }
      ErrorAction::Retry => {
        entry.error_count += 1;
        self.queue.retry(entry);
      }
    }
  }

  fn record(&self, entry: &QueueEntry, state: ErrorState) {
    let record = ErrorRecord {
      timestamp: now(),
      task: entry.options.task,
      address: entry.address.clone(),
      state,
    };
    self
      .caches
      .with(entry.slave_id, |cache| cache.add_error(record));
  }

  fn notice(&self, entry: &QueueEntry, message: &str) {
    if !entry.options.print_logs {
      tracing::debug!("{}", message);
      return;
    }

    let message = format!(
      "{} slave {}: {}",
      entry.options.task, entry.slave_id, message
    );
    if self.notice.lock().should_log(&message, now()) {
      tracing::warn!("{}", message);
    } else {
      tracing::debug!("{}", message);
    }
  }
}

/// Suppresses repeats of the last notice for a while.
#[derive(Debug, Default)]
struct Notice {
  last: Option<(String, DateTime<Utc>)>,
}

impl Notice {
  fn should_log(&mut self, message: &str, now: DateTime<Utc>) -> bool {
    let repeated = match &self.last {
      Some((last, at)) => last == message && now - *at < notice_timeout(),
      None => false,
    };
    if !repeated {
      self.last = Some((message.to_string(), now));
    }
    !repeated
  }
}

fn now() -> DateTime<Utc> {
  Utc::now()
}

/// Owns the task that feeds queue signals into a [`Worker`].
#[derive(Debug, Clone)]
pub(crate) struct Driver {
  queue: Queue,
  handle: Arc<Mutex<Option<TaskHandle>>>,
  termination_timeout: futures_time::time::Duration,
}

type TaskHandle = tokio::task::JoinHandle<()>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TerminateError {
  #[error("Termination timed out")]
  Timeout(anyhow::Error),

  #[error("Failed joining inner handle")]
  Join(anyhow::Error),
}

impl Driver {
  pub(crate) fn spawn(
    worker: Arc<Worker>,
    termination_timeout: chrono::Duration,
  ) -> Self {
    let queue = worker.queue().clone();
    let handle = tokio::spawn(Self::execute(worker, queue.signals()));
    Self {
      queue,
      handle: Arc::new(Mutex::new(Some(handle))),
      termination_timeout: futures_time::time::Duration::from_millis(
        termination_timeout.num_milliseconds().max(0) as u64,
      ),
    }
  }

  async fn execute(worker: Arc<Worker>, signals: flume::Receiver<Signal>) {
    loop {
      let mut batch = match signals.recv_async().await {
        Ok(signal) => vec![signal],
        Err(flume::RecvError::Disconnected) => return,
      };
      loop {
        match signals.try_recv() {
          Ok(signal) => batch.push(signal),
          Err(flume::TryRecvError::Empty) => break,
          Err(flume::TryRecvError::Disconnected) => return,
        }
      }
      tracing::trace!("Received signals {:?}", batch);

      if batch.contains(&Signal::CachedEntry) {
        worker.answer_cached();
      }
      worker.run().await;

      if batch.contains(&Signal::Terminate) {
        tracing::trace!("Terminating");
        return;
      }
    }
  }

  pub(crate) async fn terminate(&self) -> Result<(), TerminateError> {
    self.queue.terminate();

    let handle = {
      let mut handle = self.handle.clone().lock_owned().await;
      (*handle).take()
    };
    if let Some(handle) = handle {
      let abort_handle = handle.abort_handle();
      match handle.timeout(self.termination_timeout).await {
        Ok(Ok(_)) => {}
        Err(error) => {
          abort_handle.abort();
          return Err(TerminateError::Timeout(error.into()));
        }
        Ok(Err(error)) => {
          abort_handle.abort();
          return Err(TerminateError::Join(error.into()));
        }
      };
    }

    Ok(())
  }
}
