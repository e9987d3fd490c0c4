// src/transport/mod.rs

//! Tokio sessions hosting an adapter on one task.
//!
//! A session owns its adapter and implements `SessionContext` for it. User code
//! talks to the task through a `SessionHandle` and observes it through the
//! `SessionEvents` receiver.

pub mod datagram;
pub mod stream;

pub use datagram::{DatagramSession, DatagramTransport};
pub use stream::StreamSession;

use crate::buffer::{BufferAllocator, HeapAllocator};
use crate::error::SecureError;
use crate::runtime::{EventSender, TaskExecutor, Timer, TokioTimer};
use crate::session::{CloseStrength, Incident, Interest, SessionContext, WriteFuture, WritePromise};

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Capacity of a session's command mailbox.
const COMMAND_MAILBOX_CAPACITY: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
  NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Requests sent from a `SessionHandle` to its session task.
#[derive(Debug)]
pub enum SessionCommand {
  Write { data: BytesMut, promise: WritePromise },
  Close,
  QuickClose,
  DirtyClose,
}

/// What a session reports to its user.
#[derive(Debug, Clone)]
pub enum SessionEvent {
  /// The first handshake completed.
  Ready,
  Data(Bytes),
  Incident(Incident),
  Exception(SecureError),
  /// The transport is closed. Always the last event.
  Closed,
}

pub type SessionEvents = async_channel::Receiver<SessionEvent>;

/// Services a session lends its adapter.
#[derive(Clone)]
pub struct SessionConfig {
  pub allocator: Arc<dyn BufferAllocator>,
  /// Defaults to a `TokioTimer` on the runtime the session is spawned on.
  pub timer: Option<Arc<dyn Timer>>,
  /// Executor for delegated tasks, unless the adapter configures its own.
  pub executor: Option<Arc<dyn TaskExecutor>>,
  /// Bytes requested per transport read; the receive buffer size for datagrams.
  pub read_buffer_size: usize,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      allocator: Arc::new(HeapAllocator),
      timer: None,
      executor: None,
      read_buffer_size: 16 * 1024,
    }
  }
}

impl fmt::Debug for SessionConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SessionConfig")
      .field("timer", &self.timer.is_some())
      .field("executor", &self.executor.is_some())
      .field("read_buffer_size", &self.read_buffer_size)
      .finish_non_exhaustive()
  }
}

impl SessionConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
    self.allocator = allocator;
    self
  }

  pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
    self.timer = Some(timer);
    self
  }

  pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
    self.executor = Some(executor);
    self
  }

  pub fn with_read_buffer_size(mut self, size: usize) -> Self {
    self.read_buffer_size = size.max(1);
    self
  }
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
  id: u64,
  commands: async_channel::Sender<SessionCommand>,
}

impl SessionHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Queues application data. Waits only for mailbox space; the returned
  /// future settles once the data is on the wire.
  pub async fn write(&self, data: impl Into<BytesMut>) -> WriteFuture {
    let (promise, future) = WritePromise::pair();
    let command = SessionCommand::Write {
      data: data.into(),
      promise,
    };
    if self.commands.send(command).await.is_err() {
      return WriteFuture::failed(SecureError::Closed);
    }
    future
  }

  /// Closes with the adapter's default strength.
  pub async fn close(&self) -> Result<(), SecureError> {
    self.send(SessionCommand::Close).await
  }

  pub async fn quick_close(&self) -> Result<(), SecureError> {
    self.send(SessionCommand::QuickClose).await
  }

  pub async fn dirty_close(&self) -> Result<(), SecureError> {
    self.send(SessionCommand::DirtyClose).await
  }

  pub fn is_closed(&self) -> bool {
    self.commands.is_closed()
  }

  async fn send(&self, command: SessionCommand) -> Result<(), SecureError> {
    self.commands.send(command).await.map_err(|_| SecureError::Closed)
  }
}

pub(crate) fn command_mailbox(id: u64) -> (SessionHandle, async_channel::Receiver<SessionCommand>) {
  let (tx, rx) = async_channel::bounded(COMMAND_MAILBOX_CAPACITY);
  (SessionHandle { id, commands: tx }, rx)
}

/// Fails writes still sitting in a closed session's mailbox.
pub(crate) fn reject_pending_commands(commands: &async_channel::Receiver<SessionCommand>) {
  commands.close();
  while let Ok(command) = commands.try_recv() {
    if let SessionCommand::Write { promise, .. } = command {
      promise.fail(SecureError::Closed);
    }
  }
}

/// `SessionContext` shared by the stream and datagram sessions.
pub(crate) struct SessionCtx {
  pub id: u64,
  pub interest: Interest,
  /// Network bytes waiting for the transport, each with the promise to settle
  /// once it is written.
  pub outbound: VecDeque<(Bytes, Option<WritePromise>)>,
  pub close_requested: Option<CloseStrength>,
  config: SessionConfig,
  timer: Arc<dyn Timer>,
  adapter_events: EventSender,
  session_events: async_channel::Sender<SessionEvent>,
}

impl SessionCtx {
  pub fn new(
    id: u64,
    config: SessionConfig,
    adapter_events: EventSender,
    session_events: async_channel::Sender<SessionEvent>,
  ) -> Result<Self, SecureError> {
    let timer: Arc<dyn Timer> = match &config.timer {
      Some(timer) => timer.clone(),
      None => Arc::new(TokioTimer::current()?),
    };
    Ok(Self {
      id,
      interest: Interest::default(),
      outbound: VecDeque::new(),
      close_requested: None,
      config,
      timer,
      adapter_events,
      session_events,
    })
  }

  pub fn read_buffer_size(&self) -> usize {
    self.config.read_buffer_size
  }

  pub fn wants_read(&self) -> bool {
    self.interest.contains(Interest::READ)
  }

  pub fn can_flush(&self) -> bool {
    self.interest.contains(Interest::WRITE) && !self.outbound.is_empty()
  }

  /// Unwritten bytes of the head of the queue; empty when nothing is queued.
  pub fn pending_bytes(&self) -> &[u8] {
    self.outbound.front().map(|(data, _)| &data[..]).unwrap_or(&[])
  }

  /// Records `n` bytes of the head as written, settling its promise once all
  /// of it is.
  pub fn advance_written(&mut self, n: usize) {
    let Some((data, _)) = self.outbound.front_mut() else {
      return;
    };
    data.advance(n.min(data.len()));
    if data.is_empty() {
      if let Some((_, Some(promise))) = self.outbound.pop_front() {
        promise.complete();
      }
    }
  }

  pub fn fail_outbound(&mut self, error: SecureError) {
    for (_, promise) in self.outbound.drain(..) {
      if let Some(promise) = promise {
        promise.fail(error.clone());
      }
    }
  }

  pub fn emit(&self, event: SessionEvent) {
    if self.session_events.try_send(event).is_err() {
      tracing::trace!(session = self.id, "Session event receiver gone");
    }
  }
}

impl SessionContext for SessionCtx {
  fn session_id(&self) -> u64 {
    self.id
  }

  fn enqueue_write(&mut self, data: Bytes, promise: Option<WritePromise>) {
    if self.close_requested == Some(CloseStrength::Dirty) {
      if let Some(promise) = promise {
        promise.fail(SecureError::Closed);
      }
      return;
    }
    self.outbound.push_back((data, promise));
  }

  fn suspend_read(&mut self) {
    self.interest.remove(Interest::READ);
  }

  fn resume_read(&mut self) {
    self.interest.insert(Interest::READ);
  }

  fn suspend_write(&mut self) {
    self.interest.remove(Interest::WRITE);
  }

  fn resume_write(&mut self) {
    self.interest.insert(Interest::WRITE);
  }

  fn close(&mut self, strength: CloseStrength) {
    tracing::debug!(session = self.id, ?strength, "Adapter requested transport close");
    self.close_requested = Some(strength);
  }

  fn fire_ready(&mut self) {
    self.emit(SessionEvent::Ready);
  }

  fn fire_data_received(&mut self, data: Bytes) {
    self.emit(SessionEvent::Data(data));
  }

  fn fire_incident(&mut self, incident: &Incident) {
    self.emit(SessionEvent::Incident(incident.clone()));
  }

  fn fire_exception(&mut self, error: &SecureError) {
    self.emit(SessionEvent::Exception(error.clone()));
  }

  fn allocator(&self) -> Arc<dyn BufferAllocator> {
    self.config.allocator.clone()
  }

  fn executor(&self) -> Option<Arc<dyn TaskExecutor>> {
    self.config.executor.clone()
  }

  fn timer(&self) -> Arc<dyn Timer> {
    self.timer.clone()
  }

  fn events(&self) -> EventSender {
    self.adapter_events.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::event_mailbox;

  #[tokio::test]
  async fn written_head_settles_its_promise() {
    let (adapter_tx, _adapter_rx) = event_mailbox();
    let (events_tx, _events_rx) = async_channel::unbounded();
    let mut ctx = SessionCtx::new(7, SessionConfig::default(), adapter_tx, events_tx).unwrap();
    let (promise, mut future) = WritePromise::pair();
    ctx.enqueue_write(Bytes::from_static(b"abcd"), Some(promise));

    assert_eq!(ctx.pending_bytes(), b"abcd");
    ctx.advance_written(3);
    assert!(future.try_result().is_none());
    assert_eq!(ctx.pending_bytes(), b"d");
    ctx.advance_written(1);
    assert!(matches!(future.try_result(), Some(Ok(()))));
    assert!(!ctx.can_flush());
  }

  #[tokio::test]
  async fn handle_fails_writes_once_session_is_gone() {
    let (handle, commands) = command_mailbox(next_session_id());
    drop(commands);
    assert!(handle.is_closed());
    let future = handle.write(&b"late"[..]).await;
    assert!(matches!(future.await, Err(SecureError::Closed)));
    assert!(matches!(handle.close().await, Err(SecureError::Closed)));
  }
}
