// src/engine/mod.rs

//! The pluggable record-layer engine consumed by the adapters.

pub mod null;

use crate::error::SecureError;
use std::fmt;

pub use null::{NullEngine, NullEngineBuilder};

/// What the engine needs next to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
  /// No handshake in progress; application data may flow.
  NotHandshaking,
  /// The engine has handshake (or close) records to produce.
  NeedWrap,
  /// The engine waits for records from the peer.
  NeedUnwrap,
  /// The engine can unwrap again without new transport data.
  NeedUnwrapAgain,
  /// A delegated task must run before the handshake can continue.
  NeedTask,
}

impl HandshakeStatus {
  pub fn is_handshaking(self) -> bool {
    self != HandshakeStatus::NotHandshaking
  }
}

/// Outcome code of a single `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
  Ok,
  /// The destination buffer had too little room.
  BufferOverflow,
  /// The source did not hold a complete record.
  BufferUnderflow,
  /// The engine produced or consumed its final record.
  Closed,
}

/// Result of a single `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
  pub status: EngineStatus,
  pub handshake_status: HandshakeStatus,
  pub bytes_consumed: usize,
  pub bytes_produced: usize,
}

impl EngineResult {
  pub fn new(
    status: EngineStatus,
    handshake_status: HandshakeStatus,
    bytes_consumed: usize,
    bytes_produced: usize,
  ) -> Self {
    Self {
      status,
      handshake_status,
      bytes_consumed,
      bytes_produced,
    }
  }
}

/// CPU-bound unit of work handed out while the engine reports `NeedTask`.
pub type DelegatedTask = Box<dyn FnOnce() -> Result<(), SecureError> + Send + 'static>;

/// A record-layer engine (TLS, DTLS or a test double).
///
/// The engine never touches the transport. The adapter feeds it the bytes it
/// received and flushes whatever it produces.
///
/// `wrap` and `unwrap` receive the free space of the destination buffer as
/// `dst`; produced bytes are written from its start and reported as
/// `bytes_produced`. Consumed bytes are taken from the start of `src`.
///
/// An `unwrap` with an empty `src` while the engine waits for a peer flight
/// signals a retransmission timeout. Datagram engines should re-arm their last
/// flight and report `NeedWrap`; stream engines may ignore it.
pub trait SecureEngine: Send + 'static {
  fn begin_handshake(&mut self) -> Result<(), SecureError>;

  fn handshake_status(&self) -> HandshakeStatus;

  /// Encodes application data from `src` into wire records in `dst`.
  fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError>;

  /// Decodes wire records from `src` into application data in `dst`.
  fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError>;

  /// Next task to run while `handshake_status()` is `NeedTask`.
  fn next_delegated_task(&mut self) -> Option<DelegatedTask>;

  /// Queues the close message; the next `wrap` emits it.
  fn close_outbound(&mut self);

  /// Marks the inbound side closed. Fails if the peer's close message was never
  /// received (possible truncation).
  fn close_inbound(&mut self) -> Result<(), SecureError>;

  fn is_outbound_done(&self) -> bool;

  fn is_inbound_done(&self) -> bool;

  fn min_app_buffer_size(&self) -> usize;

  fn max_app_buffer_size(&self) -> usize;

  fn min_net_buffer_size(&self) -> usize;

  fn max_net_buffer_size(&self) -> usize;
}

impl<E: SecureEngine + ?Sized> SecureEngine for Box<E> {
  fn begin_handshake(&mut self) -> Result<(), SecureError> {
    (**self).begin_handshake()
  }
  fn handshake_status(&self) -> HandshakeStatus {
    (**self).handshake_status()
  }
  fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError> {
    (**self).wrap(src, dst)
  }
  fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError> {
    (**self).unwrap(src, dst)
  }
  fn next_delegated_task(&mut self) -> Option<DelegatedTask> {
    (**self).next_delegated_task()
  }
  fn close_outbound(&mut self) {
    (**self).close_outbound()
  }
  fn close_inbound(&mut self) -> Result<(), SecureError> {
    (**self).close_inbound()
  }
  fn is_outbound_done(&self) -> bool {
    (**self).is_outbound_done()
  }
  fn is_inbound_done(&self) -> bool {
    (**self).is_inbound_done()
  }
  fn min_app_buffer_size(&self) -> usize {
    (**self).min_app_buffer_size()
  }
  fn max_app_buffer_size(&self) -> usize {
    (**self).max_app_buffer_size()
  }
  fn min_net_buffer_size(&self) -> usize {
    (**self).min_net_buffer_size()
  }
  fn max_net_buffer_size(&self) -> usize {
    (**self).max_net_buffer_size()
  }
}

/// Which engine operation a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineOp {
  Wrap,
  Unwrap,
}

impl fmt::Display for EngineOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EngineOp::Wrap => f.write_str("wrap"),
      EngineOp::Unwrap => f.write_str("unwrap"),
    }
  }
}
