// src/error.rs

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// How a session should be closed when an error is raised.
///
/// Errors may carry one of these as an override; without one a fatal error
/// tears the session down dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseType {
  /// Orderly close: flush queued data, exchange close messages.
  Gentle,
  /// Discard queued data, send the close message, do not wait for the peer.
  Quick,
  /// No further engine calls, transport torn down immediately.
  Dirty,
  /// Report the error but leave the session open.
  None,
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SecureError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(Arc<io::Error>),

  #[error("Connection closed by peer or transport")]
  ConnectionClosed,

  // --- Engine Errors ---
  /// Failure reported by the record-layer engine (malformed record, crypto failure, ...).
  #[error("Engine failure: {reason}")]
  Engine {
    reason: String,
    close: Option<CloseType>,
  },

  /// A buffer needed to grow past its configured maximum.
  #[error("Buffer limit exceeded: {buffer} needs more than {max} bytes")]
  BufferLimit { buffer: &'static str, max: usize },

  // --- Timeouts ---
  #[error("Handshake timed out")]
  HandshakeTimeout,

  // --- Delegated Tasks ---
  #[error("Delegated task failed: {0}")]
  TaskFailed(String),

  #[error("Executor rejected delegated task: {0}")]
  ExecutorRejected(String),

  // --- State Errors ---
  #[error("Session is closed")]
  Closed,

  #[error("Operation is invalid for the current state: {0}")]
  InvalidState(&'static str),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}

impl From<io::Error> for SecureError {
  fn from(e: io::Error) -> Self {
    match e.kind() {
      io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
        SecureError::ConnectionClosed
      }
      _ => SecureError::Io(Arc::new(e)),
    }
  }
}

impl SecureError {
  /// Builds an engine failure without a close override.
  pub fn engine(reason: impl Into<String>) -> Self {
    SecureError::Engine {
      reason: reason.into(),
      close: None,
    }
  }

  /// Builds an engine failure that asks for a specific close type instead of the
  /// default dirty teardown.
  pub fn engine_with_close(reason: impl Into<String>, close: CloseType) -> Self {
    SecureError::Engine {
      reason: reason.into(),
      close: Some(close),
    }
  }

  /// The close type requested by this error, if it carries one.
  pub fn close_override(&self) -> Option<CloseType> {
    match self {
      SecureError::Engine { close, .. } => *close,
      _ => None,
    }
  }

  /// True for the dedicated handshake timeout error.
  pub fn is_timeout(&self) -> bool {
    matches!(self, SecureError::HandshakeTimeout)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_errors_map_to_connection_closed() {
    let err: SecureError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(err, SecureError::ConnectionClosed));

    let err: SecureError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
    assert!(matches!(err, SecureError::Io(_)));
  }

  #[test]
  fn close_override_only_on_engine_errors() {
    assert_eq!(
      SecureError::engine_with_close("bad mac", CloseType::Quick).close_override(),
      Some(CloseType::Quick)
    );
    assert_eq!(SecureError::engine("bad mac").close_override(), None);
    assert_eq!(SecureError::HandshakeTimeout.close_override(), None);
  }
}
