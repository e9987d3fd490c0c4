// src/session/mod.rs

//! The transport session contract an adapter is driven through.

pub mod incident;
pub mod promise;

#[cfg(test)]
pub(crate) mod testing;

pub use incident::{CloseOnIncidentPolicy, Incident, IncidentAction, IncidentKind, IncidentPolicy, LogIncidentPolicy};
pub use promise::{WriteFuture, WritePromise};

use crate::buffer::BufferAllocator;
use crate::error::{CloseType, SecureError};
use crate::runtime::{EventSender, TaskExecutor, Timer};

use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;

/// How the session should tear the transport down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CloseStrength {
  /// Flush everything queued, then close.
  #[default]
  Gentle,
  /// Flush what is already queued (the close record), skip waiting for the peer.
  Quick,
  /// Close immediately, dropping queued bytes.
  Dirty,
}

impl CloseStrength {
  /// Strength requested by an error's close override. `None` means the error
  /// leaves the session open.
  pub fn from_close_type(close: CloseType) -> Option<CloseStrength> {
    match close {
      CloseType::Gentle => Some(CloseStrength::Gentle),
      CloseType::Quick => Some(CloseStrength::Quick),
      CloseType::Dirty => Some(CloseStrength::Dirty),
      CloseType::None => None,
    }
  }
}

bitflags! {
  /// Readiness the session is interested in.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct Interest: u8 {
    const READ = 0b01;
    const WRITE = 0b10;
  }
}

impl Default for Interest {
  fn default() -> Self {
    Interest::READ | Interest::WRITE
  }
}

/// Services the adapter consumes from the session that owns it.
///
/// Every method is called from the task that owns the adapter. Work finishing
/// elsewhere (timers, executor threads) comes back through `events()`.
pub trait SessionContext {
  fn session_id(&self) -> u64;

  /// Queues network bytes for the transport. The session settles `promise`
  /// once the bytes were written, or fails it if they never will be.
  fn enqueue_write(&mut self, data: Bytes, promise: Option<WritePromise>);

  fn suspend_read(&mut self);

  fn resume_read(&mut self);

  fn suspend_write(&mut self);

  fn resume_write(&mut self);

  /// Closes the transport. `Gentle` and `Quick` flush what is already queued first.
  fn close(&mut self, strength: CloseStrength);

  /// The first handshake completed.
  fn fire_ready(&mut self);

  fn fire_data_received(&mut self, data: Bytes);

  fn fire_incident(&mut self, incident: &Incident);

  fn fire_exception(&mut self, error: &SecureError);

  fn allocator(&self) -> Arc<dyn BufferAllocator>;

  /// Executor for delegated tasks; `None` runs them inline.
  fn executor(&self) -> Option<Arc<dyn TaskExecutor>>;

  fn timer(&self) -> Arc<dyn Timer>;

  /// Mailbox the owner drains into the adapter's `on_event`.
  fn events(&self) -> EventSender;
}
