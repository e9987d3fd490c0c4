// src/runtime/mailbox.rs

//! Channel through which timers and executor threads hand control back to the
//! task that owns an adapter.

use crate::error::SecureError;

/// Which adapter timer produced a `TimerFired` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
  /// Overall handshake deadline.
  Handshake,
  /// Datagram flight retransmission.
  Retransmit,
  /// Bound on waiting for the peer's close message.
  Closing,
}

/// Completion signals posted to the owning task. The owner feeds each one back
/// into the adapter with `on_event`.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
  TaskCompleted { result: Result<(), SecureError> },
  TimerFired { kind: TimerKind, generation: u64 },
}

/// The sending end of an adapter's event mailbox. Cloneable, usable from any thread.
pub type EventSender = async_channel::Sender<AdapterEvent>;

/// The receiving end of an adapter's event mailbox.
pub type EventReceiver = async_channel::Receiver<AdapterEvent>;

/// Creates an event mailbox.
///
/// Unbounded: senders are timer callbacks and blocking threads that cannot
/// await, and at most a handful of events are outstanding per adapter.
pub fn event_mailbox() -> (EventSender, EventReceiver) {
  async_channel::unbounded()
}

/// Posts an event, ignoring a mailbox whose owner already went away.
pub(crate) fn post(events: &EventSender, event: AdapterEvent) {
  if let Err(e) = events.try_send(event) {
    tracing::trace!(event = ?e.into_inner(), "Adapter mailbox closed, dropping event");
  }
}
