// src/adapter/datagram.rs

use super::driver::UnwrapMode;
use super::{ClosingState, EngineCore, Flavor, HandshakeMarker};
use crate::config::EngineAdapterConfig;
use crate::engine::SecureEngine;
use crate::error::SecureError;
use crate::runtime::{AdapterEvent, TimerKind};
use crate::session::{Incident, IncidentKind, SessionContext, WriteFuture, WritePromise};

use bytes::BytesMut;
use std::sync::Arc;

#[cfg(any(test, feature = "test-support"))]
use super::BufferCapacities;

/// Drives an engine over a datagram transport.
///
/// Every wrap result is sent as exactly one datagram and every received
/// datagram is unwrapped on its own. Several records packed into one datagram
/// are unwrapped in turn; a datagram holding only part of a record is dropped
/// (or kept for the next one, per `IncompleteDatagramPolicy`).
///
/// While waiting for the peer's answer to a handshake flight a repeating
/// retransmission timer re-arms the engine's last flight. It shares one slot
/// with the handshake timer, and a fire from an earlier round does nothing.
#[derive(Debug)]
pub struct DatagramEngineAdapter<E: SecureEngine> {
  core: EngineCore<E>,
}

impl<E: SecureEngine> DatagramEngineAdapter<E> {
  pub fn new(engine: E, config: Arc<EngineAdapterConfig>) -> Self {
    Self {
      core: EngineCore::new(engine, config, Flavor::Datagram),
    }
  }

  pub fn start<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    self.core.start(ctx);
  }

  pub fn write<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: &[u8]) -> WriteFuture {
    self.core.write(ctx, data)
  }

  pub fn write_owned<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: BytesMut) -> WriteFuture {
    self.core.write_owned(ctx, data)
  }

  pub fn write_with_promise<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: BytesMut, promise: WritePromise) {
    self.core.write_with_promise(ctx, data, promise);
  }

  pub fn begin_handshake<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, lazy: bool) {
    self.core.begin_handshake(ctx, lazy);
  }

  /// Feeds one received datagram.
  pub fn on_datagram<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, datagram: &[u8]) {
    let core = &mut self.core;
    core.ensure_started(ctx);
    if core.closing == ClosingState::Finished || core.peer_close_received || datagram.is_empty() {
      return;
    }
    if let Err(e) = core.trigger_lazy_handshake(ctx) {
      core.fail(ctx, e);
      return;
    }

    let Some(bufs) = core.buffers.as_mut() else {
      return;
    };
    if bufs.in_net.len() + datagram.len() > bufs.in_net.max() {
      tracing::debug!(session = core.session_id, bytes = datagram.len(), "Datagram exceeds inbound buffer");
      let cause = SecureError::BufferLimit {
        buffer: bufs.in_net.name(),
        max: bufs.in_net.max(),
      };
      core.raise_incident(ctx, Incident::with_cause(IncidentKind::OversizedDatagram, cause));
      core.update_interest(ctx);
      return;
    }
    if let Err(e) = bufs.in_net.grow(&*core.allocator, datagram.len()) {
      core.fail(ctx, e);
      return;
    }
    let taken = bufs.in_net.extend_from(datagram);
    core.in_net_stalled = false;
    tracing::trace!(session = core.session_id, bytes = taken, "Datagram buffered");
    core.drive(ctx);
  }

  pub fn close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    self.core.close(ctx);
  }

  pub fn quick_close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    self.core.quick_close(ctx);
  }

  pub fn dirty_close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    self.core.dirty_close(ctx);
  }

  pub fn on_event<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, event: AdapterEvent) {
    self.core.on_event(ctx, event);
  }

  pub fn closing_state(&self) -> ClosingState {
    self.core.closing_state()
  }

  pub fn handshake_marker(&self) -> HandshakeMarker {
    self.core.handshake_marker()
  }

  pub fn is_handshaking(&self) -> bool {
    self.core.is_handshaking()
  }

  pub fn engine(&self) -> &E {
    self.core.engine()
  }

  #[cfg(any(test, feature = "test-support"))]
  pub fn buffer_capacities(&self) -> Option<BufferCapacities> {
    self.core.buffer_capacities()
  }

  #[cfg(any(test, feature = "test-support"))]
  pub fn task_in_flight(&self) -> bool {
    self.core.task_in_flight()
  }
}

impl<E: SecureEngine> EngineCore<E> {
  pub(super) fn on_retransmit_timer<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if self.closing != ClosingState::None || self.marker != HandshakeMarker::Started {
      self.hs_timer.cancel();
      return;
    }
    if let Some(remaining) = self.handshake_remaining(ctx) {
      if remaining.is_zero() {
        tracing::warn!(session = self.session_id, round = self.round, "Handshake timed out during retransmission");
        self.fail(ctx, SecureError::HandshakeTimeout);
        return;
      }
      if self.hs_timer.active_round() != Some(self.round) {
        // The peer answered since this timer was armed; only the deadline is left to watch.
        tracing::trace!(session = self.session_id, round = self.round, "Stale retransmission ignored");
        self.hs_timer.arm_once(ctx, TimerKind::Handshake, remaining, self.round);
        return;
      }
    }
    if self.task_in_flight {
      return;
    }

    tracing::debug!(session = self.session_id, round = self.round, "Retransmitting handshake flight");
    let status = self.engine.handshake_status();
    if let Err(e) = self.unwrap_once(ctx, status, UnwrapMode::RetransmitCue) {
      self.fail(ctx, e);
      return;
    }
    self.drive(ctx);
    self.hand_over_to_deadline(ctx);
  }

  /// Swaps the retransmission timer for the handshake timer once the deadline
  /// comes before the next retransmission would.
  fn hand_over_to_deadline<C: SessionContext + ?Sized>(&mut self, ctx: &C) {
    if self.closing != ClosingState::None || self.hs_timer.active_kind() != Some(TimerKind::Retransmit) {
      return;
    }
    let Some(remaining) = self.handshake_remaining(ctx) else {
      return;
    };
    if remaining <= self.config.retransmission_interval {
      tracing::debug!(session = self.session_id, round = self.round, ?remaining, "Handshake deadline due before next retransmission");
      self.hs_timer.arm_once(ctx, TimerKind::Handshake, remaining, self.round);
    }
  }
}
