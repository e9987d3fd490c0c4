// src/adapter/closing.rs

//! Closing negotiation: gentle, quick and dirty teardown, plus fatal errors.

use super::driver::Step;
use super::{ClosingState, EngineCore, HandshakeMarker};
use crate::engine::SecureEngine;
use crate::error::SecureError;
use crate::runtime::TimerKind;
use crate::session::{CloseStrength, SessionContext};

/// Upper bound on wrap calls spent emitting the close record on a quick close.
const QUICK_CLOSE_WRAP_ATTEMPTS: usize = 4;

impl<E: SecureEngine> EngineCore<E> {
  /// Closes with the configured default strength.
  pub(crate) fn close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    let strength = self.config.default_close_strength;
    self.close_with(ctx, strength);
  }

  pub(crate) fn close_with<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, strength: CloseStrength) {
    match strength {
      CloseStrength::Gentle => self.gentle_close(ctx),
      CloseStrength::Quick => self.quick_close(ctx),
      CloseStrength::Dirty => self.dirty_close(ctx),
    }
  }

  /// Flushes queued writes, sends the close message and, if configured, waits
  /// for the peer's.
  pub(crate) fn gentle_close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if self.closing != ClosingState::None {
      tracing::trace!(session = self.session_id, closing = ?self.closing, "Close already in progress");
      return;
    }
    self.ensure_started(ctx);
    if self.closing != ClosingState::None {
      return;
    }
    if let Err(e) = self.trigger_lazy_handshake(ctx) {
      self.fail(ctx, e);
      return;
    }
    self.begin_gentle_close(ctx);
    self.drive(ctx);
  }

  /// Moves to `Sending` without driving; the caller's loop picks it up.
  pub(super) fn begin_gentle_close<C: SessionContext + ?Sized>(&mut self, ctx: &C) {
    if self.closing != ClosingState::None {
      return;
    }
    let pending = self.buffers.as_ref().map_or(0, |b| b.pending_app_bytes());
    tracing::debug!(session = self.session_id, pending_bytes = pending, "Gentle close started");
    self.closing = ClosingState::Sending;
    self.hs_timer.cancel();
    self
      .close_timer
      .arm_once(ctx, TimerKind::Closing, self.config.close_timeout, self.round);
  }

  /// Discards queued writes, emits the close message and finishes without
  /// waiting for the peer.
  pub(crate) fn quick_close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if self.closing == ClosingState::Finished {
      tracing::trace!(session = self.session_id, "Quick close on finished adapter ignored");
      return;
    }
    tracing::debug!(session = self.session_id, closing = ?self.closing, "Quick close");
    self.fail_pending_writes(SecureError::Closed);
    self.hs_timer.cancel();

    let handshake_begun = self.marker != HandshakeMarker::Requested;
    if self.buffers.is_some() && handshake_begun && !self.task_in_flight && !self.engine.is_outbound_done() {
      // `Finishing` keeps the wrap path from running its own close transition.
      self.closing = ClosingState::Finishing;
      if !self.outbound_close_issued {
        self.engine.close_outbound();
        self.outbound_close_issued = true;
      }
      for _ in 0..QUICK_CLOSE_WRAP_ATTEMPTS {
        if self.engine.is_outbound_done() {
          break;
        }
        let status = self.engine.handshake_status();
        match self.wrap_once(ctx, status) {
          Ok(Step::Continue) => {}
          Ok(Step::Stop) => break,
          Err(e) => {
            tracing::debug!(session = self.session_id, error = %e, "Close record not sent on quick close");
            break;
          }
        }
      }
    }
    self.finish(ctx, CloseStrength::Quick);
  }

  /// Tears down immediately: no engine calls, queued writes fail.
  pub(crate) fn dirty_close<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if self.closing == ClosingState::Finished {
      tracing::trace!(session = self.session_id, "Dirty close on finished adapter ignored");
      return;
    }
    tracing::debug!(session = self.session_id, closing = ?self.closing, "Dirty close");
    self.finish(ctx, CloseStrength::Dirty);
  }

  /// The close message was wrapped and flushed.
  pub(super) fn on_outbound_closed<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    match self.closing {
      ClosingState::None | ClosingState::Sending => {
        tracing::debug!(session = self.session_id, "Close message sent");
        self.closing = ClosingState::Finishing;
        self.check_finishing(ctx);
      }
      ClosingState::Finishing | ClosingState::Finished => {}
    }
  }

  /// The peer's close message was unwrapped.
  pub(super) fn on_inbound_closed<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if !self.peer_close_received {
      tracing::debug!(session = self.session_id, closing = ?self.closing, "Peer close message received");
    }
    self.peer_close_received = true;
    if let Some(bufs) = self.buffers.as_mut() {
      bufs.in_net.clear();
    }
    match self.closing {
      // Answer with our own close once queued data is out.
      ClosingState::None => self.begin_gentle_close(ctx),
      ClosingState::Sending => {}
      ClosingState::Finishing => self.finish(ctx, CloseStrength::Gentle),
      ClosingState::Finished => {}
    }
  }

  fn check_finishing<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if self.closing != ClosingState::Finishing {
      return;
    }
    let inbound_done = self.peer_close_received || self.engine.is_inbound_done();
    if !self.config.wait_for_inbound_close_message || inbound_done {
      self.finish(ctx, CloseStrength::Gentle);
    } else {
      tracing::debug!(session = self.session_id, "Waiting for peer close message");
    }
  }

  pub(super) fn on_close_timeout<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    match self.closing {
      ClosingState::Sending => {
        tracing::warn!(session = self.session_id, "Close timed out with data still queued");
        self.quick_close(ctx);
      }
      ClosingState::Finishing => {
        tracing::warn!(session = self.session_id, "Peer close message not received in time");
        self.finish(ctx, CloseStrength::Gentle);
      }
      ClosingState::None | ClosingState::Finished => {}
    }
  }

  /// Enters `Finished`, releases buffers and asks the session to close.
  pub(super) fn finish<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, strength: CloseStrength) {
    if self.closing == ClosingState::Finished {
      return;
    }
    self.closing = ClosingState::Finished;
    self.hs_timer.cancel();
    self.close_timer.cancel();
    self.handshake_deadline = None;
    if let Some(bufs) = self.buffers.take() {
      for promise in bufs.release(&*self.allocator) {
        promise.fail(SecureError::Closed);
      }
    }
    tracing::debug!(session = self.session_id, ?strength, "Engine adapter finished");
    ctx.close(strength);
  }

  fn fail_pending_writes(&mut self, error: SecureError) {
    let Some(bufs) = self.buffers.as_mut() else {
      return;
    };
    let promises = bufs.drain_out_app(&*self.allocator);
    for promise in promises {
      promise.fail(error.clone());
    }
  }

  /// Reports a fatal error and closes the way the error asks for (dirty by
  /// default, always dirty for a handshake timeout).
  pub(crate) fn fail<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, error: SecureError) {
    if self.closing == ClosingState::Finished {
      tracing::debug!(session = self.session_id, error = %error, "Error after adapter finished");
      return;
    }
    tracing::error!(session = self.session_id, error = %error, "Engine adapter failure");
    ctx.fire_exception(&error);

    let strength = if error.is_timeout() {
      Some(CloseStrength::Dirty)
    } else {
      match error.close_override() {
        Some(close) => CloseStrength::from_close_type(close),
        None => Some(CloseStrength::Dirty),
      }
    };

    match strength {
      Some(CloseStrength::Gentle) => self.gentle_close(ctx),
      Some(CloseStrength::Quick) => {
        self.fail_pending_writes(error);
        self.quick_close(ctx);
      }
      Some(CloseStrength::Dirty) => {
        self.fail_pending_writes(error);
        self.dirty_close(ctx);
      }
      None => self.fail_pending_writes(error),
    }
  }
}
