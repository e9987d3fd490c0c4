// src/adapter/driver.rs

//! The wrap/unwrap pump.
//!
//! `drive` keeps asking the engine what it needs next and does it until no
//! further progress is possible without an outside event (more transport
//! bytes, a finished task, a timer).

use super::{ClosingState, EngineCore, Flavor, HandshakeMarker};
use crate::config::IncompleteDatagramPolicy;
use crate::engine::{EngineOp, EngineResult, EngineStatus, HandshakeStatus, SecureEngine};
use crate::error::SecureError;
use crate::runtime::TimerKind;
use crate::session::{Incident, IncidentKind, SessionContext, WritePromise};

use bytes::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Step {
  Continue,
  Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UnwrapMode {
  /// Unwrap buffered transport bytes; stop if there are none.
  Fresh,
  /// The engine can make progress without new bytes.
  Again,
  /// Retransmission timeout: unwrap with empty input so the engine re-arms its
  /// last flight.
  RetransmitCue,
}

impl<E: SecureEngine> EngineCore<E> {
  /// Runs the engine as far as it can go, then syncs read/write interest.
  /// Fatal errors close the session according to their close override.
  pub(crate) fn drive<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if let Err(e) = self.drive_loop(ctx) {
      self.fail(ctx, e);
    }
    self.update_interest(ctx);
  }

  fn drive_loop<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) -> Result<(), SecureError> {
    loop {
      if self.closing == ClosingState::Finished || self.task_in_flight || self.buffers.is_none() {
        return Ok(());
      }
      self.maybe_close_outbound();

      let status = self.engine.handshake_status();
      self.track_handshake(ctx, status);

      let step = match status {
        HandshakeStatus::NotHandshaking => self.step_not_handshaking(ctx, status)?,
        HandshakeStatus::NeedWrap => self.wrap_once(ctx, status)?,
        HandshakeStatus::NeedUnwrap => self.unwrap_once(ctx, status, UnwrapMode::Fresh)?,
        HandshakeStatus::NeedUnwrapAgain => self.unwrap_once(ctx, status, UnwrapMode::Again)?,
        HandshakeStatus::NeedTask => self.delegate_task(ctx)?,
      };
      if step == Step::Stop {
        return Ok(());
      }
    }
  }

  /// Handshake bookkeeping: marker, ready notification and timers.
  fn track_handshake<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, status: HandshakeStatus) {
    // Draining records the engine already holds neither starts nor ends a handshake.
    if self.closing != ClosingState::None || status == HandshakeStatus::NeedUnwrapAgain {
      return;
    }
    if status.is_handshaking() {
      if self.marker != HandshakeMarker::Started {
        // Started by the engine itself: implicit on first data, or by the peer.
        tracing::debug!(session = self.session_id, ?status, "Engine began handshaking");
        self.marker = HandshakeMarker::Started;
        self.arm_handshake_timer(ctx);
      }
      if self.flavor == Flavor::Datagram && status == HandshakeStatus::NeedUnwrap && self.flight_sent {
        self.arm_retransmit(ctx);
      }
    } else if self.marker == HandshakeMarker::Started {
      self.marker = HandshakeMarker::None;
      self.hs_timer.cancel();
      self.handshake_deadline = None;
      self.flight_sent = false;
      tracing::info!(session = self.session_id, round = self.round, "Handshake completed");
      if !self.ready_fired {
        self.ready_fired = true;
        ctx.fire_ready();
      }
    }
  }

  fn step_not_handshaking<C: SessionContext + ?Sized>(
    &mut self,
    ctx: &mut C,
    status: HandshakeStatus,
  ) -> Result<Step, SecureError> {
    let (can_wrap, can_unwrap) = match self.buffers.as_ref() {
      Some(bufs) => (
        !bufs.out_app.is_empty() && matches!(self.closing, ClosingState::None | ClosingState::Sending),
        !bufs.in_net.is_empty() && !self.in_net_stalled && !self.peer_close_received,
      ),
      None => return Ok(Step::Stop),
    };
    match (can_wrap, can_unwrap) {
      (false, false) => Ok(Step::Stop),
      (true, false) => self.wrap_once(ctx, status),
      (false, true) => self.unwrap_once(ctx, status, UnwrapMode::Fresh),
      // Finish the side we were on before switching.
      (true, true) => match self.last_op {
        EngineOp::Unwrap => self.unwrap_once(ctx, status, UnwrapMode::Fresh),
        EngineOp::Wrap => self.wrap_once(ctx, status),
      },
    }
  }

  pub(super) fn wrap_once<C: SessionContext + ?Sized>(
    &mut self,
    ctx: &mut C,
    status: HandshakeStatus,
  ) -> Result<Step, SecureError> {
    let engine = &mut self.engine;
    let Some(bufs) = self.buffers.as_mut() else {
      return Ok(Step::Stop);
    };
    let src: &[u8] = bufs.out_app.front().map(|c| &c.data[..]).unwrap_or(&[]);
    let res = bufs.out_net.fill_with(|dst| {
      let res = engine.wrap(src, dst)?;
      Ok((res, res.bytes_produced))
    })?;
    self.last_op = EngineOp::Wrap;
    self.trace_result(EngineOp::Wrap, &res);

    match res.status {
      EngineStatus::Ok | EngineStatus::Closed => {
        let promise = self.consume_out_app(res.bytes_consumed);
        if res.bytes_produced > 0 {
          if status.is_handshaking() && self.closing == ClosingState::None {
            self.flight_sent = true;
          }
          self.flush(ctx, promise);
        } else if let Some(promise) = promise {
          promise.complete();
        }

        if res.status == EngineStatus::Closed {
          let before = self.closing;
          self.on_outbound_closed(ctx);
          return Ok(if self.closing != before || res.bytes_produced > 0 {
            Step::Continue
          } else {
            Step::Stop
          });
        }
        Ok(progress(&res, status))
      }
      EngineStatus::BufferOverflow => {
        let Some(bufs) = self.buffers.as_mut() else {
          return Ok(Step::Stop);
        };
        bufs.out_net.grow_to_max(&*self.allocator)?;
        Ok(Step::Continue)
      }
      EngineStatus::BufferUnderflow => {
        tracing::debug!(session = self.session_id, "Engine reported underflow on wrap");
        Ok(Step::Stop)
      }
    }
  }

  pub(super) fn unwrap_once<C: SessionContext + ?Sized>(
    &mut self,
    ctx: &mut C,
    status: HandshakeStatus,
    mode: UnwrapMode,
  ) -> Result<Step, SecureError> {
    let engine = &mut self.engine;
    let Some(bufs) = self.buffers.as_mut() else {
      return Ok(Step::Stop);
    };
    if mode == UnwrapMode::Fresh && (bufs.in_net.is_empty() || self.in_net_stalled || self.peer_close_received) {
      // Wait for the next read.
      return Ok(Step::Stop);
    }

    let in_net = &mut bufs.in_net;
    let in_app = &mut bufs.in_app;
    let src: &[u8] = if mode == UnwrapMode::RetransmitCue { &[] } else { in_net.data() };
    let res = match in_app.fill_with(|dst| {
      let res = engine.unwrap(src, dst)?;
      Ok((res, res.bytes_produced))
    }) {
      Ok(res) => res,
      Err(e) => {
        // Input the engine rejected is not offered to it again.
        in_net.clear();
        return Err(e);
      }
    };
    in_net.consume(res.bytes_consumed);
    self.last_op = EngineOp::Unwrap;
    self.trace_result(EngineOp::Unwrap, &res);

    if res.bytes_consumed > 0 && status.is_handshaking() {
      self.round += 1;
      self.flight_sent = false;
    }

    match res.status {
      EngineStatus::Ok => {
        self.deliver(ctx);
        Ok(progress(&res, status))
      }
      EngineStatus::Closed => {
        self.deliver(ctx);
        let before = self.closing;
        self.on_inbound_closed(ctx);
        Ok(if self.closing != before || res.bytes_consumed > 0 {
          Step::Continue
        } else {
          Step::Stop
        })
      }
      EngineStatus::BufferOverflow => {
        let Some(bufs) = self.buffers.as_mut() else {
          return Ok(Step::Stop);
        };
        bufs.in_app.grow_to_max(&*self.allocator)?;
        Ok(Step::Continue)
      }
      EngineStatus::BufferUnderflow => self.on_underflow(ctx, mode),
    }
  }

  fn on_underflow<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, mode: UnwrapMode) -> Result<Step, SecureError> {
    if mode == UnwrapMode::RetransmitCue {
      return Ok(Step::Stop);
    }
    let Some(bufs) = self.buffers.as_mut() else {
      return Ok(Step::Stop);
    };
    if bufs.in_net.is_empty() {
      return Ok(Step::Stop);
    }

    let buffer_partial = match self.flavor {
      Flavor::Stream => true,
      Flavor::Datagram => self.config.incomplete_datagram_policy == IncompleteDatagramPolicy::Buffer,
    };
    if buffer_partial {
      // A partial record must fit once the rest arrives.
      if bufs.in_net.is_full() {
        bufs.in_net.grow(&*self.allocator, 1)?;
      }
      self.in_net_stalled = true;
      return Ok(Step::Stop);
    }

    let dropped = bufs.in_net.len();
    bufs.in_net.clear();
    tracing::debug!(session = self.session_id, bytes = dropped, "Discarding incomplete datagram");
    self.raise_incident(
      ctx,
      Incident::with_cause(
        IncidentKind::IncompleteDatagram,
        SecureError::engine(format!("{} byte datagram held no complete record", dropped)),
      ),
    );
    Ok(Step::Stop)
  }

  /// Drops `n` wrapped bytes from the head of the outbound queue. Returns the
  /// promise of the write whose last byte was just consumed.
  fn consume_out_app(&mut self, n: usize) -> Option<WritePromise> {
    if n == 0 {
      return None;
    }
    let bufs = self.buffers.as_mut()?;
    let front = bufs.out_app.front_mut()?;
    let n = n.min(front.data.len());
    front.data.advance(n);
    if !front.data.is_empty() {
      return None;
    }
    let chunk = bufs.out_app.pop_front()?;
    self.allocator.release(chunk.data);
    chunk.promise
  }

  /// Hands everything in the outbound network buffer to the session.
  fn flush<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, promise: Option<WritePromise>) {
    let Some(bufs) = self.buffers.as_mut() else {
      if let Some(promise) = promise {
        promise.fail(SecureError::Closed);
      }
      return;
    };
    let data = bufs.out_net.take_all().freeze();
    tracing::trace!(session = self.session_id, bytes = data.len(), "Flushing network bytes");
    ctx.enqueue_write(data, promise);
  }

  fn deliver<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    let Some(bufs) = self.buffers.as_mut() else {
      return;
    };
    if bufs.in_app.is_empty() {
      return;
    }
    let data = bufs.in_app.take_all().freeze();
    tracing::trace!(session = self.session_id, bytes = data.len(), "Delivering application data");
    ctx.fire_data_received(data);
  }

  /// Issues `close_outbound` once the data queued before a gentle close is wrapped.
  fn maybe_close_outbound(&mut self) {
    if self.closing != ClosingState::Sending || self.outbound_close_issued || self.task_in_flight {
      return;
    }
    let drained = self.buffers.as_ref().map_or(true, |b| b.out_app.is_empty());
    if drained {
      tracing::debug!(session = self.session_id, "Queued data wrapped, closing outbound");
      self.engine.close_outbound();
      self.outbound_close_issued = true;
    }
  }

  fn arm_retransmit<C: SessionContext + ?Sized>(&mut self, ctx: &C) {
    let active = self.hs_timer.active_kind();
    if active == Some(TimerKind::Retransmit) && self.hs_timer.active_round() == Some(self.round) {
      return;
    }
    if let Some(remaining) = self.handshake_remaining(ctx) {
      if remaining <= self.config.retransmission_interval {
        // The deadline comes first; a one-shot handshake timer always targets it.
        if active != Some(TimerKind::Handshake) {
          self.hs_timer.arm_once(ctx, TimerKind::Handshake, remaining, self.round);
        }
        return;
      }
    }
    tracing::debug!(session = self.session_id, round = self.round, "Arming retransmission timer");
    self
      .hs_timer
      .arm_repeating(ctx, TimerKind::Retransmit, self.config.retransmission_interval, self.round);
  }

  fn trace_result(&self, op: EngineOp, res: &EngineResult) {
    tracing::trace!(
      session = self.session_id,
      op = %op,
      status = ?res.status,
      handshake = ?res.handshake_status,
      consumed = res.bytes_consumed,
      produced = res.bytes_produced,
      "Engine call"
    );
  }
}

fn progress(res: &EngineResult, before: HandshakeStatus) -> Step {
  if res.bytes_consumed > 0 || res.bytes_produced > 0 || res.handshake_status != before {
    Step::Continue
  } else {
    Step::Stop
  }
}
