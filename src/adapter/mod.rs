// src/adapter/mod.rs

//! Adapters that pump a `SecureEngine` over a session.
//!
//! Both flavours share `EngineCore`: the buffer set, the handshake driver
//! loop, task delegation and closing negotiation. `StreamEngineAdapter` feeds it
//! a continuous byte stream; `DatagramEngineAdapter` feeds it one datagram at a
//! time and adds flight retransmission.
//!
//! All state is touched only from the task that owns the session. Timers and
//! executor threads post `AdapterEvent`s which the owner hands back through
//! `on_event`.

mod closing;
mod delegate;
mod driver;
mod timers;

pub mod datagram;
pub mod stream;

pub use datagram::DatagramEngineAdapter;
pub use stream::StreamEngineAdapter;

use crate::buffer::{BufferAllocator, BufferBounds, BufferSet, HeapAllocator, OutboundChunk};
use crate::config::EngineAdapterConfig;
use crate::engine::{EngineOp, SecureEngine};
use crate::error::SecureError;
use crate::runtime::{AdapterEvent, TimerKind};
use crate::session::{Incident, IncidentAction, SessionContext, WriteFuture, WritePromise};

use bytes::BytesMut;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use timers::TimerSlot;
use tokio::time::Instant;

/// Progress of closing negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosingState {
  /// Open.
  None,
  /// Close requested; queued data and then the close message are being wrapped.
  Sending,
  /// Close message sent; possibly waiting for the peer's.
  Finishing,
  /// Terminal. No further engine calls.
  Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeMarker {
  None,
  /// Deferred until the next write, read or close.
  Requested,
  Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
  Stream,
  Datagram,
}

/// Current logical capacities of the adapter's buffers.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCapacities {
  pub in_net: usize,
  pub out_net: usize,
  pub in_app: usize,
  pub max_net: usize,
  pub max_app: usize,
}

pub(crate) struct EngineCore<E: SecureEngine> {
  engine: E,
  config: Arc<EngineAdapterConfig>,
  flavor: Flavor,
  session_id: u64,
  started: bool,
  allocator: Arc<dyn BufferAllocator>,
  buffers: Option<BufferSet>,
  closing: ClosingState,
  marker: HandshakeMarker,
  ready_fired: bool,
  task_in_flight: bool,
  hs_timer: TimerSlot,
  close_timer: TimerSlot,
  /// On the session timer's clock, so virtual and paused time apply.
  handshake_deadline: Option<Instant>,
  /// Bumped whenever a peer handshake flight is consumed.
  round: u64,
  /// A handshake flight went out in the current round.
  flight_sent: bool,
  last_op: EngineOp,
  /// The last unwrap underflowed; wait for more bytes before retrying.
  in_net_stalled: bool,
  outbound_close_issued: bool,
  peer_close_received: bool,
  read_enabled: bool,
  write_enabled: bool,
}

impl<E: SecureEngine> fmt::Debug for EngineCore<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EngineCore")
      .field("session_id", &self.session_id)
      .field("flavor", &self.flavor)
      .field("closing", &self.closing)
      .field("marker", &self.marker)
      .field("task_in_flight", &self.task_in_flight)
      .field("round", &self.round)
      .field("buffers", &self.buffers)
      .finish_non_exhaustive()
  }
}

impl<E: SecureEngine> EngineCore<E> {
  pub(crate) fn new(engine: E, config: Arc<EngineAdapterConfig>, flavor: Flavor) -> Self {
    Self {
      engine,
      config,
      flavor,
      session_id: 0,
      started: false,
      allocator: Arc::new(HeapAllocator),
      buffers: None,
      closing: ClosingState::None,
      marker: HandshakeMarker::None,
      ready_fired: false,
      task_in_flight: false,
      hs_timer: TimerSlot::default(),
      close_timer: TimerSlot::default(),
      handshake_deadline: None,
      round: 0,
      flight_sent: false,
      last_op: EngineOp::Wrap,
      in_net_stalled: false,
      outbound_close_issued: false,
      peer_close_received: false,
      read_enabled: true,
      write_enabled: true,
    }
  }

  /// Sizes the buffers from the engine hints and begins (or defers) the handshake.
  pub(crate) fn start<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if self.started {
      return;
    }
    self.started = true;
    self.session_id = ctx.session_id();
    self.allocator = ctx.allocator();

    let app = BufferBounds::from_hints(
      self.engine.min_app_buffer_size(),
      self.engine.max_app_buffer_size(),
      self.config.max_app_buffer_multiplier,
    );
    let net = BufferBounds::from_hints(
      self.engine.min_net_buffer_size(),
      self.engine.max_net_buffer_size(),
      self.config.max_net_buffer_multiplier,
    );
    self.buffers = Some(BufferSet::new(&*self.allocator, app, net));
    tracing::debug!(
      session = self.session_id,
      flavor = ?self.flavor,
      app_min = app.min,
      app_max = app.max,
      net_min = net.min,
      net_max = net.max,
      "Engine adapter started"
    );

    if self.config.lazy_handshake {
      self.marker = HandshakeMarker::Requested;
      tracing::debug!(session = self.session_id, "Handshake deferred until first activity");
    } else if let Err(e) = self.begin_now(ctx) {
      self.fail(ctx, e);
      return;
    }
    self.drive(ctx);
  }

  fn ensure_started<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    if !self.started {
      self.start(ctx);
    }
  }

  /// Starts the handshake right away: marker to `Started`, one `begin_handshake`.
  fn begin_now<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) -> Result<(), SecureError> {
    self.engine.begin_handshake()?;
    self.marker = HandshakeMarker::Started;
    self.arm_handshake_timer(ctx);
    tracing::debug!(session = self.session_id, "Handshake started");
    Ok(())
  }

  /// Turns a deferred handshake request into a started one.
  fn trigger_lazy_handshake<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) -> Result<(), SecureError> {
    if self.marker == HandshakeMarker::Requested && self.closing == ClosingState::None {
      self.begin_now(ctx)?;
    }
    Ok(())
  }

  pub(crate) fn begin_handshake<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, lazy: bool) {
    self.ensure_started(ctx);
    if self.closing != ClosingState::None {
      tracing::debug!(session = self.session_id, "Handshake request ignored while closing");
      return;
    }
    if self.marker == HandshakeMarker::Started || self.engine.handshake_status().is_handshaking() {
      tracing::trace!(session = self.session_id, "Handshake already in progress, request coalesced");
      return;
    }
    if lazy {
      self.marker = HandshakeMarker::Requested;
      return;
    }
    if let Err(e) = self.begin_now(ctx) {
      self.fail(ctx, e);
      return;
    }
    self.drive(ctx);
  }

  fn arm_handshake_timer<C: SessionContext + ?Sized>(&mut self, ctx: &C) {
    let timeout = self.config.handshake_timeout;
    self.handshake_deadline = Some(ctx.timer().now() + timeout);
    self.hs_timer.arm_once(ctx, TimerKind::Handshake, timeout, self.round);
  }

  /// Time left before the handshake deadline, if one is running.
  fn handshake_remaining<C: SessionContext + ?Sized>(&self, ctx: &C) -> Option<Duration> {
    let deadline = self.handshake_deadline?;
    Some(deadline.saturating_duration_since(ctx.timer().now()))
  }

  /// Copies `data` unless the caller lets us adopt it.
  pub(crate) fn write_owned<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: BytesMut) -> WriteFuture {
    let (promise, future) = WritePromise::pair();
    self.write_with_promise(ctx, data, promise);
    future
  }

  pub(crate) fn write<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: &[u8]) -> WriteFuture {
    let (promise, future) = WritePromise::pair();
    self.ensure_started(ctx);
    let mut chunk = self.allocator.allocate(data.len());
    chunk.extend_from_slice(data);
    self.accept_write(ctx, chunk, promise);
    future
  }

  pub(crate) fn write_with_promise<C: SessionContext + ?Sized>(
    &mut self,
    ctx: &mut C,
    data: BytesMut,
    promise: WritePromise,
  ) {
    self.ensure_started(ctx);
    let chunk = if self.config.optimize_buffer_copying {
      data
    } else {
      let mut copy = self.allocator.allocate(data.len());
      copy.extend_from_slice(&data);
      copy
    };
    self.accept_write(ctx, chunk, promise);
  }

  fn accept_write<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: BytesMut, promise: WritePromise) {
    if self.closing != ClosingState::None || self.buffers.is_none() {
      self.allocator.release(data);
      promise.fail(SecureError::Closed);
      return;
    }
    if data.is_empty() {
      self.allocator.release(data);
      promise.complete();
      return;
    }
    if let Err(e) = self.trigger_lazy_handshake(ctx) {
      promise.fail(e.clone());
      self.fail(ctx, e);
      return;
    }
    tracing::trace!(session = self.session_id, bytes = data.len(), "Application write queued");
    if let Some(bufs) = self.buffers.as_mut() {
      bufs.out_app.push_back(OutboundChunk {
        data,
        promise: Some(promise),
      });
    }
    self.drive(ctx);
  }

  pub(crate) fn on_event<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, event: AdapterEvent) {
    match event {
      AdapterEvent::TaskCompleted { result } => self.on_task_completed(ctx, result),
      AdapterEvent::TimerFired { kind, generation } => self.on_timer(ctx, kind, generation),
    }
    self.update_interest(ctx);
  }

  fn on_timer<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, kind: TimerKind, generation: u64) {
    match kind {
      TimerKind::Handshake | TimerKind::Retransmit => {
        if !self.hs_timer.is_current(kind, generation) {
          tracing::trace!(session = self.session_id, ?kind, generation, "Stale timer ignored");
          return;
        }
        if kind == TimerKind::Handshake {
          self.hs_timer.clear();
          if self.closing == ClosingState::None && self.marker == HandshakeMarker::Started {
            tracing::warn!(session = self.session_id, "Handshake timed out");
            self.fail(ctx, SecureError::HandshakeTimeout);
          }
        } else {
          self.on_retransmit_timer(ctx);
        }
      }
      TimerKind::Closing => {
        if !self.close_timer.is_current(kind, generation) {
          tracing::trace!(session = self.session_id, generation, "Stale close timer ignored");
          return;
        }
        self.close_timer.clear();
        self.on_close_timeout(ctx);
      }
    }
  }

  /// Reports an incident and applies the configured policy.
  fn raise_incident<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, incident: Incident) {
    tracing::debug!(session = self.session_id, kind = ?incident.kind, "Raising incident");
    ctx.fire_incident(&incident);
    match self.config.incident_policy.on_incident(self.session_id, &incident) {
      IncidentAction::Continue => {}
      IncidentAction::Close(strength) => self.close_with(ctx, strength),
    }
  }

  /// Syncs the session's read/write interest with what the adapter can accept.
  fn update_interest<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    let finished = self.closing == ClosingState::Finished;
    let room = match (&self.buffers, self.flavor) {
      (Some(bufs), Flavor::Stream) => bufs.in_net.remaining() > 0,
      _ => true,
    };
    let want_read = !finished && !self.task_in_flight && room;
    let want_write = !self.task_in_flight;

    if want_read != self.read_enabled {
      self.read_enabled = want_read;
      if want_read {
        ctx.resume_read();
      } else {
        ctx.suspend_read();
      }
    }
    if want_write != self.write_enabled {
      self.write_enabled = want_write;
      if want_write {
        ctx.resume_write();
      } else {
        ctx.suspend_write();
      }
    }
  }

  pub(crate) fn closing_state(&self) -> ClosingState {
    self.closing
  }

  pub(crate) fn handshake_marker(&self) -> HandshakeMarker {
    self.marker
  }

  pub(crate) fn is_handshaking(&self) -> bool {
    self.closing == ClosingState::None
      && (self.marker == HandshakeMarker::Started || self.engine.handshake_status().is_handshaking())
  }

  pub(crate) fn engine(&self) -> &E {
    &self.engine
  }

  #[cfg(any(test, feature = "test-support"))]
  pub(crate) fn buffer_capacities(&self) -> Option<BufferCapacities> {
    self.buffers.as_ref().map(|b| BufferCapacities {
      in_net: b.in_net.capacity(),
      out_net: b.out_net.capacity(),
      in_app: b.in_app.capacity(),
      max_net: b.in_net.max(),
      max_app: b.in_app.max(),
    })
  }

  #[cfg(any(test, feature = "test-support"))]
  pub(crate) fn task_in_flight(&self) -> bool {
    self.task_in_flight
  }
}
