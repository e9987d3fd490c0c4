// src/adapter/stream.rs

use super::{ClosingState, EngineCore, Flavor, HandshakeMarker};
use crate::config::EngineAdapterConfig;
use crate::engine::SecureEngine;
use crate::runtime::AdapterEvent;
use crate::session::{CloseStrength, Incident, IncidentKind, SessionContext, WriteFuture, WritePromise};

use bytes::{Buf, BytesMut};
use std::sync::Arc;

#[cfg(any(test, feature = "test-support"))]
use super::BufferCapacities;

/// Drives an engine over a continuous byte stream.
///
/// Records may span any number of reads; partial records stay in the inbound
/// network buffer, which is compacted rather than replaced between calls.
#[derive(Debug)]
pub struct StreamEngineAdapter<E: SecureEngine> {
  core: EngineCore<E>,
}

impl<E: SecureEngine> StreamEngineAdapter<E> {
  pub fn new(engine: E, config: Arc<EngineAdapterConfig>) -> Self {
    Self {
      core: EngineCore::new(engine, config, Flavor::Stream),
    }
  }

  /// Call once the session is connected. Later calls do nothing.
  pub fn start<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    self.core.start(ctx);
  }

  /// Queues a copy of `data`. The future settles when the network bytes
  /// carrying its last byte were written.
  pub fn write<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: &[u8]) -> WriteFuture {
    self.core.write(ctx, data)
  }

  /// Like `write`, but adopts `data` when `optimize_buffer_copying` is set. An
  /// adopted buffer goes back to the allocator once wrapped.
  pub fn write_owned<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: BytesMut) -> WriteFuture {
    self.core.write_owned(ctx, data)
  }

  /// `write_owned` settling an existing promise.
  pub fn write_with_promise<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, data: BytesMut, promise: WritePromise) {
    self.core.write_with_promise(ctx, data, promise);
  }

  pub fn begin_handshake<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, lazy: bool) {
    self.core.begin_handshake(ctx, lazy);
  }

  /// Feeds transport bytes. Takes whatever fits into the inbound network
  /// buffer; anything left in `src` must be offered again once read interest
  /// is resumed.
  pub fn on_read<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, src: &mut BytesMut) {
    let core = &mut self.core;
    core.ensure_started(ctx);
    if core.closing == ClosingState::Finished || core.peer_close_received {
      // Nothing valid follows a close; drop trailing bytes.
      src.clear();
      return;
    }
    if let Err(e) = core.trigger_lazy_handshake(ctx) {
      core.fail(ctx, e);
      return;
    }

    loop {
      let Some(bufs) = core.buffers.as_mut() else {
        break;
      };
      let taken = bufs.in_net.extend_from(src);
      if taken > 0 {
        src.advance(taken);
        core.in_net_stalled = false;
        tracing::trace!(session = core.session_id, bytes = taken, "Transport bytes buffered");
      }

      core.drive(ctx);

      if src.is_empty() || core.closing == ClosingState::Finished || core.task_in_flight {
        break;
      }
      let room = core.buffers.as_ref().map_or(0, |b| b.in_net.remaining());
      if taken == 0 && room == 0 {
        break;
      }
    }
    core.update_interest(ctx);
  }

  /// The transport reached end of stream.
  pub fn on_eof<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) {
    let core = &mut self.core;
    if core.closing == ClosingState::Finished {
      return;
    }
    if !core.started {
      core.finish(ctx, CloseStrength::Gentle);
      return;
    }
    tracing::debug!(session = core.session_id, closing = ?core.closing, "End of stream");

    if let Err(e) = core.engine.close_inbound() {
      if !core.peer_close_received {
        core.raise_incident(ctx, Incident::with_cause(IncidentKind::ClosedWithoutCloseNotify, e));
      }
    }
    if core.closing == ClosingState::Finished {
      return;
    }

    if core.marker == HandshakeMarker::Requested {
      // Never began; nothing to negotiate.
      core.finish(ctx, CloseStrength::Gentle);
      return;
    }
    core.begin_gentle_close(ctx);
    core.drive(ctx);
    if core.closing != ClosingState::Finished {
      core.finish(ctx, CloseStrength::Gentle);
    }
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

  /// Feeds back a task completion or timer fire posted to the session's mailbox.
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
