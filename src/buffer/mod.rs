// src/buffer/mod.rs

//! Buffers owned by an adapter and the allocator they come from.

pub mod allocator;
pub mod engine_buffer;

pub use allocator::{BufferAllocator, HeapAllocator, PooledAllocator};
pub use engine_buffer::EngineBuffer;

use crate::session::WritePromise;

use bytes::BytesMut;
use std::collections::VecDeque;

/// Capacity range `[min, max]` for one class of buffer.
///
/// `min` is the engine's minimum hint; `max` is the larger of the engine's
/// maximum hint and `min`, scaled by the configured multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBounds {
  pub min: usize,
  pub max: usize,
}

impl BufferBounds {
  pub fn from_hints(min_hint: usize, max_hint: usize, multiplier: usize) -> Self {
    let min = min_hint.max(1);
    let max = max_hint.max(min).saturating_mul(multiplier.max(1));
    Self { min, max }
  }
}

/// Application bytes waiting to be wrapped, with the promise of the write they
/// came from.
#[derive(Debug)]
pub(crate) struct OutboundChunk {
  pub data: BytesMut,
  pub promise: Option<WritePromise>,
}

/// The buffers of one adapter: inbound network, outbound network, inbound
/// application and the queue of outbound application chunks.
#[derive(Debug)]
pub(crate) struct BufferSet {
  pub in_net: EngineBuffer,
  pub out_net: EngineBuffer,
  pub in_app: EngineBuffer,
  pub out_app: VecDeque<OutboundChunk>,
}

impl BufferSet {
  pub fn new(allocator: &dyn BufferAllocator, app: BufferBounds, net: BufferBounds) -> Self {
    Self {
      in_net: EngineBuffer::new("in_net", allocator, net.min, net.max),
      out_net: EngineBuffer::new("out_net", allocator, net.min, net.max),
      in_app: EngineBuffer::new("in_app", allocator, app.min, app.max),
      out_app: VecDeque::new(),
    }
  }

  pub fn pending_app_bytes(&self) -> usize {
    self.out_app.iter().map(|c| c.data.len()).sum()
  }

  /// Removes every queued chunk, returning their promises.
  pub fn drain_out_app(&mut self, allocator: &dyn BufferAllocator) -> Vec<WritePromise> {
    let mut promises = Vec::new();
    for chunk in self.out_app.drain(..) {
      allocator.release(chunk.data);
      promises.extend(chunk.promise);
    }
    promises
  }

  pub fn release(mut self, allocator: &dyn BufferAllocator) -> Vec<WritePromise> {
    let promises = self.drain_out_app(allocator);
    self.in_net.release(allocator);
    self.out_net.release(allocator);
    self.in_app.release(allocator);
    promises
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bounds_apply_multiplier_to_max() {
    assert_eq!(BufferBounds::from_hints(10, 10, 1), BufferBounds { min: 10, max: 10 });
    assert_eq!(BufferBounds::from_hints(10, 4, 3), BufferBounds { min: 10, max: 30 });
    assert_eq!(BufferBounds::from_hints(0, 0, 0), BufferBounds { min: 1, max: 1 });
  }
}
