// src/buffer/engine_buffer.rs

use super::allocator::BufferAllocator;
use crate::error::SecureError;

use bytes::{Buf, BytesMut};

/// A growable buffer bounded by the engine's capacity hints.
///
/// `capacity()` is the logical size the engine sees as free space plus pending
/// data. It starts at `min`, only grows, and never passes `max`.
#[derive(Debug)]
pub struct EngineBuffer {
  name: &'static str,
  buf: BytesMut,
  limit: usize,
  min: usize,
  max: usize,
}

impl EngineBuffer {
  pub fn new(name: &'static str, allocator: &dyn BufferAllocator, min: usize, max: usize) -> Self {
    let min = min.max(1);
    let max = max.max(min);
    Self {
      name,
      buf: allocator.allocate(min),
      limit: min,
      min,
      max,
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn len(&self) -> usize {
    self.buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.limit
  }

  pub fn min(&self) -> usize {
    self.min
  }

  pub fn max(&self) -> usize {
    self.max
  }

  /// Free space left before the buffer must grow.
  pub fn remaining(&self) -> usize {
    self.limit.saturating_sub(self.buf.len())
  }

  pub fn is_full(&self) -> bool {
    self.remaining() == 0
  }

  pub fn at_max(&self) -> bool {
    self.limit >= self.max
  }

  pub fn data(&self) -> &[u8] {
    &self.buf
  }

  /// Drops `n` bytes from the front.
  pub fn consume(&mut self, n: usize) {
    let n = n.min(self.buf.len());
    self.buf.advance(n);
  }

  /// Splits off all pending bytes.
  pub fn take_all(&mut self) -> BytesMut {
    self.buf.split()
  }

  pub fn clear(&mut self) {
    self.buf.clear();
  }

  /// Copies as much of `src` as fits into the free space and returns the
  /// number of bytes copied.
  pub fn extend_from(&mut self, src: &[u8]) -> usize {
    let n = src.len().min(self.remaining());
    self.buf.extend_from_slice(&src[..n]);
    n
  }

  /// Grows the logical capacity so that `additional` more bytes fit, doubling
  /// and clamping to `max`. Fails when the buffer is already at `max` and still
  /// too small.
  pub fn grow(&mut self, allocator: &dyn BufferAllocator, additional: usize) -> Result<(), SecureError> {
    let needed = self.buf.len().saturating_add(additional.max(1));
    if needed <= self.limit {
      return Ok(());
    }
    if self.at_max() {
      return Err(SecureError::BufferLimit {
        buffer: self.name,
        max: self.max,
      });
    }
    let mut new_limit = self.limit.max(1);
    while new_limit < needed {
      new_limit = new_limit.saturating_mul(2);
    }
    self.resize_to(allocator, new_limit.min(self.max));
    Ok(())
  }

  /// Grows straight to `max`. Used after the engine reported overflow, where
  /// the needed size is unknown.
  pub fn grow_to_max(&mut self, allocator: &dyn BufferAllocator) -> Result<(), SecureError> {
    if self.at_max() {
      return Err(SecureError::BufferLimit {
        buffer: self.name,
        max: self.max,
      });
    }
    self.resize_to(allocator, self.max);
    Ok(())
  }

  fn resize_to(&mut self, allocator: &dyn BufferAllocator, new_limit: usize) {
    let old = std::mem::take(&mut self.buf);
    let additional = new_limit.saturating_sub(old.len());
    self.buf = allocator.ensure(old, additional, self.min, self.max);
    tracing::trace!(buffer = self.name, from = self.limit, to = new_limit, "Engine buffer grown");
    self.limit = new_limit;
  }

  /// Lends the free space to `f`, which returns a value and the number of bytes
  /// it wrote from the start of the slice. Those bytes become pending data.
  pub fn fill_with<R, F>(&mut self, f: F) -> Result<R, SecureError>
  where
    F: FnOnce(&mut [u8]) -> Result<(R, usize), SecureError>,
  {
    let len = self.buf.len();
    self.buf.resize(self.limit.max(len), 0);
    match f(&mut self.buf[len..]) {
      Ok((value, produced)) => {
        let produced = produced.min(self.limit.saturating_sub(len));
        self.buf.truncate(len + produced);
        Ok(value)
      }
      Err(e) => {
        self.buf.truncate(len);
        Err(e)
      }
    }
  }

  /// Returns the backing storage to the allocator.
  pub fn release(self, allocator: &dyn BufferAllocator) {
    allocator.release(self.buf);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::HeapAllocator;

  #[test]
  fn grow_is_bounded_by_max() {
    let alloc = HeapAllocator;
    let mut buf = EngineBuffer::new("in_net", &alloc, 8, 20);
    buf.extend_from(&[1u8; 8]);
    assert!(buf.is_full());

    buf.grow(&alloc, 4).unwrap();
    assert_eq!(buf.capacity(), 16);
    buf.grow(&alloc, 10).unwrap();
    assert_eq!(buf.capacity(), 20);
    assert_eq!(buf.data(), &[1u8; 8]);

    buf.extend_from(&[2u8; 12]);
    let err = buf.grow(&alloc, 1).unwrap_err();
    assert!(matches!(err, SecureError::BufferLimit { buffer: "in_net", max: 20 }));
    assert_eq!(buf.len(), 20);
  }

  #[test]
  fn fill_with_commits_only_produced_bytes() {
    let alloc = HeapAllocator;
    let mut buf = EngineBuffer::new("out_net", &alloc, 8, 8);
    buf.extend_from(b"ab");
    let seen = buf
      .fill_with(|dst| {
        assert_eq!(dst.len(), 6);
        dst[..3].copy_from_slice(b"cde");
        Ok((dst.len(), 3))
      })
      .unwrap();
    assert_eq!(seen, 6);
    assert_eq!(buf.data(), b"abcde");

    let res: Result<(), _> = buf.fill_with(|dst| {
      dst[0] = b'x';
      Err(SecureError::engine("boom"))
    });
    assert!(res.is_err());
    assert_eq!(buf.data(), b"abcde");
  }

  #[test]
  fn consume_keeps_the_rest() {
    let alloc = HeapAllocator;
    let mut buf = EngineBuffer::new("in_net", &alloc, 4, 4);
    buf.extend_from(b"wxyz");
    buf.consume(3);
    assert_eq!(buf.data(), b"z");
    assert_eq!(buf.remaining(), 3);
    assert_eq!(buf.extend_from(b"12345"), 3);
    assert_eq!(buf.data(), b"z123");
  }
}
