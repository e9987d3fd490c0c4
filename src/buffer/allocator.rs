// src/buffer/allocator.rs

use bytes::BytesMut;
use parking_lot::Mutex;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of the byte buffers used by adapters and sessions.
///
/// Calls are individually safe from any thread; adapters only ever call in from
/// the task that owns them.
pub trait BufferAllocator: Send + Sync + 'static {
  /// Returns an empty buffer able to hold at least `capacity` bytes.
  fn allocate(&self, capacity: usize) -> BytesMut;

  /// Hands a buffer back once its contents are no longer needed.
  fn release(&self, buf: BytesMut);

  /// Returns a buffer holding the contents of `buf` with room for `additional`
  /// more bytes, never asking for more than `max` nor less than `min` bytes of
  /// capacity. The result may be `buf` grown in place or a replacement with the
  /// data copied over.
  fn ensure(&self, buf: BytesMut, additional: usize, min: usize, max: usize) -> BytesMut;
}

fn target_capacity(len: usize, additional: usize, min: usize, max: usize) -> usize {
  len.saturating_add(additional).max(min).min(max.max(len))
}

/// Plain heap allocation; `release` just drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
  fn allocate(&self, capacity: usize) -> BytesMut {
    BytesMut::with_capacity(capacity)
  }

  fn release(&self, _buf: BytesMut) {}

  fn ensure(&self, mut buf: BytesMut, additional: usize, min: usize, max: usize) -> BytesMut {
    let target = target_capacity(buf.len(), additional, min, max);
    if buf.capacity() < target {
      buf.reserve(target - buf.len());
    }
    buf
  }
}

const POOL_MIN_CLASS: usize = 512;
const POOL_CLASSES: usize = 12; // 512 B .. 1 MiB

/// Recycles released buffers in power-of-two size classes.
#[derive(Debug)]
pub struct PooledAllocator {
  classes: Vec<Mutex<Vec<BytesMut>>>,
  max_per_class: usize,
  allocated: AtomicUsize,
  reused: AtomicUsize,
}

impl Default for PooledAllocator {
  fn default() -> Self {
    Self::new(64)
  }
}

impl PooledAllocator {
  /// `max_per_class` bounds how many idle buffers each size class keeps.
  pub fn new(max_per_class: usize) -> Self {
    Self {
      classes: (0..POOL_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
      max_per_class,
      allocated: AtomicUsize::new(0),
      reused: AtomicUsize::new(0),
    }
  }

  /// Buffers created from scratch so far.
  pub fn allocated(&self) -> usize {
    self.allocated.load(Ordering::Relaxed)
  }

  /// Buffers served from the pool so far.
  pub fn reused(&self) -> usize {
    self.reused.load(Ordering::Relaxed)
  }

  /// Idle buffers currently held by the pool.
  pub fn idle(&self) -> usize {
    self.classes.iter().map(|c| c.lock().len()).sum()
  }

  fn class_of(capacity: usize) -> Option<(usize, usize)> {
    let size = capacity.max(POOL_MIN_CLASS).next_power_of_two();
    let index = (size / POOL_MIN_CLASS).trailing_zeros() as usize;
    (index < POOL_CLASSES).then_some((index, size))
  }
}

impl BufferAllocator for PooledAllocator {
  fn allocate(&self, capacity: usize) -> BytesMut {
    match Self::class_of(capacity) {
      Some((index, size)) => {
        if let Some(buf) = self.classes[index].lock().pop() {
          self.reused.fetch_add(1, Ordering::Relaxed);
          return buf;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(size)
      }
      None => {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(capacity)
      }
    }
  }

  fn release(&self, mut buf: BytesMut) {
    buf.clear();
    let capacity = buf.capacity();
    if !capacity.is_power_of_two() {
      return;
    }
    if let Some((index, size)) = Self::class_of(capacity) {
      if size == capacity {
        let mut class = self.classes[index].lock();
        if class.len() < self.max_per_class {
          class.push(buf);
        }
      }
    }
  }

  fn ensure(&self, buf: BytesMut, additional: usize, min: usize, max: usize) -> BytesMut {
    let target = target_capacity(buf.len(), additional, min, max);
    if buf.capacity() >= target {
      return buf;
    }
    let mut replacement = self.allocate(target);
    if replacement.capacity() < target {
      replacement.reserve(target);
    }
    replacement.extend_from_slice(&buf);
    self.release(buf);
    replacement
  }
}
