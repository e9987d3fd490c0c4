// src/session/testing.rs

//! In-memory session used by the crate's unit tests.

use super::{CloseStrength, Incident, SessionContext, WritePromise};
use crate::buffer::{BufferAllocator, HeapAllocator};
use crate::error::SecureError;
use crate::runtime::{event_mailbox, AdapterEvent, EventReceiver, EventSender, ManualTimer, TaskExecutor, Timer};

use bytes::{Bytes, BytesMut};
use std::sync::Arc;

pub(crate) struct RecordingContext {
  pub id: u64,
  pub written: Vec<Bytes>,
  pub received: BytesMut,
  pub incidents: Vec<Incident>,
  pub exceptions: Vec<SecureError>,
  pub closes: Vec<CloseStrength>,
  pub ready: usize,
  pub read_suspended: bool,
  pub write_suspended: bool,
  pub timer: ManualTimer,
  pub executor: Option<Arc<dyn TaskExecutor>>,
  events_tx: EventSender,
  events_rx: EventReceiver,
}

impl RecordingContext {
  pub fn new(id: u64) -> Self {
    let (events_tx, events_rx) = event_mailbox();
    Self {
      id,
      written: Vec::new(),
      received: BytesMut::new(),
      incidents: Vec::new(),
      exceptions: Vec::new(),
      closes: Vec::new(),
      ready: 0,
      read_suspended: false,
      write_suspended: false,
      timer: ManualTimer::new(),
      executor: None,
      events_tx,
      events_rx,
    }
  }

  /// Takes everything written so far as one contiguous byte string.
  pub fn take_wire(&mut self) -> BytesMut {
    let mut wire = BytesMut::new();
    for chunk in self.written.drain(..) {
      wire.extend_from_slice(&chunk);
    }
    wire
  }

  pub fn drain_events(&self) -> Vec<AdapterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.events_rx.try_recv() {
      events.push(event);
    }
    events
  }
}

impl SessionContext for RecordingContext {
  fn session_id(&self) -> u64 {
    self.id
  }

  fn enqueue_write(&mut self, data: Bytes, promise: Option<WritePromise>) {
    self.written.push(data);
    if let Some(promise) = promise {
      promise.complete();
    }
  }

  fn suspend_read(&mut self) {
    self.read_suspended = true;
  }

  fn resume_read(&mut self) {
    self.read_suspended = false;
  }

  fn suspend_write(&mut self) {
    self.write_suspended = true;
  }

  fn resume_write(&mut self) {
    self.write_suspended = false;
  }

  fn close(&mut self, strength: CloseStrength) {
    self.closes.push(strength);
  }

  fn fire_ready(&mut self) {
    self.ready += 1;
  }

  fn fire_data_received(&mut self, data: Bytes) {
    self.received.extend_from_slice(&data);
  }

  fn fire_incident(&mut self, incident: &Incident) {
    self.incidents.push(incident.clone());
  }

  fn fire_exception(&mut self, error: &SecureError) {
    self.exceptions.push(error.clone());
  }

  fn allocator(&self) -> Arc<dyn BufferAllocator> {
    Arc::new(HeapAllocator)
  }

  fn executor(&self) -> Option<Arc<dyn TaskExecutor>> {
    self.executor.clone()
  }

  fn timer(&self) -> Arc<dyn Timer> {
    Arc::new(self.timer.clone())
  }

  fn events(&self) -> EventSender {
    self.events_tx.clone()
  }
}
