// tests/common/mod.rs
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rsecure::engine::NullEngine;
use rsecure::runtime::{event_mailbox, AdapterEvent, EventReceiver, EventSender, ExecutorJob};
use rsecure::session::{CloseStrength, Incident, SessionContext, WritePromise};
use rsecure::{
  BufferAllocator, DatagramEngineAdapter, EngineAdapterConfig, HeapAllocator, ManualTimer, SecureError,
  StreamEngineAdapter, TaskExecutor, Timer,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

/// Installs the global subscriber once. `RUST_LOG` overrides the default filter.
pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rsecure=debug,warn"));
    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

/// In-memory session recording everything an adapter does to it.
pub struct TestSession {
  pub id: u64,
  /// Network writes in order, one entry per `enqueue_write`.
  pub wire: VecDeque<Bytes>,
  pub received: BytesMut,
  pub incidents: Vec<Incident>,
  pub exceptions: Vec<SecureError>,
  pub closes: Vec<CloseStrength>,
  pub ready: usize,
  pub read_suspended: bool,
  pub write_suspended: bool,
  pub timer: ManualTimer,
  pub executor: Option<Arc<dyn TaskExecutor>>,
  pub allocator: Arc<dyn BufferAllocator>,
  events_tx: EventSender,
  events_rx: EventReceiver,
}

impl TestSession {
  pub fn new(id: u64) -> Self {
    setup_tracing();
    let (events_tx, events_rx) = event_mailbox();
    Self {
      id,
      wire: VecDeque::new(),
      received: BytesMut::new(),
      incidents: Vec::new(),
      exceptions: Vec::new(),
      closes: Vec::new(),
      ready: 0,
      read_suspended: false,
      write_suspended: false,
      timer: ManualTimer::new(),
      executor: None,
      allocator: Arc::new(HeapAllocator),
      events_tx,
      events_rx,
    }
  }

  pub fn wire_bytes(&self) -> usize {
    self.wire.iter().map(Bytes::len).sum()
  }

  pub fn drain_events(&self) -> Vec<AdapterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.events_rx.try_recv() {
      events.push(event);
    }
    events
  }
}

impl SessionContext for TestSession {
  fn session_id(&self) -> u64 {
    self.id
  }

  fn enqueue_write(&mut self, data: Bytes, promise: Option<WritePromise>) {
    self.wire.push_back(data);
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
    self.allocator.clone()
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

/// Executor that queues jobs until the test runs them.
#[derive(Clone, Default)]
pub struct ManualExecutor {
  jobs: Arc<Mutex<VecDeque<ExecutorJob>>>,
  submitted: Arc<AtomicUsize>,
  max_queued: Arc<AtomicUsize>,
  rejecting: bool,
}

impl ManualExecutor {
  pub fn new() -> Self {
    Self::default()
  }

  /// An executor that refuses every job, like one that was shut down.
  pub fn rejecting() -> Self {
    Self {
      rejecting: true,
      ..Self::default()
    }
  }

  /// Runs every queued job on the calling thread. Returns how many ran.
  pub fn run_all(&self) -> usize {
    let mut ran = 0;
    loop {
      let job = self.jobs.lock().pop_front();
      let Some(job) = job else {
        return ran;
      };
      job();
      ran += 1;
    }
  }

  pub fn queued(&self) -> usize {
    self.jobs.lock().len()
  }

  pub fn submitted(&self) -> usize {
    self.submitted.load(Ordering::SeqCst)
  }

  /// Largest number of jobs ever waiting at once.
  pub fn max_queued(&self) -> usize {
    self.max_queued.load(Ordering::SeqCst)
  }
}

impl TaskExecutor for ManualExecutor {
  fn execute(&self, job: ExecutorJob) -> Result<(), SecureError> {
    if self.rejecting {
      return Err(SecureError::ExecutorRejected("executor is shut down".into()));
    }
    let mut jobs = self.jobs.lock();
    jobs.push_back(job);
    self.submitted.fetch_add(1, Ordering::SeqCst);
    self.max_queued.fetch_max(jobs.len(), Ordering::SeqCst);
    Ok(())
  }
}

/// Heap allocator that counts calls and remembers where released buffers end.
#[derive(Clone, Default)]
pub struct CountingAllocator {
  allocations: Arc<AtomicUsize>,
  released: Arc<Mutex<Vec<usize>>>,
}

impl CountingAllocator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn allocations(&self) -> usize {
    self.allocations.load(Ordering::SeqCst)
  }

  /// Address just past the last byte of each released buffer. A fully consumed
  /// buffer ends where its original contents did.
  pub fn released_ends(&self) -> Vec<usize> {
    self.released.lock().clone()
  }
}

impl BufferAllocator for CountingAllocator {
  fn allocate(&self, capacity: usize) -> BytesMut {
    self.allocations.fetch_add(1, Ordering::SeqCst);
    HeapAllocator.allocate(capacity)
  }

  fn release(&self, buf: BytesMut) {
    self.released.lock().push(buf.as_ptr() as usize + buf.len());
    HeapAllocator.release(buf);
  }

  fn ensure(&self, buf: BytesMut, additional: usize, min: usize, max: usize) -> BytesMut {
    HeapAllocator.ensure(buf, additional, min, max)
  }
}

/// Bound on pump rounds before a test is considered stuck.
const MAX_PUMP_ROUNDS: usize = 1000;

/// Two stream adapters wired back to back through their test sessions.
pub struct StreamPair {
  pub client: StreamEngineAdapter<NullEngine>,
  pub server: StreamEngineAdapter<NullEngine>,
  pub c: TestSession,
  pub s: TestSession,
  to_server: BytesMut,
  to_client: BytesMut,
}

impl StreamPair {
  pub fn new(client: NullEngine, server: NullEngine) -> Self {
    Self::with_configs(client, server, EngineAdapterConfig::default(), EngineAdapterConfig::default())
  }

  pub fn with_configs(
    client: NullEngine,
    server: NullEngine,
    client_config: EngineAdapterConfig,
    server_config: EngineAdapterConfig,
  ) -> Self {
    Self {
      client: StreamEngineAdapter::new(client, Arc::new(client_config)),
      server: StreamEngineAdapter::new(server, Arc::new(server_config)),
      c: TestSession::new(1),
      s: TestSession::new(2),
      to_server: BytesMut::new(),
      to_client: BytesMut::new(),
    }
  }

  pub fn start(&mut self) {
    self.client.start(&mut self.c);
    self.server.start(&mut self.s);
  }

  /// Moves bytes and adapter events until nothing changes. Returns the number
  /// of rounds that made progress.
  pub fn pump(&mut self) -> usize {
    for round in 0..MAX_PUMP_ROUNDS {
      let mut progressed = false;

      for event in self.c.drain_events() {
        self.client.on_event(&mut self.c, event);
        progressed = true;
      }
      for event in self.s.drain_events() {
        self.server.on_event(&mut self.s, event);
        progressed = true;
      }

      while let Some(chunk) = self.c.wire.pop_front() {
        self.to_server.extend_from_slice(&chunk);
      }
      while let Some(chunk) = self.s.wire.pop_front() {
        self.to_client.extend_from_slice(&chunk);
      }

      if !self.to_server.is_empty() && !self.s.read_suspended {
        let before = self.to_server.len();
        self.server.on_read(&mut self.s, &mut self.to_server);
        progressed |= self.to_server.len() != before;
      }
      if !self.to_client.is_empty() && !self.c.read_suspended {
        let before = self.to_client.len();
        self.client.on_read(&mut self.c, &mut self.to_client);
        progressed |= self.to_client.len() != before;
      }

      if !progressed && self.c.wire.is_empty() && self.s.wire.is_empty() {
        return round;
      }
    }
    panic!("stream pair did not settle after {} rounds", MAX_PUMP_ROUNDS);
  }

  /// Runs the handshake to completion.
  pub fn connect(&mut self) {
    self.start();
    self.pump();
    assert_eq!(self.c.ready, 1, "client not ready");
    assert_eq!(self.s.ready, 1, "server not ready");
  }
}

/// Two datagram adapters exchanging whole datagrams, with optional loss.
pub struct DatagramPair {
  pub client: DatagramEngineAdapter<NullEngine>,
  pub server: DatagramEngineAdapter<NullEngine>,
  pub c: TestSession,
  pub s: TestSession,
  /// Client datagrams still to be dropped before delivery resumes.
  pub drop_to_server: usize,
  pub drop_to_client: usize,
  pub delivered_to_server: usize,
  pub delivered_to_client: usize,
}

impl DatagramPair {
  pub fn new(client: NullEngine, server: NullEngine) -> Self {
    Self::with_configs(client, server, EngineAdapterConfig::default(), EngineAdapterConfig::default())
  }

  pub fn with_configs(
    client: NullEngine,
    server: NullEngine,
    client_config: EngineAdapterConfig,
    server_config: EngineAdapterConfig,
  ) -> Self {
    Self {
      client: DatagramEngineAdapter::new(client, Arc::new(client_config)),
      server: DatagramEngineAdapter::new(server, Arc::new(server_config)),
      c: TestSession::new(1),
      s: TestSession::new(2),
      drop_to_server: 0,
      drop_to_client: 0,
      delivered_to_server: 0,
      delivered_to_client: 0,
    }
  }

  pub fn start(&mut self) {
    self.client.start(&mut self.c);
    self.server.start(&mut self.s);
  }

  pub fn pump(&mut self) -> usize {
    for round in 0..MAX_PUMP_ROUNDS {
      let mut progressed = false;

      for event in self.c.drain_events() {
        self.client.on_event(&mut self.c, event);
        progressed = true;
      }
      for event in self.s.drain_events() {
        self.server.on_event(&mut self.s, event);
        progressed = true;
      }

      while let Some(datagram) = self.c.wire.pop_front() {
        progressed = true;
        if self.drop_to_server > 0 {
          self.drop_to_server -= 1;
          continue;
        }
        self.delivered_to_server += 1;
        self.server.on_datagram(&mut self.s, &datagram);
      }
      while let Some(datagram) = self.s.wire.pop_front() {
        progressed = true;
        if self.drop_to_client > 0 {
          self.drop_to_client -= 1;
          continue;
        }
        self.delivered_to_client += 1;
        self.client.on_datagram(&mut self.c, &datagram);
      }

      if !progressed {
        return round;
      }
    }
    panic!("datagram pair did not settle after {} rounds", MAX_PUMP_ROUNDS);
  }

  /// Advances both sessions' timers by `by` and returns how many callbacks ran.
  pub fn advance(&mut self, by: Duration) -> usize {
    self.c.timer.advance(by) + self.s.timer.advance(by)
  }
}

/// A recognisable payload of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
  (0..len).map(|i| (i % 251) as u8).collect()
}
