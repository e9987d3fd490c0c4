// tests/tokio_sessions.rs

mod common;

use bytes::BytesMut;
use rsecure::engine::NullEngine;
use rsecure::{
  BlockingExecutor, DatagramEngineAdapter, DatagramSession, EngineAdapterConfig, PooledAllocator, SessionConfig,
  SessionEvent, SessionEvents, StreamEngineAdapter, StreamSession,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_event(events: &SessionEvents) -> SessionEvent {
  timeout(EVENT_TIMEOUT, events.recv())
    .await
    .expect("timed out waiting for session event")
    .expect("session event channel closed")
}

async fn wait_ready(events: &SessionEvents) {
  match next_event(events).await {
    SessionEvent::Ready => {}
    other => panic!("expected Ready, got {:?}", other),
  }
}

/// Collects `len` bytes of application data, skipping other events.
async fn collect_data(events: &SessionEvents, len: usize) -> BytesMut {
  let mut data = BytesMut::new();
  while data.len() < len {
    if let SessionEvent::Data(chunk) = next_event(events).await {
      data.extend_from_slice(&chunk);
    }
  }
  data
}

async fn wait_closed(events: &SessionEvents) {
  loop {
    if let SessionEvent::Closed = next_event(events).await {
      return;
    }
  }
}

#[tokio::test]
async fn stream_sessions_over_duplex() -> anyhow::Result<()> {
  common::setup_tracing();
  let (a, b) = tokio::io::duplex(64 * 1024);
  let config = Arc::new(EngineAdapterConfig::default());

  let (client, client_events) = StreamSession::spawn(
    a,
    StreamEngineAdapter::new(NullEngine::client().build(), config.clone()),
    SessionConfig::default(),
  )?;
  let (server, server_events) = StreamSession::spawn(
    b,
    StreamEngineAdapter::new(NullEngine::server().build(), config),
    SessionConfig::default().with_allocator(Arc::new(PooledAllocator::new(8))),
  )?;
  assert_ne!(client.id(), server.id());

  wait_ready(&client_events).await;
  wait_ready(&server_events).await;

  let payload = common::pattern(100_000);
  let written = client.write(&payload[..]).await;
  timeout(EVENT_TIMEOUT, written).await??;
  let received = collect_data(&server_events, payload.len()).await;
  assert_eq!(&received[..], &payload[..]);

  server.write(&b"reply"[..]).await;
  assert_eq!(&collect_data(&client_events, 5).await[..], b"reply");

  client.close().await?;
  wait_closed(&client_events).await;
  wait_closed(&server_events).await;

  let late = client.write(&b"late"[..]).await;
  assert!(late.await.is_err());
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_session_runs_delegated_tasks_on_blocking_pool() -> anyhow::Result<()> {
  common::setup_tracing();
  let (a, b) = tokio::io::duplex(16 * 1024);
  let executor = Arc::new(BlockingExecutor::current()?);
  let server_config = Arc::new(EngineAdapterConfig::default().with_executor(executor));

  let (_client, client_events) = StreamSession::spawn(
    a,
    StreamEngineAdapter::new(NullEngine::client().build(), Arc::new(EngineAdapterConfig::default())),
    SessionConfig::default(),
  )?;
  let server_engine = NullEngine::server()
    .delegated_task(rsecure::engine::null::DelegatedTaskMode::Succeed)
    .build();
  let (server, server_events) = StreamSession::spawn(
    b,
    StreamEngineAdapter::new(server_engine, server_config),
    SessionConfig::default(),
  )?;

  wait_ready(&server_events).await;
  wait_ready(&client_events).await;

  server.dirty_close().await?;
  wait_closed(&server_events).await;
  Ok(())
}

#[tokio::test]
async fn datagram_sessions_over_udp() -> anyhow::Result<()> {
  common::setup_tracing();
  let client_socket = UdpSocket::bind("127.0.0.1:0").await?;
  let server_socket = UdpSocket::bind("127.0.0.1:0").await?;
  client_socket.connect(server_socket.local_addr()?).await?;
  server_socket.connect(client_socket.local_addr()?).await?;

  let config = Arc::new(EngineAdapterConfig::default().with_retransmission_interval(Duration::from_millis(100)));
  let (server, server_events) = DatagramSession::spawn(
    server_socket,
    DatagramEngineAdapter::new(NullEngine::server().datagram(true).build(), config.clone()),
    SessionConfig::default(),
  )?;
  let (client, client_events) = DatagramSession::spawn(
    client_socket,
    DatagramEngineAdapter::new(NullEngine::client().datagram(true).build(), config),
    SessionConfig::default(),
  )?;

  wait_ready(&client_events).await;
  wait_ready(&server_events).await;

  let written = client.write(&b"over udp"[..]).await;
  timeout(EVENT_TIMEOUT, written).await??;
  assert_eq!(&collect_data(&server_events, 8).await[..], b"over udp");

  client.close().await?;
  wait_closed(&client_events).await;
  wait_closed(&server_events).await;
  drop(server);
  Ok(())
}
