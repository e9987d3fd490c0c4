// src/transport/datagram.rs

use super::{
  command_mailbox, next_session_id, reject_pending_commands, SessionCommand, SessionConfig, SessionCtx,
  SessionEvent, SessionEvents, SessionHandle,
};
use crate::adapter::DatagramEngineAdapter;
use crate::engine::SecureEngine;
use crate::error::SecureError;
use crate::runtime::{event_mailbox, EventReceiver};
use crate::session::{CloseStrength, SessionContext};

use async_channel::Receiver;
use async_trait::async_trait;
use std::io;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;

/// A connected, message-oriented transport.
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
  /// Sends one datagram.
  async fn send(&self, datagram: &[u8]) -> io::Result<usize>;

  /// Receives one datagram into `buf`, truncating it if it does not fit.
  async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
  async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
    UdpSocket::send(self, datagram).await
  }

  async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
    UdpSocket::recv(self, buf).await
  }
}

/// Hosts a `DatagramEngineAdapter` over a `DatagramTransport`.
#[derive(Debug)]
pub struct DatagramSession;

impl DatagramSession {
  pub fn spawn<T, E>(
    transport: T,
    adapter: DatagramEngineAdapter<E>,
    config: SessionConfig,
  ) -> Result<(SessionHandle, SessionEvents), SecureError>
  where
    T: DatagramTransport,
    E: SecureEngine,
  {
    let runtime = Handle::try_current().map_err(|e| SecureError::Internal(format!("no Tokio runtime: {}", e)))?;
    let id = next_session_id();
    let (handle, commands) = command_mailbox(id);
    let (events_tx, events_rx) = async_channel::unbounded();
    let (mail_tx, mail_rx) = event_mailbox();
    let ctx = SessionCtx::new(id, config, mail_tx, events_tx)?;
    let recv_buf = vec![0u8; ctx.read_buffer_size()];

    let actor = DatagramActor {
      adapter,
      ctx,
      transport,
      commands,
      mailbox: mail_rx,
      recv_buf,
      commands_open: true,
    };
    runtime.spawn(actor.run());
    Ok((handle, events_rx))
  }
}

struct DatagramActor<T, E: SecureEngine> {
  adapter: DatagramEngineAdapter<E>,
  ctx: SessionCtx,
  transport: T,
  commands: Receiver<SessionCommand>,
  mailbox: EventReceiver,
  recv_buf: Vec<u8>,
  commands_open: bool,
}

/// The peer is not listening (yet). Lost datagrams are the handshake's
/// retransmission problem, not a transport failure.
fn is_transient(error: &io::Error) -> bool {
  error.kind() == io::ErrorKind::ConnectionRefused
}

impl<T, E> DatagramActor<T, E>
where
  T: DatagramTransport,
  E: SecureEngine,
{
  async fn run(mut self) {
    let session = self.ctx.id;
    tracing::info!(session, "Datagram session started");
    self.adapter.start(&mut self.ctx);

    while self.ctx.close_requested.is_none() {
      let can_read = self.ctx.wants_read();
      let can_flush = self.ctx.can_flush();

      tokio::select! {
        biased;

        command = self.commands.recv(), if self.commands_open => match command {
          Ok(command) => self.process_command(command),
          Err(_) => {
            tracing::debug!(session, "All session handles dropped, closing");
            self.commands_open = false;
            self.adapter.close(&mut self.ctx);
          }
        },

        event = self.mailbox.recv() => {
          if let Ok(event) = event {
            self.adapter.on_event(&mut self.ctx, event);
          }
        }

        sent = self.transport.send(self.ctx.pending_bytes()), if can_flush => match sent {
          Ok(_) => self.ctx.advance_written(usize::MAX),
          Err(e) if is_transient(&e) => {
            tracing::debug!(session, error = %e, "Datagram not delivered");
            self.ctx.advance_written(usize::MAX);
          }
          Err(e) => self.on_io_error(e),
        },

        received = self.transport.recv(&mut self.recv_buf), if can_read => match received {
          Ok(n) => {
            tracing::trace!(session, bytes = n, "Datagram received");
            self.adapter.on_datagram(&mut self.ctx, &self.recv_buf[..n]);
          }
          Err(e) if is_transient(&e) => {
            tracing::debug!(session, error = %e, "Peer not reachable");
          }
          Err(e) => self.on_io_error(e),
        },
      }
    }

    self.shutdown().await;
  }

  fn process_command(&mut self, command: SessionCommand) {
    match command {
      SessionCommand::Write { data, promise } => self.adapter.write_with_promise(&mut self.ctx, data, promise),
      SessionCommand::Close => self.adapter.close(&mut self.ctx),
      SessionCommand::QuickClose => self.adapter.quick_close(&mut self.ctx),
      SessionCommand::DirtyClose => self.adapter.dirty_close(&mut self.ctx),
    }
  }

  fn on_io_error(&mut self, error: io::Error) {
    let error = SecureError::from(error);
    tracing::warn!(session = self.ctx.id, error = %error, "Transport I/O failed");
    self.ctx.fail_outbound(error.clone());
    self.ctx.fire_exception(&error);
    self.adapter.dirty_close(&mut self.ctx);
    if self.ctx.close_requested.is_none() {
      self.ctx.close_requested = Some(CloseStrength::Dirty);
    }
  }

  async fn shutdown(mut self) {
    let session = self.ctx.id;
    let strength = self.ctx.close_requested.unwrap_or(CloseStrength::Dirty);
    reject_pending_commands(&self.commands);

    if strength == CloseStrength::Dirty {
      self.ctx.fail_outbound(SecureError::Closed);
    } else {
      while let Some((datagram, promise)) = self.ctx.outbound.pop_front() {
        let sent = self.transport.send(&datagram).await;
        match (sent, promise) {
          (Ok(_), Some(promise)) => promise.complete(),
          (Err(e), Some(promise)) => promise.fail(e.into()),
          (_, None) => {}
        }
      }
    }

    self.ctx.emit(SessionEvent::Closed);
    tracing::info!(session, ?strength, "Datagram session closed");
  }
}
