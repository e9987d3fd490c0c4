// src/transport/stream.rs

use super::{
  command_mailbox, next_session_id, reject_pending_commands, SessionCommand, SessionConfig, SessionCtx,
  SessionEvent, SessionEvents, SessionHandle,
};
use crate::adapter::StreamEngineAdapter;
use crate::engine::SecureEngine;
use crate::error::SecureError;
use crate::runtime::{event_mailbox, EventReceiver};
use crate::session::{CloseStrength, SessionContext};

use async_channel::Receiver;
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;

/// Hosts a `StreamEngineAdapter` over any Tokio byte stream.
#[derive(Debug)]
pub struct StreamSession;

impl StreamSession {
  /// Spawns the session task on the current runtime and starts the adapter.
  pub fn spawn<S, E>(
    stream: S,
    adapter: StreamEngineAdapter<E>,
    config: SessionConfig,
  ) -> Result<(SessionHandle, SessionEvents), SecureError>
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
    E: SecureEngine,
  {
    let runtime = Handle::try_current().map_err(|e| SecureError::Internal(format!("no Tokio runtime: {}", e)))?;
    let id = next_session_id();
    let (handle, commands) = command_mailbox(id);
    let (events_tx, events_rx) = async_channel::unbounded();
    let (mail_tx, mail_rx) = event_mailbox();
    let ctx = SessionCtx::new(id, config, mail_tx, events_tx)?;

    let (reader, writer) = tokio::io::split(stream);
    let actor = StreamActor {
      adapter,
      ctx,
      reader,
      writer,
      commands,
      mailbox: mail_rx,
      read_buf: BytesMut::new(),
      read_open: true,
      commands_open: true,
    };
    runtime.spawn(actor.run());
    Ok((handle, events_rx))
  }
}

struct StreamActor<S, E: SecureEngine> {
  adapter: StreamEngineAdapter<E>,
  ctx: SessionCtx,
  reader: ReadHalf<S>,
  writer: WriteHalf<S>,
  commands: Receiver<SessionCommand>,
  mailbox: EventReceiver,
  /// Transport bytes the adapter had no room for yet.
  read_buf: BytesMut,
  read_open: bool,
  commands_open: bool,
}

impl<S, E> StreamActor<S, E>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
  E: SecureEngine,
{
  async fn run(mut self) {
    let session = self.ctx.id;
    tracing::info!(session, "Stream session started");
    self.adapter.start(&mut self.ctx);

    while self.ctx.close_requested.is_none() {
      if self.ctx.wants_read() && !self.read_buf.is_empty() {
        self.adapter.on_read(&mut self.ctx, &mut self.read_buf);
        continue;
      }
      if self.read_buf.is_empty() {
        self.read_buf.reserve(self.ctx.read_buffer_size());
      }
      let can_read = self.read_open && self.ctx.wants_read();
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

        written = self.writer.write(self.ctx.pending_bytes()), if can_flush => match written {
          Ok(0) => self.on_io_error(io::ErrorKind::WriteZero.into()),
          Ok(n) => self.ctx.advance_written(n),
          Err(e) => self.on_io_error(e),
        },

        read = self.reader.read_buf(&mut self.read_buf), if can_read => match read {
          Ok(0) => {
            tracing::debug!(session, "Transport reached end of stream");
            self.read_open = false;
            self.adapter.on_eof(&mut self.ctx);
          }
          Ok(n) => {
            tracing::trace!(session, bytes = n, "Transport read");
            self.adapter.on_read(&mut self.ctx, &mut self.read_buf);
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
      while let Some((data, promise)) = self.ctx.outbound.pop_front() {
        match self.writer.write_all(&data).await {
          Ok(()) => {
            if let Some(promise) = promise {
              promise.complete();
            }
          }
          Err(e) => {
            let error = SecureError::from(e);
            tracing::debug!(session, error = %error, "Final flush failed");
            if let Some(promise) = promise {
              promise.fail(error.clone());
            }
            self.ctx.fail_outbound(error);
            break;
          }
        }
      }
      if let Err(e) = self.writer.shutdown().await {
        tracing::debug!(session, error = %e, "Transport shutdown failed");
      }
    }

    self.ctx.emit(SessionEvent::Closed);
    tracing::info!(session, ?strength, "Stream session closed");
  }
}
