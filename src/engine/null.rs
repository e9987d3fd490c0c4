// src/engine/null.rs

//! A cleartext record-layer engine.
//!
//! `NullEngine` speaks a tiny TLS-shaped protocol without any cryptography:
//! every record is `[content type: u8][length: u16 BE][payload]`. The handshake
//! is two flights (client HELLO, server REPLY), the server may require a
//! delegated task before replying, and a one-byte alert record carries the
//! close notification. In datagram mode an empty `unwrap` while awaiting the
//! REPLY re-arms the HELLO for retransmission.
//!
//! With `stage_records` the engine takes a whole datagram of records at once,
//! unwraps the first and reports `NeedUnwrapAgain` until it has worked through
//! the rest, the way DTLS engines handle several records per datagram.

use super::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, SecureEngine};
use crate::error::{CloseType, SecureError};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const RECORD_HEADER_LEN: usize = 3;
pub const DEFAULT_RECORD_SIZE: usize = 16384;

const CT_ALERT: u8 = 21;
const CT_HANDSHAKE: u8 = 22;
const CT_APPLICATION: u8 = 23;

const HS_HELLO: u8 = 1;
const HS_REPLY: u8 = 2;
const HS_PAYLOAD_LEN: usize = 1 + 8;
const ALERT_CLOSE_NOTIFY: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Client,
  Server,
}

/// Whether the server needs a delegated task before sending its REPLY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegatedTaskMode {
  None,
  Succeed,
  Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsState {
  Idle,
  ClientSendHello,
  ClientAwaitReply,
  ServerAwaitHello,
  ServerRunTask,
  ServerSendReply,
  Established,
}

#[derive(Debug, Clone)]
pub struct NullEngineBuilder {
  role: Role,
  datagram: bool,
  record_size: usize,
  hints: Option<(usize, usize, usize, usize)>,
  task_mode: DelegatedTaskMode,
  established: bool,
  stage_records: bool,
  protocol_error_close: Option<CloseType>,
}

impl NullEngineBuilder {
  /// Datagram mode enables retransmission on empty unwraps.
  pub fn datagram(mut self, datagram: bool) -> Self {
    self.datagram = datagram;
    self
  }

  /// Maximum plaintext carried by one record.
  pub fn record_size(mut self, record_size: usize) -> Self {
    self.record_size = record_size.max(1);
    self
  }

  /// Overrides the buffer hints `(min_app, max_app, min_net, max_net)`.
  pub fn buffer_hints(mut self, min_app: usize, max_app: usize, min_net: usize, max_net: usize) -> Self {
    self.hints = Some((min_app, max_app, min_net, max_net));
    self
  }

  pub fn delegated_task(mut self, mode: DelegatedTaskMode) -> Self {
    self.task_mode = mode;
    self
  }

  /// Unwraps one record per call from a batch taken in a single `unwrap`.
  pub fn stage_records(mut self, stage: bool) -> Self {
    self.stage_records = stage;
    self
  }

  /// Close type attached to errors for malformed input.
  pub fn protocol_error_close(mut self, close: CloseType) -> Self {
    self.protocol_error_close = Some(close);
    self
  }

  /// Starts in the established state; no handshake is needed before data flows.
  pub fn established(mut self) -> Self {
    self.established = true;
    self
  }

  pub fn build(self) -> NullEngine {
    let record_size = self.record_size;
    let hints = self.hints.unwrap_or((
      record_size,
      record_size,
      record_size + RECORD_HEADER_LEN,
      record_size + RECORD_HEADER_LEN,
    ));
    NullEngine {
      role: self.role,
      datagram: self.datagram,
      record_size,
      hints,
      state: if self.established { HsState::Established } else { HsState::Idle },
      handshakes_completed: u32::from(self.established),
      task_mode: self.task_mode,
      task_done: Arc::new(AtomicBool::new(false)),
      task_handed_out: false,
      nonce: rand::random(),
      peer_nonce: None,
      close_pending: false,
      outbound_done: false,
      inbound_done: false,
      close_received: false,
      retransmissions: 0,
      stage_records: self.stage_records,
      staged: VecDeque::new(),
      staged_unwraps: 0,
      protocol_error_close: self.protocol_error_close,
    }
  }
}

pub struct NullEngine {
  role: Role,
  datagram: bool,
  record_size: usize,
  hints: (usize, usize, usize, usize),
  state: HsState,
  handshakes_completed: u32,
  task_mode: DelegatedTaskMode,
  task_done: Arc<AtomicBool>,
  task_handed_out: bool,
  nonce: [u8; 8],
  peer_nonce: Option<[u8; 8]>,
  close_pending: bool,
  outbound_done: bool,
  inbound_done: bool,
  close_received: bool,
  retransmissions: u32,
  stage_records: bool,
  staged: VecDeque<Vec<u8>>,
  staged_unwraps: u32,
  protocol_error_close: Option<CloseType>,
}

impl std::fmt::Debug for NullEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NullEngine")
      .field("role", &self.role)
      .field("datagram", &self.datagram)
      .field("state", &self.state)
      .field("handshakes_completed", &self.handshakes_completed)
      .field("outbound_done", &self.outbound_done)
      .field("inbound_done", &self.inbound_done)
      .field("staged", &self.staged.len())
      .finish_non_exhaustive()
  }
}

impl NullEngine {
  pub fn client() -> NullEngineBuilder {
    Self::builder(Role::Client)
  }

  pub fn server() -> NullEngineBuilder {
    Self::builder(Role::Server)
  }

  fn builder(role: Role) -> NullEngineBuilder {
    NullEngineBuilder {
      role,
      datagram: false,
      record_size: DEFAULT_RECORD_SIZE,
      hints: None,
      task_mode: DelegatedTaskMode::None,
      established: false,
      stage_records: false,
      protocol_error_close: None,
    }
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn handshakes_completed(&self) -> u32 {
    self.handshakes_completed
  }

  /// Number of times the HELLO was re-armed after a retransmission cue.
  pub fn retransmissions(&self) -> u32 {
    self.retransmissions
  }

  /// Records unwrapped from the staged batch rather than from fresh input.
  pub fn staged_unwraps(&self) -> u32 {
    self.staged_unwraps
  }

  /// Nonce the peer sent in its last handshake message.
  pub fn peer_nonce(&self) -> Option<[u8; 8]> {
    self.peer_nonce
  }

  fn start_handshake_state(&mut self) {
    self.state = match self.role {
      Role::Client => {
        self.nonce = rand::random();
        HsState::ClientSendHello
      }
      Role::Server => HsState::ServerAwaitHello,
    };
  }

  fn protocol_error(&self, reason: impl Into<String>) -> SecureError {
    match self.protocol_error_close {
      Some(close) => SecureError::engine_with_close(reason, close),
      None => SecureError::engine(reason),
    }
  }

  /// Length of the complete record at the start of `src`, if there is one.
  fn record_len(src: &[u8]) -> Option<usize> {
    if src.len() < RECORD_HEADER_LEN {
      return None;
    }
    let total = RECORD_HEADER_LEN + u16::from_be_bytes([src[1], src[2]]) as usize;
    (src.len() >= total).then_some(total)
  }

  /// Unwraps the single record at the start of `src`.
  fn unwrap_record(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError> {
    if src.len() < RECORD_HEADER_LEN {
      return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
    }

    let content_type = src[0];
    let len = u16::from_be_bytes([src[1], src[2]]) as usize;
    if len > self.record_size.max(HS_PAYLOAD_LEN) {
      return Err(self.protocol_error(format!("record length {} exceeds limit", len)));
    }
    let total = RECORD_HEADER_LEN + len;
    if src.len() < total {
      return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
    }
    let payload = &src[RECORD_HEADER_LEN..total];

    match content_type {
      CT_ALERT => {
        self.inbound_done = true;
        self.close_received = true;
        Ok(self.result(EngineStatus::Closed, total, 0))
      }
      CT_HANDSHAKE => {
        self.on_handshake_record(payload)?;
        Ok(self.result(EngineStatus::Ok, total, 0))
      }
      CT_APPLICATION => {
        if !self.data_allowed() {
          return Err(self.protocol_error("application data before handshake"));
        }
        if dst.len() < len {
          return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
        }
        dst[..len].copy_from_slice(payload);
        Ok(self.result(EngineStatus::Ok, total, len))
      }
      other => Err(self.protocol_error(format!("unknown record type {}", other))),
    }
  }

  fn write_record(dst: &mut [u8], content_type: u8, payload: &[u8]) -> Option<usize> {
    let total = RECORD_HEADER_LEN + payload.len();
    if dst.len() < total {
      return None;
    }
    dst[0] = content_type;
    dst[1..3].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    dst[RECORD_HEADER_LEN..total].copy_from_slice(payload);
    Some(total)
  }

  fn handshake_payload(&self, msg_type: u8) -> [u8; HS_PAYLOAD_LEN] {
    let mut payload = [0u8; HS_PAYLOAD_LEN];
    payload[0] = msg_type;
    payload[1..].copy_from_slice(&self.nonce);
    payload
  }

  fn result(&self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
    EngineResult::new(status, self.handshake_status(), consumed, produced)
  }

  fn data_allowed(&self) -> bool {
    self.handshakes_completed > 0
  }

  fn server_after_hello(&mut self) {
    self.task_done.store(false, Ordering::Release);
    self.task_handed_out = false;
    self.state = match self.task_mode {
      DelegatedTaskMode::None => HsState::ServerSendReply,
      _ => HsState::ServerRunTask,
    };
  }

  fn on_handshake_record(&mut self, payload: &[u8]) -> Result<(), SecureError> {
    if payload.len() != HS_PAYLOAD_LEN {
      return Err(self.protocol_error("malformed handshake record"));
    }
    let mut peer_nonce = [0u8; 8];
    peer_nonce.copy_from_slice(&payload[1..]);

    match (self.role, payload[0]) {
      (Role::Server, HS_HELLO) => match self.state {
        HsState::Idle | HsState::ServerAwaitHello | HsState::Established => {
          self.peer_nonce = Some(peer_nonce);
          self.server_after_hello();
        }
        // Retransmitted HELLO while the REPLY is still pending.
        _ => tracing::trace!("NullEngine: ignoring duplicate HELLO"),
      },
      (Role::Client, HS_REPLY) => match self.state {
        HsState::ClientAwaitReply | HsState::ClientSendHello => {
          self.peer_nonce = Some(peer_nonce);
          self.state = HsState::Established;
          self.handshakes_completed += 1;
        }
        HsState::Established => tracing::trace!("NullEngine: ignoring duplicate REPLY"),
        _ => return Err(self.protocol_error("unexpected REPLY")),
      },
      (_, other) => {
        return Err(self.protocol_error(format!(
          "unexpected handshake message {} for {:?}",
          other, self.role
        )))
      }
    }
    Ok(())
  }
}

impl SecureEngine for NullEngine {
  fn begin_handshake(&mut self) -> Result<(), SecureError> {
    if self.close_pending || self.outbound_done {
      return Err(SecureError::InvalidState("engine outbound is closed"));
    }
    // Renegotiation is not supported: an established engine stays established.
    if self.state == HsState::Idle {
      self.start_handshake_state();
    }
    Ok(())
  }

  fn handshake_status(&self) -> HandshakeStatus {
    if self.close_pending && !self.outbound_done {
      return HandshakeStatus::NeedWrap;
    }
    if !self.staged.is_empty() && !self.inbound_done {
      return HandshakeStatus::NeedUnwrapAgain;
    }
    match self.state {
      HsState::Idle | HsState::Established => HandshakeStatus::NotHandshaking,
      HsState::ClientSendHello | HsState::ServerSendReply => HandshakeStatus::NeedWrap,
      HsState::ClientAwaitReply | HsState::ServerAwaitHello => HandshakeStatus::NeedUnwrap,
      HsState::ServerRunTask => {
        if self.task_done.load(Ordering::Acquire) {
          HandshakeStatus::NeedWrap
        } else {
          HandshakeStatus::NeedTask
        }
      }
    }
  }

  fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError> {
    if self.outbound_done {
      return Ok(self.result(EngineStatus::Closed, 0, 0));
    }
    if self.close_pending {
      return Ok(match Self::write_record(dst, CT_ALERT, &[ALERT_CLOSE_NOTIFY]) {
        Some(n) => {
          self.close_pending = false;
          self.outbound_done = true;
          self.result(EngineStatus::Closed, 0, n)
        }
        None => self.result(EngineStatus::BufferOverflow, 0, 0),
      });
    }

    if self.state == HsState::Idle && !src.is_empty() {
      // Application data before any handshake starts one implicitly.
      self.start_handshake_state();
    }

    match self.state {
      HsState::ClientSendHello | HsState::ServerSendReply | HsState::ServerRunTask
        if self.handshake_status() == HandshakeStatus::NeedWrap =>
      {
        let msg_type = if self.role == Role::Client { HS_HELLO } else { HS_REPLY };
        let payload = self.handshake_payload(msg_type);
        match Self::write_record(dst, CT_HANDSHAKE, &payload) {
          Some(n) => {
            if self.role == Role::Client {
              self.state = HsState::ClientAwaitReply;
            } else {
              self.state = HsState::Established;
              self.handshakes_completed += 1;
            }
            Ok(self.result(EngineStatus::Ok, 0, n))
          }
          None => Ok(self.result(EngineStatus::BufferOverflow, 0, 0)),
        }
      }
      _ if self.data_allowed() => {
        if src.is_empty() {
          return Ok(self.result(EngineStatus::Ok, 0, 0));
        }
        let n = src.len().min(self.record_size);
        match Self::write_record(dst, CT_APPLICATION, &src[..n]) {
          Some(produced) => Ok(self.result(EngineStatus::Ok, n, produced)),
          None => Ok(self.result(EngineStatus::BufferOverflow, 0, 0)),
        }
      }
      _ => Ok(self.result(EngineStatus::Ok, 0, 0)),
    }
  }

  fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, SecureError> {
    if self.inbound_done {
      return Ok(self.result(EngineStatus::Closed, 0, 0));
    }
    if let Some(record) = self.staged.pop_front() {
      // Already counted as consumed when the batch was taken.
      let res = self.unwrap_record(&record, dst)?;
      if res.status == EngineStatus::BufferOverflow {
        self.staged.push_front(record);
      } else {
        self.staged_unwraps += 1;
      }
      return Ok(EngineResult::new(res.status, self.handshake_status(), 0, res.bytes_produced));
    }
    if src.is_empty() {
      if self.datagram && self.state == HsState::ClientAwaitReply {
        self.state = HsState::ClientSendHello;
        self.retransmissions += 1;
        tracing::debug!(retransmissions = self.retransmissions, "NullEngine: re-arming HELLO");
        return Ok(self.result(EngineStatus::Ok, 0, 0));
      }
      return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
    }
    if !self.stage_records {
      return self.unwrap_record(src, dst);
    }

    let Some(first) = Self::record_len(src) else {
      return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
    };
    let mut taken = first;
    while let Some(len) = Self::record_len(&src[taken..]) {
      self.staged.push_back(src[taken..taken + len].to_vec());
      taken += len;
    }
    let res = match self.unwrap_record(&src[..first], dst) {
      Ok(res) => res,
      Err(e) => {
        self.staged.clear();
        return Err(e);
      }
    };
    if res.status == EngineStatus::BufferOverflow {
      self.staged.clear();
      return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
    }
    Ok(EngineResult::new(res.status, self.handshake_status(), taken, res.bytes_produced))
  }

  fn next_delegated_task(&mut self) -> Option<DelegatedTask> {
    if self.state != HsState::ServerRunTask || self.task_handed_out {
      return None;
    }
    self.task_handed_out = true;
    let done = self.task_done.clone();
    let seed = self.peer_nonce.unwrap_or_default();
    let mode = self.task_mode;
    Some(Box::new(move || {
      // Stand-in for key agreement work.
      let mut acc = 0u64;
      for b in seed.iter().cycle().take(4096) {
        acc = acc.rotate_left(5) ^ u64::from(*b);
      }
      std::hint::black_box(acc);
      if mode == DelegatedTaskMode::Fail {
        return Err(SecureError::TaskFailed("key computation failed".into()));
      }
      done.store(true, Ordering::Release);
      Ok(())
    }))
  }

  fn close_outbound(&mut self) {
    if !self.outbound_done {
      self.close_pending = true;
    }
  }

  fn close_inbound(&mut self) -> Result<(), SecureError> {
    self.inbound_done = true;
    if self.close_received {
      Ok(())
    } else {
      Err(SecureError::engine(
        "inbound closed before receiving the peer's close notification",
      ))
    }
  }

  fn is_outbound_done(&self) -> bool {
    self.outbound_done
  }

  fn is_inbound_done(&self) -> bool {
    self.inbound_done
  }

  fn min_app_buffer_size(&self) -> usize {
    self.hints.0
  }

  fn max_app_buffer_size(&self) -> usize {
    self.hints.1
  }

  fn min_net_buffer_size(&self) -> usize {
    self.hints.2
  }

  fn max_net_buffer_size(&self) -> usize {
    self.hints.3
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn wrap_vec(engine: &mut NullEngine, src: &[u8]) -> (EngineResult, Vec<u8>) {
    let mut dst = vec![0u8; 64];
    let res = engine.wrap(src, &mut dst).unwrap();
    dst.truncate(res.bytes_produced);
    (res, dst)
  }

  #[test]
  fn handshake_two_flights() {
    let mut client = NullEngine::client().build();
    let mut server = NullEngine::server().build();
    client.begin_handshake().unwrap();
    server.begin_handshake().unwrap();
    assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
    assert_eq!(server.handshake_status(), HandshakeStatus::NeedUnwrap);

    let (_, hello) = wrap_vec(&mut client, &[]);
    assert_eq!(client.handshake_status(), HandshakeStatus::NeedUnwrap);

    let mut app = [0u8; 16];
    let res = server.unwrap(&hello, &mut app).unwrap();
    assert_eq!(res.bytes_consumed, hello.len());
    assert_eq!(res.handshake_status, HandshakeStatus::NeedWrap);

    let (_, reply) = wrap_vec(&mut server, &[]);
    assert_eq!(server.handshake_status(), HandshakeStatus::NotHandshaking);
    client.unwrap(&reply, &mut app).unwrap();
    assert_eq!(client.handshake_status(), HandshakeStatus::NotHandshaking);
    assert_eq!(client.handshakes_completed(), 1);
  }

  #[test]
  fn partial_record_underflows() {
    let mut client = NullEngine::client().established().build();
    let mut server = NullEngine::server().established().build();
    let (_, record) = wrap_vec(&mut client, b"hello");
    let mut app = [0u8; 16];
    let res = server.unwrap(&record[..4], &mut app).unwrap();
    assert_eq!(res.status, EngineStatus::BufferUnderflow);
    let res = server.unwrap(&record, &mut app).unwrap();
    assert_eq!(res.status, EngineStatus::Ok);
    assert_eq!(&app[..res.bytes_produced], b"hello");
  }

  #[test]
  fn wrap_overflows_when_destination_too_small() {
    let mut client = NullEngine::client().established().build();
    let mut dst = [0u8; 4];
    let res = client.wrap(b"hello", &mut dst).unwrap();
    assert_eq!(res.status, EngineStatus::BufferOverflow);
    assert_eq!(res.bytes_consumed, 0);
  }

  #[test]
  fn close_inbound_without_notification_fails() {
    let mut server = NullEngine::server().established().build();
    assert!(server.close_inbound().is_err());
    assert!(server.is_inbound_done());
  }

  #[test]
  fn datagram_empty_unwrap_rearms_hello() {
    let mut client = NullEngine::client().datagram(true).build();
    client.begin_handshake().unwrap();
    let (_, first) = wrap_vec(&mut client, &[]);
    let mut app = [0u8; 16];
    let res = client.unwrap(&[], &mut app).unwrap();
    assert_eq!(res.handshake_status, HandshakeStatus::NeedWrap);
    let (_, again) = wrap_vec(&mut client, &[]);
    assert_eq!(first, again);
    assert_eq!(client.retransmissions(), 1);
  }

  #[test]
  fn server_task_gates_reply() {
    let mut server = NullEngine::server().delegated_task(DelegatedTaskMode::Succeed).build();
    let mut client = NullEngine::client().build();
    server.begin_handshake().unwrap();
    client.begin_handshake().unwrap();
    let (_, hello) = wrap_vec(&mut client, &[]);
    let mut app = [0u8; 16];
    server.unwrap(&hello, &mut app).unwrap();
    assert_eq!(server.handshake_status(), HandshakeStatus::NeedTask);
    let task = server.next_delegated_task().unwrap();
    assert!(server.next_delegated_task().is_none());
    task().unwrap();
    assert_eq!(server.handshake_status(), HandshakeStatus::NeedWrap);
  }

  #[test]
  fn staged_records_are_unwrapped_one_per_call() {
    let mut client = NullEngine::client().established().build();
    let mut server = NullEngine::server().established().stage_records(true).build();
    let (_, first) = wrap_vec(&mut client, b"one");
    let (_, second) = wrap_vec(&mut client, b"two");
    let datagram = [first, second, vec![CT_APPLICATION]].concat();

    let mut app = [0u8; 16];
    let res = server.unwrap(&datagram, &mut app).unwrap();
    assert_eq!(&app[..res.bytes_produced], b"one");
    // The trailing partial header is left to the caller.
    assert_eq!(res.bytes_consumed, datagram.len() - 1);
    assert_eq!(res.handshake_status, HandshakeStatus::NeedUnwrapAgain);

    let res = server.unwrap(&[], &mut app).unwrap();
    assert_eq!(&app[..res.bytes_produced], b"two");
    assert_eq!(res.bytes_consumed, 0);
    assert_eq!(res.handshake_status, HandshakeStatus::NotHandshaking);
    assert_eq!(server.staged_unwraps(), 1);
  }

  #[test]
  fn protocol_errors_carry_configured_close() {
    let mut server = NullEngine::server()
      .established()
      .protocol_error_close(CloseType::Quick)
      .build();
    let mut app = [0u8; 16];
    let err = server.unwrap(&[99, 0, 1, 0], &mut app).unwrap_err();
    assert_eq!(err.close_override(), Some(CloseType::Quick));
  }
}
