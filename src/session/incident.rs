// src/session/incident.rs

use super::CloseStrength;
use crate::error::SecureError;

use std::fmt;

/// Non-fatal abnormal conditions reported through `fire_incident`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncidentKind {
  /// The transport ended before the peer's close message arrived.
  ClosedWithoutCloseNotify,
  /// A datagram held only part of a record and was dropped.
  IncompleteDatagram,
  /// A datagram was larger than the inbound buffer can ever hold.
  OversizedDatagram,
  /// A layer above the adapter failed to decode delivered data.
  DecodingFailure,
}

impl fmt::Display for IncidentKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      IncidentKind::ClosedWithoutCloseNotify => "closed without close notification",
      IncidentKind::IncompleteDatagram => "incomplete datagram discarded",
      IncidentKind::OversizedDatagram => "oversized datagram discarded",
      IncidentKind::DecodingFailure => "decoding failure",
    };
    f.write_str(text)
  }
}

#[derive(Debug, Clone)]
pub struct Incident {
  pub kind: IncidentKind,
  pub cause: Option<SecureError>,
}

impl Incident {
  pub fn new(kind: IncidentKind) -> Self {
    Self { kind, cause: None }
  }

  pub fn with_cause(kind: IncidentKind, cause: SecureError) -> Self {
    Self {
      kind,
      cause: Some(cause),
    }
  }
}

impl fmt::Display for Incident {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.cause {
      Some(cause) => write!(f, "{}: {}", self.kind, cause),
      None => write!(f, "{}", self.kind),
    }
  }
}

/// What to do after an incident was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentAction {
  Continue,
  Close(CloseStrength),
}

/// Decides whether an incident is tolerated or closes the session.
pub trait IncidentPolicy: Send + Sync + 'static {
  fn on_incident(&self, session_id: u64, incident: &Incident) -> IncidentAction;
}

/// Logs the incident and keeps the session open.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIncidentPolicy;

impl IncidentPolicy for LogIncidentPolicy {
  fn on_incident(&self, session_id: u64, incident: &Incident) -> IncidentAction {
    tracing::warn!(session = session_id, kind = ?incident.kind, "Incident: {}", incident);
    IncidentAction::Continue
  }
}

/// Closes the session with a fixed strength on every incident.
#[derive(Debug, Clone, Copy)]
pub struct CloseOnIncidentPolicy(pub CloseStrength);

impl IncidentPolicy for CloseOnIncidentPolicy {
  fn on_incident(&self, session_id: u64, incident: &Incident) -> IncidentAction {
    tracing::warn!(session = session_id, kind = ?incident.kind, strength = ?self.0, "Closing on incident: {}", incident);
    IncidentAction::Close(self.0)
  }
}
