// src/config.rs

use crate::runtime::TaskExecutor;
use crate::session::{CloseStrength, IncidentPolicy, LogIncidentPolicy};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What the datagram adapter does with a datagram holding only part of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncompleteDatagramPolicy {
  /// Drop it and report an `IncompleteDatagram` incident.
  #[default]
  Discard,
  /// Keep the bytes and prepend them to the next datagram.
  Buffer,
}

/// Options shared by stream and datagram adapters.
#[derive(Clone)]
pub struct EngineAdapterConfig {
  /// Bound on a whole handshake, from its start until the engine stops handshaking.
  pub handshake_timeout: Duration,
  /// Delay between retransmissions of an unanswered datagram flight.
  pub retransmission_interval: Duration,
  /// Bound on waiting for the peer's close message.
  pub close_timeout: Duration,
  /// Keep the session readable after sending our close until the peer's close arrives.
  pub wait_for_inbound_close_message: bool,
  pub max_app_buffer_multiplier: usize,
  pub max_net_buffer_multiplier: usize,
  /// Adopt caller-owned buffers handed to `write_owned` instead of copying them.
  pub optimize_buffer_copying: bool,
  /// Overrides the session's executor for delegated tasks.
  pub executor: Option<Arc<dyn TaskExecutor>>,
  /// Strength used by `close()`.
  pub default_close_strength: CloseStrength,
  /// Defer the handshake until the first write, read or close.
  pub lazy_handshake: bool,
  pub incomplete_datagram_policy: IncompleteDatagramPolicy,
  pub incident_policy: Arc<dyn IncidentPolicy>,
}

impl Default for EngineAdapterConfig {
  fn default() -> Self {
    Self {
      handshake_timeout: Duration::from_secs(60),
      retransmission_interval: Duration::from_secs(1),
      close_timeout: Duration::from_secs(5),
      wait_for_inbound_close_message: false,
      max_app_buffer_multiplier: 1,
      max_net_buffer_multiplier: 1,
      optimize_buffer_copying: false,
      executor: None,
      default_close_strength: CloseStrength::Gentle,
      lazy_handshake: false,
      incomplete_datagram_policy: IncompleteDatagramPolicy::Discard,
      incident_policy: Arc::new(LogIncidentPolicy),
    }
  }
}

impl fmt::Debug for EngineAdapterConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EngineAdapterConfig")
      .field("handshake_timeout", &self.handshake_timeout)
      .field("retransmission_interval", &self.retransmission_interval)
      .field("close_timeout", &self.close_timeout)
      .field("wait_for_inbound_close_message", &self.wait_for_inbound_close_message)
      .field("max_app_buffer_multiplier", &self.max_app_buffer_multiplier)
      .field("max_net_buffer_multiplier", &self.max_net_buffer_multiplier)
      .field("optimize_buffer_copying", &self.optimize_buffer_copying)
      .field("executor", &self.executor.is_some())
      .field("default_close_strength", &self.default_close_strength)
      .field("lazy_handshake", &self.lazy_handshake)
      .field("incomplete_datagram_policy", &self.incomplete_datagram_policy)
      .finish_non_exhaustive()
  }
}

impl EngineAdapterConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }

  pub fn with_retransmission_interval(mut self, interval: Duration) -> Self {
    self.retransmission_interval = interval;
    self
  }

  pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
    self.close_timeout = timeout;
    self
  }

  pub fn with_wait_for_inbound_close_message(mut self, wait: bool) -> Self {
    self.wait_for_inbound_close_message = wait;
    self
  }

  pub fn with_max_app_buffer_multiplier(mut self, multiplier: usize) -> Self {
    self.max_app_buffer_multiplier = multiplier.max(1);
    self
  }

  pub fn with_max_net_buffer_multiplier(mut self, multiplier: usize) -> Self {
    self.max_net_buffer_multiplier = multiplier.max(1);
    self
  }

  pub fn with_optimize_buffer_copying(mut self, optimize: bool) -> Self {
    self.optimize_buffer_copying = optimize;
    self
  }

  pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
    self.executor = Some(executor);
    self
  }

  pub fn with_default_close_strength(mut self, strength: CloseStrength) -> Self {
    self.default_close_strength = strength;
    self
  }

  pub fn with_lazy_handshake(mut self, lazy: bool) -> Self {
    self.lazy_handshake = lazy;
    self
  }

  pub fn with_incomplete_datagram_policy(mut self, policy: IncompleteDatagramPolicy) -> Self {
    self.incomplete_datagram_policy = policy;
    self
  }

  pub fn with_incident_policy(mut self, policy: Arc<dyn IncidentPolicy>) -> Self {
    self.incident_policy = policy;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_and_setters() {
    let config = EngineAdapterConfig::default();
    assert_eq!(config.handshake_timeout, Duration::from_secs(60));
    assert!(!config.wait_for_inbound_close_message);
    assert_eq!(config.default_close_strength, CloseStrength::Gentle);
    assert_eq!(config.incomplete_datagram_policy, IncompleteDatagramPolicy::Discard);

    let config = config
      .with_max_net_buffer_multiplier(0)
      .with_lazy_handshake(true)
      .with_close_timeout(Duration::from_millis(250));
    assert_eq!(config.max_net_buffer_multiplier, 1);
    assert!(config.lazy_handshake);
    assert_eq!(config.close_timeout, Duration::from_millis(250));
  }
}
