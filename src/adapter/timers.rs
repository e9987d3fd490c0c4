// src/adapter/timers.rs

use crate::runtime::mailbox::post;
use crate::runtime::{AdapterEvent, TimerCallback, TimerHandle, TimerKind};
use crate::session::SessionContext;

use std::time::Duration;

#[derive(Debug)]
struct ArmedTimer {
  kind: TimerKind,
  round: u64,
  handle: TimerHandle,
}

/// Holds at most one scheduled timer. Arming replaces (and cancels) whatever
/// was there; every arm bumps the generation so late fires of replaced timers
/// can be recognised and ignored.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
  generation: u64,
  active: Option<ArmedTimer>,
}

impl TimerSlot {
  pub fn arm_once<C: SessionContext + ?Sized>(&mut self, ctx: &C, kind: TimerKind, delay: Duration, round: u64) {
    let timer = ctx.timer();
    let callback = self.prepare(ctx, kind);
    let handle = timer.schedule_once(delay, callback);
    self.active = Some(ArmedTimer { kind, round, handle });
  }

  pub fn arm_repeating<C: SessionContext + ?Sized>(
    &mut self,
    ctx: &C,
    kind: TimerKind,
    period: Duration,
    round: u64,
  ) {
    let timer = ctx.timer();
    let callback = self.prepare(ctx, kind);
    let handle = timer.schedule_repeating(period, period, callback);
    self.active = Some(ArmedTimer { kind, round, handle });
  }

  fn prepare<C: SessionContext + ?Sized>(&mut self, ctx: &C, kind: TimerKind) -> TimerCallback {
    self.cancel();
    self.generation += 1;
    let generation = self.generation;
    let events = ctx.events();
    Box::new(move || post(&events, AdapterEvent::TimerFired { kind, generation }))
  }

  pub fn cancel(&mut self) {
    if let Some(armed) = self.active.take() {
      armed.handle.cancel();
    }
  }

  /// Forgets a one-shot timer that already fired.
  pub fn clear(&mut self) {
    self.active = None;
  }

  pub fn is_current(&self, kind: TimerKind, generation: u64) -> bool {
    self.generation == generation && self.active_kind() == Some(kind)
  }

  pub fn active_kind(&self) -> Option<TimerKind> {
    self.active.as_ref().map(|a| a.kind)
  }

  pub fn active_round(&self) -> Option<u64> {
    self.active.as_ref().map(|a| a.round)
  }
}
