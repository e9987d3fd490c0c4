// src/runtime/timer.rs

use crate::error::SecureError;

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Callback run when a timer fires. Repeating timers call it once per period.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Schedules delayed and periodic callbacks.
pub trait Timer: Send + Sync + 'static {
  fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

  fn schedule_repeating(&self, delay: Duration, period: Duration, callback: TimerCallback) -> TimerHandle;

  /// Current time on this timer's clock. Deadlines compared against fires
  /// must be taken from here.
  fn now(&self) -> Instant;
}

/// Cancels a scheduled callback. Dropping the handle leaves the timer running;
/// cancelling one that already fired does nothing.
pub struct TimerHandle {
  cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
  pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
    Self {
      cancel: Some(Box::new(cancel)),
    }
  }

  /// A handle with nothing to cancel.
  pub fn noop() -> Self {
    Self { cancel: None }
  }

  pub fn cancel(mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

impl fmt::Debug for TimerHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TimerHandle")
      .field("armed", &self.cancel.is_some())
      .finish()
  }
}

/// Timer backed by tasks on a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTimer {
  handle: Handle,
}

impl TokioTimer {
  pub fn new(handle: Handle) -> Self {
    Self { handle }
  }

  /// Uses the runtime the caller is running on.
  pub fn current() -> Result<Self, SecureError> {
    Handle::try_current()
      .map(Self::new)
      .map_err(|e| SecureError::Internal(format!("no Tokio runtime for timer: {}", e)))
  }

  fn abort_handle(abort: AbortHandle) -> TimerHandle {
    TimerHandle::new(move || abort.abort())
  }
}

impl Timer for TokioTimer {
  fn schedule_once(&self, delay: Duration, mut callback: TimerCallback) -> TimerHandle {
    let task = self.handle.spawn(async move {
      tokio::time::sleep(delay).await;
      callback();
    });
    Self::abort_handle(task.abort_handle())
  }

  fn schedule_repeating(&self, delay: Duration, period: Duration, mut callback: TimerCallback) -> TimerHandle {
    let period = period.max(Duration::from_millis(1));
    let task = self.handle.spawn(async move {
      let mut ticks = interval_at(Instant::now() + delay, period);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticks.tick().await;
        callback();
      }
    });
    Self::abort_handle(task.abort_handle())
  }

  fn now(&self) -> Instant {
    Instant::now()
  }
}

struct ManualEntry {
  id: u64,
  deadline: Duration,
  period: Option<Duration>,
  callback: Arc<Mutex<TimerCallback>>,
}

#[derive(Default)]
struct ManualState {
  now: Duration,
  next_id: u64,
  entries: Vec<ManualEntry>,
  cancelled: Vec<u64>,
  fired: usize,
}

/// Timer driven by explicit `advance` calls instead of a clock.
///
/// Deterministic stand-in for `TokioTimer` when simulating sessions: callbacks
/// run on the thread calling `advance`, in deadline order.
#[derive(Clone)]
pub struct ManualTimer {
  origin: Instant,
  state: Arc<Mutex<ManualState>>,
}

impl Default for ManualTimer {
  fn default() -> Self {
    Self::new()
  }
}

impl ManualTimer {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
      state: Arc::default(),
    }
  }

  /// Virtual time elapsed since the timer was created.
  pub fn elapsed(&self) -> Duration {
    self.state.lock().now
  }

  /// Moves the virtual clock forward, running every callback that comes due.
  /// Returns how many callbacks ran.
  pub fn advance(&self, by: Duration) -> usize {
    let target = self.state.lock().now + by;
    let mut fired = 0;
    loop {
      let callback = {
        let mut state = self.state.lock();
        let cancelled = std::mem::take(&mut state.cancelled);
        state.entries.retain(|e| !cancelled.contains(&e.id));
        let due = state
          .entries
          .iter()
          .enumerate()
          .filter(|(_, e)| e.deadline <= target)
          .min_by_key(|(_, e)| (e.deadline, e.id))
          .map(|(i, _)| i);
        let Some(index) = due else {
          break;
        };
        let deadline = state.entries[index].deadline;
        state.now = state.now.max(deadline);
        match state.entries[index].period {
          Some(period) => {
            state.entries[index].deadline = deadline + period;
            state.entries[index].callback.clone()
          }
          None => state.entries.remove(index).callback,
        }
      };
      let mut cb = callback.lock();
      (&mut **cb)();
      fired += 1;
    }
    let mut state = self.state.lock();
    state.now = target;
    state.fired += fired;
    fired
  }

  /// Scheduled callbacks that were neither cancelled nor completed.
  pub fn pending(&self) -> usize {
    let state = self.state.lock();
    state.entries.iter().filter(|e| !state.cancelled.contains(&e.id)).count()
  }

  /// Total callbacks run so far.
  pub fn fired(&self) -> usize {
    self.state.lock().fired
  }

  fn schedule(&self, delay: Duration, period: Option<Duration>, callback: TimerCallback) -> TimerHandle {
    let mut state = self.state.lock();
    state.next_id += 1;
    let id = state.next_id;
    let deadline = state.now + delay;
    state.entries.push(ManualEntry {
      id,
      deadline,
      period: period.map(|p| p.max(Duration::from_millis(1))),
      callback: Arc::new(Mutex::new(callback)),
    });
    let weak = Arc::downgrade(&self.state);
    TimerHandle::new(move || {
      if let Some(state) = weak.upgrade() {
        state.lock().cancelled.push(id);
      }
    })
  }
}

impl fmt::Debug for ManualTimer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("ManualTimer")
      .field("now", &state.now)
      .field("entries", &state.entries.len())
      .field("fired", &state.fired)
      .finish()
  }
}

impl Timer for ManualTimer {
  fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
    self.schedule(delay, None, callback)
  }

  fn schedule_repeating(&self, delay: Duration, period: Duration, callback: TimerCallback) -> TimerHandle {
    self.schedule(delay, Some(period), callback)
  }

  fn now(&self) -> Instant {
    self.origin + self.elapsed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test(start_paused = true)]
  async fn repeating_timer_fires_until_cancelled() {
    let timer = TokioTimer::current().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handle = timer.schedule_repeating(
      Duration::from_millis(100),
      Duration::from_millis(100),
      Box::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
      }),
    );

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    handle.cancel();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_once_timer_never_fires() {
    let timer = TokioTimer::current().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handle = timer.schedule_once(
      Duration::from_secs(1),
      Box::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
      }),
    );
    handle.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn manual_timer_runs_due_callbacks_in_order() {
    let timer = ManualTimer::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (a, b) = (order.clone(), order.clone());
    timer.schedule_once(Duration::from_secs(2), Box::new(move || a.lock().push("once")));
    let repeating = timer.schedule_repeating(
      Duration::from_secs(1),
      Duration::from_secs(1),
      Box::new(move || b.lock().push("tick")),
    );

    assert_eq!(timer.advance(Duration::from_millis(2500)), 3);
    assert_eq!(*order.lock(), vec!["tick", "once", "tick"]);

    repeating.cancel();
    assert_eq!(timer.advance(Duration::from_secs(5)), 0);
    assert_eq!(timer.pending(), 0);
    assert_eq!(timer.fired(), 3);
  }

  #[test]
  fn manual_clock_only_moves_on_advance() {
    let timer = ManualTimer::new();
    let start = timer.now();
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(timer.now(), start);

    timer.advance(Duration::from_secs(3));
    assert_eq!(timer.now() - start, Duration::from_secs(3));
    assert_eq!(timer.clone().now(), timer.now());
  }

  #[tokio::test(start_paused = true)]
  async fn tokio_clock_follows_paused_time() {
    let timer = TokioTimer::current().unwrap();
    let start = timer.now();
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(timer.now() - start, Duration::from_secs(2));
  }
}
