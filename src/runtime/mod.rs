// src/runtime/mod.rs

//! Timers, executors and the event mailbox that marshals their completions
//! back onto the owning task.

pub mod executor;
pub mod mailbox;
pub mod timer;

pub use executor::{BlockingExecutor, ExecutorJob, TaskExecutor};
pub use mailbox::{event_mailbox, AdapterEvent, EventReceiver, EventSender, TimerKind};
pub use timer::{ManualTimer, Timer, TimerCallback, TimerHandle, TokioTimer};
