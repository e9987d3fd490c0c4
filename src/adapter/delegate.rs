// src/adapter/delegate.rs

//! Delegated task execution: inline without an executor, otherwise on the
//! executor with completion posted back through the event mailbox.

use super::driver::Step;
use super::EngineCore;
use crate::engine::SecureEngine;
use crate::error::SecureError;
use crate::runtime::mailbox::post;
use crate::runtime::AdapterEvent;
use crate::session::SessionContext;

use std::panic::{catch_unwind, AssertUnwindSafe};

impl<E: SecureEngine> EngineCore<E> {
  pub(super) fn delegate_task<C: SessionContext + ?Sized>(&mut self, ctx: &mut C) -> Result<Step, SecureError> {
    if self.task_in_flight {
      return Ok(Step::Stop);
    }
    let task = self
      .engine
      .next_delegated_task()
      .ok_or_else(|| SecureError::engine("engine needs a delegated task but handed none out"))?;

    let executor = self.config.executor.clone().or_else(|| ctx.executor());
    let Some(executor) = executor else {
      tracing::trace!(session = self.session_id, "Running delegated task inline");
      task()?;
      return Ok(Step::Continue);
    };

    let events = ctx.events();
    let session = self.session_id;
    self.task_in_flight = true;
    let submitted = executor.execute(Box::new(move || {
      let result = catch_unwind(AssertUnwindSafe(task))
        .unwrap_or_else(|_| Err(SecureError::TaskFailed("delegated task panicked".into())));
      tracing::trace!(session, ok = result.is_ok(), "Delegated task finished");
      post(&events, AdapterEvent::TaskCompleted { result });
    }));

    match submitted {
      Ok(()) => {
        tracing::debug!(session = self.session_id, "Delegated task submitted to executor");
        Ok(Step::Stop)
      }
      Err(e) => {
        self.task_in_flight = false;
        Err(match e {
          SecureError::ExecutorRejected(_) => e,
          other => SecureError::ExecutorRejected(other.to_string()),
        })
      }
    }
  }

  pub(super) fn on_task_completed<C: SessionContext + ?Sized>(&mut self, ctx: &mut C, result: Result<(), SecureError>) {
    if !self.task_in_flight {
      tracing::trace!(session = self.session_id, "Completion without a task in flight ignored");
      return;
    }
    self.task_in_flight = false;
    match result {
      Ok(()) => {
        tracing::debug!(session = self.session_id, "Delegated task completed");
        self.drive(ctx);
      }
      Err(e) => self.fail(ctx, e),
    }
  }
}
