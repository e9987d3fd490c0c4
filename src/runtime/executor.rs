// src/runtime/executor.rs

use crate::error::SecureError;

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;

/// A unit of work submitted to an executor.
pub type ExecutorJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs delegated engine tasks off the I/O task.
pub trait TaskExecutor: Send + Sync + 'static {
  /// Submits `job`. An `Err` means the job will never run.
  fn execute(&self, job: ExecutorJob) -> Result<(), SecureError>;
}

/// Executor backed by Tokio's blocking thread pool.
#[derive(Debug)]
pub struct BlockingExecutor {
  handle: Handle,
  shut_down: AtomicBool,
}

impl BlockingExecutor {
  pub fn new(handle: Handle) -> Self {
    Self {
      handle,
      shut_down: AtomicBool::new(false),
    }
  }

  pub fn current() -> Result<Self, SecureError> {
    Handle::try_current()
      .map(Self::new)
      .map_err(|e| SecureError::Internal(format!("no Tokio runtime for executor: {}", e)))
  }

  /// Rejects every job submitted afterwards.
  pub fn shutdown(&self) {
    self.shut_down.store(true, Ordering::Release);
  }
}

impl TaskExecutor for BlockingExecutor {
  fn execute(&self, job: ExecutorJob) -> Result<(), SecureError> {
    if self.shut_down.load(Ordering::Acquire) {
      return Err(SecureError::ExecutorRejected("executor is shut down".into()));
    }
    self.handle.spawn_blocking(job);
    Ok(())
  }
}
