// src/session/promise.rs

use crate::error::SecureError;

use futures::{ready, FutureExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type WriteResult = Result<(), SecureError>;

/// Completion side of a write. Settled by whoever flushes the network bytes
/// that carry the write's last byte.
///
/// Several promises may be joined into one, e.g. when the last bytes of two
/// writes travel in the same network record.
pub struct WritePromise {
  senders: Vec<oneshot::Sender<WriteResult>>,
}

impl WritePromise {
  /// Creates a linked promise and future.
  pub fn pair() -> (WritePromise, WriteFuture) {
    let (tx, rx) = oneshot::channel();
    (
      WritePromise { senders: vec![tx] },
      WriteFuture {
        state: FutureState::Pending(rx),
      },
    )
  }

  /// Folds `other` into this promise so both settle together.
  pub fn join(&mut self, mut other: WritePromise) {
    self.senders.append(&mut other.senders);
  }

  pub fn complete(self) {
    self.settle(Ok(()));
  }

  pub fn fail(self, error: SecureError) {
    self.settle(Err(error));
  }

  fn settle(self, result: WriteResult) {
    for tx in self.senders {
      // The waiter may have given up; that is fine.
      let _ = tx.send(result.clone());
    }
  }
}

impl fmt::Debug for WritePromise {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WritePromise")
      .field("waiters", &self.senders.len())
      .finish()
  }
}

enum FutureState {
  Pending(oneshot::Receiver<WriteResult>),
  Ready(Option<WriteResult>),
}

/// Resolves once the write's bytes were handed to the transport, or fails with
/// the error that stopped them.
pub struct WriteFuture {
  state: FutureState,
}

impl WriteFuture {
  /// An already completed write.
  pub fn completed() -> Self {
    Self {
      state: FutureState::Ready(Some(Ok(()))),
    }
  }

  /// An already failed write.
  pub fn failed(error: SecureError) -> Self {
    Self {
      state: FutureState::Ready(Some(Err(error))),
    }
  }

  /// Non-blocking check. `None` while the write is still pending.
  pub fn try_result(&mut self) -> Option<WriteResult> {
    match &mut self.state {
      FutureState::Ready(result) => result.clone(),
      FutureState::Pending(rx) => match rx.try_recv() {
        Ok(result) => {
          self.state = FutureState::Ready(Some(result.clone()));
          Some(result)
        }
        Err(oneshot::error::TryRecvError::Empty) => None,
        Err(oneshot::error::TryRecvError::Closed) => {
          self.state = FutureState::Ready(Some(Err(SecureError::Closed)));
          Some(Err(SecureError::Closed))
        }
      },
    }
  }
}

impl fmt::Debug for WriteFuture {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match &self.state {
      FutureState::Pending(_) => "pending",
      FutureState::Ready(_) => "ready",
    };
    f.debug_struct("WriteFuture").field("state", &state).finish()
  }
}

impl Future for WriteFuture {
  type Output = WriteResult;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    match &mut this.state {
      FutureState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(SecureError::Closed))),
      FutureState::Pending(rx) => {
        let result = match ready!(rx.poll_unpin(cx)) {
          Ok(result) => result,
          // Promise dropped without being settled.
          Err(_) => Err(SecureError::Closed),
        };
        this.state = FutureState::Ready(None);
        Poll::Ready(result)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn joined_promises_settle_together() {
    let (mut first, mut f1) = WritePromise::pair();
    let (second, mut f2) = WritePromise::pair();
    first.join(second);
    assert!(f1.try_result().is_none());
    first.fail(SecureError::Closed);
    assert!(matches!(f1.try_result(), Some(Err(SecureError::Closed))));
    assert!(matches!(f2.try_result(), Some(Err(SecureError::Closed))));
  }

  #[test]
  fn dropped_promise_reads_as_closed() {
    let (promise, mut future) = WritePromise::pair();
    drop(promise);
    assert!(matches!(future.try_result(), Some(Err(SecureError::Closed))));
  }

  #[tokio::test]
  async fn future_resolves_on_completion() {
    let (promise, future) = WritePromise::pair();
    promise.complete();
    assert!(future.await.is_ok());
    assert!(WriteFuture::completed().await.is_ok());
  }

  #[test]
  fn future_stays_pending_until_settled() {
    let (promise, future) = WritePromise::pair();
    let mut task = tokio_test::task::spawn(future);
    tokio_test::assert_pending!(task.poll());
    promise.fail(SecureError::Closed);
    assert!(task.is_woken());
    let result = tokio_test::assert_ready!(task.poll());
    assert!(matches!(result, Err(SecureError::Closed)));
  }
}
