//! Awaitable handles for spawned store operations

use crate::error::{StoreError, StoreResult};
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Awaitable handle for a single store operation
///
/// Backends resolve the operation on their own task and deliver the result
/// through a oneshot channel, which keeps [`crate::SecretStore`] object safe.
#[pin_project]
#[derive(Debug)]
pub struct StoreRequest<T> {
    #[pin]
    receiver: oneshot::Receiver<StoreResult<T>>,
}

impl<T> StoreRequest<T> {
    /// Wrap the receiving half of a result channel
    pub fn new(receiver: oneshot::Receiver<StoreResult<T>>) -> Self {
        Self { receiver }
    }

    /// A request that is already resolved
    pub fn ready(result: StoreResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx)
    }

    /// Run `future` on the current runtime and resolve with its output
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = StoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
        Self::new(rx)
    }
}

impl<T> Future for StoreRequest<T> {
    type Output = StoreResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().receiver.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::internal(
                "Store operation channel closed unexpectedly",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
