//! One-shot completion tokens.
//!
//! Every asynchronous operation hands its caller a [`CompletionToken`] and
//! keeps the matching [`Completion`]. Dropping a `Completion` without
//! resolving it resolves the token with [`TransportError::Cancelled`], so a
//! torn-down connection can never leave a caller waiting forever.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::core::{TransportError, TransportResult};

/// Create a linked completion pair.
pub fn completion<T>() -> (Completion<T>, CompletionToken<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion { tx: Some(tx) },
        CompletionToken { rx: Some(rx) },
    )
}

/// Producer half, owned by whoever finishes the operation.
#[derive(Debug)]
pub struct Completion<T> {
    tx: Option<oneshot::Sender<TransportResult<T>>>,
}

impl<T> Completion<T> {
    /// Resolve the token. A caller that dropped its token is ignored.
    pub fn complete(mut self, result: TransportResult<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Whether the caller has dropped its token.
    pub fn is_abandoned(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(TransportError::Cancelled));
        }
    }
}

/// Caller half. Await it, or poll it with [`try_result`](Self::try_result).
#[derive(Debug)]
#[must_use = "a completion token reports whether the operation succeeded"]
pub struct CompletionToken<T> {
    rx: Option<oneshot::Receiver<TransportResult<T>>>,
}

impl<T> CompletionToken<T> {
    /// A token that is already resolved.
    pub fn ready(result: TransportResult<T>) -> Self {
        let (completion, token) = completion();
        completion.complete(result);
        token
    }

    /// Take the result if it is available, without waiting.
    ///
    /// Returns `None` while pending, and after the result was taken.
    pub fn try_result(&mut self) -> Option<TransportResult<T>> {
        let rx = self.rx.as_mut()?;
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(TransportError::Cancelled),
        };
        self.rx = None;
        Some(result)
    }

    /// Whether the result has already been taken.
    pub fn is_taken(&self) -> bool {
        self.rx.is_none()
    }
}

impl<T> Future for CompletionToken<T> {
    type Output = TransportResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(TransportError::Cancelled));
        };

        let result = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(TransportError::Cancelled),
        };
        self.rx = None;
        Poll::Ready(result)
    }
}
