//! # Single-Result Primitive
//!
//! `Mono<T>` is a deferred computation that settles exactly once, to a value or
//! to an `Error`.
//!
//! ## Invariants
//! - **Settle Once**: `MonoSink::resolve` and `MonoSink::fail` succeed at most once
//!   in total. Later calls report `ProtocolViolation` to the producer; the consumer
//!   never sees them.
//! - **Eager Delivery**: a Mono that is already settled completes on its first poll.
//!   The dispatcher relies on this to answer stub handlers while still processing
//!   the Open frame.
//! - **Cancellation**: cancelling (or dropping) an unsettled Mono moves it to
//!   `Cancelled`. Producers observe it through `is_cancelled` / `cancelled`, and a
//!   later `resolve` fails with `Cancelled`.
//! - **Abandonment**: if every sink is dropped without settling, the consumer
//!   resolves to `Cancelled` instead of hanging.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::poll_fn;
use tokio::sync::oneshot;

use rxrpc::Error;
use rxrpc::Result;

/// Take-once slot for the sender. Empty once the outcome was sent.
type Slot<T> = Mutex<Option<oneshot::Sender<Result<T>>>>;

fn lock<T>(slot: &Slot<T>) -> MutexGuard<'_, Option<oneshot::Sender<Result<T>>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn polled_after_completion() -> Error {
    Error::protocol_violation("single result polled after completion")
}

/// Producer half of a deferred `Mono`. Clones share one slot.
pub struct MonoSink<T> {
    slot: Arc<Slot<T>>,
}

impl<T> MonoSink<T> {
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(Ok(value))
    }

    pub fn fail(&self, error: Error) -> Result<()> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T>) -> Result<()> {
        let mut slot = lock(&self.slot);
        match slot.take() {
            None => Err(Error::protocol_violation("single result already resolved")),
            Some(tx) if tx.is_closed() => {
                *slot = Some(tx);
                Err(Error::cancelled())
            }
            Some(tx) => tx.send(outcome).map_err(|_| Error::cancelled()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.slot).as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Completes once the consumer has cancelled. Never completes otherwise.
    pub async fn cancelled(&self) {
        poll_fn(|cx| match lock(&self.slot).as_mut() {
            Some(tx) => tx.poll_closed(cx),
            None => Poll::Pending,
        })
        .await
    }
}

impl<T> Clone for MonoSink<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

enum Inner<T> {
    Ready(Result<T>),
    Deferred(oneshot::Receiver<Result<T>>),
    Future(BoxFuture<'static, Result<T>>),
    Cancelled,
    Done,
}

/// A single value (or error) that becomes available at most once.
///
/// Awaiting a `Mono` subscribes to it; it is single use.
pub struct Mono<T> {
    inner: Inner<T>,
}

// Inner state is never pinned in place; `T` only ever moves by value.
impl<T> Unpin for Mono<T> {}

impl<T> Mono<T> {
    /// Creates an unsettled Mono and the sink that settles it.
    pub fn pending() -> (MonoSink<T>, Mono<T>) {
        let (tx, rx) = oneshot::channel();
        let sink = MonoSink { slot: Arc::new(Mutex::new(Some(tx))) };
        (sink, Self { inner: Inner::Deferred(rx) })
    }

    pub fn just(value: T) -> Self {
        Self { inner: Inner::Ready(Ok(value)) }
    }

    pub fn error(error: Error) -> Self {
        Self { inner: Inner::Ready(Err(error)) }
    }

    pub fn from_result(outcome: Result<T>) -> Self {
        Self { inner: Inner::Ready(outcome) }
    }

    /// The default outcome of a handler stub that was never filled in.
    pub fn unimplemented() -> Self {
        Self::error(Error::unimplemented())
    }

    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self { inner: Inner::Future(future.boxed()) }
    }

    /// Abandons the result. Idempotent; a no-op once the outcome was delivered.
    /// Dropping the receiver is what the sink observes as cancellation.
    pub fn cancel(&mut self) {
        if !matches!(self.inner, Inner::Done) {
            self.inner = Inner::Cancelled;
        }
    }
}

impl<T: Send + 'static> Mono<T> {
    pub fn map<U, F>(self, f: F) -> Mono<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
        U: Send + 'static,
    {
        Mono::from_future(async move { self.await.map(f) })
    }

    pub fn and_then<U, F>(self, f: F) -> Mono<U>
    where
        F: FnOnce(T) -> Mono<U> + Send + 'static,
        U: Send + 'static,
    {
        Mono::from_future(async move {
            let value = self.await?;
            f(value).await
        })
    }
}

impl<T> Future for Mono<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match std::mem::replace(&mut this.inner, Inner::Done) {
            Inner::Ready(outcome) => Poll::Ready(outcome),
            Inner::Deferred(mut rx) => match rx.poll_unpin(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                // Every sink was dropped without settling.
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::cancelled())),
                Poll::Pending => {
                    this.inner = Inner::Deferred(rx);
                    Poll::Pending
                }
            },
            Inner::Future(mut future) => match future.poll_unpin(cx) {
                Poll::Ready(outcome) => Poll::Ready(outcome),
                Poll::Pending => {
                    this.inner = Inner::Future(future);
                    Poll::Pending
                }
            },
            Inner::Cancelled => {
                this.inner = Inner::Cancelled;
                Poll::Ready(Err(Error::cancelled()))
            }
            Inner::Done => Poll::Ready(Err(polled_after_completion())),
        }
    }
}

impl<T> Drop for Mono<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> std::fmt::Debug for Mono<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner {
            Inner::Ready(_) => "ready",
            Inner::Deferred(_) => "deferred",
            Inner::Future(_) => "future",
            Inner::Cancelled => "cancelled",
            Inner::Done => "done",
        };
        write!(f, "Mono({})", state)
    }
}
