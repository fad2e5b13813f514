//! Deferred values: the awaitables routines suspend on.
//!
//! A [`Deferred`] is the read half of a one-shot settlement; the matching
//! [`Resolver`] settles it with a value or an error. Awaiting a rejected
//! deferred hands the error back to the routine as `Err`, which is how
//! failures are injected into a suspended routine.
//!
//! # Turn semantics
//!
//! Settlement is never observed in the same synchronous pass that first
//! awaits it. A deferred that is already settled when it is first polled
//! wakes its task and returns `Pending`; the routine resumes on the next
//! [`Scheduler::drain`](crate::Scheduler::drain). This keeps
//! `Deferred::resolved(())` equivalent to "yield once, then continue".
//!
//! ```ignore
//! let (resolver, pending) = deferred::<u32>();
//! scheduler.run(move |_cx| async move {
//!     let n = pending.await?;          // suspends here
//!     println!("got {}", n);
//!     Ok(())
//! })?;
//!
//! resolver.resolve(7);                  // enqueues the resumption
//! scheduler.drain()?;                   // prints "got 7"
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::SagaError;

type Settlement<T> = anyhow::Result<T>;

/// Create a linked resolver / deferred pair.
pub fn deferred<T>() -> (Resolver<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx }, Deferred::from_receiver(rx))
}

/// The write half: settles its [`Deferred`] exactly once.
///
/// Dropping a resolver without settling makes the deferred fail with
/// [`SagaError::DeferredAbandoned`].
#[derive(Debug)]
pub struct Resolver<T> {
    tx: oneshot::Sender<Settlement<T>>,
}

impl<T> Resolver<T> {
    /// Settle with a value. Returns false if the deferred was already dropped.
    pub fn resolve(self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Settle with an error. Returns false if the deferred was already dropped.
    pub fn reject(self, error: impl Into<anyhow::Error>) -> bool {
        self.tx.send(Err(error.into())).is_ok()
    }

    /// Check if nobody is waiting on the other half anymore.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The read half: a future that settles once its [`Resolver`] does.
#[derive(Debug)]
pub struct Deferred<T> {
    rx: Option<oneshot::Receiver<Settlement<T>>>,
    settled: Option<Settlement<T>>,
    polled: bool,
}

impl<T> Deferred<T> {
    fn from_receiver(rx: oneshot::Receiver<Settlement<T>>) -> Self {
        Self {
            rx: Some(rx),
            settled: None,
            polled: false,
        }
    }

    /// A deferred that is already resolved.
    pub fn resolved(value: T) -> Self {
        let (resolver, deferred) = deferred();
        resolver.resolve(value);
        deferred
    }

    /// A deferred that is already rejected.
    pub fn rejected(error: impl Into<anyhow::Error>) -> Self {
        let (resolver, deferred) = deferred();
        resolver.reject(error);
        deferred
    }
}

// The settled value is never pinned; only the receiver is polled.
impl<T> Unpin for Deferred<T> {}

impl<T> Future for Deferred<T> {
    type Output = Settlement<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(settlement) = this.settled.take() {
            return Poll::Ready(settlement);
        }

        let first_poll = !this.polled;
        this.polled = true;

        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(SagaError::DeferredAbandoned.into()));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(received) => {
                this.rx = None;
                let settlement =
                    received.unwrap_or_else(|_| Err(SagaError::DeferredAbandoned.into()));
                if first_poll {
                    this.settled = Some(settlement);
                    cx.waker().wake_by_ref();
                    Poll::Pending
                } else {
                    Poll::Ready(settlement)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
