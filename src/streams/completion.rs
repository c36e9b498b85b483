//! Settle-once cells shared between the stream task and any number of observers.
//!
//! The task holds the settling side; handles hand out [`SignalFuture`]s that
//! resolve with the cell's outcome. Re-arming an observable means swapping in
//! a fresh cell, so observers of the old one keep the old outcome.

use super::{StreamError, StreamResult};
use crate::platform::SharedPtr;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Wakers parked on one cell, deduplicated with `will_wake`.
#[derive(Default)]
struct WakerSet(Vec<Waker>);

impl WakerSet {
    fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    fn take(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.0)
    }
}

struct DeferredState {
    outcome: Option<StreamResult<()>>,
    wakers: WakerSet,
    handled: bool,
}

pub(crate) struct Deferred {
    state: Mutex<DeferredState>,
}

impl Deferred {
    fn with_outcome(outcome: Option<StreamResult<()>>) -> SharedPtr<Self> {
        SharedPtr::new(Self {
            state: Mutex::new(DeferredState {
                outcome,
                wakers: WakerSet::default(),
                handled: false,
            }),
        })
    }

    pub(crate) fn pending() -> SharedPtr<Self> {
        Self::with_outcome(None)
    }

    pub(crate) fn rejected(error: StreamError) -> SharedPtr<Self> {
        Self::with_outcome(Some(Err(error)))
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.lock().outcome.is_none()
    }

    /// Returns false if the cell had already settled.
    pub(crate) fn resolve(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Returns false if the cell had already settled.
    pub(crate) fn reject(&self, error: StreamError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: StreamResult<()>) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.wakers.take()
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Suppress the unobserved-rejection diagnostic for this cell.
    pub(crate) fn mark_handled(&self) {
        self.state.lock().handled = true;
    }

    pub(crate) fn wait(self: &SharedPtr<Self>) -> SignalFuture {
        SignalFuture {
            deferred: SharedPtr::clone(self),
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(Err(error)) = &state.outcome {
            if !state.handled {
                tracing::debug!(%error, "stream rejection was never observed");
            }
        }
    }
}

/// Future resolving with the outcome of a stream or writer observable
/// (`ready`, `closed`).
///
/// Cheap to create; every observer gets the same outcome.
#[must_use = "futures do nothing unless polled"]
pub struct SignalFuture {
    deferred: SharedPtr<Deferred>,
}

impl Future for SignalFuture {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.deferred.state.lock();
        match &state.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                state.handled = true;
                Poll::Ready(outcome)
            }
            None => {
                state.wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// Completion of a `write`, `close` or `abort` request.
///
/// The request is already on its way to the stream when this is returned;
/// dropping the future only discards the outcome.
#[must_use = "the outcome of the request is lost if this is dropped"]
pub struct OperationFuture {
    state: OperationState,
}

enum OperationState {
    Waiting(oneshot::Receiver<StreamResult<()>>),
    Failed(Option<StreamError>),
}

impl OperationFuture {
    pub(crate) fn waiting(receiver: oneshot::Receiver<StreamResult<()>>) -> Self {
        Self {
            state: OperationState::Waiting(receiver),
        }
    }

    pub(crate) fn failed(error: StreamError) -> Self {
        Self {
            state: OperationState::Failed(Some(error)),
        }
    }
}

impl Future for OperationFuture {
    type Output = StreamResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            OperationState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(StreamError::TaskDropped)),
                Poll::Pending => Poll::Pending,
            },
            OperationState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(StreamError::TaskDropped)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn settles_exactly_once() {
        let deferred = Deferred::pending();
        assert!(deferred.is_pending());
        assert!(deferred.resolve());
        assert!(!deferred.reject(StreamError::Closed));
        assert!(!deferred.is_pending());
        assert!(matches!(deferred.wait().now_or_never(), Some(Ok(()))));
    }

    #[test]
    fn every_observer_sees_the_same_rejection() {
        let deferred = Deferred::pending();
        let first = deferred.wait();
        let second = deferred.wait();
        let boom: StreamError = "boom".into();
        deferred.reject(boom.clone());

        let first = first.now_or_never().unwrap().unwrap_err();
        let second = second.now_or_never().unwrap().unwrap_err();
        assert!(first.same_as(&boom));
        assert!(second.same_as(&boom));
    }

    #[test]
    fn pending_future_wakes_on_settle() {
        use futures::task::{ArcWake, waker};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingWaker(AtomicUsize);
        impl ArcWake for CountingWaker {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = waker(counter.clone());
        let mut cx = Context::from_waker(&waker);

        let deferred = Deferred::pending();
        let mut fut = deferred.wait();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        // same task polling twice registers once
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());

        deferred.resolve();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(()))));
    }

    #[test]
    fn pre_settled_cells_are_ready_immediately() {
        let resolved = Deferred::pending();
        resolved.resolve();
        assert!(!resolved.is_pending());
        assert!(matches!(resolved.wait().now_or_never(), Some(Ok(()))));
        let rejected = Deferred::rejected(StreamError::Released);
        rejected.mark_handled();
        assert!(matches!(
            rejected.wait().now_or_never(),
            Some(Err(StreamError::Released))
        ));
    }

    #[test]
    fn operation_future_reports_outcome_or_dropped_task() {
        let (tx, rx) = oneshot::channel();
        let op = OperationFuture::waiting(rx);
        tx.send(Err(StreamError::Closing)).unwrap();
        assert!(matches!(op.now_or_never(), Some(Err(StreamError::Closing))));

        let (tx, rx) = oneshot::channel::<StreamResult<()>>();
        drop(tx);
        let op = OperationFuture::waiting(rx);
        assert!(matches!(op.now_or_never(), Some(Err(StreamError::TaskDropped))));

        let op = OperationFuture::failed(StreamError::Locked);
        assert!(matches!(op.now_or_never(), Some(Err(StreamError::Locked))));
    }
}
