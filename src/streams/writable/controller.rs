use super::super::completion::{Deferred, SignalFuture};
use super::super::queue::SizedQueue;
use super::super::{StreamError, StreamResult};
use crate::platform::{BoxedStrategy, SharedPtr};
use futures::FutureExt;
use futures::channel::mpsc::UnboundedSender;
use parking_lot::Mutex;
use std::future::Future;

pub(crate) enum ControllerMsg {
    /// Trigger a stream error (controller.error(...))
    Error(StreamError),
}

struct AbortState {
    signal: SharedPtr<Deferred>,
    reason: Mutex<Option<String>>,
}

/// Handle given to the sink so it can error the stream and observe aborts.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    abort: SharedPtr<AbortState>,
}

impl WritableStreamDefaultController {
    pub(crate) fn new(sender: UnboundedSender<ControllerMsg>) -> Self {
        Self {
            tx: sender,
            abort: SharedPtr::new(AbortState {
                signal: Deferred::pending(),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Signal an error on the stream.
    ///
    /// Ignored unless the stream is still writable when the message is
    /// processed.
    pub fn error(&self, error: StreamError) {
        // ignore send failure if the stream task is gone
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    /// Returns `true` once `abort` has been requested on the stream.
    pub fn is_aborted(&self) -> bool {
        !self.abort.signal.is_pending()
    }

    /// The reason the stream was aborted with, if any.
    pub fn abort_reason(&self) -> Option<String> {
        self.abort.reason.lock().clone()
    }

    /// Resolves once `abort` has been requested on the stream.
    ///
    /// Sinks that hold on to a controller clone can await this to tear down
    /// background work; for racing a single operation see [`with_abort`].
    ///
    /// [`with_abort`]: Self::with_abort
    pub fn signal(&self) -> SignalFuture {
        self.abort.signal.wait()
    }

    /// Fires the signal with `reason`. Only the first request counts.
    pub(crate) fn request_abort(&self, reason: Option<String>) {
        let mut stored = self.abort.reason.lock();
        if self.abort.signal.is_pending() {
            *stored = reason;
            self.abort.signal.resolve();
        }
    }

    /// Races a future against the abort signal.
    ///
    /// If the abort fires first, returns `Err(StreamError::Aborted(reason))`.
    /// Otherwise, returns the output of the future wrapped in `Ok`.
    pub fn with_abort<F>(&self, fut: F) -> impl Future<Output = StreamResult<F::Output>> + use<F>
    where
        F: Future,
    {
        let abort = SharedPtr::clone(&self.abort);
        let signal = Box::pin(self.signal());
        let fut = Box::pin(fut);

        futures::future::select(fut, signal).map(move |either| match either {
            futures::future::Either::Left((value, _)) => Ok(value),
            futures::future::Either::Right(_) => {
                Err(StreamError::Aborted(abort.reason.lock().clone()))
            }
        })
    }
}

/// A queue slot: either a chunk waiting for (or handed to) the sink, or the
/// marker for a pending close.
pub(crate) enum QueuedValue<T> {
    /// `None` once the chunk has been moved into an in-flight sink write.
    Chunk(Option<T>),
    Close,
}

/// Stream-owned controller state: the queue, the sizing strategy, the sink
/// and whether it has started.
pub(crate) struct ControllerState<T, Sink> {
    pub(crate) queue: SizedQueue<QueuedValue<T>>,
    high_water_mark: f64,
    strategy: Option<BoxedStrategy<T>>,
    pub(crate) started: bool,
    sink: Option<Sink>,
    algorithms_cleared: bool,
    pub(crate) handle: WritableStreamDefaultController,
}

impl<T, Sink> ControllerState<T, Sink> {
    /// The sink is handed over once its start operation settles.
    pub(crate) fn new(
        strategy: BoxedStrategy<T>,
        high_water_mark: f64,
        handle: WritableStreamDefaultController,
    ) -> Self {
        Self {
            queue: SizedQueue::new(),
            high_water_mark,
            strategy: Some(strategy),
            started: false,
            sink: None,
            algorithms_cleared: false,
            handle,
        }
    }

    pub(crate) fn desired_size(&self) -> f64 {
        self.high_water_mark - self.queue.total_size()
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.desired_size() <= 0.0
    }

    pub(crate) fn chunk_size(&self, chunk: &T) -> StreamResult<f64> {
        match &self.strategy {
            Some(strategy) => strategy.size(chunk).map_err(StreamError::into_sizing),
            None => Err(StreamError::sizing("size strategy has been released")),
        }
    }

    pub(crate) fn enqueue_close(&mut self) {
        let queued = self.queue.enqueue(QueuedValue::Close, 0.0);
        debug_assert!(queued.is_ok());
    }

    /// Takes the chunk at the front of the queue, leaving its size accounted
    /// for until the sink write settles.
    pub(crate) fn take_front_chunk(&mut self) -> Option<T> {
        match self.queue.peek_mut() {
            Some(QueuedValue::Chunk(chunk)) => chunk.take(),
            _ => None,
        }
    }

    pub(crate) fn front_is_close(&self) -> bool {
        matches!(self.queue.peek(), Some(QueuedValue::Close))
    }

    pub(crate) fn take_sink(&mut self) -> Option<Sink> {
        self.sink.take()
    }

    /// Puts the sink back after an operation, unless the algorithms were
    /// cleared while it was out, in which case it is dropped.
    pub(crate) fn restore_sink(&mut self, sink: Sink) {
        if !self.algorithms_cleared {
            self.sink = Some(sink);
        }
    }

    /// Drops the sink and strategy; nothing may call into them afterwards.
    pub(crate) fn clear_algorithms(&mut self) {
        self.sink = None;
        self.strategy = None;
        self.algorithms_cleared = true;
    }

    pub(crate) fn reset_queue(&mut self) {
        self.queue.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::super::super::CountQueuingStrategy;
    use super::*;
    use futures::channel::mpsc::unbounded;
    use futures::future::{pending, ready};

    fn controller() -> WritableStreamDefaultController {
        let (tx, _rx) = unbounded();
        WritableStreamDefaultController::new(tx)
    }

    #[test]
    fn abort_signal_fires_once_and_keeps_first_reason() {
        let controller = controller();
        assert!(!controller.is_aborted());
        assert!(controller.signal().now_or_never().is_none());

        controller.request_abort(Some("first".into()));
        controller.request_abort(Some("second".into()));
        assert!(controller.is_aborted());
        assert_eq!(controller.abort_reason().as_deref(), Some("first"));
        assert!(matches!(controller.signal().now_or_never(), Some(Ok(()))));
    }

    #[test]
    fn with_abort_prefers_completed_work() {
        let controller = controller();
        let result = controller.with_abort(ready(7)).now_or_never().unwrap();
        assert_eq!(result.unwrap(), 7);

        controller.request_abort(Some("stop".into()));
        let result = controller
            .with_abort(pending::<()>())
            .now_or_never()
            .unwrap();
        assert!(matches!(result, Err(StreamError::Aborted(Some(r))) if r == "stop"));
    }

    #[test]
    fn state_tracks_desired_size_and_clears_algorithms() {
        let strategy: BoxedStrategy<u8> = Box::new(CountQueuingStrategy::new(2.0));
        let mut state: ControllerState<u8, ()> = ControllerState::new(strategy, 2.0, controller());
        assert_eq!(state.desired_size(), 2.0);
        assert!(!state.backpressure());

        let size = state.chunk_size(&1).unwrap();
        state.queue.enqueue(QueuedValue::Chunk(Some(1)), size).unwrap();
        state.queue.enqueue(QueuedValue::Chunk(Some(2)), size).unwrap();
        assert_eq!(state.desired_size(), 0.0);
        assert!(state.backpressure());

        assert_eq!(state.take_front_chunk(), Some(1));
        assert_eq!(state.take_front_chunk(), None);
        assert_eq!(state.desired_size(), 0.0);

        state.restore_sink(());
        state.clear_algorithms();
        assert!(state.take_sink().is_none());
        state.restore_sink(());
        assert!(state.take_sink().is_none());
        assert!(matches!(state.chunk_size(&3), Err(StreamError::Sizing(_))));
    }
}
