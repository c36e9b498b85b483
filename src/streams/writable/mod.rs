mod controller;
mod state;
mod writer;

pub use controller::WritableStreamDefaultController;
pub use writer::{WritableStreamDefaultWriter, WriterSink};

use super::completion::{Deferred, OperationFuture, SignalFuture};
use super::{CountQueuingStrategy, QueuingStrategy, StreamError, StreamResult};
use crate::platform::{MaybeSend, SharedPtr};
use controller::ControllerMsg;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use futures::channel::oneshot;
use futures::future;
use state::WritableStreamInner;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use writer::WriterSlots;

/// Lifecycle of a writable stream.
///
/// `Writable → Erroring → Errored` is the only failure path and
/// `Writable → Closed` the only success path; `Closed` and `Errored` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableStreamState {
    Writable,
    Erroring,
    Closed,
    Errored,
}

impl WritableStreamState {
    fn to_u8(self) -> u8 {
        match self {
            WritableStreamState::Writable => 0,
            WritableStreamState::Erroring => 1,
            WritableStreamState::Closed => 2,
            WritableStreamState::Errored => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => WritableStreamState::Writable,
            1 => WritableStreamState::Erroring,
            2 => WritableStreamState::Closed,
            _ => WritableStreamState::Errored,
        }
    }
}

/// Snapshot of task-owned state, published for synchronous readers before
/// any completion is delivered.
pub(crate) struct StreamFlags {
    state: AtomicU8,
    backpressure: AtomicBool,
    queue_total_size: AtomicU64,
    high_water_mark: f64,
    locked: AtomicBool,
    next_writer_id: AtomicU64,
}

impl StreamFlags {
    fn new(high_water_mark: f64) -> Self {
        Self {
            state: AtomicU8::new(WritableStreamState::Writable.to_u8()),
            backpressure: AtomicBool::new(false),
            queue_total_size: AtomicU64::new(0f64.to_bits()),
            high_water_mark,
            locked: AtomicBool::new(false),
            next_writer_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn publish(
        &self,
        state: WritableStreamState,
        backpressure: bool,
        queue_total_size: f64,
    ) {
        self.queue_total_size
            .store(queue_total_size.to_bits(), Ordering::SeqCst);
        self.backpressure.store(backpressure, Ordering::SeqCst);
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn state(&self) -> WritableStreamState {
        WritableStreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn desired_size(&self) -> Option<f64> {
        match self.state() {
            WritableStreamState::Erroring | WritableStreamState::Errored => None,
            WritableStreamState::Closed => Some(0.0),
            WritableStreamState::Writable => {
                let queued = f64::from_bits(self.queue_total_size.load(Ordering::SeqCst));
                Some(self.high_water_mark - queued)
            }
        }
    }
}

/// Settling side of a write, close or abort request.
pub(crate) type Responder = oneshot::Sender<StreamResult<()>>;

/// Commands sent to the stream task, processed strictly in order.
pub(crate) enum StreamCommand<T> {
    Attach {
        id: u64,
        slots: SharedPtr<WriterSlots>,
    },
    Detach {
        id: u64,
    },
    Write {
        chunk: T,
        completion: Responder,
    },
    Close {
        completion: Responder,
    },
    Abort {
        reason: Option<String>,
        completion: Responder,
    },
}

/// What the public handles share: the command channel into the task and the
/// published snapshot.
pub(crate) struct StreamHandle<T> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    flags: SharedPtr<StreamFlags>,
    closed: SharedPtr<Deferred>,
}

impl<T> Clone for StreamHandle<T> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            flags: SharedPtr::clone(&self.flags),
            closed: SharedPtr::clone(&self.closed),
        }
    }
}

impl<T> StreamHandle<T> {
    pub(crate) fn send(&self, command: StreamCommand<T>) -> StreamResult<()> {
        self.command_tx
            .unbounded_send(command)
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Issue a request now and hand back its completion.
    pub(crate) fn request(
        &self,
        make: impl FnOnce(Responder) -> StreamCommand<T>,
    ) -> OperationFuture {
        let (tx, rx) = oneshot::channel();
        match self.send(make(tx)) {
            Ok(()) => OperationFuture::waiting(rx),
            Err(error) => OperationFuture::failed(error),
        }
    }

    pub(crate) fn flags(&self) -> &StreamFlags {
        &self.flags
    }
}

/// Caller-supplied destination for the chunks written to a stream.
///
/// Only `write` is required. The stream never runs two of these operations
/// at the same time.
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink. Writes queue up until this settles.
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink once every queued chunk has been written
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

/// A backpressure-aware destination for chunks of `T`, backed by a `Sink`.
///
/// Created through [`WritableStream::builder`]. The stream itself only
/// accepts `close` and `abort`; chunks are written through the single
/// [`WritableStreamDefaultWriter`] obtained with [`get_writer`].
///
/// [`get_writer`]: Self::get_writer
pub struct WritableStream<T: MaybeSend + 'static, Sink> {
    handle: StreamHandle<T>,
    _sink: PhantomData<Sink>,
}

impl<T, Sink> WritableStream<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    /// Returns a builder for this writable stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    fn new_inner(
        sink: Sink,
        strategy: crate::platform::BoxedStrategy<T>,
    ) -> StreamResult<(Self, impl Future<Output = ()>)> {
        let high_water_mark = super::validate_high_water_mark(strategy.high_water_mark())?;
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded::<ControllerMsg>();

        let flags = SharedPtr::new(StreamFlags::new(high_water_mark));
        let closed = Deferred::pending();
        let controller = WritableStreamDefaultController::new(ctrl_tx);

        let inner = WritableStreamInner::new(
            sink,
            strategy,
            high_water_mark,
            controller,
            SharedPtr::clone(&flags),
            SharedPtr::clone(&closed),
        );
        let fut = state::stream_task(command_rx, ctrl_rx, inner);

        let stream = Self {
            handle: StreamHandle {
                command_tx,
                flags,
                closed,
            },
            _sink: PhantomData,
        };

        Ok((stream, fut))
    }

    /// Lock the stream to a new writer.
    ///
    /// Fails with [`StreamError::Locked`] while another writer is attached.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T, Sink>> {
        WritableStreamDefaultWriter::attach(self.handle.clone())
    }

    /// Abort the stream, discarding queued chunks once the in-flight sink
    /// operation settles. Resolves immediately on a closed or errored stream.
    pub fn abort(&self, reason: Option<String>) -> OperationFuture {
        if self.locked() {
            return OperationFuture::failed(StreamError::Locked);
        }
        self.handle.request(|completion| StreamCommand::Abort { reason, completion })
    }

    /// Close the stream after every queued chunk has been written.
    pub fn close(&self) -> OperationFuture {
        if self.locked() {
            return OperationFuture::failed(StreamError::Locked);
        }
        self.handle.request(|completion| StreamCommand::Close { completion })
    }

    /// Aborts the stream once `signal` resolves, with the reason it yields.
    ///
    /// The abort is issued exactly once and goes through even while a writer
    /// holds the lock.
    pub fn abort_on<S>(&self, signal: S) -> impl Future<Output = StreamResult<()>> + use<T, Sink, S>
    where
        S: Future<Output = Option<String>>,
    {
        let handle = self.handle.clone();
        async move {
            let reason = signal.await;
            tracing::debug!(?reason, "abort signal fired");
            handle
                .request(|completion| StreamCommand::Abort { reason, completion })
                .await
        }
    }

    /// Resolves when the stream closes, fails with the stored error when it
    /// errors.
    pub fn closed(&self) -> SignalFuture {
        self.handle.closed.wait()
    }

    /// Hand the stream over to another execution context.
    ///
    /// Gives the stream back unchanged while a writer is attached.
    pub fn transfer(self) -> Result<TransferredWritableStream<T, Sink>, Self> {
        if self.locked() {
            return Err(self);
        }
        Ok(TransferredWritableStream { stream: self })
    }
}

impl<T: MaybeSend + 'static, Sink> WritableStream<T, Sink> {
    pub fn locked(&self) -> bool {
        self.handle.flags.locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WritableStreamState {
        self.handle.flags.state()
    }

    /// `high_water_mark - queue_total_size`; `None` while erroring or errored
    /// and `Some(0.0)` once closed.
    pub fn desired_size(&self) -> Option<f64> {
        self.handle.flags.desired_size()
    }
}

/// A stream in transit between execution contexts. Only unlocked streams can
/// be transferred.
pub struct TransferredWritableStream<T: MaybeSend + 'static, Sink> {
    stream: WritableStream<T, Sink>,
}

impl<T: MaybeSend + 'static, Sink> TransferredWritableStream<T, Sink> {
    pub fn into_stream(self) -> WritableStream<T, Sink> {
        self.stream
    }
}

pub struct WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    sink: Sink,
    strategy: crate::platform::BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + driver future without spawning.
    ///
    /// Nothing happens, not even the sink's `start`, until the future is
    /// polled.
    pub fn prepare(self) -> StreamResult<(WritableStream<T, Sink>, impl Future<Output = ()>)> {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    /// Spawn the driver with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T, Sink>>
    where
        F: FnOnce(crate::platform::PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn local<F: Future<Output = ()>>(f: F) {
        tokio::task::LocalSet::new().run_until(f).await;
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[derive(Clone, Default)]
    struct CountingSink {
        write_count: SharedPtr<Mutex<usize>>,
        closed: SharedPtr<Mutex<bool>>,
        aborted: SharedPtr<Mutex<Option<Option<String>>>>,
    }

    impl CountingSink {
        fn count(&self) -> usize {
            *self.write_count.lock().unwrap()
        }
    }

    impl WritableSink<Vec<u8>> for CountingSink {
        fn write(
            &mut self,
            _chunk: Vec<u8>,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> {
            let count = SharedPtr::clone(&self.write_count);
            async move {
                *count.lock().unwrap() += 1;
                Ok(())
            }
        }

        fn close(self) -> impl Future<Output = StreamResult<()>> {
            async move {
                *self.closed.lock().unwrap() = true;
                Ok(())
            }
        }

        fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
            let aborted = SharedPtr::clone(&self.aborted);
            async move {
                *aborted.lock().unwrap() = Some(reason);
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn writes_chunks_to_underlying_sink() {
        local(async {
            let sink = CountingSink::default();
            let stream = WritableStream::builder(sink.clone())
                .strategy(CountQueuingStrategy::new(2.0))
                .spawn(tokio::task::spawn_local)
                .expect("valid strategy");
            let writer = stream.get_writer().expect("failed to get writer");

            writer.write(vec![1, 2, 3]).await.expect("first write failed");
            writer.write(vec![4, 5]).await.expect("second write failed");
            writer.close().await.expect("close failed");

            assert_eq!(sink.count(), 2);
            assert!(*sink.closed.lock().unwrap());
            assert_eq!(stream.state(), WritableStreamState::Closed);
            assert_eq!(stream.desired_size(), Some(0.0));
            stream.closed().await.expect("stream closed signal");
        })
        .await;
    }

    #[tokio::test]
    async fn rejects_invalid_high_water_mark() {
        let result = WritableStream::builder(CountingSink::default())
            .strategy(CountQueuingStrategy::new(-1.0))
            .prepare();
        assert!(matches!(result, Err(StreamError::InvalidHighWaterMark(_))));
    }

    #[tokio::test]
    async fn stream_close_and_abort_fail_fast_while_locked() {
        local(async {
            let stream = WritableStream::builder(CountingSink::default())
                .spawn(tokio::task::spawn_local)
                .unwrap();
            let writer = stream.get_writer().unwrap();
            assert!(stream.locked());

            assert!(matches!(stream.close().await, Err(StreamError::Locked)));
            assert!(matches!(stream.abort(None).await, Err(StreamError::Locked)));
            assert!(matches!(stream.get_writer(), Err(StreamError::Locked)));

            writer.release_lock();
            assert!(!stream.locked());
            stream.close().await.expect("close after release");
        })
        .await;
    }

    #[tokio::test]
    async fn abort_is_a_no_op_on_closed_streams() {
        local(async {
            let sink = CountingSink::default();
            let stream = WritableStream::builder(sink.clone())
                .spawn(tokio::task::spawn_local)
                .unwrap();
            stream.close().await.unwrap();

            stream.abort(Some("late".into())).await.unwrap();
            stream.abort(Some("later".into())).await.unwrap();
            assert!(sink.aborted.lock().unwrap().is_none());
            assert_eq!(stream.state(), WritableStreamState::Closed);

            let err = stream.close().await.unwrap_err();
            assert!(matches!(err, StreamError::Closed));
        })
        .await;
    }

    #[tokio::test]
    async fn abort_on_signal_aborts_exactly_once() {
        local(async {
            let sink = CountingSink::default();
            let stream = WritableStream::builder(sink.clone())
                .spawn(tokio::task::spawn_local)
                .unwrap();
            let writer = stream.get_writer().unwrap();

            let (trigger, signal) = oneshot::channel::<Option<String>>();
            let aborting = tokio::task::spawn_local(
                stream.abort_on(async move { signal.await.unwrap_or(None) }),
            );
            settle().await;
            assert_eq!(stream.state(), WritableStreamState::Writable);

            trigger.send(Some("cancelled".into())).unwrap();
            aborting.await.unwrap().expect("abort through signal");

            assert_eq!(
                *sink.aborted.lock().unwrap(),
                Some(Some("cancelled".to_string()))
            );
            assert_eq!(stream.state(), WritableStreamState::Errored);
            let err = writer.closed().await.unwrap_err();
            assert!(matches!(err, StreamError::Aborted(Some(r)) if r == "cancelled"));
        })
        .await;
    }

    #[tokio::test]
    async fn transfer_requires_an_unlocked_stream() {
        local(async {
            let stream = WritableStream::builder(CountingSink::default())
                .spawn(tokio::task::spawn_local)
                .unwrap();
            let writer = stream.get_writer().unwrap();

            let stream = match stream.transfer() {
                Ok(_) => panic!("locked stream must not transfer"),
                Err(stream) => stream,
            };
            drop(writer);

            let transferred = stream.transfer().unwrap_or_else(|_| panic!("unlocked"));
            let stream = transferred.into_stream();
            let writer = stream.get_writer().unwrap();
            writer.write(vec![1]).await.unwrap();
        })
        .await;
    }
}
