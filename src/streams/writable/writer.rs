use super::{StreamCommand, StreamHandle};
use crate::platform::{MaybeSend, SharedPtr};
use crate::streams::completion::{Deferred, OperationFuture, SignalFuture};
use crate::streams::{StreamError, StreamResult};
use futures::ready;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

struct SlotsState {
    ready: SharedPtr<Deferred>,
    closed: SharedPtr<Deferred>,
    detached: bool,
}

/// A writer's `ready` and `closed` cells, shared between the writer and the
/// stream task.
///
/// Once the writer releases its lock the slots are detached and the task can
/// no longer settle or replace them.
pub(crate) struct WriterSlots {
    state: Mutex<SlotsState>,
}

fn reject_or_replace(cell: &mut SharedPtr<Deferred>, error: StreamError) {
    if !cell.reject(error.clone()) {
        *cell = Deferred::rejected(error);
    }
    cell.mark_handled();
}

impl WriterSlots {
    fn new() -> SharedPtr<Self> {
        SharedPtr::new(Self {
            state: Mutex::new(SlotsState {
                ready: Deferred::pending(),
                closed: Deferred::pending(),
                detached: false,
            }),
        })
    }

    fn ready(&self) -> SharedPtr<Deferred> {
        SharedPtr::clone(&self.state.lock().ready)
    }

    fn closed(&self) -> SharedPtr<Deferred> {
        SharedPtr::clone(&self.state.lock().closed)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Arm a fresh pending `ready`, unless the current one is still pending.
    pub(crate) fn rearm_ready(&self) {
        let mut state = self.state.lock();
        if !state.detached && !state.ready.is_pending() {
            state.ready = Deferred::pending();
        }
    }

    pub(crate) fn resolve_ready(&self) {
        let state = self.state.lock();
        if !state.detached {
            state.ready.resolve();
        }
    }

    pub(crate) fn ensure_ready_rejected(&self, error: StreamError) {
        let mut state = self.state.lock();
        if !state.detached {
            reject_or_replace(&mut state.ready, error);
        }
    }

    pub(crate) fn resolve_closed(&self) {
        let state = self.state.lock();
        if !state.detached {
            state.closed.resolve();
        }
    }

    pub(crate) fn reject_closed(&self, error: StreamError) {
        let state = self.state.lock();
        if !state.detached {
            state.closed.reject(error);
            state.closed.mark_handled();
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.detached {
            return;
        }
        reject_or_replace(&mut state.ready, StreamError::Released);
        reject_or_replace(&mut state.closed, StreamError::Released);
        state.detached = true;
    }
}

/// Exclusive handle for writing to a [`WritableStream`](super::WritableStream).
///
/// Every request is handed to the stream as soon as the method is called;
/// the returned future only reports the outcome. Dropping the writer
/// releases its lock.
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink> {
    stream: StreamHandle<T>,
    id: u64,
    slots: SharedPtr<WriterSlots>,
    released: AtomicBool,
    _sink: PhantomData<Sink>,
}

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink> {
    pub(crate) fn attach(stream: StreamHandle<T>) -> StreamResult<Self> {
        let flags = stream.flags();
        if flags
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Locked);
        }
        let id = flags.next_writer_id.fetch_add(1, Ordering::SeqCst);
        let slots = WriterSlots::new();

        let attach = StreamCommand::Attach {
            id,
            slots: SharedPtr::clone(&slots),
        };
        if let Err(error) = stream.send(attach) {
            stream.flags().locked.store(false, Ordering::SeqCst);
            return Err(error);
        }

        Ok(Self {
            stream,
            id,
            slots,
            released: AtomicBool::new(false),
            _sink: PhantomData,
        })
    }

    fn ensure_bound(&self) -> StreamResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidState("writer is not bound to a stream"));
        }
        Ok(())
    }

    /// Write a chunk. Resolves once the sink has accepted this chunk, not
    /// when it is merely queued.
    pub fn write(&self, chunk: T) -> OperationFuture {
        if let Err(error) = self.ensure_bound() {
            return OperationFuture::failed(error);
        }
        self.stream
            .request(|completion| StreamCommand::Write { chunk, completion })
    }

    /// Close the stream once every queued chunk has been written.
    pub fn close(&self) -> OperationFuture {
        if let Err(error) = self.ensure_bound() {
            return OperationFuture::failed(error);
        }
        self.stream
            .request(|completion| StreamCommand::Close { completion })
    }

    /// Abort the stream.
    pub fn abort(&self, reason: Option<String>) -> OperationFuture {
        if let Err(error) = self.ensure_bound() {
            return OperationFuture::failed(error);
        }
        self.stream
            .request(|completion| StreamCommand::Abort { reason, completion })
    }

    /// Resolves when the stream has room for more chunks; rejects once the
    /// stream starts erroring.
    ///
    /// The future captures the current cell. Ask again after backpressure
    /// returns to wait for the next cycle.
    pub fn ready(&self) -> SignalFuture {
        self.slots.ready().wait()
    }

    /// Resolves when the stream closes, rejects when it errors or this
    /// writer is released first.
    pub fn closed(&self) -> SignalFuture {
        self.slots.closed().wait()
    }

    /// `Ok(None)` while erroring or errored, `Ok(Some(0.0))` once closed.
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        self.ensure_bound()?;
        Ok(self.stream.flags().desired_size())
    }

    /// Detach from the stream so another writer can be attached.
    ///
    /// Pending `ready`/`closed` futures fail with [`StreamError::Released`].
    /// Calling this twice is a no-op.
    pub fn release_lock(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.release();
        // detach is queued before the lock opens, so a new writer's attach
        // always lands after it
        let _ = self.stream.send(StreamCommand::Detach { id: self.id });
        self.stream.flags().locked.store(false, Ordering::SeqCst);
    }

    /// Adapt this writer into a [`futures::Sink`].
    pub fn into_sink(self) -> WriterSink<T, Sink> {
        WriterSink {
            writer: self,
            ready: None,
            last_write: None,
            close: None,
        }
    }
}

impl<T: MaybeSend + 'static, Sink> Drop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(&mut self) {
        self.release_lock();
    }
}

/// [`futures::Sink`] over a writer.
///
/// `poll_ready` waits on the writer's `ready`, `start_send` issues a write,
/// `poll_flush` waits for the last issued write and `poll_close` closes the
/// stream.
#[pin_project]
pub struct WriterSink<T: MaybeSend + 'static, Sink> {
    writer: WritableStreamDefaultWriter<T, Sink>,
    #[pin]
    ready: Option<SignalFuture>,
    #[pin]
    last_write: Option<OperationFuture>,
    #[pin]
    close: Option<OperationFuture>,
}

impl<T: MaybeSend + 'static, Sink> WriterSink<T, Sink> {
    pub fn writer(&self) -> &WritableStreamDefaultWriter<T, Sink> {
        &self.writer
    }

    pub fn into_writer(self) -> WritableStreamDefaultWriter<T, Sink> {
        self.writer
    }
}

impl<T: MaybeSend + 'static, Sink> futures::Sink<T> for WriterSink<T, Sink> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let mut this = self.project();
        if this.ready.is_none() {
            this.ready.set(Some(this.writer.ready()));
        }
        let result = match this.ready.as_mut().as_pin_mut() {
            Some(ready) => ready!(ready.poll(cx)),
            None => Ok(()),
        };
        this.ready.set(None);
        Poll::Ready(result)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> StreamResult<()> {
        let mut this = self.project();
        let write = this.writer.write(item);
        this.last_write.set(Some(write));
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let mut this = self.project();
        let result = match this.last_write.as_mut().as_pin_mut() {
            Some(write) => ready!(write.poll(cx)),
            None => Ok(()),
        };
        this.last_write.set(None);
        Poll::Ready(result)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        if self.close.is_none() {
            ready!(<Self as futures::Sink<T>>::poll_flush(self.as_mut(), cx))?;
            let mut this = self.as_mut().project();
            let close = this.writer.close();
            this.close.set(Some(close));
        }
        let this = self.project();
        match this.close.as_pin_mut() {
            Some(close) => close.poll(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn release_rejects_pending_cells_and_detaches() {
        let slots = WriterSlots::new();
        let ready = slots.ready().wait();
        slots.resolve_closed();
        slots.release();

        assert!(matches!(ready.now_or_never(), Some(Err(StreamError::Released))));
        // settled cells are replaced rather than overwritten
        assert!(matches!(
            slots.closed().wait().now_or_never(),
            Some(Err(StreamError::Released))
        ));
        assert!(slots.is_detached());

        slots.resolve_ready();
        slots.rearm_ready();
        assert!(matches!(
            slots.ready().wait().now_or_never(),
            Some(Err(StreamError::Released))
        ));
    }

    #[test]
    fn rearm_keeps_a_pending_ready() {
        let slots = WriterSlots::new();
        let first = slots.ready();
        slots.rearm_ready();
        assert!(SharedPtr::ptr_eq(&first, &slots.ready()));

        slots.resolve_ready();
        slots.rearm_ready();
        assert!(!SharedPtr::ptr_eq(&first, &slots.ready()));
        assert!(slots.ready().is_pending());
        assert!(matches!(first.wait().now_or_never(), Some(Ok(()))));
    }

    #[test]
    fn ready_rejection_replaces_a_resolved_cell() {
        let slots = WriterSlots::new();
        slots.resolve_ready();
        slots.ensure_ready_rejected("boom".into());
        let err = slots.ready().wait().now_or_never().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
