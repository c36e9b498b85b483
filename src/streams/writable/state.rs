use super::controller::{ControllerMsg, ControllerState, QueuedValue, WritableStreamDefaultController};
use super::writer::WriterSlots;
use super::{Responder, StreamCommand, StreamFlags, WritableSink, WritableStreamState};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, SharedPtr};
use crate::streams::completion::Deferred;
use crate::streams::{StreamError, StreamResult};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::task::{Context, Poll};

struct AttachedWriter {
    id: u64,
    slots: SharedPtr<WriterSlots>,
}

struct PendingAbortRequest {
    responders: Vec<Responder>,
    reason: Option<String>,
    was_already_erroring: bool,
}

// Sink operation being driven; the sink travels with the future and comes
// back when it settles
enum InFlight<Sink> {
    Start(PlatformBoxFutureStatic<(Sink, StreamResult<()>)>),
    Write(PlatformBoxFutureStatic<(Sink, StreamResult<()>)>),
    Close(PlatformBoxFutureStatic<StreamResult<()>>),
    Abort {
        fut: PlatformBoxFutureStatic<StreamResult<()>>,
        request: Option<PendingAbortRequest>,
    },
}

enum Settled<Sink> {
    Start(Sink, StreamResult<()>),
    Write(Sink, StreamResult<()>),
    Close(StreamResult<()>),
    Abort(StreamResult<()>, Option<PendingAbortRequest>),
}

impl<Sink> InFlight<Sink> {
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<Settled<Sink>> {
        match self {
            InFlight::Start(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(sink, result)| Settled::Start(sink, result)),
            InFlight::Write(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(sink, result)| Settled::Write(sink, result)),
            InFlight::Close(fut) => fut.as_mut().poll(cx).map(Settled::Close),
            InFlight::Abort { fut, request } => fut
                .as_mut()
                .poll(cx)
                .map(|result| Settled::Abort(result, request.take())),
        }
    }
}

/// Everything the stream task owns. Only the task touches this; handles see
/// the published [`StreamFlags`] and the shared deferred cells.
pub(super) struct WritableStreamInner<T, Sink> {
    state: WritableStreamState,
    stored_error: Option<StreamError>,
    backpressure: bool,
    writer: Option<AttachedWriter>,
    close_request: Option<Responder>,
    in_flight_close_request: Option<Responder>,
    in_flight_write_request: Option<Responder>,
    write_requests: VecDeque<Responder>,
    pending_abort_request: Option<PendingAbortRequest>,
    controller: ControllerState<T, Sink>,
    in_flight: Option<InFlight<Sink>>,
    flags: SharedPtr<StreamFlags>,
    closed: SharedPtr<Deferred>,
    outbox: Vec<(Responder, StreamResult<()>)>,
}

impl<T, Sink> WritableStreamInner<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    pub(super) fn new(
        mut sink: Sink,
        strategy: BoxedStrategy<T>,
        high_water_mark: f64,
        handle: WritableStreamDefaultController,
        flags: SharedPtr<StreamFlags>,
        closed: SharedPtr<Deferred>,
    ) -> Self {
        let controller = ControllerState::new(strategy, high_water_mark, handle.clone());
        let backpressure = controller.backpressure();

        let mut ctrl = handle;
        let start = Box::pin(async move {
            let result = sink.start(&mut ctrl).await;
            (sink, result)
        });

        let inner = Self {
            state: WritableStreamState::Writable,
            stored_error: None,
            backpressure,
            writer: None,
            close_request: None,
            in_flight_close_request: None,
            in_flight_write_request: None,
            write_requests: VecDeque::new(),
            pending_abort_request: None,
            controller,
            in_flight: Some(InFlight::Start(start)),
            flags,
            closed,
            outbox: Vec::new(),
        };
        inner.publish();
        inner
    }
}

impl<T, Sink> WritableStreamInner<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn publish(&self) {
        self.flags.publish(
            self.state,
            self.backpressure,
            self.controller.queue.total_size(),
        );
    }

    fn reply(&mut self, responder: Responder, result: StreamResult<()>) {
        self.outbox.push((responder, result));
    }

    /// Publish the snapshot, then deliver every completion decided since the
    /// last flush.
    fn flush(&mut self) {
        self.publish();
        for (responder, result) in self.outbox.drain(..) {
            // the caller may have dropped its future
            let _ = responder.send(result);
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::InvalidState("stream failed without a stored error"))
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn process_command(&mut self, command: StreamCommand<T>) {
        match command {
            StreamCommand::Attach { id, slots } => self.attach_writer(id, slots),
            StreamCommand::Detach { id } => {
                if self.writer.as_ref().is_some_and(|w| w.id == id) {
                    tracing::trace!(writer = id, "writer detached");
                    self.writer = None;
                }
            }
            StreamCommand::Write { chunk, completion } => self.write(chunk, completion),
            StreamCommand::Close { completion } => self.close_from_handle(completion),
            StreamCommand::Abort { reason, completion } => self.abort(reason, completion),
        }
    }

    fn attach_writer(&mut self, id: u64, slots: SharedPtr<WriterSlots>) {
        // released before the task got to it
        if slots.is_detached() {
            return;
        }
        match self.state {
            WritableStreamState::Writable => {
                if self.close_queued_or_in_flight() || !self.backpressure {
                    slots.resolve_ready();
                }
            }
            WritableStreamState::Erroring => {
                slots.ensure_ready_rejected(self.stored_error());
            }
            WritableStreamState::Closed => {
                slots.resolve_ready();
                slots.resolve_closed();
            }
            WritableStreamState::Errored => {
                let error = self.stored_error();
                slots.ensure_ready_rejected(error.clone());
                slots.reject_closed(error);
            }
        }
        tracing::trace!(writer = id, state = ?self.state, "writer attached");
        self.writer = Some(AttachedWriter { id, slots });
    }

    fn write(&mut self, chunk: T, completion: Responder) {
        let size = match self.controller.chunk_size(&chunk) {
            Ok(size) => size,
            Err(error) => {
                tracing::debug!(%error, "chunk sizing failed");
                self.error_if_needed(error);
                // unused: the stream is no longer writable
                1.0
            }
        };

        match self.state {
            WritableStreamState::Errored => {
                let error = self.stored_error();
                return self.reply(completion, Err(error));
            }
            WritableStreamState::Closed => return self.reply(completion, Err(StreamError::Closed)),
            _ if self.close_queued_or_in_flight() => {
                return self.reply(completion, Err(StreamError::Closing));
            }
            WritableStreamState::Erroring => {
                let error = self.stored_error();
                return self.reply(completion, Err(error));
            }
            WritableStreamState::Writable => {}
        }

        self.write_requests.push_back(completion);
        self.controller_write(chunk, size);
    }

    fn controller_write(&mut self, chunk: T, size: f64) {
        if let Err(error) = self
            .controller
            .queue
            .enqueue(QueuedValue::Chunk(Some(chunk)), size)
        {
            self.error_if_needed(error);
            return;
        }
        if !self.close_queued_or_in_flight() && self.state == WritableStreamState::Writable {
            let backpressure = self.controller.backpressure();
            self.update_backpressure(backpressure);
        }
        self.advance_queue_if_needed();
    }

    fn close_from_handle(&mut self, completion: Responder) {
        if self.close_queued_or_in_flight() {
            return self.reply(
                completion,
                Err(StreamError::InvalidState("close already requested")),
            );
        }
        self.close(completion);
    }

    fn close(&mut self, completion: Responder) {
        match self.state {
            WritableStreamState::Closed => return self.reply(completion, Err(StreamError::Closed)),
            WritableStreamState::Errored => {
                let error = self.stored_error();
                return self.reply(completion, Err(error));
            }
            WritableStreamState::Writable | WritableStreamState::Erroring => {}
        }
        debug_assert!(!self.close_queued_or_in_flight());

        self.close_request = Some(completion);
        if self.backpressure && self.state == WritableStreamState::Writable {
            if let Some(writer) = &self.writer {
                writer.slots.resolve_ready();
            }
        }
        self.controller.enqueue_close();
        self.advance_queue_if_needed();
    }

    fn abort(&mut self, reason: Option<String>, completion: Responder) {
        if matches!(
            self.state,
            WritableStreamState::Closed | WritableStreamState::Errored
        ) {
            return self.reply(completion, Ok(()));
        }
        self.controller.handle.request_abort(reason.clone());

        if let Some(request) = &mut self.pending_abort_request {
            request.responders.push(completion);
            return;
        }

        let was_already_erroring = self.state == WritableStreamState::Erroring;
        let reason = if was_already_erroring { None } else { reason };
        tracing::debug!(?reason, was_already_erroring, "abort requested");
        self.pending_abort_request = Some(PendingAbortRequest {
            responders: vec![completion],
            reason: reason.clone(),
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(StreamError::Aborted(reason));
        }
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        debug_assert_eq!(self.state, WritableStreamState::Writable);
        debug_assert!(!self.close_queued_or_in_flight());

        let changed = backpressure != self.backpressure;
        self.backpressure = backpressure;
        self.publish();
        match &self.writer {
            Some(writer) if changed && backpressure => writer.slots.rearm_ready(),
            Some(writer) if changed => writer.slots.resolve_ready(),
            _ => {}
        }
    }

    fn start_erroring(&mut self, reason: StreamError) {
        debug_assert!(self.stored_error.is_none());
        debug_assert_eq!(self.state, WritableStreamState::Writable);
        tracing::debug!(error = %reason, "stream erroring");

        self.stored_error = Some(reason.clone());
        self.state = WritableStreamState::Erroring;
        self.publish();
        if let Some(writer) = &self.writer {
            writer.slots.ensure_ready_rejected(reason);
        }
        if !self.has_operation_marked_in_flight() && self.controller.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        debug_assert_eq!(self.state, WritableStreamState::Erroring);
        debug_assert!(!self.has_operation_marked_in_flight());

        self.state = WritableStreamState::Errored;
        self.controller.reset_queue();
        self.publish();

        let stored_error = self.stored_error();
        tracing::debug!(error = %stored_error, queued = self.write_requests.len(), "stream errored");
        let write_requests = std::mem::take(&mut self.write_requests);
        self.outbox.extend(
            write_requests
                .into_iter()
                .map(|request| (request, Err(stored_error.clone()))),
        );

        let Some(request) = self.pending_abort_request.take() else {
            self.reject_close_and_closed_if_needed();
            return;
        };

        if request.was_already_erroring {
            for responder in request.responders {
                self.reply(responder, Err(stored_error.clone()));
            }
            self.reject_close_and_closed_if_needed();
            return;
        }

        match self.controller.take_sink() {
            Some(mut sink) => {
                let reason = request.reason.clone();
                self.controller.clear_algorithms();
                tracing::debug!(?reason, "aborting sink");
                let fut = Box::pin(async move { sink.abort(reason).await });
                debug_assert!(self.in_flight.is_none());
                self.in_flight = Some(InFlight::Abort {
                    fut,
                    request: Some(request),
                });
            }
            None => {
                for responder in request.responders {
                    self.reply(responder, Ok(()));
                }
                self.reject_close_and_closed_if_needed();
            }
        }
    }

    fn reject_close_and_closed_if_needed(&mut self) {
        debug_assert_eq!(self.state, WritableStreamState::Errored);
        let stored_error = self.stored_error();

        if let Some(close_request) = self.close_request.take() {
            debug_assert!(self.in_flight_close_request.is_none());
            self.reply(close_request, Err(stored_error.clone()));
        }
        if let Some(writer) = &self.writer {
            writer.slots.reject_closed(stored_error.clone());
        }
        if self.closed.reject(stored_error) {
            self.closed.mark_handled();
        }
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == WritableStreamState::Writable {
            self.start_erroring(error);
            return;
        }
        debug_assert_eq!(self.state, WritableStreamState::Erroring);
        self.finish_erroring();
    }

    fn finish_in_flight_write(&mut self, result: StreamResult<()>) {
        let Some(request) = self.in_flight_write_request.take() else {
            debug_assert!(false, "write settled without an in-flight request");
            return;
        };
        match result {
            Ok(()) => self.reply(request, Ok(())),
            Err(error) => {
                self.reply(request, Err(error.clone()));
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_in_flight_close(&mut self, result: StreamResult<()>) {
        let Some(request) = self.in_flight_close_request.take() else {
            debug_assert!(false, "close settled without an in-flight request");
            return;
        };
        match result {
            Ok(()) => {
                self.reply(request, Ok(()));
                if self.state == WritableStreamState::Erroring {
                    // a close that reached the sink wins over the error
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort_request.take() {
                        for responder in abort.responders {
                            self.reply(responder, Ok(()));
                        }
                    }
                }
                self.state = WritableStreamState::Closed;
                self.publish();
                tracing::debug!("stream closed");
                if let Some(writer) = &self.writer {
                    writer.slots.resolve_closed();
                }
                self.closed.resolve();
            }
            Err(error) => {
                self.reply(request, Err(error.clone()));
                if let Some(abort) = self.pending_abort_request.take() {
                    for responder in abort.responders {
                        self.reply(responder, Err(error.clone()));
                    }
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn error_if_needed(&mut self, error: StreamError) {
        if self.state == WritableStreamState::Writable {
            self.controller_error(error);
        }
    }

    fn controller_error(&mut self, error: StreamError) {
        debug_assert_eq!(self.state, WritableStreamState::Writable);
        self.controller.clear_algorithms();
        self.start_erroring(error);
    }

    fn on_controller_msg(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Error(error) => {
                if self.state == WritableStreamState::Writable {
                    self.controller_error(error);
                } else {
                    tracing::trace!(%error, "controller error ignored, stream not writable");
                }
            }
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.controller.started
            || self.in_flight_write_request.is_some()
            || self.in_flight.is_some()
        {
            return;
        }
        if self.state == WritableStreamState::Erroring {
            self.finish_erroring();
            return;
        }
        if self.controller.queue.is_empty() {
            return;
        }
        if self.controller.front_is_close() {
            self.process_close();
        } else {
            self.process_write();
        }
    }

    fn process_close(&mut self) {
        self.in_flight_close_request = self.close_request.take();
        self.controller.queue.dequeue();
        debug_assert!(self.controller.queue.is_empty());

        let sink = self.controller.take_sink();
        self.controller.clear_algorithms();
        match sink {
            Some(sink) => {
                tracing::trace!("closing sink");
                self.in_flight = Some(InFlight::Close(Box::pin(async move { sink.close().await })));
            }
            None => self.finish_in_flight_close(Err(StreamError::InvalidState(
                "sink released before close",
            ))),
        }
    }

    fn process_write(&mut self) {
        self.in_flight_write_request = self.write_requests.pop_front();
        debug_assert!(self.in_flight_write_request.is_some());

        let chunk = self.controller.take_front_chunk();
        let sink = self.controller.take_sink();
        match (chunk, sink) {
            (Some(chunk), Some(mut sink)) => {
                let mut ctrl = self.controller.handle.clone();
                self.in_flight = Some(InFlight::Write(Box::pin(async move {
                    let result = sink.write(chunk, &mut ctrl).await;
                    (sink, result)
                })));
            }
            (_, sink) => {
                if let Some(sink) = sink {
                    self.controller.restore_sink(sink);
                }
                self.on_write_settled(Err(StreamError::InvalidState(
                    "sink released before write",
                )));
            }
        }
    }

    fn on_write_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.finish_in_flight_write(Ok(()));
                self.controller.queue.dequeue();
                if !self.close_queued_or_in_flight() && self.state == WritableStreamState::Writable
                {
                    let backpressure = self.controller.backpressure();
                    self.update_backpressure(backpressure);
                }
                self.advance_queue_if_needed();
            }
            Err(error) => {
                tracing::debug!(%error, "sink write failed");
                if self.state == WritableStreamState::Writable {
                    self.controller.clear_algorithms();
                }
                self.finish_in_flight_write(Err(error));
            }
        }
    }

    fn on_settled(&mut self, settled: Settled<Sink>) {
        match settled {
            Settled::Start(sink, result) => {
                self.controller.restore_sink(sink);
                self.controller.started = true;
                match result {
                    Ok(()) => {
                        tracing::trace!("sink started");
                        self.advance_queue_if_needed();
                    }
                    Err(error) => {
                        tracing::warn!(%error, "sink start failed");
                        self.deal_with_rejection(error);
                    }
                }
            }
            Settled::Write(sink, result) => {
                self.controller.restore_sink(sink);
                self.on_write_settled(result);
            }
            Settled::Close(result) => self.finish_in_flight_close(result),
            Settled::Abort(result, request) => {
                match &result {
                    Ok(()) => tracing::debug!("sink aborted"),
                    Err(error) => tracing::debug!(%error, "sink abort failed"),
                }
                for responder in request.into_iter().flat_map(|r| r.responders) {
                    self.reply(responder, result.clone());
                }
                self.reject_close_and_closed_if_needed();
            }
        }
    }
}

/// Drives a writable stream: applies commands in order, runs at most one sink
/// operation at a time and delivers completions.
///
/// Finishes once every handle is gone and no sink operation is in flight.
pub(super) async fn stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
    mut inner: WritableStreamInner<T, Sink>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    tracing::trace!("writable stream task started");
    let mut commands_closed = false;

    poll_fn(|cx| {
        loop {
            let mut progressed = false;

            while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
                inner.on_controller_msg(msg);
                progressed = true;
            }

            while !commands_closed {
                match command_rx.poll_next_unpin(cx) {
                    Poll::Ready(Some(command)) => {
                        inner.process_command(command);
                        progressed = true;
                    }
                    Poll::Ready(None) => commands_closed = true,
                    Poll::Pending => break,
                }
            }

            if let Some(op) = inner.in_flight.as_mut() {
                if let Poll::Ready(settled) = op.poll_settled(cx) {
                    inner.in_flight = None;
                    // errors the sink raised before settling come first
                    while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
                        inner.on_controller_msg(msg);
                    }
                    inner.on_settled(settled);
                    progressed = true;
                }
            }

            inner.flush();

            if commands_closed && inner.in_flight.is_none() {
                return Poll::Ready(());
            }
            if !progressed {
                return Poll::Pending;
            }
        }
    })
    .await;

    tracing::trace!("writable stream task finished");
}
